//! 可观测性：tracing 订阅器与会话 span
//!
//! 日志写到 stderr，避免与 REPL 的回答交错；默认 info，可通过 RUST_LOG 覆盖。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// 编排器的根 span；一个会话一个
pub fn session_span(session_id: &str) -> tracing::Span {
    tracing::info_span!("session", id = %session_id)
}
