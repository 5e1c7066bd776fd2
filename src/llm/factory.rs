//! 后端注册表：按配置选择封闭集合中的具体后端
//!
//! BackendKind 列出全部可用后端；BackendFactory 负责「名字 + 模型 -> 未初始化的后端实例」，
//! 初始化与失败回退由 OrchestratorBuilder / Orchestrator::switch_backend 处理。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::LlmSection;
use crate::llm::{create_deepseek_backend, Backend, BackendError, MockBackend, OpenAiBackend};

/// 构造阶段主后端初始化失败时回退的固定默认值
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// 可用后端（封闭集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    OpenAi,
    DeepSeek,
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "openai",
            BackendKind::DeepSeek => "deepseek",
            BackendKind::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(BackendKind::OpenAi),
            "deepseek" => Ok(BackendKind::DeepSeek),
            "mock" => Ok(BackendKind::Mock),
            other => Err(BackendError::Init(format!("unknown backend '{other}'"))),
        }
    }
}

/// 名字 -> 后端实例（尚未 initialize）
pub trait BackendFactory: Send + Sync {
    fn create(&self, provider: &str, model: &str) -> Result<Arc<dyn Backend>, BackendError>;
}

impl<F> BackendFactory for F
where
    F: Fn(&str, &str) -> Result<Arc<dyn Backend>, BackendError> + Send + Sync,
{
    fn create(&self, provider: &str, model: &str) -> Result<Arc<dyn Backend>, BackendError> {
        self(provider, model)
    }
}

/// 基于 [llm] 配置段的默认工厂
#[derive(Debug, Clone)]
pub struct ConfigBackendFactory {
    llm: LlmSection,
}

impl ConfigBackendFactory {
    pub fn new(llm: LlmSection) -> Self {
        Self { llm }
    }
}

impl BackendFactory for ConfigBackendFactory {
    fn create(&self, provider: &str, model: &str) -> Result<Arc<dyn Backend>, BackendError> {
        let kind: BackendKind = provider.parse()?;
        // base_url 覆盖只作用于配置中的主后端
        let base_url = if kind.as_str() == self.llm.provider.to_lowercase() {
            self.llm.base_url.as_deref()
        } else {
            None
        };
        let timeout = self.llm.timeouts.request;
        tracing::info!(backend = %kind, model = %model, "creating backend");
        let backend: Arc<dyn Backend> = match kind {
            BackendKind::OpenAi => Arc::new(OpenAiBackend::openai(base_url, timeout)),
            BackendKind::DeepSeek => Arc::new(create_deepseek_backend(base_url, timeout)),
            BackendKind::Mock => Arc::new(MockBackend::new()),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("OpenAI".parse::<BackendKind>().unwrap(), BackendKind::OpenAi);
        assert_eq!(" deepseek ".parse::<BackendKind>().unwrap(), BackendKind::DeepSeek);
        assert!("anthropic-ish".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_config_factory_creates_named_backend() {
        let factory = ConfigBackendFactory::new(LlmSection::default());
        assert_eq!(factory.create("mock", "echo").unwrap().name(), "mock");
        assert_eq!(factory.create("deepseek", "deepseek-chat").unwrap().name(), "deepseek");
        assert!(factory.create("nope", "x").is_err());
    }
}
