//! Agent 错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 BackendError 决定 Abort（致命）还是 AskRetry（询问调用方是否重试）。

use std::time::Duration;

use thiserror::Error;

/// 编排过程中会中止 `run` 或构造/切换失败的错误；其余情况以 RunOutcome 表达
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Authentication failed: {0}. Re-authenticate (check your API key) and try again.")]
    AuthFatal(String),

    #[error("Backend initialization failed: {0}")]
    BackendInit(String),

    #[error("Switch to {provider}/{model} failed: {reason}")]
    SwitchFailed {
        provider: String,
        model: String,
        reason: String,
    },

    #[error("Conversation log invariant violated: {0}")]
    LogInvariant(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 致命错误（认证失败）：不询问、不重试，直接结束 run
    Abort,
    /// 可重试：经 on_error 询问调用方；若重试则先等待 backoff
    AskRetry { message: String, backoff: Duration },
}
