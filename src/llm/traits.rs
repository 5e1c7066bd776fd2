//! 后端抽象（BackendGateway）
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 Backend：initialize（校验凭据、建立客户端）
//! 与 send（发送完整对话日志与生成参数，返回文本或工具调用）。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::{ToolCallRequest, Turn};
use crate::tools::ToolDefinition;

/// 后端错误：调用方据此区分「认证致命」与「可重试」
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("network error: {0}")]
    Network(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("request rejected {status}: {message}")]
    Request { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("initialization failed: {0}")]
    Init(String),
}

impl BackendError {
    /// 仅认证失败是致命的，其余均可交给调用方决定是否重试
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackendError::Authentication(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            BackendError::RateLimited {
                retry_after_ms: Some(ms),
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

/// 工具选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// 单次后端调用的生成参数
#[derive(Debug, Clone, Default)]
pub struct GenerationOptions {
    pub model: String,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Token 使用统计（单次调用）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// 后端返回：自由文本 + 可选推理内容 + 按序的工具调用
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendReply {
    pub text: String,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl BackendReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::default()
        }
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// 后端 trait：先 initialize 再 send；send 的 future 被丢弃即视为取消
#[async_trait]
pub trait Backend: Send + Sync {
    /// 后端标识（openai / deepseek / mock）
    fn name(&self) -> &str;

    /// 校验凭据并准备客户端；失败时不可用于 send
    async fn initialize(&self) -> Result<(), BackendError>;

    async fn send(&self, turns: &[Turn], options: &GenerationOptions) -> Result<BackendReply, BackendError>;
}
