//! DeepSeek 后端（OpenAI 兼容格式）
//!
//! DeepSeek 提供与 OpenAI 兼容的 API 接口。
//! - Base URL: https://api.deepseek.com/v1
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式，返回 reasoning_content)

use crate::llm::OpenAiBackend;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 后端；API Key 取自环境变量 `DEEPSEEK_API_KEY`
pub fn create_deepseek_backend(base_url: Option<&str>, timeout_secs: u64) -> OpenAiBackend {
    OpenAiBackend::new(
        "deepseek",
        base_url.unwrap_or(DEEPSEEK_BASE_URL),
        None,
        "DEEPSEEK_API_KEY",
        timeout_secs,
    )
}
