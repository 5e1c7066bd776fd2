//! OpenAI 兼容 Chat Completions 后端
//!
//! 通过 reqwest 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 OpenAI、DeepSeek、自建代理等。
//! 负责把 Turn 序列转为线上格式（assistant.tool_calls / tool.tool_call_id），
//! 并把 HTTP 状态码归类为 BackendError（401/403 认证、429 限流、5xx 服务端）。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::llm::{Backend, BackendError, BackendReply, GenerationOptions, TokenUsage, ToolChoice};
use crate::memory::{Role, ToolCallRequest, Turn};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI 兼容后端：持有 HTTP 客户端、端点与 API Key
pub struct OpenAiBackend {
    name: String,
    /// 构建失败时保留原因，initialize 报 Init
    client: Result<Client, String>,
    base_url: String,
    api_key: Option<String>,
    key_env: &'static str,
}

impl OpenAiBackend {
    /// api_key 为 None 时从 `key_env` 环境变量读取
    pub fn new(
        name: &str,
        base_url: &str,
        api_key: Option<&str>,
        key_env: &'static str,
        timeout_secs: u64,
    ) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var(key_env).ok())
            .filter(|k| !is_placeholder_api_key(k));
        let client = build_client(timeout_secs, concat!("coda/", env!("CARGO_PKG_VERSION")));
        Self {
            name: name.to_string(),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            key_env,
        }
    }

    pub fn openai(base_url: Option<&str>, timeout_secs: u64) -> Self {
        Self::new(
            "openai",
            base_url.unwrap_or(OPENAI_BASE_URL),
            None,
            "OPENAI_API_KEY",
            timeout_secs,
        )
    }
}

/// 带请求超时与 User-Agent 的 HTTP 客户端
pub(crate) fn build_client(timeout_secs: u64, user_agent: &str) -> Result<Client, String> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(user_agent)
        .build()
        .map_err(|e| format!("failed to build HTTP client: {e}"))
}

/// Retry-After 的秒数形式；超大值饱和而不是溢出
fn parse_retry_after_ms(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().map(|secs| secs.saturating_mul(1000))
}

fn is_placeholder_api_key(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v == "sk-placeholder" || v.eq_ignore_ascii_case("x")
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        if self.api_key.is_none() {
            return Err(BackendError::Authentication(format!(
                "{} is not set",
                self.key_env
            )));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(BackendError::Init(format!("invalid base url: {}", self.base_url)));
        }
        self.client.as_ref().map_err(|e| BackendError::Init(e.clone()))?;
        Ok(())
    }

    async fn send(&self, turns: &[Turn], options: &GenerationOptions) -> Result<BackendReply, BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| BackendError::Authentication(format!("{} is not set", self.key_env)))?;
        let url = format!("{}/chat/completions", self.base_url);
        let body = build_request_body(turns, options);

        let client = self.client.as_ref().map_err(|e| BackendError::Init(e.clone()))?;
        let response = client
            .post(url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after_ms);
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::Network(e.to_string()))?;
        let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);

        if !(200..300).contains(&status) {
            let detail = extract_error(&value).unwrap_or_else(|| truncate_for_error(&text, 300));
            return Err(classify_status(status, detail, retry_after_ms));
        }
        if value.is_null() {
            return Err(BackendError::InvalidResponse(truncate_for_error(&text, 300)));
        }
        parse_reply(&value)
    }
}

/// 将 HTTP 状态码映射为 BackendError
pub(crate) fn classify_status(status: u16, message: String, retry_after_ms: Option<u64>) -> BackendError {
    match status {
        401 | 403 => BackendError::Authentication(message),
        429 => BackendError::RateLimited { retry_after_ms },
        500..=599 => BackendError::Server { status, message },
        _ => BackendError::Request { status, message },
    }
}

pub(crate) fn build_request_body(turns: &[Turn], options: &GenerationOptions) -> Value {
    let mut body = json!({
        "model": options.model,
        "messages": to_wire_messages(turns),
        "temperature": options.temperature,
        "stream": false,
    });
    if !options.tools.is_empty() {
        let tools: Vec<Value> = options
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        let tool_choice = match options.tool_choice {
            ToolChoice::Auto => "auto",
            ToolChoice::None => "none",
            ToolChoice::Required => "required",
        };
        body["tools"] = Value::Array(tools);
        body["tool_choice"] = json!(tool_choice);
    }
    if let Some(max_tokens) = options.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    body
}

pub(crate) fn to_wire_messages(turns: &[Turn]) -> Vec<Value> {
    turns
        .iter()
        .map(|t| match t.role {
            Role::System => json!({"role": "system", "content": t.content}),
            Role::User => json!({"role": "user", "content": t.content}),
            Role::Assistant if !t.tool_calls.is_empty() => {
                let calls: Vec<Value> = t
                    .tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {"name": c.name, "arguments": c.raw_arguments},
                        })
                    })
                    .collect();
                let content = if t.content.is_empty() {
                    Value::Null
                } else {
                    Value::String(t.content.clone())
                };
                json!({"role": "assistant", "content": content, "tool_calls": calls})
            }
            Role::Assistant => json!({"role": "assistant", "content": t.content}),
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": t.tool_call_id.clone().unwrap_or_default(),
                "content": t.content,
            }),
        })
        .collect()
}

pub(crate) fn parse_reply(value: &Value) -> Result<BackendReply, BackendError> {
    if let Some(detail) = value.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()) {
        return Err(BackendError::InvalidResponse(detail.to_string()));
    }
    let choice = value
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| BackendError::InvalidResponse("response has no choices".to_string()))?;
    let message = choice
        .get("message")
        .ok_or_else(|| BackendError::InvalidResponse("choice has no message".to_string()))?;

    let text = message
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let reasoning = message
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .filter(|s| !s.trim().is_empty())
        .map(String::from);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(|v| v.as_array()) {
        for call in calls {
            let function = call.get("function");
            let name = function
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            if name.trim().is_empty() {
                return Err(BackendError::InvalidResponse(format!(
                    "tool call without a function name: {}",
                    truncate_for_error(&call.to_string(), 200)
                )));
            }
            let raw_arguments = match function.and_then(|f| f.get("arguments")) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => String::new(),
                Some(other) => other.to_string(),
            };
            let id = call.get("id").and_then(|i| i.as_str()).unwrap_or_default();
            tool_calls.push(ToolCallRequest::new(id, name, raw_arguments));
        }
    }

    Ok(BackendReply {
        text,
        reasoning,
        tool_calls,
        usage: extract_usage(value),
        finish_reason: choice
            .get("finish_reason")
            .and_then(|f| f.as_str())
            .map(String::from),
    })
}

fn extract_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn extract_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| value.get("message").and_then(|v| v.as_str()).map(String::from))
}

fn truncate_for_error(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        format!("{}...", input.chars().take(max_chars).collect::<String>())
    }
}
