//! 编排过程的回调边界
//!
//! `AgentObserver` 供 UI 注册：通知类回调同步、默认空实现；两个决策类回调
//! （到达迭代上限是否继续、后端错误是否重试）为异步，默认都回答 false。
//! `ChannelObserver` 把每个通知序列化为 `AgentEvent` 发往 mpsc 通道。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::llm::TokenUsage;
use crate::tools::ToolResult;

#[async_trait]
pub trait AgentObserver: Send + Sync {
    fn on_tool_start(&self, _tool: &str, _args: &Value) {}

    fn on_tool_end(&self, _tool: &str, _result: &ToolResult) {}

    fn on_approval_request(&self, _tool: &str, _args: &Value) {}

    /// 伴随工具调用出现的自由文本
    fn on_thinking_text(&self, _text: &str, _reasoning: Option<&str>) {}

    fn on_final_message(&self, _text: &str, _reasoning: Option<&str>) {}

    fn on_usage(&self, _usage: &TokenUsage) {}

    /// 返回 true 则计数清零继续
    async fn on_max_iterations_reached(&self, _limit: usize) -> bool {
        false
    }

    /// 可重试错误；返回 true 则退避后重试
    async fn on_error(&self, _message: &str) -> bool {
        false
    }
}

/// 不关心任何回调
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl AgentObserver for NoopObserver {}

/// 过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolStart { tool: String, args: Value },
    ToolEnd { tool: String, result: ToolResult },
    ApprovalRequest { tool: String, args: Value },
    ThinkingText { text: String, reasoning: Option<String> },
    FinalMessage { text: String, reasoning: Option<String> },
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    MaxIterationsReached { limit: usize, resumed: bool },
    Error { message: String, retry: bool },
}

/// 通道观察者：决策回调按固定设置回答
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<AgentEvent>,
    retry_on_error: bool,
    continue_on_limit: bool,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self {
            tx,
            retry_on_error: false,
            continue_on_limit: false,
        }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn retry_on_error(mut self, retry: bool) -> Self {
        self.retry_on_error = retry;
        self
    }

    pub fn continue_on_limit(mut self, resume: bool) -> Self {
        self.continue_on_limit = resume;
        self
    }

    fn send(&self, event: AgentEvent) {
        // 接收端已关闭时丢弃
        let _ = self.tx.send(event);
    }
}

#[async_trait]
impl AgentObserver for ChannelObserver {
    fn on_tool_start(&self, tool: &str, args: &Value) {
        self.send(AgentEvent::ToolStart {
            tool: tool.to_string(),
            args: args.clone(),
        });
    }

    fn on_tool_end(&self, tool: &str, result: &ToolResult) {
        self.send(AgentEvent::ToolEnd {
            tool: tool.to_string(),
            result: result.clone(),
        });
    }

    fn on_approval_request(&self, tool: &str, args: &Value) {
        self.send(AgentEvent::ApprovalRequest {
            tool: tool.to_string(),
            args: args.clone(),
        });
    }

    fn on_thinking_text(&self, text: &str, reasoning: Option<&str>) {
        self.send(AgentEvent::ThinkingText {
            text: text.to_string(),
            reasoning: reasoning.map(str::to_string),
        });
    }

    fn on_final_message(&self, text: &str, reasoning: Option<&str>) {
        self.send(AgentEvent::FinalMessage {
            text: text.to_string(),
            reasoning: reasoning.map(str::to_string),
        });
    }

    fn on_usage(&self, usage: &TokenUsage) {
        self.send(AgentEvent::Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });
    }

    async fn on_max_iterations_reached(&self, limit: usize) -> bool {
        self.send(AgentEvent::MaxIterationsReached {
            limit,
            resumed: self.continue_on_limit,
        });
        self.continue_on_limit
    }

    async fn on_error(&self, message: &str) -> bool {
        self.send(AgentEvent::Error {
            message: message.to_string(),
            retry: self.retry_on_error,
        });
        self.retry_on_error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_observer_forwards_events() {
        let (observer, mut rx) = ChannelObserver::channel();
        let observer = observer.retry_on_error(true);
        observer.on_tool_start("read_file", &json!({"path": "a.txt"}));
        observer.on_final_message("done", None);
        assert!(observer.on_error("rate limited").await);
        assert!(!observer.on_max_iterations_reached(3).await);

        let first = serde_json::to_value(rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "tool_start");
        assert_eq!(first["args"]["path"], "a.txt");
        assert!(matches!(rx.recv().await, Some(AgentEvent::FinalMessage { .. })));
        assert!(matches!(rx.recv().await, Some(AgentEvent::Error { retry: true, .. })));
        assert!(matches!(
            rx.recv().await,
            Some(AgentEvent::MaxIterationsReached { limit: 3, resumed: false })
        ));
    }

    #[tokio::test]
    async fn test_noop_defaults() {
        let observer = NoopObserver;
        assert!(!observer.on_error("x").await);
        assert!(!observer.on_max_iterations_reached(1).await);
    }
}
