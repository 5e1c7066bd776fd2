//! 对话日志：按序、只追加的 Turn 记录
//!
//! 日志是「说过什么」的唯一事实来源。写入时即校验不变量：
//! - 首条永远是 system，且至少保留一条 system
//! - 每条 tool Turn 的 tool_call_id 必须出现在最近一条 assistant Turn 的 tool_calls 中
//! - 同一 assistant Turn 内的 tool call id 不重复
//!
//! 违反时返回 `AgentError::LogInvariant`，日志保持不变。

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::tools::ToolResult;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// 后端请求的一次工具调用；`raw_arguments` 保留原始文本，解析交给 ToolRouter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub raw_arguments: String,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, raw_arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            raw_arguments: raw_arguments.into(),
        }
    }
}

/// 对话日志中的一条记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    /// tool Turn：content 为 ToolResult 的紧凑 JSON
    pub fn tool(tool_call_id: impl Into<String>, result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.to_content(),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// 只追加的对话日志
#[derive(Clone, Debug)]
pub struct ConversationLog {
    turns: Vec<Turn>,
}

impl ConversationLog {
    /// 以唯一一条 system Turn 创建
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::system(system_prompt)],
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// 日志至少有一条 system Turn，永不为空
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn system_prompt(&self) -> &str {
        &self.turns[0].content
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::user(content));
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::system(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(Turn::assistant(content));
    }

    /// 追加携带工具调用的 assistant Turn；id 为空或重复时拒绝
    pub fn push_assistant_with_calls(
        &mut self,
        content: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
    ) -> Result<(), AgentError> {
        let mut seen = HashSet::new();
        for call in &tool_calls {
            if call.id.is_empty() {
                return Err(AgentError::LogInvariant(format!(
                    "tool call '{}' has an empty id",
                    call.name
                )));
            }
            if !seen.insert(call.id.as_str()) {
                return Err(AgentError::LogInvariant(format!(
                    "duplicate tool call id '{}'",
                    call.id
                )));
            }
        }
        self.turns.push(Turn::assistant_with_calls(content, tool_calls));
        Ok(())
    }

    /// 追加工具结果；tool_call_id 必须属于最近的 assistant Turn 且尚未被应答
    pub fn push_tool_result(&mut self, tool_call_id: &str, result: &ToolResult) -> Result<(), AgentError> {
        let (idx, assistant) = self
            .turns
            .iter()
            .enumerate()
            .rev()
            .find(|(_, t)| t.role == Role::Assistant)
            .ok_or_else(|| {
                AgentError::LogInvariant(format!(
                    "tool result '{tool_call_id}' has no preceding assistant turn"
                ))
            })?;
        if !assistant.tool_calls.iter().any(|c| c.id == tool_call_id) {
            return Err(AgentError::LogInvariant(format!(
                "tool result '{tool_call_id}' does not match any call of the preceding assistant turn"
            )));
        }
        let answered = self.turns[idx + 1..]
            .iter()
            .any(|t| t.tool_call_id.as_deref() == Some(tool_call_id));
        if answered {
            return Err(AgentError::LogInvariant(format!(
                "tool call '{tool_call_id}' already has a result"
            )));
        }
        self.turns.push(Turn::tool(tool_call_id, result));
        Ok(())
    }

    /// 截断为仅保留 system Turn（幂等）
    pub fn clear_history(&mut self) {
        self.turns.retain(|t| t.role == Role::System);
    }

    /// 切换后端时对首条 system prompt 的唯一一次原地改写
    pub fn replace_system_prompt(&mut self, content: impl Into<String>) {
        self.turns[0].content = content.into();
    }

    /// 全量复查不变量（测试与调试用）
    pub fn validate(&self) -> Result<(), AgentError> {
        match self.turns.first() {
            Some(t) if t.role == Role::System => {}
            _ => {
                return Err(AgentError::LogInvariant(
                    "first turn must be a system turn".to_string(),
                ))
            }
        }
        let mut open: Option<&Turn> = None;
        let mut answered: HashSet<&str> = HashSet::new();
        for turn in &self.turns {
            match turn.role {
                Role::Assistant => {
                    let mut ids = HashSet::new();
                    if !turn.tool_calls.iter().all(|c| ids.insert(c.id.as_str())) {
                        return Err(AgentError::LogInvariant(
                            "duplicate tool call id in assistant turn".to_string(),
                        ));
                    }
                    open = Some(turn);
                    answered.clear();
                }
                Role::Tool => {
                    let id = turn.tool_call_id.as_deref().unwrap_or_default();
                    let matches = open
                        .map(|a| a.tool_calls.iter().any(|c| c.id == id))
                        .unwrap_or(false);
                    if !matches || !answered.insert(id) {
                        return Err(AgentError::LogInvariant(format!(
                            "orphan or repeated tool result '{id}'"
                        )));
                    }
                }
                Role::System | Role::User => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_calls(ids: &[&str]) -> ConversationLog {
        let mut log = ConversationLog::new("sys");
        log.push_user("hi");
        let calls = ids
            .iter()
            .map(|id| ToolCallRequest::new(*id, "read_file", "{}"))
            .collect();
        log.push_assistant_with_calls("", calls).unwrap();
        log
    }

    #[test]
    fn test_new_log_starts_with_system() {
        let log = ConversationLog::new("You are helpful");
        assert_eq!(log.len(), 1);
        assert_eq!(log.turns()[0].role, Role::System);
        assert!(log.validate().is_ok());
    }

    #[test]
    fn test_clear_history_is_idempotent() {
        let mut log = log_with_calls(&["a"]);
        log.push_tool_result("a", &ToolResult::ok(serde_json::json!("x"))).unwrap();
        log.push_system("note");
        log.clear_history();
        let once = log.turns().to_vec();
        log.clear_history();
        assert_eq!(once, log.turns());
        assert_eq!(log.len(), 2);
        assert!(log.turns().iter().all(|t| t.role == Role::System));
    }

    #[test]
    fn test_duplicate_call_ids_rejected() {
        let mut log = ConversationLog::new("sys");
        let calls = vec![
            ToolCallRequest::new("a", "read_file", "{}"),
            ToolCallRequest::new("a", "read_file", "{}"),
        ];
        let err = log.push_assistant_with_calls("", calls).unwrap_err();
        assert!(matches!(err, AgentError::LogInvariant(_)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_tool_result_must_match_preceding_assistant() {
        let mut log = log_with_calls(&["a", "b"]);
        assert!(log.push_tool_result("zzz", &ToolResult::failure("x")).is_err());
        log.push_tool_result("b", &ToolResult::failure("x")).unwrap();
        assert!(log.push_tool_result("b", &ToolResult::failure("x")).is_err());
        log.push_tool_result("a", &ToolResult::failure("x")).unwrap();
        assert!(log.validate().is_ok());
    }

    #[test]
    fn test_tool_result_without_assistant_rejected() {
        let mut log = ConversationLog::new("sys");
        log.push_user("hi");
        assert!(log.push_tool_result("a", &ToolResult::failure("x")).is_err());
    }

    #[test]
    fn test_replace_system_prompt_in_place() {
        let mut log = log_with_calls(&["a"]);
        let before = log.len();
        log.replace_system_prompt("new prompt");
        assert_eq!(log.system_prompt(), "new prompt");
        assert_eq!(log.len(), before);
    }

    #[test]
    fn test_tool_turn_serializes_result() {
        let mut log = log_with_calls(&["a"]);
        log.push_tool_result("a", &ToolResult::ok(serde_json::json!({"n": 1}))).unwrap();
        let turn = log.last().unwrap();
        assert_eq!(turn.tool_call_id.as_deref(), Some("a"));
        let v: serde_json::Value = serde_json::from_str(&turn.content).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["payload"]["n"], 1);
    }
}
