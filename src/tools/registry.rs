//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / file_access / execute），
//! 由 ToolRegistry 按名注册与查找；ToolExecutor 在调用时解析参数、加超时并统一转 ToolResult。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// 提供给后端的工具声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具执行结果；写入日志时序列化为紧凑 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub user_rejected: bool,
}

impl ToolResult {
    pub fn ok(payload: impl Into<Value>) -> Self {
        Self {
            success: true,
            payload: Some(payload.into()),
            error: None,
            user_rejected: false,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            payload: None,
            error: Some(error.into()),
            user_rejected: false,
        }
    }

    /// 用户在审批时拒绝（或审批超时）
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            user_rejected: true,
            ..Self::failure(reason)
        }
    }

    pub fn to_content(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"success\":{},\"error\":\"unserializable tool result\"}}",
                self.success
            )
        })
    }
}

/// 工具对某个路径的文件访问方式（读后写前置检查用）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAccess {
    None,
    Read(String),
    /// 目标文件尚不存在
    Create(String),
    /// 修改已存在的文件
    Mutate(String),
}

/// 单次执行的上下文：取消信号由 CancellationController 为每次调度新建
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub cancel: CancellationToken,
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、文件访问声明、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema；默认空对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn file_access(&self, _args: &Value) -> FileAccess {
        FileAccess::None
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String>;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>（BTreeMap 保证声明顺序稳定）
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_content_omits_absent_fields() {
        let ok = ToolResult::ok(serde_json::json!("hi")).to_content();
        assert_eq!(ok, r#"{"success":true,"payload":"hi"}"#);
        let rejected = ToolResult::rejected("rejected by user").to_content();
        assert_eq!(
            rejected,
            r#"{"success":false,"error":"rejected by user","user_rejected":true}"#
        );
    }

    #[test]
    fn test_tool_result_round_trips_rejection_flag() {
        let parsed: ToolResult = serde_json::from_str(r#"{"success":false,"error":"x"}"#).unwrap();
        assert!(!parsed.user_rejected);
    }
}
