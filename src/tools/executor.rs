//! 工具执行器（ToolRouter 的注册表实现）
//!
//! 持有 ToolRegistry 与全局超时：invoke(name, raw_arguments) 先解析参数（解析失败不抛错，
//! 返回结构化失败以便模型改用更小、正确的参数重试），再在超时与取消信号下调用工具；
//! 每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::tools::{FileAccess, ToolContext, ToolDefinition, ToolRegistry, ToolResult};

/// 编排器消费的工具路由能力
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// 供后端使用的工具 schema
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// 该调用会如何访问文件；未知工具为 None
    fn file_access(&self, name: &str, args: &Value) -> FileAccess;

    /// 执行工具；所有失败（未知工具、参数错误、超时、取消）都包装为 ToolResult
    async fn invoke(&self, name: &str, raw_arguments: &str, cancel: CancellationToken) -> ToolResult;
}

/// 解析工具参数：空串视为 `{}`；必须是 JSON 对象
pub fn parse_arguments(raw: &str) -> Result<Value, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(other) => Err(format!(
            "Tool arguments must be a JSON object, got: {}",
            preview(&other.to_string())
        )),
        Err(e) => Err(format!(
            "Invalid tool arguments ({e}). The arguments may have been truncated; \
             retry with smaller, valid JSON arguments."
        )),
    }
}

/// 工具执行器：对每次调用施加超时，并将结果映射为 ToolResult
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl ToolRouter for ToolExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    fn file_access(&self, name: &str, args: &Value) -> FileAccess {
        self.registry
            .get(name)
            .map(|tool| tool.file_access(args))
            .unwrap_or(FileAccess::None)
    }

    async fn invoke(&self, name: &str, raw_arguments: &str, cancel: CancellationToken) -> ToolResult {
        let start = Instant::now();
        let args_preview = preview(raw_arguments);

        let (result, outcome) = match (self.registry.get(name), parse_arguments(raw_arguments)) {
            (None, _) => (ToolResult::failure(format!("Unknown tool: {name}")), "unknown_tool"),
            (Some(_), Err(e)) => (ToolResult::failure(e), "invalid_arguments"),
            (Some(_), Ok(_)) if cancel.is_cancelled() => {
                (ToolResult::failure("cancelled by user"), "cancelled")
            }
            (Some(tool), Ok(args)) => {
                let ctx = ToolContext {
                    cancel: cancel.clone(),
                };
                // 先看取消信号，首次 poll 即完成的工具也不会在取消后落盘
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => (ToolResult::failure("cancelled by user"), "cancelled"),
                    res = timeout(self.timeout, tool.execute(args, &ctx)) => match res {
                        Ok(Ok(payload)) => (ToolResult::ok(payload), "ok"),
                        Ok(Err(e)) => (ToolResult::failure(e), "error"),
                        Err(_) => (
                            ToolResult::failure(format!(
                                "Tool '{name}' timed out after {}s",
                                self.timeout.as_secs()
                            )),
                            "timeout",
                        ),
                    },
                }
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.success,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Echo the text argument"
        }

        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
            args.get("text")
                .cloned()
                .ok_or_else(|| "Missing text".to_string())
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "Sleeps forever"
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    fn executor() -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool);
        ToolExecutor::new(registry, 1)
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments("").unwrap(), serde_json::json!({}));
        assert!(parse_arguments(r#"{"path": "a.txt"}"#).is_ok());
        let err = parse_arguments(r#"{"path": "a.t"#).unwrap_err();
        assert!(err.contains("truncated"));
        assert!(parse_arguments("[1,2]").is_err());
    }

    #[tokio::test]
    async fn test_invoke_ok_and_failure() {
        let exec = executor();
        let ok = exec
            .invoke("echo", r#"{"text":"hi"}"#, CancellationToken::new())
            .await;
        assert!(ok.success);
        assert_eq!(ok.payload, Some(serde_json::json!("hi")));

        let failed = exec.invoke("echo", "{}", CancellationToken::new()).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("Missing text"));
    }

    #[tokio::test]
    async fn test_invoke_wraps_truncated_arguments() {
        let exec = executor();
        let result = exec
            .invoke("echo", r#"{"text": "unterminated"#, CancellationToken::new())
            .await;
        assert!(!result.success);
        assert!(!result.user_rejected);
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let result = executor().invoke("nope", "{}", CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn test_invoke_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let result = executor().invoke("slow", "{}", token).await;
        assert_eq!(result.error.as_deref(), Some("cancelled by user"));
    }

    struct CountingTool(Arc<AtomicUsize>);

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "count"
        }

        fn description(&self) -> &str {
            "Increments a counter"
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_precancelled_token_never_runs_fast_tool() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(CountingTool(Arc::clone(&runs)));
        let exec = ToolExecutor::new(registry, 5);
        for _ in 0..100 {
            let token = CancellationToken::new();
            token.cancel();
            let result = exec.invoke("count", "{}", token).await;
            assert_eq!(result.error.as_deref(), Some("cancelled by user"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_precancelled_token_never_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(crate::tools::CreateFileTool::new(dir.path()));
        let exec = ToolExecutor::new(registry, 5);
        for i in 0..50 {
            let token = CancellationToken::new();
            token.cancel();
            let args = format!(r#"{{"path":"f{i}.txt","content":"x"}}"#);
            let result = exec.invoke("create_file", &args, token).await;
            assert!(!result.success);
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let result = executor().invoke("slow", "{}", CancellationToken::new()).await;
        assert!(result.error.unwrap().contains("timed out"));
    }
}
