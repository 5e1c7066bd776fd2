//! 审批闸门：工具调用在用户决定前挂起
//!
//! 未接入审批处理器时一律拒绝；等待期间与取消信号竞速，请求前后都复查中断；
//! 「本会话总是允许」只对 ApprovalRequired 级别生效。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::ToolClass;

/// 审批处理器的答复
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApprovalDecision {
    pub approved: bool,
    /// 本会话内对 approval-required 工具不再询问
    pub auto_approve_session: bool,
}

impl ApprovalDecision {
    pub fn approve() -> Self {
        Self {
            approved: true,
            auto_approve_session: false,
        }
    }

    pub fn approve_for_session() -> Self {
        Self {
            approved: true,
            auto_approve_session: true,
        }
    }

    pub fn reject() -> Self {
        Self::default()
    }
}

/// 由 UI 实现的审批来源（终端提示、IDE 对话框等）
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request(&self, tool_name: &str, args: &Value) -> ApprovalDecision;
}

/// 闸门结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved { auto_approve_session: bool },
    Rejected { reason: String },
    Interrupted,
}

pub struct ApprovalGate {
    handler: Option<Arc<dyn ApprovalHandler>>,
    timeout: Option<Duration>,
}

/// 未接入审批处理器时的拒绝原因（未询问任何用户）
pub const NO_HANDLER_REASON: &str = "no approval handler configured";

impl ApprovalGate {
    pub fn new(handler: Option<Arc<dyn ApprovalHandler>>, timeout: Option<Duration>) -> Self {
        Self { handler, timeout }
    }

    pub async fn request(
        &self,
        tool_name: &str,
        args: &Value,
        class: ToolClass,
        cancel: &CancellationToken,
    ) -> ApprovalOutcome {
        if cancel.is_cancelled() {
            return ApprovalOutcome::Interrupted;
        }
        let Some(handler) = &self.handler else {
            tracing::info!(tool = %tool_name, "no approval handler wired, rejecting");
            return ApprovalOutcome::Rejected {
                reason: NO_HANDLER_REASON.to_string(),
            };
        };

        let wait = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, handler.request(tool_name, args))
                    .await
                    .ok(),
                None => Some(handler.request(tool_name, args).await),
            }
        };
        let decision = tokio::select! {
            d = wait => d,
            _ = cancel.cancelled() => return ApprovalOutcome::Interrupted,
        };
        if cancel.is_cancelled() {
            return ApprovalOutcome::Interrupted;
        }

        match decision {
            None => {
                tracing::info!(tool = %tool_name, "approval timed out");
                ApprovalOutcome::Rejected {
                    reason: "approval timed out".to_string(),
                }
            }
            Some(d) if d.approved => {
                let auto = d.auto_approve_session && class == ToolClass::ApprovalRequired;
                tracing::info!(tool = %tool_name, auto_approve_session = auto, "tool call approved");
                ApprovalOutcome::Approved {
                    auto_approve_session: auto,
                }
            }
            Some(_) => {
                tracing::info!(tool = %tool_name, "tool call rejected");
                ApprovalOutcome::Rejected {
                    reason: "rejected by user".to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(ApprovalDecision);

    #[async_trait]
    impl ApprovalHandler for Fixed {
        async fn request(&self, _tool_name: &str, _args: &Value) -> ApprovalDecision {
            self.0
        }
    }

    struct Never;

    #[async_trait]
    impl ApprovalHandler for Never {
        async fn request(&self, _tool_name: &str, _args: &Value) -> ApprovalDecision {
            std::future::pending().await
        }
    }

    fn gate(handler: impl ApprovalHandler + 'static) -> ApprovalGate {
        ApprovalGate::new(Some(Arc::new(handler)), None)
    }

    #[tokio::test]
    async fn test_no_handler_rejects() {
        let gate = ApprovalGate::new(None, None);
        let out = gate
            .request("edit_file", &json!({}), ToolClass::ApprovalRequired, &CancellationToken::new())
            .await;
        assert_eq!(
            out,
            ApprovalOutcome::Rejected {
                reason: NO_HANDLER_REASON.into()
            }
        );
    }

    #[tokio::test]
    async fn test_auto_approve_only_for_approval_required() {
        let gate = gate(Fixed(ApprovalDecision::approve_for_session()));
        let token = CancellationToken::new();
        let out = gate
            .request("edit_file", &json!({}), ToolClass::ApprovalRequired, &token)
            .await;
        assert_eq!(out, ApprovalOutcome::Approved { auto_approve_session: true });
        let out = gate
            .request("run_command", &json!({}), ToolClass::Dangerous, &token)
            .await;
        assert_eq!(out, ApprovalOutcome::Approved { auto_approve_session: false });
    }

    #[tokio::test]
    async fn test_reject_and_cancelled_before_request() {
        let gate = gate(Fixed(ApprovalDecision::reject()));
        let token = CancellationToken::new();
        let out = gate
            .request("edit_file", &json!({}), ToolClass::ApprovalRequired, &token)
            .await;
        assert_eq!(
            out,
            ApprovalOutcome::Rejected {
                reason: "rejected by user".into()
            }
        );
        token.cancel();
        let out = gate
            .request("edit_file", &json!({}), ToolClass::ApprovalRequired, &token)
            .await;
        assert_eq!(out, ApprovalOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_wait_races_cancellation() {
        let gate = gate(Never);
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let out = gate
            .request("run_command", &json!({}), ToolClass::Dangerous, &token)
            .await;
        assert_eq!(out, ApprovalOutcome::Interrupted);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_rejection() {
        let gate = ApprovalGate::new(Some(Arc::new(Never)), Some(Duration::from_millis(20)));
        let out = gate
            .request("edit_file", &json!({}), ToolClass::ApprovalRequired, &CancellationToken::new())
            .await;
        assert_eq!(
            out,
            ApprovalOutcome::Rejected {
                reason: "approval timed out".into()
            }
        );
    }
}
