//! 会话状态与阶段投影
//!
//! SessionState 由 Orchestrator 独占持有；UI 只需读取轻量的 `AgentPhase` 与快照。

use serde::Serialize;

/// 会话级状态：当前后端、生成参数、自动批准与计数
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionState {
    pub backend: String,
    pub model: String,
    pub temperature: f32,
    /// 仅会话重启时重置，clear_history 不影响
    pub session_auto_approve: bool,
    pub request_count: u64,
    pub interrupted: bool,
    pub phase: AgentPhase,
}

impl SessionState {
    pub fn new(backend: impl Into<String>, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            temperature,
            session_auto_approve: false,
            request_count: 0,
            interrupted: false,
            phase: AgentPhase::Idle,
        }
    }
}

/// 编排阶段（UI 投影用）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentPhase {
    Idle,
    AwaitingBackend,
    ExecutingTools,
    AwaitingApproval,
    Done,
    Interrupted,
}

impl AgentPhase {
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            AgentPhase::AwaitingBackend | AgentPhase::ExecutingTools | AgentPhase::AwaitingApproval
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_idle() {
        let state = SessionState::new("mock", "echo", 0.2);
        assert_eq!(state.phase, AgentPhase::Idle);
        assert!(!state.phase.is_busy());
        assert!(!state.session_auto_approve);
        assert_eq!(state.request_count, 0);
        assert!(AgentPhase::AwaitingApproval.is_busy());
    }
}
