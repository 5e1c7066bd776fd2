//! 核心编排层：对话循环、工具策略、审批、取消、错误恢复与构建

pub mod approval;
pub mod builder;
pub mod cancellation;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod policy;
pub mod recovery;
pub mod state;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalHandler, ApprovalOutcome};
pub use builder::{compose_system_prompt, OrchestratorBuilder};
pub use cancellation::{CancellationController, InterruptHandle, INTERRUPTION_NOTE};
pub use error::{AgentError, RecoveryAction};
pub use events::{AgentEvent, AgentObserver, ChannelObserver, NoopObserver};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use policy::{ReadTracker, ToolClass, ToolPolicy};
pub use recovery::RecoveryEngine;
pub use state::{AgentPhase, SessionState};
