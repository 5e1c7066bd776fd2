//! 编排器：用户输入 -> 有界的「后端 <-> 工具」往返 -> 最终回答
//!
//! 状态机：AwaitingBackend -> {ExecutingTools -> AwaitingBackend} | Done，中断可从任意状态进入。
//! 每步：签发新取消令牌 -> 调用后端 -> 有工具调用则按序逐个执行（前置检查、策略、审批、执行），
//! 每个调用写一条 tool Turn -> 无工具调用的文本即最终回答。
//! 后端错误经 RecoveryEngine 分类：认证失败直接返回 Err；可重试错误询问观察者。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use crate::core::builder::compose_system_prompt;
use crate::core::{
    AgentError, AgentObserver, AgentPhase, ApprovalGate, ApprovalOutcome, CancellationController,
    InterruptHandle, ReadTracker, RecoveryAction, RecoveryEngine, SessionState, ToolClass,
    ToolPolicy,
};
use crate::llm::{Backend, BackendError, BackendFactory, BackendReply, GenerationOptions, ToolChoice};
use crate::memory::{ConversationLog, ToolCallRequest};
use crate::tools::{parse_arguments, FileAccess, ToolResult, ToolRouter};

/// `run` 的非致命结束状态
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// 后端给出最终文本
    Completed(String),
    /// 用户拒绝了某个工具调用
    Rejected,
    /// 用户中断
    Interrupted,
    /// 达到迭代上限且观察者选择不继续
    Stopped,
    /// 可重试的后端错误，观察者选择不重试
    Aborted(String),
}

/// 一轮工具执行后的走向
enum StepOutcome {
    Continue,
    Rejected,
    Interrupted,
}

const SKIPPED_AFTER_REJECTION: &str = "skipped: an earlier tool call in this step was rejected by user";
const SKIPPED_AFTER_INTERRUPT: &str = "skipped: request interrupted by user";

pub struct Orchestrator {
    pub(super) log: ConversationLog,
    pub(super) base_prompt: String,
    pub(super) backend: Arc<dyn Backend>,
    pub(super) factory: Arc<dyn BackendFactory>,
    pub(super) tools: Arc<dyn ToolRouter>,
    pub(super) policy: ToolPolicy,
    pub(super) reads: ReadTracker,
    pub(super) approval: ApprovalGate,
    pub(super) cancel: CancellationController,
    pub(super) recovery: RecoveryEngine,
    pub(super) observer: Arc<dyn AgentObserver>,
    pub(super) state: SessionState,
    pub(super) max_iterations: usize,
    pub(super) max_tokens: Option<u32>,
    pub(super) span: tracing::Span,
}

impl Orchestrator {
    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    /// 可交给其他任务（如 Ctrl+C 监听）的中断句柄
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.cancel.handle()
    }

    /// 仅保留 system Turn；会话自动批准与已读记录保留
    pub fn clear_history(&mut self) {
        self.log.clear_history();
        self.state.phase = AgentPhase::Idle;
        self.span.in_scope(|| tracing::info!("conversation history cleared"));
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.state.temperature = temperature.clamp(0.0, 2.0);
    }

    /// 处理一条用户输入，直到最终回答、拒绝、中断、停止或放弃
    pub async fn run(&mut self, text: &str) -> Result<RunOutcome, AgentError> {
        let span = self.span.clone();
        self.cancel.begin_run();
        self.state.interrupted = false;
        let outcome = self.run_loop(text).instrument(span).await;
        self.cancel.end_run();
        self.state.phase = match outcome {
            Ok(RunOutcome::Interrupted) => AgentPhase::Interrupted,
            _ => AgentPhase::Done,
        };
        outcome
    }

    /// 切换后端；失败时回滚到原后端并重新初始化，会话状态保持不变
    pub async fn switch_backend(&mut self, provider: &str, model: &str) -> Result<(), AgentError> {
        let span = self.span.clone();
        self.switch_inner(provider.trim().to_lowercase(), model.trim().to_string())
            .instrument(span)
            .await
    }

    async fn switch_inner(&mut self, provider: String, model: String) -> Result<(), AgentError> {
        let attempt = async {
            let backend = self.factory.create(&provider, &model)?;
            backend.initialize().await?;
            Ok::<_, BackendError>(backend)
        }
        .await;

        match attempt {
            Ok(backend) => {
                tracing::info!(
                    from = %format!("{}/{}", self.state.backend, self.state.model),
                    to = %format!("{provider}/{model}"),
                    "backend switched"
                );
                self.backend = backend;
                self.log
                    .replace_system_prompt(compose_system_prompt(&self.base_prompt, &provider, &model));
                self.state.backend = provider;
                self.state.model = model;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(provider = %provider, model = %model, error = %err, "backend switch failed, rolling back");
                if let Err(reinit) = self.backend.initialize().await {
                    tracing::error!(error = %reinit, backend = %self.state.backend, "previous backend re-initialization failed");
                }
                Err(AgentError::SwitchFailed {
                    provider,
                    model,
                    reason: err.to_string(),
                })
            }
        }
    }

    fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            model: self.state.model.clone(),
            tools: self.tools.definitions(),
            tool_choice: ToolChoice::Auto,
            temperature: self.state.temperature,
            max_tokens: self.max_tokens,
        }
    }

    async fn run_loop(&mut self, text: &str) -> Result<RunOutcome, AgentError> {
        self.log.push_user(text);
        let mut iteration = 0usize;
        let mut failures = 0u32;

        loop {
            if iteration >= self.max_iterations {
                tracing::info!(limit = self.max_iterations, "max iterations reached");
                let token = self.cancel.next_token();
                let observer = Arc::clone(&self.observer);
                let resume = tokio::select! {
                    r = observer.on_max_iterations_reached(self.max_iterations) => Some(r),
                    _ = token.cancelled() => None,
                };
                match resume {
                    Some(true) => iteration = 0,
                    Some(false) => return Ok(RunOutcome::Stopped),
                    None => return Ok(self.finish_interrupted()),
                }
            }
            if self.cancel.is_interrupted() {
                return Ok(self.finish_interrupted());
            }

            let token = self.cancel.next_token();
            let options = self.generation_options();
            self.state.phase = AgentPhase::AwaitingBackend;
            self.state.request_count += 1;
            tracing::debug!(
                iteration,
                request_count = self.state.request_count,
                backend = %self.backend.name(),
                "backend call"
            );

            let backend = Arc::clone(&self.backend);
            let reply = tokio::select! {
                r = backend.send(self.log.turns(), &options) => Some(r),
                _ = token.cancelled() => None,
            };
            let reply = match reply {
                Some(_) if self.cancel.is_interrupted() => return Ok(self.finish_interrupted()),
                None => return Ok(self.finish_interrupted()),
                Some(Ok(reply)) => reply,
                Some(Err(err)) => {
                    failures += 1;
                    match self.recovery.handle(&err, failures) {
                        RecoveryAction::Abort => {
                            tracing::error!(error = %err, "fatal backend error");
                            let detail = match err {
                                BackendError::Authentication(msg) => msg,
                                other => other.to_string(),
                            };
                            return Err(AgentError::AuthFatal(detail));
                        }
                        RecoveryAction::AskRetry { message, backoff } => {
                            tracing::warn!(error = %message, attempt = failures, "retryable backend error");
                            let observer = Arc::clone(&self.observer);
                            let retry = tokio::select! {
                                r = observer.on_error(&message) => Some(r),
                                _ = token.cancelled() => None,
                            };
                            match retry {
                                None => return Ok(self.finish_interrupted()),
                                Some(false) => {
                                    self.log.push_system(format!(
                                        "Backend request failed and was not retried: {message}"
                                    ));
                                    return Ok(RunOutcome::Aborted(message));
                                }
                                Some(true) => {}
                            }
                            tracing::info!(backoff_ms = backoff.as_millis() as u64, "retrying backend call");
                            let waited = tokio::select! {
                                _ = tokio::time::sleep(backoff) => true,
                                _ = token.cancelled() => false,
                            };
                            if !waited {
                                return Ok(self.finish_interrupted());
                            }
                            iteration += 1;
                            continue;
                        }
                    }
                }
            };
            failures = 0;
            if let Some(usage) = &reply.usage {
                self.observer.on_usage(usage);
            }

            if !reply.has_tool_calls() {
                return Ok(self.finish_with_text(reply));
            }

            if !reply.text.trim().is_empty() {
                self.observer
                    .on_thinking_text(&reply.text, reply.reasoning.as_deref());
            }
            let calls = normalize_call_ids(reply.tool_calls);
            self.log.push_assistant_with_calls(reply.text, calls.clone())?;

            match self.execute_calls(&calls).await? {
                StepOutcome::Continue => {}
                StepOutcome::Rejected => return Ok(RunOutcome::Rejected),
                StepOutcome::Interrupted => return Ok(self.finish_interrupted()),
            }
            iteration += 1;
        }
    }

    fn finish_with_text(&mut self, reply: BackendReply) -> RunOutcome {
        self.observer
            .on_final_message(&reply.text, reply.reasoning.as_deref());
        self.log.push_assistant(reply.text.clone());
        RunOutcome::Completed(reply.text)
    }

    /// 中断收尾：每轮只写一条说明
    fn finish_interrupted(&mut self) -> RunOutcome {
        if let Some(note) = self.cancel.take_interruption_note() {
            self.log.push_system(note);
        }
        self.state.interrupted = true;
        tracing::info!("run interrupted");
        RunOutcome::Interrupted
    }

    /// 按序执行一轮工具调用，每个调用恰好写一条 tool Turn
    async fn execute_calls(&mut self, calls: &[ToolCallRequest]) -> Result<StepOutcome, AgentError> {
        self.state.phase = AgentPhase::ExecutingTools;
        for (idx, call) in calls.iter().enumerate() {
            if self.cancel.is_interrupted() {
                self.skip_remaining(&calls[idx..], SKIPPED_AFTER_INTERRUPT)?;
                return Ok(StepOutcome::Interrupted);
            }

            let result = self.execute_call(call).await;
            self.log.push_tool_result(&call.id, &result)?;

            if result.user_rejected {
                self.skip_remaining(&calls[idx + 1..], SKIPPED_AFTER_REJECTION)?;
                self.log.push_system(format!(
                    "The user rejected the '{}' tool call. Stop and wait for further instructions.",
                    call.name
                ));
                return Ok(StepOutcome::Rejected);
            }
        }
        if self.cancel.is_interrupted() {
            return Ok(StepOutcome::Interrupted);
        }
        Ok(StepOutcome::Continue)
    }

    fn skip_remaining(&mut self, calls: &[ToolCallRequest], reason: &str) -> Result<(), AgentError> {
        for call in calls {
            self.log.push_tool_result(&call.id, &ToolResult::failure(reason))?;
        }
        Ok(())
    }

    async fn execute_call(&mut self, call: &ToolCallRequest) -> ToolResult {
        let args = match parse_arguments(&call.raw_arguments) {
            Ok(args) => args,
            Err(e) => {
                tracing::info!(tool = %call.name, "unparseable tool arguments");
                let result = ToolResult::failure(e);
                self.observer.on_tool_end(&call.name, &result);
                return result;
            }
        };

        let access = self.tools.file_access(&call.name, &args);
        if let Err(e) = self.reads.check(&access) {
            tracing::info!(tool = %call.name, "read-before-write precondition failed");
            let result = precondition_failure(e, &access);
            self.observer.on_tool_end(&call.name, &result);
            return result;
        }

        let class = self.policy.classify(&call.name);
        if self
            .policy
            .requires_approval(class, self.state.session_auto_approve)
        {
            if let Some(result) = self.gate(call, &args, class).await {
                self.observer.on_tool_end(&call.name, &result);
                return result;
            }
        }

        self.state.phase = AgentPhase::ExecutingTools;
        let token = self.cancel.next_token();
        if token.is_cancelled() {
            let result = ToolResult::failure(SKIPPED_AFTER_INTERRUPT);
            self.observer.on_tool_end(&call.name, &result);
            return result;
        }
        self.observer.on_tool_start(&call.name, &args);
        let result = self.tools.invoke(&call.name, &call.raw_arguments, token).await;
        if result.success {
            self.reads.observe(&access);
        }
        self.observer.on_tool_end(&call.name, &result);
        result
    }

    /// 审批；通过返回 None，否则返回替代的工具结果
    async fn gate(
        &mut self,
        call: &ToolCallRequest,
        args: &Value,
        class: ToolClass,
    ) -> Option<ToolResult> {
        self.state.phase = AgentPhase::AwaitingApproval;
        self.observer.on_approval_request(&call.name, args);
        let token = self.cancel.next_token();
        match self.approval.request(&call.name, args, class, &token).await {
            ApprovalOutcome::Approved {
                auto_approve_session,
            } => {
                if auto_approve_session && !self.state.session_auto_approve {
                    tracing::info!("session auto-approve enabled");
                    self.state.session_auto_approve = true;
                }
                None
            }
            ApprovalOutcome::Rejected { reason } => Some(ToolResult::rejected(reason)),
            ApprovalOutcome::Interrupted => Some(ToolResult::failure(SKIPPED_AFTER_INTERRUPT)),
        }
    }
}

fn precondition_failure(message: String, access: &FileAccess) -> ToolResult {
    let path = match access {
        FileAccess::Mutate(p) | FileAccess::Create(p) | FileAccess::Read(p) => Value::String(p.clone()),
        FileAccess::None => Value::Null,
    };
    ToolResult {
        payload: Some(json!({"precondition": "read_before_write", "path": path})),
        ..ToolResult::failure(message)
    }
}

/// 空 id 或同一轮内重复的 id 替换为 call_<uuid>
fn normalize_call_ids(calls: Vec<ToolCallRequest>) -> Vec<ToolCallRequest> {
    let mut seen = HashSet::new();
    calls
        .into_iter()
        .map(|mut call| {
            if call.id.trim().is_empty() || !seen.insert(call.id.clone()) {
                call.id = format!("call_{}", Uuid::new_v4().simple());
                seen.insert(call.id.clone());
            }
            call
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_call_ids() {
        let calls = vec![
            ToolCallRequest::new("a", "read_file", "{}"),
            ToolCallRequest::new("a", "read_file", "{}"),
            ToolCallRequest::new("", "list_directory", "{}"),
        ];
        let out = normalize_call_ids(calls);
        assert_eq!(out[0].id, "a");
        assert!(out[1].id.starts_with("call_"));
        assert!(out[2].id.starts_with("call_"));
        assert_ne!(out[1].id, out[2].id);
        assert_eq!(out[2].name, "list_directory");
    }

    #[test]
    fn test_precondition_failure_is_structured() {
        let r = precondition_failure("must read".into(), &FileAccess::Mutate("a.txt".into()));
        assert!(!r.success);
        assert!(!r.user_rejected);
        assert_eq!(r.payload.unwrap()["path"], "a.txt");
    }
}
