//! 编排器构建器：统一的初始化逻辑
//!
//! 负责系统提示词、工具路由、审批与观察者的接线，以及后端的构造期回退：
//! 配置的后端初始化失败时回退一次到固定默认值，仍失败则构造失败。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::config::AppConfig;
use crate::core::{
    AgentError, AgentObserver, ApprovalGate, ApprovalHandler, CancellationController, NoopObserver,
    Orchestrator, ReadTracker, RecoveryEngine, SessionState, ToolPolicy,
};
use crate::llm::{Backend, BackendError, BackendFactory, ConfigBackendFactory, DEFAULT_MODEL, DEFAULT_PROVIDER};
use crate::memory::ConversationLog;
use crate::tools::{builtin_registry, ToolExecutor, ToolRouter};

const DEFAULT_SYSTEM_PROMPT: &str = "You are coda, an interactive coding assistant working inside the user's workspace. \
Use the provided tools to inspect and change files, and read a file before modifying it. \
Answer concisely once the task is done.";

/// 系统提示词 = 基础提示 + 当前后端/模型
pub fn compose_system_prompt(base: &str, provider: &str, model: &str) -> String {
    format!("{}\n\nActive backend: {provider} (model: {model}).", base.trim_end())
}

/// 编排器构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    system_prompt: Option<String>,
    factory: Option<Arc<dyn BackendFactory>>,
    tools: Option<Arc<dyn ToolRouter>>,
    approval: Option<Arc<dyn ApprovalHandler>>,
    observer: Option<Arc<dyn AgentObserver>>,
    span: Option<tracing::Span>,
}

impl OrchestratorBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            system_prompt: None,
            factory: None,
            tools: None,
            approval: None,
            observer: None,
            span: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 从文件加载系统提示词：配置路径优先，其次 config/prompts/system.md
    pub fn with_system_prompt_from_file(mut self) -> Self {
        let configured = self.config.app.system_prompt_path.clone();
        let candidates = configured.into_iter().chain(
            ["config/prompts/system.md", "../config/prompts/system.md"]
                .into_iter()
                .map(PathBuf::from),
        );
        self.system_prompt = candidates
            .filter_map(|p| std::fs::read_to_string(p).ok())
            .find(|s| !s.trim().is_empty());
        self
    }

    pub fn with_backend_factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolRouter>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_approval(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = Some(handler);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn AgentObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// 编排器的全部日志都在该 span 内输出
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    pub async fn build(self) -> Result<Orchestrator, AgentError> {
        let span = self
            .span
            .clone()
            .unwrap_or_else(|| crate::observability::session_span(&uuid::Uuid::new_v4().to_string()));
        let factory = self
            .factory
            .clone()
            .unwrap_or_else(|| Arc::new(ConfigBackendFactory::new(self.config.llm.clone())));

        let (backend, provider, model) = init_with_fallback(
            factory.as_ref(),
            &self.config.llm.provider,
            &self.config.llm.model,
        )
        .instrument(span.clone())
        .await?;

        let tools = match self.tools {
            Some(tools) => tools,
            None => {
                let workspace = match &self.config.app.workspace_root {
                    Some(root) => root.clone(),
                    None => std::env::current_dir()
                        .map_err(|e| AgentError::ConfigError(format!("cannot resolve workspace: {e}")))?,
                };
                let registry = builtin_registry(&workspace, &self.config.tools);
                Arc::new(ToolExecutor::new(registry, self.config.tools.tool_timeout_secs))
            }
        };

        let base_prompt = self
            .system_prompt
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        let agent = &self.config.agent;
        let approval_timeout = agent.approval_timeout_secs.map(Duration::from_secs);

        Ok(Orchestrator {
            log: ConversationLog::new(compose_system_prompt(&base_prompt, &provider, &model)),
            base_prompt,
            backend,
            factory,
            tools,
            policy: ToolPolicy::from_config(&self.config.policy),
            reads: ReadTracker::new(),
            approval: ApprovalGate::new(self.approval, approval_timeout),
            cancel: CancellationController::new(),
            recovery: RecoveryEngine::new(&agent.retry),
            observer: self.observer.unwrap_or_else(|| Arc::new(NoopObserver)),
            state: SessionState::new(provider, model, agent.temperature),
            max_iterations: agent.max_iterations,
            max_tokens: agent.max_tokens,
            span,
        })
    }
}

async fn create_and_init(
    factory: &dyn BackendFactory,
    provider: &str,
    model: &str,
) -> Result<Arc<dyn Backend>, BackendError> {
    let backend = factory.create(provider, model)?;
    backend.initialize().await?;
    Ok(backend)
}

/// 配置的后端失败时回退一次到默认后端
async fn init_with_fallback(
    factory: &dyn BackendFactory,
    provider: &str,
    model: &str,
) -> Result<(Arc<dyn Backend>, String, String), AgentError> {
    let provider = provider.trim().to_lowercase();
    let primary = match create_and_init(factory, &provider, model).await {
        Ok(backend) => {
            tracing::info!(provider = %provider, model = %model, "backend ready");
            return Ok((backend, provider, model.to_string()));
        }
        Err(e) => e,
    };
    tracing::warn!(
        provider = %provider,
        model = %model,
        error = %primary,
        fallback = %format!("{DEFAULT_PROVIDER}/{DEFAULT_MODEL}"),
        "backend initialization failed, falling back"
    );
    if provider == DEFAULT_PROVIDER && model == DEFAULT_MODEL {
        return Err(AgentError::BackendInit(primary.to_string()));
    }
    match create_and_init(factory, DEFAULT_PROVIDER, DEFAULT_MODEL).await {
        Ok(backend) => Ok((backend, DEFAULT_PROVIDER.to_string(), DEFAULT_MODEL.to_string())),
        Err(fallback) => {
            tracing::error!(error = %fallback, "fallback backend initialization failed");
            Err(AgentError::BackendInit(format!(
                "{provider}/{model}: {primary}; fallback {DEFAULT_PROVIDER}/{DEFAULT_MODEL}: {fallback}"
            )))
        }
    }
}
