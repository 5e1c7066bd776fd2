//! coda - 交互式编程助手
//!
//! 入口：初始化日志与配置，构建编排器，运行按行读取的 REPL。
//! Ctrl+C 中断正在进行的一轮；空闲时退出。
//!
//! 用法：`coda [config.toml]`；API Key 取自 OPENAI_API_KEY / DEEPSEEK_API_KEY。

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use coda::config::{load_config, AppConfig};
use coda::core::{
    AgentError, AgentObserver, ApprovalDecision, ApprovalHandler, Orchestrator, OrchestratorBuilder,
    RunOutcome,
};
use coda::llm::TokenUsage;
use coda::tools::ToolResult;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

const HELP: &str = "\
Commands:
  /clear                      clear the conversation (keeps session approvals)
  /switch <provider> <model>  switch backend (openai | deepseek | mock)
  /temp <t>                   set sampling temperature (0.0 - 2.0)
  /status                     show backend, model and counters
  /help                       show this help
  /quit                       exit
Ctrl+C interrupts a running request.";

/// REPL、审批与重试提示共用的 stdin 行读取器
#[derive(Clone)]
struct Input(Arc<Mutex<Lines<BufReader<Stdin>>>>);

impl Input {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(BufReader::new(tokio::io::stdin()).lines())))
    }

    async fn ask(&self, prompt: &str) -> Option<String> {
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        self.0.lock().await.next_line().await.ok().flatten()
    }

    async fn confirm(&self, prompt: &str) -> bool {
        matches!(
            self.ask(prompt).await.as_deref().map(str::trim),
            Some("y" | "Y" | "yes")
        )
    }
}

fn preview(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        format!("{}...", value.chars().take(max).collect::<String>())
    } else {
        value.to_string()
    }
}

struct ConsoleObserver {
    input: Input,
}

#[async_trait]
impl AgentObserver for ConsoleObserver {
    fn on_tool_start(&self, tool: &str, args: &Value) {
        println!("  -> {tool} {}", preview(&args.to_string(), 160));
    }

    fn on_tool_end(&self, tool: &str, result: &ToolResult) {
        match (&result.error, result.success) {
            (_, true) => println!("  <- {tool} ok"),
            (Some(err), false) => println!("  <- {tool} failed: {}", preview(err, 200)),
            (None, false) => println!("  <- {tool} failed"),
        }
    }

    fn on_approval_request(&self, tool: &str, args: &Value) {
        println!("  ? {tool} wants to run with {}", preview(&args.to_string(), 400));
    }

    fn on_thinking_text(&self, text: &str, _reasoning: Option<&str>) {
        println!("{}", text.trim());
    }

    fn on_final_message(&self, text: &str, _reasoning: Option<&str>) {
        println!("\n{}\n", text.trim());
    }

    fn on_usage(&self, usage: &TokenUsage) {
        tracing::debug!(
            prompt = usage.prompt_tokens,
            completion = usage.completion_tokens,
            total = usage.total_tokens,
            "token usage"
        );
    }

    async fn on_max_iterations_reached(&self, limit: usize) -> bool {
        self.input
            .confirm(&format!("Reached {limit} iterations. Continue? [y/N] "))
            .await
    }

    async fn on_error(&self, message: &str) -> bool {
        self.input
            .confirm(&format!("Backend error: {message}\nRetry? [y/N] "))
            .await
    }
}

struct ConsoleApproval {
    input: Input,
}

#[async_trait]
impl ApprovalHandler for ConsoleApproval {
    async fn request(&self, _tool_name: &str, _args: &Value) -> ApprovalDecision {
        let answer = self.input.ask("  Allow? [y]es / [n]o / [a]lways: ").await;
        match answer.as_deref().map(|s| s.trim().to_lowercase()).as_deref() {
            Some("y" | "yes") => ApprovalDecision::approve(),
            Some("a" | "always") => ApprovalDecision::approve_for_session(),
            _ => ApprovalDecision::reject(),
        }
    }
}

/// 处理斜杠命令；返回 false 表示退出
async fn handle_command(agent: &mut Orchestrator, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next().unwrap_or("") {
        "/quit" | "/exit" => return false,
        "/help" => println!("{HELP}"),
        "/clear" => {
            agent.clear_history();
            println!("(history cleared)");
        }
        "/switch" => match (parts.next(), parts.next()) {
            (Some(provider), Some(model)) => match agent.switch_backend(provider, model).await {
                Ok(()) => println!("(switched to {provider}/{model})"),
                Err(e) => println!("{e}"),
            },
            _ => println!("usage: /switch <provider> <model>"),
        },
        "/temp" => match parts.next().and_then(|t| t.parse::<f32>().ok()) {
            Some(t) => {
                agent.set_temperature(t);
                println!("(temperature {})", agent.state().temperature);
            }
            None => println!("usage: /temp <0.0-2.0>"),
        },
        "/status" => {
            let s = agent.state();
            println!(
                "backend: {}/{}  temperature: {}  requests: {}  auto-approve: {}  turns: {}",
                s.backend,
                s.model,
                s.temperature,
                s.request_count,
                s.session_auto_approve,
                agent.log().len()
            );
        }
        other => println!("unknown command {other}, try /help"),
    }
    true
}

fn report(outcome: Result<RunOutcome, AgentError>) {
    match outcome {
        Ok(RunOutcome::Completed(_)) => {}
        Ok(RunOutcome::Rejected) => println!("(stopped: tool call rejected)"),
        Ok(RunOutcome::Interrupted) => println!("(interrupted)"),
        Ok(RunOutcome::Stopped) => println!("(stopped at the iteration limit)"),
        Ok(RunOutcome::Aborted(message)) => println!("(aborted: {message})"),
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            println!("error: {e}");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coda::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let input = Input::new();
    let mut agent = OrchestratorBuilder::new(cfg)
        .with_system_prompt_from_file()
        .with_observer(Arc::new(ConsoleObserver {
            input: input.clone(),
        }))
        .with_approval(Arc::new(ConsoleApproval {
            input: input.clone(),
        }))
        .build()
        .await
        .context("Failed to create orchestrator")?;

    let handle = agent.interrupt_handle();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !handle.interrupt() {
                println!();
                std::process::exit(130);
            }
        }
    });

    let state = agent.state();
    println!("coda ({}/{}) - /help for commands", state.backend, state.model);
    loop {
        let Some(line) = input.ask("> ").await else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('/') {
            if !handle_command(&mut agent, line).await {
                break;
            }
            continue;
        }
        report(agent.run(line).await);
    }
    Ok(())
}
