//! run_command：在工作区内执行白名单命令
//!
//! CommandGuard 对 `&&`、`||`、`;`、`|` 连接的每一段都检查首词是否在白名单内，
//! 并拒绝破坏性写法。子进程带超时；观察到取消信号时结束子进程。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::{Child, Command};

use crate::tools::{Tool, ToolContext};

/// 不论首词是什么都拒绝的片段
const DENIED_FRAGMENTS: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "mkfs",
    "dd if=",
    "chmod 777",
    "chmod +s",
    "> /dev/sd",
    "| sh",
    "| bash",
    "sudo ",
    ":(){",
];

const OUTPUT_LIMIT: usize = 16_000;

/// 命令白名单检查
#[derive(Debug, Clone)]
pub struct CommandGuard {
    allowed: HashSet<String>,
}

impl CommandGuard {
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().map(|c| c.trim().to_lowercase()).collect(),
        }
    }

    /// 通过时返回各段的程序名
    pub fn check(&self, command: &str) -> Result<Vec<String>, String> {
        let lowered = command.to_lowercase();
        if let Some(fragment) = DENIED_FRAGMENTS.iter().find(|f| lowered.contains(*f)) {
            return Err(format!("command contains a denied fragment: '{}'", fragment.trim()));
        }
        if lowered.contains('`') || lowered.contains("$(") {
            return Err("command substitution is not allowed".to_string());
        }

        let chained = lowered.replace("&&", ";").replace("||", ";");
        let programs: Vec<String> = chained
            .split(|c: char| matches!(c, ';' | '|' | '\n'))
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.split_whitespace().next().unwrap_or_default().to_string())
            .collect();
        if programs.is_empty() {
            return Err("empty command".to_string());
        }
        match programs.iter().find(|p| !self.allowed.contains(p.as_str())) {
            Some(program) => Err(format!(
                "'{program}' is not an allowed command (allowed: {})",
                self.allowed_list()
            )),
            None => Ok(programs),
        }
    }

    fn allowed_list(&self) -> String {
        let mut names: Vec<&str> = self.allowed.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.join(", ")
    }
}

pub struct RunCommandTool {
    workdir: PathBuf,
    guard: CommandGuard,
    timeout: Duration,
}

impl RunCommandTool {
    pub fn new(workdir: impl AsRef<Path>, allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            workdir: workdir.as_ref().to_path_buf(),
            guard: CommandGuard::new(allowed_commands),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn spawn(&self, command: &str) -> Result<Child, String> {
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start command: {e}"))
    }
}

fn clip(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end();
    match text.char_indices().nth(OUTPUT_LIMIT) {
        Some((cut, _)) => format!("{}\n...[output truncated]", &text[..cut]),
        None => text.to_string(),
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace. Every program in the command must be allowlisted. Returns exit_code, stdout and stderr."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line, e.g. `cargo test -p core`"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .map(str::trim)
            .ok_or("Missing required parameter: command")?;
        let programs = self.guard.check(command)?;
        tracing::info!(command = %command, programs = ?programs, "run_command tool execute");

        let child = self.spawn(command)?;
        // 取消或超时时丢弃 future，kill_on_drop 结束子进程
        tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => match res {
                Ok(Ok(output)) => Ok(json!({
                    "exit_code": output.status.code(),
                    "stdout": clip(&output.stdout),
                    "stderr": clip(&output.stderr),
                })),
                Ok(Err(e)) => Err(format!("failed to read command output: {e}")),
                Err(_) => Err(format!("command timed out after {}s", self.timeout.as_secs())),
            },
            _ = ctx.cancel.cancelled() => {
                tracing::info!(command = %command, "run_command cancelled");
                Err("cancelled by user".to_string())
            }
        }
    }
}
