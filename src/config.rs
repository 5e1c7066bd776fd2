//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CODA__*` 覆盖（双下划线表示嵌套，如 `CODA__LLM__PROVIDER=deepseek`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub agent: AgentSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub policy: PolicySection,
}

/// [app] 段：工作目录与系统提示词
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    /// 工具沙箱根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    /// 系统提示词文件；未设置时依次查找 config/prompts/system.md
    pub system_prompt_path: Option<PathBuf>,
}

/// [agent] 段：循环上限、生成参数、审批与重试
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// 审批等待超时（秒）；未设置则无限等待，直到批准、拒绝或中断
    pub approval_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            temperature: default_temperature(),
            max_tokens: None,
            approval_timeout_secs: None,
            retry: RetrySection::default(),
        }
    }
}

fn default_max_iterations() -> usize {
    50
}

fn default_temperature() -> f32 {
    0.2
}

/// [agent.retry] 段：可重试后端错误的退避参数
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [tools] 段：工具超时、Shell 白名单、Fetch 域名
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default)]
    pub shell: ShellSection,
    #[serde(default)]
    pub fetch: FetchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: default_tool_timeout_secs(),
            shell: ShellSection::default(),
            fetch: FetchSection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "git".into(),
        "cargo".into(),
        "rustc".into(),
    ]
}

/// [tools.fetch] 段：抓取 URL 的超时、最大字符数、允许的域名白名单
#[derive(Debug, Clone, Deserialize)]
pub struct FetchSection {
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout_secs(),
            max_result_chars: default_max_result_chars(),
            allowed_domains: default_allowed_domains(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    15
}

fn default_max_result_chars() -> usize {
    8000
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "docs.rs".into(),
        "crates.io".into(),
        "doc.rust-lang.org".into(),
        "github.com".into(),
        "raw.githubusercontent.com".into(),
        "stackoverflow.com".into(),
        "developer.mozilla.org".into(),
        "docs.python.org".into(),
        "pypi.org".into(),
        "www.npmjs.com".into(),
        "en.wikipedia.org".into(),
    ]
}

/// [policy] 段：覆盖工具的审批分级；未列出的工具沿用内置默认
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicySection {
    #[serde(default)]
    pub safe: Vec<String>,
    #[serde(default)]
    pub approval_required: Vec<String>,
    #[serde(default)]
    pub dangerous: Vec<String>,
}

/// 默认配置文件的候选位置，取第一个存在的
const DEFAULT_LOCATIONS: &[&str] = &["config/default.toml", "../config/default.toml", "default.toml"];

/// 加载配置：默认文件 < 显式文件 < `CODA__*` 环境变量
///
/// 显式文件不存在时静默跳过，由调用方决定是否退回 `AppConfig::default()`。
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let defaults = DEFAULT_LOCATIONS
        .iter()
        .map(Path::new)
        .find(|p| p.is_file())
        .map(|p| config::File::from(p.to_path_buf()).required(false));
    let explicit = config_path
        .filter(|p| p.is_file())
        .map(|p| config::File::from(p).required(false));

    defaults
        .into_iter()
        .chain(explicit)
        .fold(config::Config::builder(), |b, file| b.add_source(file))
        .add_source(
            config::Environment::with_prefix("CODA")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agent.max_iterations, 50);
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.agent.retry.base_delay_ms, 1000);
        assert!(cfg.agent.approval_timeout_secs.is_none());
        assert!(cfg.tools.shell.allowed_commands.contains(&"cargo".to_string()));
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coda.toml");
        std::fs::write(
            &path,
            r#"
[agent]
max_iterations = 7
approval_timeout_secs = 90

[llm]
provider = "mock"
model = "echo"

[policy]
dangerous = ["fetch_url"]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.agent.max_iterations, 7);
        assert_eq!(cfg.agent.approval_timeout_secs, Some(90));
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.policy.dangerous, vec!["fetch_url".to_string()]);
        assert_eq!(cfg.tools.tool_timeout_secs, 30);
    }
}
