//! 工具层：Tool trait 与注册表、ToolRouter 执行器、内置工具（文件、grep、shell、fetch）

pub mod executor;
pub mod fetch;
pub mod filesystem;
pub mod grep;
pub mod registry;
pub mod shell;

use std::path::Path;

use crate::config::ToolsSection;

pub use executor::{parse_arguments, ToolExecutor, ToolRouter};
pub use fetch::{DomainAllowlist, FetchUrlTool};
pub use filesystem::{CreateFileTool, EditFileTool, ListDirectoryTool, ReadFileTool, SafeFs};
pub use grep::GrepSearchTool;
pub use registry::{FileAccess, Tool, ToolContext, ToolDefinition, ToolRegistry, ToolResult};
pub use shell::RunCommandTool;

/// 内置工具注册表（所有接入方式共享同一套工具）
pub fn builtin_registry(workspace: &Path, cfg: &ToolsSection) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(ReadFileTool::new(workspace));
    tools.register(ListDirectoryTool::new(workspace));
    tools.register(GrepSearchTool::new(workspace));
    tools.register(CreateFileTool::new(workspace));
    tools.register(EditFileTool::new(workspace));
    tools.register(RunCommandTool::new(
        workspace,
        cfg.shell.allowed_commands.clone(),
        cfg.tool_timeout_secs,
    ));
    tools.register(FetchUrlTool::new(
        cfg.fetch.allowed_domains.clone(),
        cfg.fetch.timeout_secs,
        cfg.fetch.max_result_chars,
    ));
    tools
}
