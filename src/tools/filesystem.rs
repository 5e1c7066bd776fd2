//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径先做词法规范化（`./a/../b` -> `b`），`..` 越过根目录即拒绝；
//! 已存在的目标再 canonicalize 校验，防止符号链接逃逸。
//! read_file / list_directory / create_file / edit_file 基于 SafeFs，并向编排器声明各自的文件访问方式。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::AgentError;
use crate::tools::{FileAccess, Tool, ToolContext};

/// 单个文件读写上限
const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// 沙箱文件系统：绑定根目录，校验路径在根下
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 词法规范化为相对根目录的路径（正斜杠分隔）；越界返回 PathEscape
    pub fn relative(&self, path: &str) -> Result<String, AgentError> {
        let raw = Path::new(path.trim());
        let raw = if raw.is_absolute() {
            raw.strip_prefix(&self.root_dir)
                .map_err(|_| AgentError::PathEscape(path.to_string()))?
        } else {
            raw
        };
        let mut parts: Vec<String> = Vec::new();
        for component in raw.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(AgentError::PathEscape(path.to_string())); // 如 ../../etc/passwd
                    }
                }
                Component::Normal(p) => parts.push(p.to_string_lossy().to_string()),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(AgentError::PathEscape(path.to_string()))
                }
            }
        }
        Ok(parts.join("/"))
    }

    /// 解析为绝对路径；目标存在时额外校验 canonicalize 后仍在根下
    pub fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let rel = self.relative(path)?;
        let full = self.root_dir.join(&rel);
        if let Ok(canonical) = full.canonicalize() {
            if !canonical.starts_with(&self.root_dir) {
                return Err(AgentError::PathEscape(path.to_string()));
            }
            return Ok(canonical);
        }
        Ok(full)
    }

    pub fn read_file(&self, path: &str) -> Result<String, AgentError> {
        let resolved = self.resolve(path)?;
        let meta = std::fs::metadata(&resolved)
            .map_err(|_| AgentError::ToolExecutionFailed(format!("Path not found: {}", path)))?;
        if meta.len() > MAX_FILE_BYTES {
            return Err(AgentError::ToolExecutionFailed(format!(
                "File too large: {} bytes",
                meta.len()
            )));
        }
        std::fs::read_to_string(&resolved)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Read failed: {}", e)))
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, AgentError> {
        let base = self.resolve(path)?;
        let mut entries = Vec::new();
        for e in std::fs::read_dir(&base)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("List failed: {}", e)))?
        {
            let e = e.map_err(|e| AgentError::ToolExecutionFailed(e.to_string()))?;
            let name = e.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                let ty = if e.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    "/"
                } else {
                    ""
                };
                entries.push(format!("{}{}", name, ty));
            }
        }
        entries.sort();
        Ok(entries)
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, AgentError> {
        if content.len() as u64 > MAX_FILE_BYTES {
            return Err(AgentError::ToolExecutionFailed("Content too large".to_string()));
        }
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AgentError::ToolExecutionFailed(format!("Failed to create parent directory: {}", e))
            })?;
        }
        std::fs::write(&resolved, content)
            .map_err(|e| AgentError::ToolExecutionFailed(format!("Write failed: {}", e)))?;
        Ok(resolved)
    }

    fn exists(&self, rel: &str) -> bool {
        self.root_dir.join(rel).exists()
    }
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("Missing required parameter: {key}"))
}

fn path_access(fs: &SafeFs, args: &Value, build: impl FnOnce(String) -> FileAccess) -> FileAccess {
    match args.get("path").and_then(|v| v.as_str()).map(|p| fs.relative(p)) {
        Some(Ok(rel)) => build(rel),
        _ => FileAccess::None,
    }
}

/// read_file：读取文件内容
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file relative to the workspace. Must be called on a file before editing or overwriting it."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace"}
            },
            "required": ["path"]
        })
    }

    fn file_access(&self, args: &Value) -> FileAccess {
        path_access(&self.fs, args, FileAccess::Read)
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = str_arg(&args, "path")?;
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(path).map(Value::String).map_err(|e| e.to_string())
    }
}

/// list_directory：列出目录
pub struct ListDirectoryTool {
    fs: SafeFs,
}

impl ListDirectoryTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &str {
        "list_directory"
    }

    fn description(&self) -> &str {
        "List a directory relative to the workspace (directories end with '/')."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory path, default '.'"}
            },
            "required": []
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        tracing::info!(path = %path, "list_directory tool execute");
        let entries = self.fs.list_dir(path).map_err(|e| e.to_string())?;
        Ok(json!(entries))
    }
}

/// create_file：创建文件；目标已存在时即为覆盖（需先 read_file）
pub struct CreateFileTool {
    fs: SafeFs,
}

impl CreateFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create a file with the given content (parent directories are created). Overwriting an existing file requires reading it first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "File path relative to the workspace"},
                "content": {"type": "string", "description": "Full file content"}
            },
            "required": ["path", "content"]
        })
    }

    fn file_access(&self, args: &Value) -> FileAccess {
        path_access(&self.fs, args, |rel| {
            if self.fs.exists(&rel) {
                FileAccess::Mutate(rel)
            } else {
                FileAccess::Create(rel)
            }
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = str_arg(&args, "path")?;
        let content = str_arg(&args, "content")?;
        tracing::info!(path = %path, bytes = content.len(), "create_file tool execute");
        self.fs.write_file(path, content).map_err(|e| e.to_string())?;
        Ok(json!({"path": path, "bytes_written": content.len()}))
    }
}

/// edit_file：精确替换文件中唯一出现的一段文本
pub struct EditFileTool {
    fs: SafeFs,
}

impl EditFileTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
        }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Replace exactly one occurrence of old_text with new_text in a file. The file must have been read first."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "old_text": {"type": "string", "description": "Exact text to replace; must occur exactly once"},
                "new_text": {"type": "string"}
            },
            "required": ["path", "old_text", "new_text"]
        })
    }

    fn file_access(&self, args: &Value) -> FileAccess {
        path_access(&self.fs, args, FileAccess::Mutate)
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, String> {
        let path = str_arg(&args, "path")?;
        let old_text = str_arg(&args, "old_text")?;
        let new_text = str_arg(&args, "new_text")?;
        if old_text.is_empty() {
            return Err("old_text must not be empty".to_string());
        }
        let content = self.fs.read_file(path).map_err(|e| e.to_string())?;
        match content.matches(old_text).count() {
            0 => return Err(format!("old_text not found in {path}")),
            1 => {}
            n => {
                return Err(format!(
                    "old_text occurs {n} times in {path}; include more context to make it unique"
                ))
            }
        }
        let line = content
            .find(old_text)
            .map(|idx| content[..idx].matches('\n').count() + 1)
            .unwrap_or(1);
        let updated = content.replacen(old_text, new_text, 1);
        self.fs.write_file(path, &updated).map_err(|e| e.to_string())?;
        tracing::info!(path = %path, line, "edit_file tool execute");
        Ok(json!({"path": path, "line": line}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::default()
    }

    #[test]
    fn test_relative_normalizes_and_blocks_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert_eq!(fs.relative("./src/../a.txt").unwrap(), "a.txt");
        assert_eq!(fs.relative("src/lib.rs").unwrap(), "src/lib.rs");
        assert!(matches!(fs.relative("../etc/passwd"), Err(AgentError::PathEscape(_))));
        assert!(fs.relative("/etc/passwd").is_err());
        let abs = fs.root().join("b.txt");
        assert_eq!(fs.relative(abs.to_str().unwrap()).unwrap(), "b.txt");
    }

    #[tokio::test]
    async fn test_create_then_read_and_edit() {
        let dir = tempfile::tempdir().unwrap();
        let create = CreateFileTool::new(dir.path());
        let args = json!({"path": "notes/a.txt", "content": "hello world\n"});
        assert_eq!(create.file_access(&args), FileAccess::Create("notes/a.txt".into()));
        create.execute(args.clone(), &ctx()).await.unwrap();
        assert_eq!(create.file_access(&args), FileAccess::Mutate("notes/a.txt".into()));

        let read = ReadFileTool::new(dir.path());
        let content = read.execute(json!({"path": "notes/a.txt"}), &ctx()).await.unwrap();
        assert_eq!(content, json!("hello world\n"));

        let edit = EditFileTool::new(dir.path());
        edit.execute(
            json!({"path": "notes/a.txt", "old_text": "world", "new_text": "coda"}),
            &ctx(),
        )
        .await
        .unwrap();
        let content = std::fs::read_to_string(dir.path().join("notes/a.txt")).unwrap();
        assert_eq!(content, "hello coda\n");
    }

    #[tokio::test]
    async fn test_edit_requires_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dup.txt"), "x x").unwrap();
        let edit = EditFileTool::new(dir.path());
        let err = edit
            .execute(json!({"path": "dup.txt", "old_text": "x", "new_text": "y"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.contains("2 times"));
        let err = edit
            .execute(json!({"path": "dup.txt", "old_text": "z", "new_text": "y"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.contains("not found"));
    }

    #[tokio::test]
    async fn test_list_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        let ls = ListDirectoryTool::new(dir.path());
        let out = ls.execute(json!({}), &ctx()).await.unwrap();
        assert_eq!(out, json!(["a.txt", "src/"]));
    }

    #[tokio::test]
    async fn test_read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(dir.path());
        assert!(read.execute(json!({"path": "missing.txt"}), &ctx()).await.is_err());
        assert!(read.execute(json!({}), &ctx()).await.is_err());
    }
}
