//! grep_search：在工作区内按正则搜索
//!
//! walkdir 递归遍历（跳过隐藏目录、target、node_modules 与超大文件），逐行匹配，
//! 命中数达到上限即停止；遍历时检查取消信号。

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::tools::{SafeFs, Tool, ToolContext};

pub struct GrepSearchTool {
    fs: SafeFs,
    max_results: usize,
    max_file_size: u64,
}

impl GrepSearchTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root_dir),
            max_results: 100,
            max_file_size: 1024 * 1024, // 1MB
        }
    }

    pub fn with_limits(mut self, max_results: usize, max_file_size: u64) -> Self {
        self.max_results = max_results;
        self.max_file_size = max_file_size;
        self
    }

    fn search(&self, base: &Path, re: &Regex, ctx: &ToolContext) -> Result<Vec<Value>, String> {
        let mut hits = Vec::new();
        let walker = walkdir::WalkDir::new(base)
            .max_depth(16)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                e.depth() == 0
                    || (!name.starts_with('.') && name != "target" && name != "node_modules")
            })
            .filter_map(|e| e.ok());

        for entry in walker {
            if ctx.cancel.is_cancelled() {
                return Err("cancelled by user".to_string());
            }
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > self.max_file_size).unwrap_or(true) {
                continue;
            }
            let Ok(content) = std::fs::read_to_string(entry.path()) else {
                continue; // 二进制或无法读取
            };
            let rel = entry
                .path()
                .strip_prefix(self.fs.root())
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            for (idx, line) in content.lines().enumerate() {
                if re.is_match(line) {
                    let text: String = line.chars().take(200).collect();
                    hits.push(json!({"path": rel, "line": idx + 1, "text": text}));
                    if hits.len() >= self.max_results {
                        return Ok(hits);
                    }
                }
            }
        }
        Ok(hits)
    }
}

#[async_trait]
impl Tool for GrepSearchTool {
    fn name(&self) -> &str {
        "grep_search"
    }

    fn description(&self) -> &str {
        "Search files in the workspace with a regular expression. Returns path, line number and line text for each match."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Regular expression"},
                "path": {"type": "string", "description": "File or directory to search, default '.'"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value, String> {
        let pattern = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .ok_or("Missing required parameter: pattern")?;
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let re = Regex::new(pattern).map_err(|e| format!("Invalid regex pattern: {}", e))?;
        let base = self.fs.resolve(path).map_err(|e| e.to_string())?;
        tracing::info!(pattern = %pattern, path = %path, "grep_search tool execute");

        let hits = self.search(&base, &re, ctx)?;
        let truncated = hits.len() >= self.max_results;
        Ok(json!({"matches": hits, "truncated": truncated}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_grep_finds_matches_and_skips_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "fn main() {}\nfn helper() {}\n").unwrap();
        std::fs::write(dir.path().join(".git/config"), "fn hidden()").unwrap();

        let tool = GrepSearchTool::new(dir.path());
        let out = tool
            .execute(json!({"pattern": r"fn \w+\("}), &ToolContext::default())
            .await
            .unwrap();
        let matches = out["matches"].as_array().unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0]["path"], "src/lib.rs");
        assert_eq!(matches[1]["line"], 2);
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn test_grep_respects_limit_and_bad_regex() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x\nx\nx\n").unwrap();
        let tool = GrepSearchTool::new(dir.path()).with_limits(2, 1024);
        let out = tool
            .execute(json!({"pattern": "x"}), &ToolContext::default())
            .await
            .unwrap();
        assert_eq!(out["matches"].as_array().unwrap().len(), 2);
        assert_eq!(out["truncated"], true);

        assert!(tool
            .execute(json!({"pattern": "("}), &ToolContext::default())
            .await
            .is_err());
    }
}
