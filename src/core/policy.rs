//! 工具策略：分级（safe / approval-required / dangerous）与先读后写前置条件
//!
//! 分级决定是否需要审批；前置条件在审批之前独立检查：对已存在文件 P 的修改，
//! 要求本会话内读工具已观察过 P。

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::config::PolicySection;
use crate::tools::FileAccess;

/// 工具风险分级
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolClass {
    /// 从不需要审批
    Safe,
    /// 需要审批，除非本会话已开启自动批准
    ApprovalRequired,
    /// 总是需要审批，不受会话自动批准影响
    Dangerous,
}

const DEFAULT_SAFE: &[&str] = &["read_file", "list_directory", "grep_search"];
const DEFAULT_APPROVAL_REQUIRED: &[&str] = &["create_file", "edit_file", "fetch_url"];
const DEFAULT_DANGEROUS: &[&str] = &["run_command"];

/// 工具名 -> 分级；未登记的工具（如外部协议工具）按 ApprovalRequired 处理
#[derive(Clone, Debug)]
pub struct ToolPolicy {
    classes: HashMap<String, ToolClass>,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::from_config(&PolicySection::default())
    }
}

impl ToolPolicy {
    /// 内置默认 + [policy] 段覆盖（后写入者生效：safe < approval_required < dangerous）
    pub fn from_config(cfg: &PolicySection) -> Self {
        let mut classes = HashMap::new();
        let defaults = [
            (DEFAULT_SAFE, ToolClass::Safe),
            (DEFAULT_APPROVAL_REQUIRED, ToolClass::ApprovalRequired),
            (DEFAULT_DANGEROUS, ToolClass::Dangerous),
        ];
        for (names, class) in defaults {
            for name in names {
                classes.insert(name.to_string(), class);
            }
        }
        let overrides = [
            (&cfg.safe, ToolClass::Safe),
            (&cfg.approval_required, ToolClass::ApprovalRequired),
            (&cfg.dangerous, ToolClass::Dangerous),
        ];
        for (names, class) in overrides {
            for name in names {
                classes.insert(name.trim().to_string(), class);
            }
        }
        Self { classes }
    }

    pub fn classify(&self, tool_name: &str) -> ToolClass {
        self.classes
            .get(tool_name)
            .copied()
            .unwrap_or(ToolClass::ApprovalRequired)
    }

    /// 是否需要交互确认
    pub fn requires_approval(&self, class: ToolClass, session_auto_approve: bool) -> bool {
        match class {
            ToolClass::Safe => false,
            ToolClass::ApprovalRequired => !session_auto_approve,
            ToolClass::Dangerous => true,
        }
    }
}

/// 会话内读工具观察过的路径（工作区相对、已规范化）
#[derive(Clone, Debug, Default)]
pub struct ReadTracker {
    seen: HashSet<String>,
}

impl ReadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, path: impl Into<String>) {
        self.seen.insert(path.into());
    }

    pub fn has_read(&self, path: &str) -> bool {
        self.seen.contains(path)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// 先读后写：仅 Mutate(P) 受约束
    pub fn check(&self, access: &FileAccess) -> Result<(), String> {
        match access {
            FileAccess::Mutate(path) if !self.has_read(path) => Err(format!(
                "precondition failed: '{path}' must be read with read_file before it can be modified"
            )),
            _ => Ok(()),
        }
    }

    /// 工具成功后登记：Read(P) 与 Create(P) 都使 P 变为「已观察」
    pub fn observe(&mut self, access: &FileAccess) {
        match access {
            FileAccess::Read(path) | FileAccess::Create(path) => self.record(path.clone()),
            FileAccess::Mutate(_) | FileAccess::None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classes() {
        let policy = ToolPolicy::default();
        assert_eq!(policy.classify("read_file"), ToolClass::Safe);
        assert_eq!(policy.classify("edit_file"), ToolClass::ApprovalRequired);
        assert_eq!(policy.classify("run_command"), ToolClass::Dangerous);
        assert_eq!(policy.classify("mcp__github__search"), ToolClass::ApprovalRequired);
    }

    #[test]
    fn test_config_overrides() {
        let cfg = PolicySection {
            safe: vec!["fetch_url".into()],
            approval_required: vec![],
            dangerous: vec!["edit_file".into()],
        };
        let policy = ToolPolicy::from_config(&cfg);
        assert_eq!(policy.classify("fetch_url"), ToolClass::Safe);
        assert_eq!(policy.classify("edit_file"), ToolClass::Dangerous);
        assert_eq!(policy.classify("create_file"), ToolClass::ApprovalRequired);
    }

    #[test]
    fn test_auto_approve_never_promotes_dangerous() {
        let policy = ToolPolicy::default();
        assert!(!policy.requires_approval(ToolClass::Safe, false));
        assert!(policy.requires_approval(ToolClass::ApprovalRequired, false));
        assert!(!policy.requires_approval(ToolClass::ApprovalRequired, true));
        assert!(policy.requires_approval(ToolClass::Dangerous, true));
    }

    #[test]
    fn test_read_before_write() {
        let mut tracker = ReadTracker::new();
        let mutate = FileAccess::Mutate("src/lib.rs".into());
        assert!(tracker.check(&mutate).unwrap_err().contains("precondition failed"));
        assert!(tracker.check(&FileAccess::Create("new.txt".into())).is_ok());

        tracker.observe(&FileAccess::Read("src/lib.rs".into()));
        assert!(tracker.check(&mutate).is_ok());

        tracker.observe(&FileAccess::Create("new.txt".into()));
        assert!(tracker.check(&FileAccess::Mutate("new.txt".into())).is_ok());

        tracker.observe(&FileAccess::Mutate("other.rs".into()));
        assert!(!tracker.has_read("other.rs"));
        assert_eq!(tracker.len(), 2);
    }
}
