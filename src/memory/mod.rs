//! 记忆层：会话内的对话日志（不做持久化）

pub mod conversation;

pub use conversation::{ConversationLog, Role, ToolCallRequest, Turn};
