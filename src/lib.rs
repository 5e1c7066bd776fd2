//! coda - 交互式编程助手的编排引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排循环、工具策略、审批、取消、错误恢复与构建
//! - **llm**: 后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **memory**: 对话日志
//! - **observability**: tracing 初始化
//! - **tools**: 工具注册表、执行器与内置工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod tools;
