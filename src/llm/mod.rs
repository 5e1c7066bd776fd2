//! LLM 层：后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）及按配置选择的注册表

pub mod deepseek;
pub mod factory;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_backend, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use factory::{BackendFactory, BackendKind, ConfigBackendFactory, DEFAULT_MODEL, DEFAULT_PROVIDER};
pub use mock::{MockBackend, MockStep};
pub use openai::OpenAiBackend;
pub use traits::{
    Backend, BackendError, BackendReply, GenerationOptions, TokenUsage, ToolChoice,
};
