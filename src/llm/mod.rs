//! LLM 层：客户端抽象与脚本化 Mock（供 LlmOracle 使用）

pub mod message;
pub mod mock;
pub mod traits;

pub use message::{Message, Role};
pub use mock::ScriptedLlmClient;
pub use traits::{LlmClient, LlmError};
