//! LLM 客户端抽象
//!
//! 编排器只依赖 LlmClient::complete；具体后端（HTTP、本地模型、脚本 Mock）由使用方提供。

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("LLM API error: {0}")]
    ApiError(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;
}
