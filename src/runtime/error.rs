//! 运行时错误分类
//!
//! - 配置错误（DuplicateType / DuplicateSubscription / UnknownAgentType）：在出错的调用处同步返回，运行时仍可用
//! - 分发错误（UnhandledMessage / Handler / AgentConstruction）：作为该次 send 的失败结果返回，不影响调度循环
//! - Cancelled：第三态结果，与成功、失败都可区分

use thiserror::Error;

use crate::runtime::AgentId;

/// Payload 编解码错误
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("expected message type '{expected}', got '{actual}'")]
    TypeMismatch { expected: String, actual: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Agent 工厂或 Handler 返回的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("no handler for message type '{message_type}'")]
    Unhandled { message_type: String },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("{0}")]
    Failed(String),

    /// Handler 轮询取消令牌后主动放弃
    #[error("cancelled")]
    Cancelled,
}

impl AgentError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// 运行时对外暴露的错误
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("agent type '{0}' is already registered")]
    DuplicateType(String),

    #[error("invalid agent type '{0}': only letters, digits, '_', '-' and '.' are allowed")]
    InvalidAgentType(String),

    #[error("subscription already exists: {0}")]
    DuplicateSubscription(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("unknown agent type '{0}'")]
    UnknownAgentType(String),

    #[error("agent type '{agent_type}' has no handler for message type '{message_type}'")]
    UnhandledMessage {
        message_type: String,
        agent_type: String,
    },

    #[error("failed to construct agent {agent}: {source}")]
    AgentConstruction {
        agent: AgentId,
        #[source]
        source: AgentError,
    },

    #[error("agent {agent} failed: {source}")]
    Handler {
        agent: AgentId,
        #[source]
        source: AgentError,
    },

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("runtime is closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl RuntimeError {
    /// 是否为取消（第三态），编排器据此区分 Terminated(cancelled)
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RuntimeError::Cancelled)
    }
}
