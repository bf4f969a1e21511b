//! 编排器与参与者之间的消息

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::{Message, Payload};

/// 对话历史中的一条记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// 发言者（参与者名称或编排器名称）
    pub source: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(source: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 编排器交给下一位发言者的指令
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstruction {
    pub instruction: String,
    /// 整体任务，供参与者理解上下文
    pub task: String,
}

impl Message for AgentInstruction {
    const TYPE: &'static str = "hive.agent_instruction";
}

/// 参与者对指令的回复
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReply {
    pub content: String,
}

impl AgentReply {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

impl Message for AgentReply {
    const TYPE: &'static str = "hive.agent_reply";
}

/// 广播到 broadcast_topic 的对话更新
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatUpdate {
    pub message: ChatMessage,
}

impl Message for ChatUpdate {
    const TYPE: &'static str = "hive.chat_update";
}

/// 把参与者的响应转成历史中的文本；非 AgentReply 的响应使用其 JSON 文本
pub(crate) fn reply_text(reply: Option<Payload>) -> String {
    match reply {
        None => "(no response)".to_string(),
        Some(payload) => match payload.decode::<AgentReply>() {
            Ok(reply) => reply.content,
            Err(_) => match payload.body() {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            },
        },
    }
}
