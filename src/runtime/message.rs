//! 消息与寻址模型
//!
//! AgentId = (type, key)，TopicId = (type, source)；Payload 是带运行时类型标签的 JSON 值，
//! 标签来自 Message trait 的 TYPE 常量，Agent 容器据此选择 Handler。

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::runtime::{AgentRuntime, CancellationToken, CodecError};

/// 已注册工厂的名称
pub type AgentType = String;

/// Agent 地址：类型 + 实例 key，二者共同构成身份
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    #[serde(rename = "type")]
    agent_type: String,
    key: String,
}

impl AgentId {
    pub fn new(agent_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            key: key.into(),
        }
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.agent_type, self.key)
    }
}

/// Agent 类型名只允许字母、数字、`_`、`-`、`.`
pub(crate) fn is_valid_agent_type(agent_type: &str) -> bool {
    !agent_type.is_empty()
        && agent_type
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Topic 地址：source 用于区分共享同一 topic 类型的多个独立会话
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicId {
    #[serde(rename = "type")]
    topic_type: String,
    source: String,
}

impl TopicId {
    pub fn new(topic_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            topic_type: topic_type.into(),
            source: source.into(),
        }
    }

    pub fn topic_type(&self) -> &str {
        &self.topic_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic_type, self.source)
    }
}

/// 可在运行时中传递的消息类型；TYPE 是路由用的类型标签
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const TYPE: &'static str;
}

/// 不透明消息体：类型标签 + JSON 值
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    message_type: String,
    body: serde_json::Value,
}

impl Payload {
    pub fn encode<M: Message>(message: &M) -> Result<Self, CodecError> {
        Ok(Self {
            message_type: M::TYPE.to_string(),
            body: serde_json::to_value(message)?,
        })
    }

    /// 直接用标签和 JSON 构造（无对应 Rust 类型时使用）
    pub fn raw(message_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            body,
        }
    }

    pub fn decode<M: Message>(&self) -> Result<M, CodecError> {
        if self.message_type != M::TYPE {
            return Err(CodecError::TypeMismatch {
                expected: M::TYPE.to_string(),
                actual: self.message_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.body.clone())?)
    }

    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::TYPE
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn body(&self) -> &serde_json::Value {
        &self.body
    }
}

/// Handler 调用上下文：本次投递的元数据、取消令牌，以及可继续 send/publish 的运行时句柄
#[derive(Clone, Debug)]
pub struct MessageContext {
    pub message_id: String,
    /// 正在处理消息的 Agent
    pub recipient: AgentId,
    pub sender: Option<AgentId>,
    /// 经 publish 投递时为来源 Topic
    pub topic: Option<TopicId>,
    /// true 表示点对点请求，调用方在等待响应
    pub is_rpc: bool,
    pub cancellation_token: CancellationToken,
    runtime: AgentRuntime,
}

impl MessageContext {
    pub(crate) fn new(
        message_id: String,
        recipient: AgentId,
        sender: Option<AgentId>,
        topic: Option<TopicId>,
        cancellation_token: CancellationToken,
        runtime: AgentRuntime,
    ) -> Self {
        let is_rpc = topic.is_none();
        Self {
            message_id,
            recipient,
            sender,
            topic,
            is_rpc,
            cancellation_token,
            runtime,
        }
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    impl Message for Ping {
        const TYPE: &'static str = "test.ping";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Pong;

    impl Message for Pong {
        const TYPE: &'static str = "test.pong";
    }

    #[test]
    fn test_agent_id_display_and_identity() {
        let a = AgentId::new("writer", "default");
        let b = AgentId::new("writer", "default");
        let c = AgentId::new("writer", "other");
        assert_eq!(a.to_string(), "writer/default");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_agent_type_validation() {
        assert!(is_valid_agent_type("web_surfer-1.v2"));
        assert!(!is_valid_agent_type(""));
        assert!(!is_valid_agent_type("has space"));
        assert!(!is_valid_agent_type("a/b"));
    }

    #[test]
    fn test_payload_encode_decode() {
        let payload = Payload::encode(&Ping { n: 7 }).unwrap();
        assert_eq!(payload.message_type(), "test.ping");
        assert!(payload.is::<Ping>());
        assert_eq!(payload.decode::<Ping>().unwrap(), Ping { n: 7 });
    }

    #[test]
    fn test_payload_type_mismatch() {
        let payload = Payload::encode(&Ping { n: 1 }).unwrap();
        match payload.decode::<Pong>() {
            Err(CodecError::TypeMismatch { expected, actual }) => {
                assert_eq!(expected, "test.pong");
                assert_eq!(actual, "test.ping");
            }
            other => panic!("Expected TypeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_payload_with_bad_body() {
        let payload = Payload::raw("test.ping", serde_json::json!({"n": "not a number"}));
        assert!(matches!(payload.decode::<Ping>(), Err(CodecError::Json(_))));
    }
}
