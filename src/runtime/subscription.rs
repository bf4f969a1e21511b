//! 订阅：Topic → AgentId 的映射谓词
//!
//! 两种订阅都把匹配的 topic 映射到 `AgentId(agent_type, topic.source)`，
//! 即同一 source 的会话落在同一个 Agent 实例上。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::runtime::{AgentId, TopicId};

/// 订阅 ID（add_subscription 返回，用于 remove_subscription）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 订阅谓词；去重按结构相等
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Subscription {
    /// topic 类型完全相等
    Type {
        topic_type: String,
        agent_type: String,
    },
    /// topic 类型以指定前缀开头
    TypePrefix {
        topic_type_prefix: String,
        agent_type: String,
    },
}

impl Subscription {
    pub fn type_based(topic_type: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self::Type {
            topic_type: topic_type.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn type_prefix(prefix: impl Into<String>, agent_type: impl Into<String>) -> Self {
        Self::TypePrefix {
            topic_type_prefix: prefix.into(),
            agent_type: agent_type.into(),
        }
    }

    pub fn agent_type(&self) -> &str {
        match self {
            Self::Type { agent_type, .. } | Self::TypePrefix { agent_type, .. } => agent_type,
        }
    }

    pub fn is_match(&self, topic: &TopicId) -> bool {
        match self {
            Self::Type { topic_type, .. } => topic.topic_type() == topic_type,
            Self::TypePrefix {
                topic_type_prefix, ..
            } => topic.topic_type().starts_with(topic_type_prefix.as_str()),
        }
    }

    /// 不匹配时返回 None
    pub fn map_to_agent(&self, topic: &TopicId) -> Option<AgentId> {
        self.is_match(topic)
            .then(|| AgentId::new(self.agent_type(), topic.source()))
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type {
                topic_type,
                agent_type,
            } => write!(f, "{topic_type} -> {agent_type}"),
            Self::TypePrefix {
                topic_type_prefix,
                agent_type,
            } => write!(f, "{topic_type_prefix}* -> {agent_type}"),
        }
    }
}
