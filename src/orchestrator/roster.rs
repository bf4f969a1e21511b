//! 参与者名单（roster）
//!
//! 一个任务期间固定不变。名称是 Oracle 选择 next_speaker 时使用的标识，必须唯一。

use crate::orchestrator::OrchestratorError;
use crate::runtime::{AgentId, AgentRuntime};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Participant {
    pub name: String,
    pub agent_id: AgentId,
    /// 一行描述，用于构造 Oracle 提示词
    pub description: String,
}

impl Participant {
    pub fn new(
        name: impl Into<String>,
        agent_id: AgentId,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            agent_id,
            description: description.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Roster {
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new(participants: Vec<Participant>) -> Result<Self, OrchestratorError> {
        if participants.is_empty() {
            return Err(OrchestratorError::EmptyRoster);
        }
        for (i, p) in participants.iter().enumerate() {
            if participants[..i].iter().any(|q| q.name == p.name) {
                return Err(OrchestratorError::DuplicateParticipant(p.name.clone()));
            }
        }
        Ok(Self { participants })
    }

    /// 通过运行时读取各 Agent 的描述构造名单（必要时触发实例化）
    pub async fn from_runtime(
        runtime: &AgentRuntime,
        members: Vec<(String, AgentId)>,
    ) -> Result<Self, OrchestratorError> {
        let mut participants = Vec::with_capacity(members.len());
        for (name, agent_id) in members {
            let description = runtime.agent_description(&agent_id).await?;
            participants.push(Participant::new(name, agent_id, description));
        }
        Self::new(participants)
    }

    pub fn get(&self, name: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.name.as_str()).collect()
    }

    /// 每行 `name: description`
    pub fn descriptions(&self) -> String {
        self.participants
            .iter()
            .map(|p| format!("{}: {}", p.name, p.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
