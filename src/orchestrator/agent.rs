//! 托管在运行时中的编排器 Agent
//!
//! 收到 TaskRequest（send 或 publish）后用自身的 roster 跑一次 LedgerOrchestrator，
//! 以 TaskResult 作为响应；经 topic 收到且配置了 result_topic 时，结果同时广播到同一 source 的 result_topic。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::orchestrator::{LedgerOrchestrator, OrchestratorConfig, ReasoningOracle, Roster, TaskOutcome};
use crate::runtime::{Agent, Handler, HandlerResult, Message, MessageContext, Payload, Routes, TopicId};

/// 调用方 → 编排器：发起任务
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }
}

impl Message for TaskRequest {
    const TYPE: &'static str = "hive.task_request";
}

/// 编排器 → 调用方：最终结果或结构化失败原因
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TaskResult {
    Completed { outcome: TaskOutcome },
    Failed { error: String },
}

impl Message for TaskResult {
    const TYPE: &'static str = "hive.task_result";
}

pub struct OrchestratorAgent {
    oracle: Arc<dyn ReasoningOracle>,
    roster: Roster,
    config: OrchestratorConfig,
    result_topic: Option<String>,
    description: String,
}

impl OrchestratorAgent {
    pub fn new(oracle: Arc<dyn ReasoningOracle>, roster: Roster, config: OrchestratorConfig) -> Self {
        let description = format!(
            "Coordinates {} to complete open-ended tasks",
            roster.names().join(", ")
        );
        Self {
            oracle,
            roster,
            config,
            result_topic: None,
            description,
        }
    }

    pub fn with_result_topic(mut self, topic_type: impl Into<String>) -> Self {
        self.result_topic = Some(topic_type.into());
        self
    }
}

impl Agent for OrchestratorAgent {
    fn description(&self) -> &str {
        &self.description
    }

    fn routes(routes: &mut Routes<Self>) {
        routes.handle::<TaskRequest>();
    }
}

#[async_trait]
impl Handler<TaskRequest> for OrchestratorAgent {
    async fn handle(&mut self, message: TaskRequest, ctx: &MessageContext) -> HandlerResult {
        let orchestrator = LedgerOrchestrator::new(
            ctx.runtime().clone(),
            self.oracle.clone(),
            self.roster.clone(),
            self.config.clone(),
        )
        .with_agent_id(ctx.recipient.clone());

        let result = match orchestrator
            .run(message.task, ctx.cancellation_token.clone())
            .await
        {
            Ok(outcome) => TaskResult::Completed { outcome },
            Err(e) => {
                tracing::error!(agent = %ctx.recipient, error = %e, "task failed");
                TaskResult::Failed {
                    error: e.to_string(),
                }
            }
        };

        if let (Some(result_topic), Some(topic)) = (&self.result_topic, &ctx.topic) {
            let target = TopicId::new(result_topic.as_str(), topic.source());
            if let Err(e) = ctx
                .runtime()
                .publish_message(&result, target, Some(ctx.recipient.clone()), None)
                .await
            {
                tracing::warn!(error = %e, "task result broadcast failed");
            }
        }

        Ok(Some(Payload::encode(&result)?))
    }
}
