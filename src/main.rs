//! Hive demo
//!
//! 入口：加载配置、初始化日志，在运行时中注册两个回显参与者与一个编排器 Agent，
//! 用脚本化 LLM 驱动一次完整任务并打印结果。

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hive::config::load_config;
use hive::llm::ScriptedLlmClient;
use hive::orchestrator::{
    AgentInstruction, AgentReply, LlmOracle, OrchestratorAgent, OrchestratorConfig,
    ReasoningOracle, Roster, TaskRequest, TaskResult,
};
use hive::runtime::{
    Agent, AgentError, AgentId, AgentRuntime, Handler, HandlerResult, MessageContext, Payload,
    Routes, RuntimeOptions, TracingIntervention,
};

/// 把收到的指令原样回复的参与者
struct EchoAgent {
    name: String,
    description: String,
}

impl Agent for EchoAgent {
    fn description(&self) -> &str {
        &self.description
    }

    fn routes(routes: &mut Routes<Self>) {
        routes.handle::<AgentInstruction>();
    }
}

#[async_trait]
impl Handler<AgentInstruction> for EchoAgent {
    async fn handle(&mut self, message: AgentInstruction, _ctx: &MessageContext) -> HandlerResult {
        let reply = AgentReply::new(format!("[{}] {}", self.name, message.instruction));
        Ok(Some(Payload::encode(&reply)?))
    }
}

fn ledger(satisfied: bool, speaker: &str, instruction: &str) -> String {
    serde_json::json!({
        "is_request_satisfied": {"reason": "", "answer": satisfied},
        "is_in_loop": {"reason": "", "answer": false},
        "is_progress_being_made": {"reason": "", "answer": true},
        "next_speaker": {"reason": "", "answer": speaker},
        "instruction_or_question": {"reason": "", "answer": instruction},
    })
    .to_string()
}

fn scripted_llm() -> ScriptedLlmClient {
    ScriptedLlmClient::new([
        "1. GIVEN OR VERIFIED FACTS\n- The poem must be a haiku about Rust.".to_string(),
        "- writer drafts the haiku\n- reviewer checks the syllable count".to_string(),
        ledger(false, "writer", "Draft a haiku about Rust."),
        ledger(false, "reviewer", "Check the draft's syllables."),
        ledger(true, "writer", "Done"),
        "Borrow checker hums / lifetimes fold into the night / no data races".to_string(),
    ])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config(None).context("Failed to load config")?;
    hive::observability::init(&config.logging.filter);

    let runtime = AgentRuntime::new(
        RuntimeOptions::from_config(&config.runtime).with_intervention(TracingIntervention),
    );

    for (name, description) in [
        ("writer", "Writes short drafts on request"),
        ("reviewer", "Reviews drafts and points out problems"),
    ] {
        runtime
            .register_factory(name, move |_id: &AgentId| {
                Ok::<_, AgentError>(EchoAgent {
                    name: name.to_string(),
                    description: description.to_string(),
                })
            })
            .await
            .with_context(|| format!("Failed to register {}", name))?;
    }

    let roster = Roster::from_runtime(
        &runtime,
        vec![
            ("writer".to_string(), AgentId::new("writer", "default")),
            ("reviewer".to_string(), AgentId::new("reviewer", "default")),
        ],
    )
    .await
    .context("Failed to build roster")?;
    for participant in roster.iter() {
        tracing::info!(name = %participant.name, description = %participant.description, "participant");
    }

    let oracle: Arc<dyn ReasoningOracle> = Arc::new(LlmOracle::new(Arc::new(scripted_llm())));
    let orchestrator_config = OrchestratorConfig::from_config(&config.orchestrator);
    runtime
        .register_factory("orchestrator", move |_id: &AgentId| {
            Ok::<_, AgentError>(OrchestratorAgent::new(
                oracle.clone(),
                roster.clone(),
                orchestrator_config.clone(),
            ))
        })
        .await
        .context("Failed to register orchestrator")?;

    runtime.start()?;
    let response = runtime
        .send_message(
            &TaskRequest::new("Write a haiku about Rust"),
            AgentId::new("orchestrator", "default"),
            None,
            None,
        )
        .await
        .context("Task dispatch failed")?
        .context("Orchestrator returned no result")?;

    match response.decode::<TaskResult>()? {
        TaskResult::Completed { outcome } => {
            println!("termination: {:?}", outcome.termination);
            println!("rounds: {}, replans: {}", outcome.state.round_count, outcome.state.replan_count);
            for message in &outcome.state.chat_history {
                println!("{}: {}", message.source, message.content);
            }
            println!("answer: {}", outcome.answer.unwrap_or_default());
        }
        TaskResult::Failed { error } => println!("task failed: {}", error),
    }

    runtime.stop_when_idle().await?;
    runtime.close().await?;
    Ok(())
}
