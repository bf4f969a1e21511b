//! 编排层：账本式编排器、Reasoning Oracle 边界与参与者名单
//!
//! 编排器只通过 AgentRuntime 的 send/publish 与参与者交互，从不接触 Agent 内部。

pub mod agent;
pub mod error;
pub mod ledger;
pub mod ledger_orchestrator;
pub mod llm_oracle;
pub mod messages;
pub mod oracle;
pub mod roster;

pub use agent::{OrchestratorAgent, TaskRequest, TaskResult};
pub use error::{LedgerParseError, OracleError, OrchestratorError};
pub use ledger::{Ledger, LedgerItem, LedgerJudgment};
pub use ledger_orchestrator::{
    Exhaustion, LedgerOrchestrator, OrchestratorConfig, OrchestratorState, TaskOutcome,
    Termination,
};
pub use llm_oracle::LlmOracle;
pub use messages::{AgentInstruction, AgentReply, ChatMessage, ChatUpdate};
pub use oracle::{EvaluateContext, FactsAndPlan, FinalAnswerContext, PlanContext, ReasoningOracle};
pub use roster::{Participant, Roster};
