//! 编排器错误类型
//!
//! 只有协议错误（InvalidSpeaker）与 Oracle 故障会中止编排循环；
//! 停滞/轮数/时间耗尽不是错误，而是 TaskOutcome 中的正常终态。

use thiserror::Error;

use crate::llm::LlmError;
use crate::runtime::RuntimeError;

/// 从 LLM 输出中解析账本失败
#[derive(Error, Debug)]
pub enum LedgerParseError {
    #[error("no JSON object found in oracle output")]
    NoJson,

    #[error("invalid ledger JSON: {source}: {json}")]
    Invalid {
        json: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Reasoning Oracle 调用失败
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("ledger still unparseable after {attempts} attempts: {source}")]
    Parse {
        attempts: usize,
        #[source]
        source: LedgerParseError,
    },

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Oracle 给出的 next_speaker 不在 roster 中；不做猜测，直接终止本次任务
    #[error("oracle named unknown next speaker '{speaker}' (roster: {roster})")]
    InvalidSpeaker { speaker: String, roster: String },

    #[error("oracle failed: {0}")]
    Oracle(#[from] OracleError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("roster is empty")]
    EmptyRoster,

    #[error("duplicate participant name '{0}'")]
    DuplicateParticipant(String),
}
