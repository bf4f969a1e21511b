//! 进度账本（Ledger）
//!
//! 每轮由 Oracle 重新生成、整体替换。LLM 输出的 JSON 形如：
//!
//! ```text
//! {
//!   "is_request_satisfied":    {"reason": "...", "answer": false},
//!   "is_progress_being_made":  {"reason": "...", "answer": true},
//!   "is_in_loop":              {"reason": "...", "answer": false},
//!   "instruction_or_question": {"reason": "...", "answer": "..."},
//!   "next_speaker":            {"reason": "...", "answer": "coder"}
//! }
//! ```
//!
//! 可以包在 ```json 代码块中，也可以前后带有说明文字。

use serde::{Deserialize, Serialize};

use crate::orchestrator::LedgerParseError;

/// 本轮的结构化判断；三个标志位互相独立，编排器不做推断
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub is_request_satisfied: bool,
    pub is_progress_being_made: bool,
    pub is_in_loop: bool,
    pub instruction_or_question: String,
    /// roster 中的参与者名称
    pub next_speaker: String,
}

/// 带理由的单项回答
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerItem<T> {
    #[serde(default)]
    pub reason: String,
    pub answer: T,
}

impl<T> LedgerItem<T> {
    fn bare(answer: T) -> Self {
        Self {
            reason: String::new(),
            answer,
        }
    }
}

/// LLM 输出的原始判断（含每项理由）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerJudgment {
    pub is_request_satisfied: LedgerItem<bool>,
    pub is_progress_being_made: LedgerItem<bool>,
    pub is_in_loop: LedgerItem<bool>,
    pub instruction_or_question: LedgerItem<String>,
    pub next_speaker: LedgerItem<String>,
}

impl LedgerJudgment {
    /// 从 LLM 输出中提取并解析账本 JSON
    pub fn parse(output: &str) -> Result<Self, LedgerParseError> {
        let json = extract_json(output).ok_or(LedgerParseError::NoJson)?;
        serde_json::from_str(json).map_err(|source| LedgerParseError::Invalid {
            json: json.to_string(),
            source,
        })
    }
}

impl Ledger {
    pub fn from_judgment(judgment: &LedgerJudgment) -> Self {
        Self {
            is_request_satisfied: judgment.is_request_satisfied.answer,
            is_progress_being_made: judgment.is_progress_being_made.answer,
            is_in_loop: judgment.is_in_loop.answer,
            instruction_or_question: judgment.instruction_or_question.answer.clone(),
            next_speaker: judgment.next_speaker.answer.clone(),
        }
    }

    /// 转回判断结构（理由为空）
    pub fn to_judgment(&self) -> LedgerJudgment {
        LedgerJudgment {
            is_request_satisfied: LedgerItem::bare(self.is_request_satisfied),
            is_progress_being_made: LedgerItem::bare(self.is_progress_being_made),
            is_in_loop: LedgerItem::bare(self.is_in_loop),
            instruction_or_question: LedgerItem::bare(self.instruction_or_question.clone()),
            next_speaker: LedgerItem::bare(self.next_speaker.clone()),
        }
    }

    pub fn parse(output: &str) -> Result<Self, LedgerParseError> {
        LedgerJudgment::parse(output).map(|j| Self::from_judgment(&j))
    }
}

impl From<LedgerJudgment> for Ledger {
    fn from(judgment: LedgerJudgment) -> Self {
        Self::from_judgment(&judgment)
    }
}

/// 提取 JSON 块（```json ... ``` 或首个 `{` 到最后一个 `}`）
fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}
