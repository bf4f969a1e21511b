//! Reasoning Oracle：编排器唯一依赖的推理边界
//!
//! 编排器只消费 Oracle 的结构化输出（facts/plan、Ledger、最终答案），从不自行推断进度。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::orchestrator::{ChatMessage, Ledger, OracleError, Roster};

/// 任务事实与计划
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactsAndPlan {
    pub facts: String,
    pub plan: String,
}

/// plan 的输入；previous 为 Some 时表示重规划
#[derive(Clone, Copy, Debug)]
pub struct PlanContext<'a> {
    pub task: &'a str,
    pub roster: &'a Roster,
    pub previous: Option<&'a FactsAndPlan>,
    pub chat_history: &'a [ChatMessage],
}

#[derive(Clone, Copy, Debug)]
pub struct EvaluateContext<'a> {
    pub task: &'a str,
    pub facts: &'a str,
    pub plan: &'a str,
    pub roster: &'a Roster,
    pub chat_history: &'a [ChatMessage],
}

/// 终止时生成答案的输入
#[derive(Clone, Copy, Debug)]
pub struct FinalAnswerContext<'a> {
    pub task: &'a str,
    pub facts: &'a str,
    pub chat_history: &'a [ChatMessage],
    /// 最近一轮的账本
    pub ledger: &'a Ledger,
    /// 任务是否已满足；false 表示预算耗尽，只能给出部分答案
    pub satisfied: bool,
}

#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    /// 收集事实并给出计划（首次规划与重规划都走这里）
    async fn plan(&self, ctx: PlanContext<'_>) -> Result<FactsAndPlan, OracleError>;

    /// 生成本轮账本
    async fn evaluate(&self, ctx: EvaluateContext<'_>) -> Result<Ledger, OracleError>;

    /// 默认：满足时取账本的 instruction_or_question，否则取最后一条对话
    async fn final_answer(&self, ctx: FinalAnswerContext<'_>) -> Result<String, OracleError> {
        if ctx.satisfied {
            return Ok(ctx.ledger.instruction_or_question.clone());
        }
        Ok(ctx
            .chat_history
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }
}

/// 对话历史渲染为 `source: content` 行
pub fn render_history(history: &[ChatMessage]) -> String {
    history
        .iter()
        .map(|m| format!("{}: {}", m.source, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
