//! 基于 LlmClient 的 Reasoning Oracle
//!
//! 规划分两步（先事实、后计划），重规划时把旧的事实与计划一并交给 LLM 修订。
//! 账本要求 LLM 输出 JSON；解析失败时把错误回贴给 LLM 重试，最多 max_json_retries 次。

use std::sync::Arc;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};
use crate::orchestrator::oracle::render_history;
use crate::orchestrator::{
    EvaluateContext, FactsAndPlan, FinalAnswerContext, Ledger, LedgerJudgment, OracleError,
    PlanContext, ReasoningOracle,
};

const SYSTEM_PROMPT: &str =
    "You coordinate a team of agents to complete a task. Be concise and precise.";

const FACTS_PROMPT: &str = r#"Below is a task. Before we begin, list what we know and what we still need.

TASK:
{task}

Answer with these headings:
1. GIVEN OR VERIFIED FACTS
2. FACTS TO LOOK UP
3. FACTS TO DERIVE
4. EDUCATED GUESSES"#;

const PLAN_PROMPT: &str = r#"Our team:

{roster}

Write a short bullet-point plan for completing the task with this team. Only involve members whose skills are needed."#;

const UPDATE_FACTS_PROMPT: &str = r#"We have not been making progress on the task:

{task}

Conversation so far:
{history}

Here is the previous fact sheet:

{facts}

Rewrite the fact sheet. Move verified guesses into the facts, and add new guesses that explain why we are stuck."#;

const UPDATE_PLAN_PROMPT: &str = r#"The previous plan was:

{plan}

Our team:

{roster}

Briefly explain what went wrong, then write a new bullet-point plan that avoids repeating it."#;

const LEDGER_PROMPT: &str = r#"We are working on the following task:

{task}

Facts:
{facts}

Plan:
{plan}

Team members:
{roster}

Conversation so far:
{history}

Answer the following questions:
- Is the request fully satisfied? (true if complete, false if anything remains)
- Are we in a loop, repeating the same requests or responses?
- Are we making forward progress? (false if stuck or looping)
- Who should speak next? (one of: {names})
- What instruction or question should be given to that team member?

Output ONLY valid JSON in exactly this shape:

{
  "is_request_satisfied": {"reason": string, "answer": boolean},
  "is_in_loop": {"reason": string, "answer": boolean},
  "is_progress_being_made": {"reason": string, "answer": boolean},
  "next_speaker": {"reason": string, "answer": string},
  "instruction_or_question": {"reason": string, "answer": string}
}"#;

const FINAL_ANSWER_PROMPT: &str = r#"We are finishing the task:

{task}

Conversation so far:
{history}

{status}

Write the final answer to the task, addressed to the person who asked."#;

/// 以 LLM 为后端的 Oracle
pub struct LlmOracle {
    llm: Arc<dyn LlmClient>,
    max_json_retries: usize,
}

impl LlmOracle {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            max_json_retries: 3,
        }
    }

    pub fn with_max_json_retries(mut self, retries: usize) -> Self {
        self.max_json_retries = retries.max(1);
        self
    }

    async fn ask(&self, conversation: &[Message]) -> Result<String, OracleError> {
        let mut messages = Vec::with_capacity(conversation.len() + 1);
        messages.push(Message::system(SYSTEM_PROMPT));
        messages.extend_from_slice(conversation);
        Ok(self.llm.complete(&messages).await?)
    }

    async fn initial_plan(&self, ctx: PlanContext<'_>) -> Result<FactsAndPlan, OracleError> {
        let mut conversation = vec![Message::user(FACTS_PROMPT.replace("{task}", ctx.task))];
        let facts = self.ask(&conversation).await?;
        conversation.push(Message::assistant(facts.clone()));
        conversation.push(Message::user(
            PLAN_PROMPT.replace("{roster}", &ctx.roster.descriptions()),
        ));
        let plan = self.ask(&conversation).await?;
        Ok(FactsAndPlan { facts, plan })
    }

    async fn revised_plan(
        &self,
        ctx: PlanContext<'_>,
        previous: &FactsAndPlan,
    ) -> Result<FactsAndPlan, OracleError> {
        let facts_prompt = UPDATE_FACTS_PROMPT
            .replace("{task}", ctx.task)
            .replace("{history}", &render_history(ctx.chat_history))
            .replace("{facts}", &previous.facts);
        let mut conversation = vec![Message::user(facts_prompt)];
        let facts = self.ask(&conversation).await?;
        conversation.push(Message::assistant(facts.clone()));
        conversation.push(Message::user(
            UPDATE_PLAN_PROMPT
                .replace("{plan}", &previous.plan)
                .replace("{roster}", &ctx.roster.descriptions()),
        ));
        let plan = self.ask(&conversation).await?;
        Ok(FactsAndPlan { facts, plan })
    }
}

#[async_trait]
impl ReasoningOracle for LlmOracle {
    async fn plan(&self, ctx: PlanContext<'_>) -> Result<FactsAndPlan, OracleError> {
        match ctx.previous {
            None => self.initial_plan(ctx).await,
            Some(previous) => self.revised_plan(ctx, previous).await,
        }
    }

    async fn evaluate(&self, ctx: EvaluateContext<'_>) -> Result<Ledger, OracleError> {
        let prompt = LEDGER_PROMPT
            .replace("{task}", ctx.task)
            .replace("{facts}", ctx.facts)
            .replace("{plan}", ctx.plan)
            .replace("{roster}", &ctx.roster.descriptions())
            .replace("{history}", &render_history(ctx.chat_history))
            .replace("{names}", &ctx.roster.names().join(", "));
        let mut conversation = vec![Message::user(prompt)];

        let mut attempt = 0;
        loop {
            attempt += 1;
            let output = self.ask(&conversation).await?;
            match LedgerJudgment::parse(&output) {
                Ok(judgment) => {
                    tracing::debug!(
                        satisfied = %judgment.is_request_satisfied.reason,
                        progress = %judgment.is_progress_being_made.reason,
                        next_speaker = %judgment.next_speaker.reason,
                        "ledger reasons"
                    );
                    return Ok(Ledger::from(judgment));
                }
                Err(source) if attempt >= self.max_json_retries => {
                    return Err(OracleError::Parse {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, "ledger parse failed: {}", e);
                    conversation.push(Message::assistant(output));
                    conversation.push(Message::user(format!(
                        "That was not valid ledger JSON ({}). Reply again with ONLY the JSON object.",
                        e
                    )));
                }
            }
        }
    }

    async fn final_answer(&self, ctx: FinalAnswerContext<'_>) -> Result<String, OracleError> {
        let status = if ctx.satisfied {
            "The request has been satisfied."
        } else {
            "We ran out of time or attempts before fully satisfying the request; give the best partial answer."
        };
        let prompt = FINAL_ANSWER_PROMPT
            .replace("{task}", ctx.task)
            .replace("{history}", &render_history(ctx.chat_history))
            .replace("{status}", status);
        self.ask(&[Message::user(prompt)]).await
    }
}
