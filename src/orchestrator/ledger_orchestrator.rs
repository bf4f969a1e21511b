//! 账本式编排循环
//!
//! Planning → (Evaluating → Delegating)* → 终止，停滞超过阈值时进入 Replanning。
//! 每一步只等待一次 Oracle 调用或一次 send，状态由本循环独占，不会被并发访问。
//!
//! 终止条件（先触发者生效）：
//! - 账本报告请求已满足 → Success
//! - 停滞越过阈值且重规划次数已用完 → StallExhausted(Replans)
//! - round_count 达到 max_rounds → StallExhausted(Rounds)，委派前后都检查，同时耗尽时先报轮数
//! - 到达 max_time 截止时间 → StallExhausted(Time)；Oracle 调用与委派 send 都与截止时间竞争，
//!   正在等待的参与者不会让任务越过截止时间
//! - 取消令牌在任一状态转换处被观察到 → Cancelled
//! - Oracle 选择了 roster 之外的发言者 → Err(InvalidSpeaker)

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::OrchestratorSection;
use crate::orchestrator::messages::reply_text;
use crate::orchestrator::{
    AgentInstruction, ChatMessage, ChatUpdate, EvaluateContext, FactsAndPlan, FinalAnswerContext,
    Ledger, OrchestratorError, PlanContext, ReasoningOracle, Roster,
};
use crate::runtime::{AgentId, AgentRuntime, CancellationToken, TopicId};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_rounds: u32,
    /// 连续停滞次数超过该值时重规划
    pub max_stalls_before_replan: u32,
    pub max_replans: u32,
    pub max_time: Option<Duration>,
    /// 每轮对话以 ChatUpdate 广播到该 topic
    pub broadcast_topic: Option<TopicId>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_config(&OrchestratorSection::default())
    }
}

impl OrchestratorConfig {
    pub fn from_config(section: &OrchestratorSection) -> Self {
        Self {
            max_rounds: section.max_rounds,
            max_stalls_before_replan: section.max_stalls_before_replan,
            max_replans: section.max_replans,
            max_time: section.max_time_secs.map(Duration::from_secs),
            broadcast_topic: section
                .broadcast_topic
                .as_ref()
                .map(|t| TopicId::new(t.as_str(), "default")),
        }
    }

    /// 已耗尽的轮数或时间预算；两者同时耗尽时报告轮数
    pub fn exhausted(&self, rounds: u32, elapsed: Duration) -> Option<Exhaustion> {
        if rounds >= self.max_rounds {
            tracing::warn!(rounds, "round budget exhausted");
            return Some(Exhaustion::Rounds);
        }
        match self.max_time {
            Some(max_time) if elapsed >= max_time => {
                tracing::warn!(?elapsed, "time budget exhausted");
                Some(Exhaustion::Time)
            }
            _ => None,
        }
    }
}

/// 单个任务的编排状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub task: String,
    pub facts: String,
    pub plan: String,
    pub chat_history: Vec<ChatMessage>,
    pub stall_count: u32,
    pub replan_count: u32,
    pub round_count: u32,
}

impl OrchestratorState {
    fn new(task: String) -> Self {
        Self {
            task,
            facts: String::new(),
            plan: String::new(),
            chat_history: Vec::new(),
            stall_count: 0,
            replan_count: 0,
            round_count: 0,
        }
    }
}

/// 耗尽的预算
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exhaustion {
    Replans,
    Rounds,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "budget", rename_all = "snake_case")]
pub enum Termination {
    Success,
    StallExhausted(Exhaustion),
    Cancelled,
}

/// 任务结果：成功、耗尽、取消三者之一，始终可区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub termination: Termination,
    /// 成功时为最终答案，耗尽时为部分答案，取消时为 None
    pub answer: Option<String>,
    pub state: OrchestratorState,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Success
    }
}

pub struct LedgerOrchestrator {
    runtime: AgentRuntime,
    oracle: Arc<dyn ReasoningOracle>,
    roster: Roster,
    config: OrchestratorConfig,
    /// 历史中编排器发言的署名
    name: String,
    /// 作为 send 的 sender；独立运行时为 None
    agent_id: Option<AgentId>,
}

impl LedgerOrchestrator {
    pub fn new(
        runtime: AgentRuntime,
        oracle: Arc<dyn ReasoningOracle>,
        roster: Roster,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            oracle,
            roster,
            config,
            name: "orchestrator".to_string(),
            agent_id: None,
        }
    }

    pub fn with_agent_id(mut self, agent_id: AgentId) -> Self {
        self.name = agent_id.agent_type().to_string();
        self.agent_id = Some(agent_id);
        self
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// 运行一个任务直到终止。耗尽与取消是正常结果，只有协议错误与 Oracle 故障返回 Err
    pub async fn run(
        &self,
        task: impl Into<String>,
        token: CancellationToken,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let started = Instant::now();
        let deadline = self.config.max_time.map(|max_time| started + max_time);
        let mut state = OrchestratorState::new(task.into());
        tracing::info!(task = %state.task, participants = self.roster.len(), "task started");

        // Planning
        let plan_ctx = PlanContext {
            task: &state.task,
            roster: &self.roster,
            previous: None,
            chat_history: &state.chat_history,
        };
        let step = guarded(&token, deadline, self.oracle.plan(plan_ctx)).await?;
        let initial = match step {
            Step::Done(plan) => plan,
            Step::Interrupted(why) => return Ok(interrupted(state, why)),
        };
        state.facts = initial.facts;
        state.plan = initial.plan;

        loop {
            // Evaluating
            let eval_ctx = EvaluateContext {
                task: &state.task,
                facts: &state.facts,
                plan: &state.plan,
                roster: &self.roster,
                chat_history: &state.chat_history,
            };
            let step = guarded(&token, deadline, self.oracle.evaluate(eval_ctx)).await?;
            let ledger = match step {
                Step::Done(ledger) => ledger,
                Step::Interrupted(why) => return Ok(interrupted(state, why)),
            };
            tracing::debug!(
                round = state.round_count,
                satisfied = ledger.is_request_satisfied,
                progress = ledger.is_progress_being_made,
                in_loop = ledger.is_in_loop,
                next_speaker = %ledger.next_speaker,
                "ledger"
            );

            if ledger.is_request_satisfied {
                tracing::info!(round = state.round_count, "request satisfied");
                return self
                    .finish(state, Termination::Success, &ledger, &token, deadline)
                    .await;
            }

            if ledger.is_progress_being_made {
                state.stall_count = 0;
            } else {
                state.stall_count += 1;
                tracing::warn!(stall_count = state.stall_count, "no progress this round");
                if state.stall_count > self.config.max_stalls_before_replan {
                    if state.replan_count >= self.config.max_replans {
                        tracing::warn!(replans = state.replan_count, "replan budget exhausted");
                        let termination = Termination::StallExhausted(Exhaustion::Replans);
                        return self
                            .finish(state, termination, &ledger, &token, deadline)
                            .await;
                    }

                    // Replanning
                    state.replan_count += 1;
                    tracing::info!(replan = state.replan_count, "replanning");
                    let previous = FactsAndPlan {
                        facts: std::mem::take(&mut state.facts),
                        plan: std::mem::take(&mut state.plan),
                    };
                    let plan_ctx = PlanContext {
                        task: &state.task,
                        roster: &self.roster,
                        previous: Some(&previous),
                        chat_history: &state.chat_history,
                    };
                    let step = guarded(&token, deadline, self.oracle.plan(plan_ctx)).await?;
                    let revised = match step {
                        Step::Done(plan) => plan,
                        Step::Interrupted(why) => {
                            state.facts = previous.facts;
                            state.plan = previous.plan;
                            return Ok(interrupted(state, why));
                        }
                    };
                    state.facts = revised.facts;
                    state.plan = revised.plan;
                    state.stall_count = 0;
                    continue;
                }
            }

            // Delegating：max_rounds 为 0 时一次也不委派
            if let Some(budget) = self.config.exhausted(state.round_count, started.elapsed()) {
                let termination = Termination::StallExhausted(budget);
                return self
                    .finish(state, termination, &ledger, &token, deadline)
                    .await;
            }
            let participant = self.roster.get(&ledger.next_speaker).ok_or_else(|| {
                tracing::error!(speaker = %ledger.next_speaker, "oracle named unknown speaker");
                OrchestratorError::InvalidSpeaker {
                    speaker: ledger.next_speaker.clone(),
                    roster: self.roster.names().join(", "),
                }
            })?;
            if token.is_cancelled() {
                return Ok(cancelled(state));
            }

            let instruction = ChatMessage::new(&self.name, &ledger.instruction_or_question);
            state.chat_history.push(instruction.clone());
            let request = AgentInstruction {
                instruction: ledger.instruction_or_question.clone(),
                task: state.task.clone(),
            };
            let delegation = self.runtime.send_message(
                &request,
                participant.agent_id.clone(),
                self.agent_id.clone(),
                Some(token.clone()),
            );
            let step = guarded(&token, deadline, delegation).await;
            let reply = match step {
                Ok(Step::Done(reply)) => ChatMessage::new(&participant.name, reply_text(reply)),
                Ok(Step::Interrupted(why)) => return Ok(interrupted(state, why)),
                Err(e) if e.is_cancelled() => return Ok(cancelled(state)),
                Err(e) => {
                    tracing::warn!(speaker = %participant.name, error = %e, "participant failed");
                    ChatMessage::new(&participant.name, format!("error: {}", e))
                }
            };
            state.chat_history.push(reply.clone());
            self.broadcast(instruction, &token).await;
            self.broadcast(reply, &token).await;

            state.round_count += 1;
            if let Some(budget) = self.config.exhausted(state.round_count, started.elapsed()) {
                let termination = Termination::StallExhausted(budget);
                return self
                    .finish(state, termination, &ledger, &token, deadline)
                    .await;
            }
        }
    }

    async fn finish(
        &self,
        state: OrchestratorState,
        termination: Termination,
        ledger: &Ledger,
        token: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<TaskOutcome, OrchestratorError> {
        let ctx = FinalAnswerContext {
            task: &state.task,
            facts: &state.facts,
            chat_history: &state.chat_history,
            ledger,
            satisfied: termination == Termination::Success,
        };
        let step = guarded(token, deadline, self.oracle.final_answer(ctx)).await?;
        let answer = match step {
            Step::Done(answer) => answer,
            Step::Interrupted(why) => return Ok(interrupted(state, why)),
        };
        tracing::info!(
            ?termination,
            rounds = state.round_count,
            replans = state.replan_count,
            "task finished"
        );
        Ok(TaskOutcome {
            termination,
            answer: Some(answer),
            state,
        })
    }

    async fn broadcast(&self, message: ChatMessage, token: &CancellationToken) {
        let Some(topic) = &self.config.broadcast_topic else {
            return;
        };
        let update = ChatUpdate { message };
        if let Err(e) = self
            .runtime
            .publish_message(&update, topic.clone(), self.agent_id.clone(), Some(token.clone()))
            .await
        {
            if !e.is_cancelled() {
                tracing::warn!(topic = %topic, error = %e, "chat update broadcast failed");
            }
        }
    }
}

fn cancelled(state: OrchestratorState) -> TaskOutcome {
    tracing::info!(rounds = state.round_count, "task cancelled");
    TaskOutcome {
        termination: Termination::Cancelled,
        answer: None,
        state,
    }
}

/// 一次等待被打断的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    Deadline,
}

enum Step<T> {
    Done(T),
    Interrupted(Interrupt),
}

/// 到达截止时间时不再询问 Oracle，部分答案取最后一条对话
fn interrupted(state: OrchestratorState, why: Interrupt) -> TaskOutcome {
    match why {
        Interrupt::Cancelled => cancelled(state),
        Interrupt::Deadline => {
            tracing::warn!(rounds = state.round_count, "time budget exhausted while waiting");
            TaskOutcome {
                termination: Termination::StallExhausted(Exhaustion::Time),
                answer: state.chat_history.last().map(|m| m.content.clone()),
                state,
            }
        }
    }
}

/// 与取消令牌及截止时间竞争执行一次等待（Oracle 调用或委派 send）
async fn guarded<T, E>(
    token: &CancellationToken,
    deadline: Option<Instant>,
    call: impl Future<Output = Result<T, E>>,
) -> Result<Step<T>, E> {
    if token.is_cancelled() {
        return Ok(Step::Interrupted(Interrupt::Cancelled));
    }
    let expiry = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Ok(Step::Interrupted(Interrupt::Cancelled)),
        _ = expiry => Ok(Step::Interrupted(Interrupt::Deadline)),
        result = call => result.map(Step::Done),
    }
}
