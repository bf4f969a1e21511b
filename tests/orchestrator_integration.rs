//! LedgerOrchestrator 集成测试：停滞/重规划、非法发言者、取消、轮数与时间预算、广播、托管 Agent

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use hive::llm::ScriptedLlmClient;
use hive::orchestrator::{
    AgentInstruction, AgentReply, ChatUpdate, EvaluateContext, Exhaustion, FactsAndPlan, Ledger,
    LedgerOrchestrator, LlmOracle, OracleError, OrchestratorAgent, OrchestratorConfig,
    OrchestratorError, Participant, PlanContext, ReasoningOracle, Roster, TaskRequest, TaskResult,
    Termination,
};
use hive::runtime::{
    Agent, AgentError, AgentId, AgentRuntime, CancellationToken, Handler, HandlerResult,
    MessageContext, Payload, Routes, RuntimeOptions, Subscription, TopicId,
};

type Log = Arc<Mutex<Vec<String>>>;

// ---------- Oracle 测试替身 ----------

#[derive(Default)]
struct ScriptedOracle {
    ledgers: Mutex<VecDeque<Ledger>>,
    /// 脚本用完后每轮返回的账本
    fallback: Option<Ledger>,
    plan_calls: AtomicUsize,
    evaluate_calls: AtomicUsize,
    previous_plans: Mutex<Vec<FactsAndPlan>>,
}

impl ScriptedOracle {
    fn new(ledgers: Vec<Ledger>) -> Self {
        Self {
            ledgers: Mutex::new(ledgers.into()),
            ..Default::default()
        }
    }

    fn with_fallback(mut self, ledger: Ledger) -> Self {
        self.fallback = Some(ledger);
        self
    }

    fn plan_calls(&self) -> usize {
        self.plan_calls.load(Ordering::SeqCst)
    }

    fn evaluate_calls(&self) -> usize {
        self.evaluate_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReasoningOracle for ScriptedOracle {
    async fn plan(&self, ctx: PlanContext<'_>) -> Result<FactsAndPlan, OracleError> {
        let n = self.plan_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = ctx.previous {
            self.previous_plans.lock().unwrap().push(previous.clone());
        }
        Ok(FactsAndPlan {
            facts: format!("facts v{}", n),
            plan: format!("plan v{}", n),
        })
    }

    async fn evaluate(&self, _ctx: EvaluateContext<'_>) -> Result<Ledger, OracleError> {
        self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.ledgers.lock().unwrap().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| OracleError::Failed("script exhausted".to_string()))
    }
}

/// 委派一轮给 writer，之后宣布完成；答案带上任务文本以便区分并发任务
struct OneRoundOracle;

#[async_trait]
impl ReasoningOracle for OneRoundOracle {
    async fn plan(&self, _ctx: PlanContext<'_>) -> Result<FactsAndPlan, OracleError> {
        Ok(FactsAndPlan {
            facts: "none".to_string(),
            plan: "ask the writer".to_string(),
        })
    }

    async fn evaluate(&self, ctx: EvaluateContext<'_>) -> Result<Ledger, OracleError> {
        if ctx.chat_history.is_empty() {
            Ok(progress("writer", ctx.task))
        } else {
            Ok(satisfied(&format!("done: {}", ctx.task)))
        }
    }
}

fn progress(speaker: &str, instruction: &str) -> Ledger {
    Ledger {
        is_request_satisfied: false,
        is_progress_being_made: true,
        is_in_loop: false,
        instruction_or_question: instruction.to_string(),
        next_speaker: speaker.to_string(),
    }
}

fn stall(speaker: &str) -> Ledger {
    Ledger {
        is_progress_being_made: false,
        is_in_loop: true,
        ..progress(speaker, "try again")
    }
}

fn satisfied(answer: &str) -> Ledger {
    Ledger {
        is_request_satisfied: true,
        ..progress("writer", answer)
    }
}

// ---------- 参与者 ----------

#[derive(Clone, Copy)]
enum Mode {
    Reply,
    Fail,
    Sleep(Duration),
    CancelTask,
}

struct Worker {
    name: String,
    mode: Mode,
    log: Log,
}

impl Agent for Worker {
    fn description(&self) -> &str {
        "does what it is told"
    }

    fn routes(routes: &mut Routes<Self>) {
        routes.handle::<AgentInstruction>();
    }
}

#[async_trait]
impl Handler<AgentInstruction> for Worker {
    async fn handle(&mut self, message: AgentInstruction, ctx: &MessageContext) -> HandlerResult {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, message.instruction));
        match self.mode {
            Mode::Reply => {}
            Mode::Fail => return Err(AgentError::failed("tool crashed")),
            Mode::Sleep(d) => tokio::time::sleep(d).await,
            Mode::CancelTask => ctx.cancellation_token.cancel(),
        }
        let reply = AgentReply::new(format!("{} did: {}", self.name, message.instruction));
        Ok(Some(Payload::encode(&reply)?))
    }
}

/// 记录收到的 ChatUpdate
struct Listener {
    log: Log,
}

impl Agent for Listener {
    fn routes(routes: &mut Routes<Self>) {
        routes.handle::<ChatUpdate>();
    }
}

#[async_trait]
impl Handler<ChatUpdate> for Listener {
    async fn handle(&mut self, message: ChatUpdate, _ctx: &MessageContext) -> HandlerResult {
        self.log.lock().unwrap().push(format!(
            "{}: {}",
            message.message.source, message.message.content
        ));
        Ok(None)
    }
}

/// 收集广播的 TaskResult
struct Collector {
    results: Arc<Mutex<Vec<TaskResult>>>,
}

impl Agent for Collector {
    fn routes(routes: &mut Routes<Self>) {
        routes.handle::<TaskResult>();
    }
}

#[async_trait]
impl Handler<TaskResult> for Collector {
    async fn handle(&mut self, message: TaskResult, _ctx: &MessageContext) -> HandlerResult {
        self.results.lock().unwrap().push(message);
        Ok(None)
    }
}

struct Team {
    runtime: AgentRuntime,
    roster: Roster,
    log: Log,
}

async fn team(members: &[(&'static str, Mode)]) -> Team {
    team_with(RuntimeOptions::default(), members).await
}

async fn team_with(options: RuntimeOptions, members: &[(&'static str, Mode)]) -> Team {
    let runtime = AgentRuntime::new(options);
    runtime.start().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut participants = Vec::new();
    for &(name, mode) in members {
        let worker_log = log.clone();
        runtime
            .register_factory(name, move |_id: &AgentId| {
                Ok(Worker {
                    name: name.to_string(),
                    mode,
                    log: worker_log.clone(),
                })
            })
            .await
            .unwrap();
        participants.push((name.to_string(), AgentId::new(name, "default")));
    }
    let roster = Roster::from_runtime(&runtime, participants).await.unwrap();
    Team {
        runtime,
        roster,
        log,
    }
}

fn config(max_stalls: u32, max_replans: u32) -> OrchestratorConfig {
    OrchestratorConfig {
        max_stalls_before_replan: max_stalls,
        max_replans,
        ..OrchestratorConfig::default()
    }
}

fn orchestrator(team: &Team, oracle: &Arc<ScriptedOracle>, config: OrchestratorConfig) -> LedgerOrchestrator {
    let oracle: Arc<dyn ReasoningOracle> = oracle.clone();
    LedgerOrchestrator::new(team.runtime.clone(), oracle, team.roster.clone(), config)
}

fn sends(team: &Team) -> Vec<String> {
    team.log.lock().unwrap().clone()
}

// ---------- 测试 ----------

#[tokio::test]
async fn test_stall_then_recover_resets_without_replan() {
    let team = team(&[("writer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![
        stall("writer"),
        stall("writer"),
        progress("writer", "write it properly"),
        satisfied("the poem"),
    ]));

    let outcome = orchestrator(&team, &oracle, config(3, 3))
        .run("write a poem", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Success);
    assert_eq!(outcome.answer.as_deref(), Some("the poem"));
    assert_eq!(outcome.state.replan_count, 0);
    assert_eq!(outcome.state.stall_count, 0);
    assert_eq!(outcome.state.round_count, 3);
    assert_eq!(oracle.plan_calls(), 1);
    assert_eq!(outcome.state.plan, "plan v1");
    // 停滞未越过阈值时仍然委派
    assert_eq!(sends(&team).len(), 3);
}

#[tokio::test]
async fn test_stall_exhaustion_after_one_replan() {
    let team = team(&[("writer", Mode::Reply), ("reviewer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::default().with_fallback(stall("reviewer")));

    let outcome = orchestrator(&team, &oracle, config(2, 1))
        .run("impossible task", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.termination,
        Termination::StallExhausted(Exhaustion::Replans)
    );
    assert_eq!(outcome.state.replan_count, 1);
    // 初始规划 + 一次重规划
    assert_eq!(oracle.plan_calls(), 2);
    assert_eq!(
        oracle.previous_plans.lock().unwrap().clone(),
        vec![FactsAndPlan {
            facts: "facts v1".to_string(),
            plan: "plan v1".to_string()
        }]
    );
    assert_eq!(outcome.state.plan, "plan v2");
    // 每个阈值周期委派 2 次，第二次越过阈值时终止
    assert_eq!(outcome.state.round_count, 4);
    assert_eq!(oracle.evaluate_calls(), 6);
    // 部分答案取最后一条对话
    assert_eq!(outcome.answer.as_deref(), Some("reviewer did: try again"));
}

#[tokio::test]
async fn test_invalid_speaker_is_fatal_and_sends_nothing() {
    let team = team(&[
        ("writer", Mode::Reply),
        ("reviewer", Mode::Reply),
        ("surfer", Mode::Reply),
    ])
    .await;
    let oracle = Arc::new(ScriptedOracle::new(vec![progress("mallory", "do it")]));

    let result = orchestrator(&team, &oracle, config(3, 3))
        .run("task", CancellationToken::new())
        .await;

    match result {
        Err(OrchestratorError::InvalidSpeaker { speaker, roster }) => {
            assert_eq!(speaker, "mallory");
            assert_eq!(roster, "writer, reviewer, surfer");
        }
        other => panic!("Expected InvalidSpeaker, got {:?}", other.map(|o| o.termination)),
    }
    assert!(sends(&team).is_empty());
}

#[tokio::test]
async fn test_single_agent_roster_runs_full_cycle() {
    let team = team(&[("solo", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![
        progress("solo", "step 1"),
        progress("solo", "step 2"),
        satisfied("done"),
    ]));

    let outcome = orchestrator(&team, &oracle, config(3, 3))
        .run("two steps", CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.state.round_count, 2);
    assert_eq!(sends(&team), vec!["solo:step 1", "solo:step 2"]);

    let history: Vec<(String, String)> = outcome
        .state
        .chat_history
        .iter()
        .map(|m| (m.source.clone(), m.content.clone()))
        .collect();
    assert_eq!(
        history,
        vec![
            ("orchestrator".to_string(), "step 1".to_string()),
            ("solo".to_string(), "solo did: step 1".to_string()),
            ("orchestrator".to_string(), "step 2".to_string()),
            ("solo".to_string(), "solo did: step 2".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let team = team(&[("writer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![satisfied("x")]));
    let token = CancellationToken::new();
    token.cancel();

    let outcome = orchestrator(&team, &oracle, config(3, 3))
        .run("task", token)
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Cancelled);
    assert!(outcome.answer.is_none());
    assert_eq!(oracle.plan_calls(), 0);
}

#[tokio::test]
async fn test_cancel_during_delegation_stops_at_next_transition() {
    let team = team(&[("writer", Mode::Reply), ("quitter", Mode::CancelTask)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![
        progress("writer", "draft"),
        progress("quitter", "stop everything"),
        progress("writer", "never sent"),
    ]));

    let outcome = orchestrator(&team, &oracle, config(3, 3))
        .run("task", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.termination, Termination::Cancelled);
    assert_eq!(outcome.state.round_count, 2);
    assert_eq!(oracle.evaluate_calls(), 2);
    assert_eq!(sends(&team), vec!["writer:draft", "quitter:stop everything"]);
}

#[tokio::test]
async fn test_max_rounds_exhaustion() {
    let team = team(&[("writer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::default().with_fallback(progress("writer", "more")));
    let config = OrchestratorConfig {
        max_rounds: 3,
        ..OrchestratorConfig::default()
    };

    let outcome = orchestrator(&team, &oracle, config)
        .run("endless", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.termination,
        Termination::StallExhausted(Exhaustion::Rounds)
    );
    assert_eq!(outcome.state.round_count, 3);
    assert_eq!(outcome.answer.as_deref(), Some("writer did: more"));
}

#[tokio::test]
async fn test_round_budget_boundaries() {
    for max_rounds in [0, 1] {
        let team = team(&[("writer", Mode::Reply)]).await;
        let oracle = Arc::new(ScriptedOracle::default().with_fallback(progress("writer", "more")));
        let config = OrchestratorConfig {
            max_rounds,
            ..OrchestratorConfig::default()
        };

        let outcome = orchestrator(&team, &oracle, config)
            .run("endless", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome.termination,
            Termination::StallExhausted(Exhaustion::Rounds)
        );
        assert_eq!(outcome.state.round_count, max_rounds);
        assert_eq!(sends(&team).len(), max_rounds as usize);
    }
}

#[tokio::test(start_paused = true)]
async fn test_max_time_exhaustion() {
    let team = team(&[("slow", Mode::Sleep(Duration::from_secs(10)))]).await;
    let oracle = Arc::new(ScriptedOracle::default().with_fallback(progress("slow", "work")));
    let config = OrchestratorConfig {
        max_rounds: 100,
        max_time: Some(Duration::from_secs(25)),
        ..OrchestratorConfig::default()
    };

    let started = tokio::time::Instant::now();
    let outcome = orchestrator(&team, &oracle, config)
        .run("slow task", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.termination,
        Termination::StallExhausted(Exhaustion::Time)
    );
    // 第三轮委派在 25s 截止时间被打断
    assert_eq!(outcome.state.round_count, 2);
    assert!(started.elapsed() >= Duration::from_secs(25));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(sends(&team).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_participant_cannot_outlast_time_budget() {
    let team = team(&[("stuck", Mode::Sleep(Duration::from_secs(3600)))]).await;
    let oracle = Arc::new(ScriptedOracle::default().with_fallback(progress("stuck", "answer me")));
    let config = OrchestratorConfig {
        max_time: Some(Duration::from_secs(30)),
        ..OrchestratorConfig::default()
    };

    let started = tokio::time::Instant::now();
    let outcome = orchestrator(&team, &oracle, config)
        .run("waiting", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.termination,
        Termination::StallExhausted(Exhaustion::Time)
    );
    assert_eq!(outcome.state.round_count, 0);
    assert!(started.elapsed() < Duration::from_secs(3600));
    assert_eq!(outcome.answer.as_deref(), Some("answer me"));
}

#[tokio::test]
async fn test_all_stall_oracle_always_terminates_within_budgets() {
    for (max_rounds, max_stalls, max_replans) in [(20, 3, 3), (5, 3, 3), (20, 0, 0), (1, 1, 1)] {
        let team = team(&[("writer", Mode::Reply), ("reviewer", Mode::Reply)]).await;
        let oracle = Arc::new(ScriptedOracle::default().with_fallback(stall("writer")));
        let config = OrchestratorConfig {
            max_rounds,
            max_stalls_before_replan: max_stalls,
            max_replans,
            ..OrchestratorConfig::default()
        };

        let outcome = orchestrator(&team, &oracle, config)
            .run("adversarial", CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome.termination, Termination::StallExhausted(_)));
        assert!(outcome.state.round_count <= max_rounds);
        assert!(outcome.state.replan_count <= max_replans);
    }
}

#[tokio::test]
async fn test_participant_failure_is_recorded_and_loop_continues() {
    let team = team(&[("flaky", Mode::Fail), ("writer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![
        progress("flaky", "fetch data"),
        progress("writer", "work around it"),
        satisfied("done anyway"),
    ]));

    let outcome = orchestrator(&team, &oracle, config(3, 3))
        .run("task", CancellationToken::new())
        .await
        .unwrap();

    assert!(outcome.is_success());
    let failure = &outcome.state.chat_history[1];
    assert_eq!(failure.source, "flaky");
    assert!(failure.content.starts_with("error:"));
    assert!(failure.content.contains("tool crashed"));
    assert_eq!(outcome.state.chat_history[3].content, "writer did: work around it");
}

#[tokio::test]
async fn test_rounds_are_broadcast_to_listeners() {
    let team = team(&[("writer", Mode::Reply)]).await;
    let updates: Log = Arc::new(Mutex::new(Vec::new()));
    let listener_log = updates.clone();
    team.runtime
        .register_factory("listener", move |_id: &AgentId| {
            Ok(Listener {
                log: listener_log.clone(),
            })
        })
        .await
        .unwrap();
    team.runtime
        .add_subscription(Subscription::type_based("team_chat", "listener"))
        .await
        .unwrap();

    let oracle = Arc::new(ScriptedOracle::new(vec![
        progress("writer", "draft"),
        satisfied("ok"),
    ]));
    let config = OrchestratorConfig {
        broadcast_topic: Some(TopicId::new("team_chat", "default")),
        ..OrchestratorConfig::default()
    };
    orchestrator(&team, &oracle, config)
        .run("task", CancellationToken::new())
        .await
        .unwrap();
    team.runtime.stop_when_idle().await.unwrap();

    assert_eq!(
        updates.lock().unwrap().clone(),
        vec!["orchestrator: draft", "writer: writer did: draft"]
    );
}

async fn register_orchestrator(team: &Team, oracle: Arc<ScriptedOracle>, result_topic: Option<&'static str>) {
    let roster = team.roster.clone();
    team.runtime
        .register_factory("orchestrator", move |_id: &AgentId| {
            let oracle: Arc<dyn ReasoningOracle> = oracle.clone();
            let agent = OrchestratorAgent::new(oracle, roster.clone(), OrchestratorConfig::default());
            Ok(match result_topic {
                Some(topic) => agent.with_result_topic(topic),
                None => agent,
            })
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_orchestrator_agent_answers_task_request() {
    let team = team(&[("writer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![
        progress("writer", "draft"),
        satisfied("final text"),
    ]));
    register_orchestrator(&team, oracle, None).await;

    let orchestrator_id = AgentId::new("orchestrator", "default");
    let description = team.runtime.agent_description(&orchestrator_id).await.unwrap();
    assert!(description.contains("writer"));

    let reply = team
        .runtime
        .send_message(&TaskRequest::new("write"), orchestrator_id, None, None)
        .await
        .unwrap()
        .unwrap();
    match reply.decode::<TaskResult>().unwrap() {
        TaskResult::Completed { outcome } => {
            assert!(outcome.is_success());
            assert_eq!(outcome.answer.as_deref(), Some("final text"));
            // 编排器以自身 AgentId 的类型署名
            assert_eq!(outcome.state.chat_history[0].source, "orchestrator");
        }
        other => panic!("Expected Completed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_orchestrator_agent_reports_protocol_error() {
    let team = team(&[("writer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![progress("ghost", "boo")]));
    register_orchestrator(&team, oracle, None).await;

    let reply = team
        .runtime
        .send_message(
            &TaskRequest::new("write"),
            AgentId::new("orchestrator", "default"),
            None,
            None,
        )
        .await
        .unwrap()
        .unwrap();
    match reply.decode::<TaskResult>().unwrap() {
        TaskResult::Failed { error } => assert!(error.contains("ghost")),
        other => panic!("Expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_published_task_result_goes_to_result_topic() {
    let team = team(&[("writer", Mode::Reply)]).await;
    let oracle = Arc::new(ScriptedOracle::new(vec![satisfied("instant")]));
    register_orchestrator(&team, oracle, Some("results")).await;

    let results = Arc::new(Mutex::new(Vec::new()));
    let collected = results.clone();
    team.runtime
        .register_factory("collector", move |_id: &AgentId| {
            Ok(Collector {
                results: collected.clone(),
            })
        })
        .await
        .unwrap();
    team.runtime
        .add_subscription(Subscription::type_based("tasks", "orchestrator"))
        .await
        .unwrap();
    team.runtime
        .add_subscription(Subscription::type_based("results", "collector"))
        .await
        .unwrap();

    team.runtime
        .publish_message(&TaskRequest::new("quick"), TopicId::new("tasks", "session-1"), None, None)
        .await
        .unwrap();
    team.runtime.stop_when_idle().await.unwrap();

    let results = results.lock().unwrap().clone();
    assert_eq!(results.len(), 1);
    match &results[0] {
        TaskResult::Completed { outcome } => {
            assert_eq!(outcome.answer.as_deref(), Some("instant"));
            assert_eq!(outcome.state.round_count, 0);
        }
        other => panic!("Expected Completed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_llm_oracle_drives_a_task() {
    fn ledger_json(satisfied: bool, speaker: &str, instruction: &str) -> String {
        serde_json::json!({
            "is_request_satisfied": {"reason": "", "answer": satisfied},
            "is_in_loop": {"reason": "", "answer": false},
            "is_progress_being_made": {"reason": "", "answer": true},
            "next_speaker": {"reason": "", "answer": speaker},
            "instruction_or_question": {"reason": "", "answer": instruction},
        })
        .to_string()
    }

    let team = team(&[("writer", Mode::Reply)]).await;
    let llm = Arc::new(ScriptedLlmClient::new([
        "FACTS".to_string(),
        "PLAN".to_string(),
        format!("```json\n{}\n```", ledger_json(false, "writer", "draft")),
        ledger_json(true, "writer", "done"),
        "FINAL ANSWER".to_string(),
    ]));
    let oracle: Arc<dyn ReasoningOracle> = Arc::new(LlmOracle::new(llm.clone()));
    let orchestrator = LedgerOrchestrator::new(
        team.runtime.clone(),
        oracle,
        team.roster.clone(),
        OrchestratorConfig::default(),
    );

    let outcome = orchestrator
        .run("write", CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.answer.as_deref(), Some("FINAL ANSWER"));
    assert_eq!(outcome.state.facts, "FACTS");
    assert_eq!(outcome.state.plan, "PLAN");
    assert_eq!(sends(&team), vec!["writer:draft"]);
    assert_eq!(llm.remaining(), 0);
    // 第二次评估的提示词包含第一轮的对话
    let calls = llm.calls();
    assert!(calls[3][1].content.contains("writer: writer did: draft"));
}

#[tokio::test]
async fn test_concurrent_hosted_tasks_finish_under_tight_concurrency() {
    for max_concurrency in [1, 2] {
        let team = team_with(
            RuntimeOptions::default().with_max_concurrency(max_concurrency),
            &[("writer", Mode::Reply), ("reviewer", Mode::Reply)],
        )
        .await;
        let roster = team.roster.clone();
        team.runtime
            .register_factory("orchestrator", move |_id: &AgentId| {
                let oracle: Arc<dyn ReasoningOracle> = Arc::new(OneRoundOracle);
                Ok(OrchestratorAgent::new(oracle, roster.clone(), OrchestratorConfig::default()))
            })
            .await
            .unwrap();

        let requests = (0..8).map(|k| {
            let runtime = team.runtime.clone();
            async move {
                runtime
                    .send_message(
                        &TaskRequest::new(format!("task-{}", k)),
                        AgentId::new("orchestrator", format!("k{}", k)),
                        None,
                        None,
                    )
                    .await
            }
        });
        let results = tokio::time::timeout(Duration::from_secs(5), join_all(requests))
            .await
            .expect("hosted tasks should not starve each other of permits");

        for (k, result) in results.into_iter().enumerate() {
            match result.unwrap().unwrap().decode::<TaskResult>().unwrap() {
                TaskResult::Completed { outcome } => {
                    assert!(outcome.is_success());
                    assert_eq!(outcome.answer, Some(format!("done: task-{}", k)));
                }
                other => panic!("Expected Completed, got {:?}", other),
            }
        }
        assert_eq!(sends(&team).len(), 8);
    }
}
