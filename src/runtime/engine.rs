//! 调度引擎：AgentRuntime
//!
//! 对外是可克隆的句柄，内部一个后台任务独占全部表（工厂、订阅、实例缓存），
//! 句柄只通过命令通道投递请求并等待 oneshot 结果。
//!
//! - 调度循环只做同步的表操作与转发，从不等待 Handler，因此 Handler 内部可以继续 send/publish
//! - 每个 Agent 实例拥有一个邮箱任务，按入队顺序串行处理（同一 AgentId 不会并发）
//! - 不同 Agent 之间并行执行，由信号量限制同时运行的 Handler 数量；
//!   Handler 内部 send 等待响应期间归还许可，嵌套请求不会占满并发上限
//! - Stopped 状态下投递进入待处理队列，start 后按 FIFO 排空

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::config::RuntimeSection;
use crate::runtime::intervention::apply;
use crate::runtime::message::is_valid_agent_type;
use crate::runtime::{
    Agent, AgentContainer, AgentError, AgentId, CancellationToken, InterventionHandler, Message,
    MessageContext, Payload, RuntimeError, Subscription, SubscriptionId, TopicId,
};

/// Agent 工厂：以 AgentId 为实例化上下文构造容器
pub type AgentFactory = Arc<dyn Fn(&AgentId) -> Result<AgentContainer, AgentError> + Send + Sync>;

type SendReply = oneshot::Sender<Result<Option<Payload>, RuntimeError>>;
type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

/// 运行时生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    /// 未启动或已排空；投递进入待处理队列
    Stopped,
    Running,
    /// stop_when_idle 已调用，等待队列与在途投递清空
    Stopping,
    /// 终态
    Closed,
}

/// createRuntime 的选项
#[derive(Clone)]
pub struct RuntimeOptions {
    /// 不同 Agent 间同时运行的 Handler 上限（至少 1）
    pub max_concurrency: usize,
    /// publish 投递到没有对应 Handler 的订阅者时只记 debug 日志
    pub ignore_unhandled_publish: bool,
    pub interventions: Vec<Arc<dyn InterventionHandler>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            ignore_unhandled_publish: true,
            interventions: Vec::new(),
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(section: &RuntimeSection) -> Self {
        Self {
            max_concurrency: section.max_concurrency,
            ignore_unhandled_publish: section.ignore_unhandled_publish,
            interventions: Vec::new(),
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_intervention(mut self, hook: impl InterventionHandler + 'static) -> Self {
        self.interventions.push(Arc::new(hook));
        self
    }
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("ignore_unhandled_publish", &self.ignore_unhandled_publish)
            .field("interventions", &self.interventions.len())
            .finish()
    }
}

struct SendEnvelope {
    message_id: String,
    payload: Payload,
    sender: Option<AgentId>,
    recipient: AgentId,
    token: CancellationToken,
    reply: SendReply,
}

struct PublishEnvelope {
    message_id: String,
    payload: Payload,
    sender: Option<AgentId>,
    topic: TopicId,
    token: CancellationToken,
    reply: Reply<()>,
}

enum Envelope {
    Send(SendEnvelope),
    Publish(PublishEnvelope),
}

impl Envelope {
    fn reject(self, err: RuntimeError) {
        match self {
            Envelope::Send(env) => {
                let _ = env.reply.send(Err(err));
            }
            Envelope::Publish(env) => {
                let _ = env.reply.send(Err(err));
            }
        }
    }
}

enum Command {
    RegisterFactory {
        agent_type: String,
        factory: AgentFactory,
        reply: Reply<()>,
    },
    AddSubscription {
        subscription: Subscription,
        reply: Reply<SubscriptionId>,
    },
    RemoveSubscription {
        id: SubscriptionId,
        reply: Reply<()>,
    },
    Describe {
        agent: AgentId,
        reply: Reply<String>,
    },
    Dispatch(Envelope),
    /// 邮箱完成一次投递（用于 stop_when_idle 的在途计数）
    Completed,
    Start,
    StopWhenIdle {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// 运行时句柄：可克隆，所有克隆指向同一个调度循环
#[derive(Clone)]
pub struct AgentRuntime {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<RuntimeState>,
    /// 经 MessageContext 交给 Handler 的句柄携带该 Handler 的并发许可
    lease: Option<Arc<PermitLease>>,
}

impl AgentRuntime {
    /// 创建运行时并在当前 tokio 运行时中启动调度循环（初始为 Stopped）
    pub fn new(options: RuntimeOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RuntimeState::Stopped);
        let runtime = Self {
            cmd_tx,
            state_rx,
            lease: None,
        };

        let shared = WorkerShared {
            semaphore: Arc::new(Semaphore::new(options.max_concurrency.max(1))),
            interventions: Arc::new(options.interventions),
            ignore_unhandled_publish: options.ignore_unhandled_publish,
            runtime: runtime.clone(),
        };
        let dispatcher = Dispatcher {
            shared,
            state_tx,
            state: RuntimeState::Stopped,
            factories: HashMap::new(),
            subscriptions: Vec::new(),
            mailboxes: HashMap::new(),
            pending: VecDeque::new(),
            in_flight: 0,
            idle_waiters: Vec::new(),
        };
        tokio::spawn(dispatcher.run(cmd_rx));
        runtime
    }

    pub fn state(&self) -> RuntimeState {
        *self.state_rx.borrow()
    }

    fn leased(&self, lease: Arc<PermitLease>) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            state_rx: self.state_rx.clone(),
            lease: Some(lease),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| RuntimeError::Closed)?;
        rx.await.map_err(|_| RuntimeError::Closed)?
    }

    /// 注册 Agent 类型；同一类型重复注册返回 DuplicateType，首次注册保持有效。不会立即实例化
    pub async fn register_factory<A, F>(
        &self,
        agent_type: impl Into<String>,
        factory: F,
    ) -> Result<(), RuntimeError>
    where
        A: Agent,
        F: Fn(&AgentId) -> Result<A, AgentError> + Send + Sync + 'static,
    {
        let agent_type = agent_type.into();
        if !is_valid_agent_type(&agent_type) {
            return Err(RuntimeError::InvalidAgentType(agent_type));
        }
        let factory: AgentFactory =
            Arc::new(move |id: &AgentId| factory(id).map(AgentContainer::new));
        self.request(|reply| Command::RegisterFactory {
            agent_type,
            factory,
            reply,
        })
        .await
    }

    /// 结构相同的订阅已存在时返回 DuplicateSubscription
    pub async fn add_subscription(
        &self,
        subscription: Subscription,
    ) -> Result<SubscriptionId, RuntimeError> {
        self.request(|reply| Command::AddSubscription {
            subscription,
            reply,
        })
        .await
    }

    pub async fn remove_subscription(&self, id: SubscriptionId) -> Result<(), RuntimeError> {
        self.request(|reply| Command::RemoveSubscription { id, reply })
            .await
    }

    /// 点对点请求：目标实例（首次使用时经工厂构造）处理后返回其响应
    pub async fn send(
        &self,
        payload: Payload,
        recipient: AgentId,
        sender: Option<AgentId>,
        token: Option<CancellationToken>,
    ) -> Result<Option<Payload>, RuntimeError> {
        let token = token.unwrap_or_default();
        if token.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        let suspension = self.lease.as_ref().map(PermitLease::suspend);
        let result = self
            .request(|reply| {
                Command::Dispatch(Envelope::Send(SendEnvelope {
                    message_id: new_message_id(),
                    payload,
                    sender,
                    recipient,
                    token,
                    reply,
                }))
            })
            .await;
        if let Some(suspension) = suspension {
            suspension.resume().await;
        }
        result
    }

    pub async fn send_message<M: Message>(
        &self,
        message: &M,
        recipient: AgentId,
        sender: Option<AgentId>,
        token: Option<CancellationToken>,
    ) -> Result<Option<Payload>, RuntimeError> {
        self.send(Payload::encode(message)?, recipient, sender, token)
            .await
    }

    /// 广播：按订阅注册顺序为每个匹配的订阅者入队一次投递；入队完成即返回，不等待订阅者处理结果。
    /// 发送者自身匹配该 topic 时同样会收到
    pub async fn publish(
        &self,
        payload: Payload,
        topic: TopicId,
        sender: Option<AgentId>,
        token: Option<CancellationToken>,
    ) -> Result<(), RuntimeError> {
        let token = token.unwrap_or_default();
        if token.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        self.request(|reply| {
            Command::Dispatch(Envelope::Publish(PublishEnvelope {
                message_id: new_message_id(),
                payload,
                sender,
                topic,
                token,
                reply,
            }))
        })
        .await
    }

    pub async fn publish_message<M: Message>(
        &self,
        message: &M,
        topic: TopicId,
        sender: Option<AgentId>,
        token: Option<CancellationToken>,
    ) -> Result<(), RuntimeError> {
        self.publish(Payload::encode(message)?, topic, sender, token)
            .await
    }

    /// 返回实例的一行描述（必要时先实例化）
    pub async fn agent_description(&self, agent: &AgentId) -> Result<String, RuntimeError> {
        let agent = agent.clone();
        self.request(|reply| Command::Describe { agent, reply })
            .await
    }

    /// Stopped → Running，开始排空待处理队列
    pub fn start(&self) -> Result<(), RuntimeError> {
        self.cmd_tx
            .send(Command::Start)
            .map_err(|_| RuntimeError::Closed)
    }

    /// 等待队列为空且没有在途投递，然后回到 Stopped
    pub async fn stop_when_idle(&self) -> Result<(), RuntimeError> {
        self.request(|reply| Command::StopWhenIdle { reply }).await
    }

    /// 关闭所有实例（调用 on_close）并进入 Closed；之后的任何调用都返回 Closed
    pub async fn close(&self) -> Result<(), RuntimeError> {
        self.request(|reply| Command::Close { reply }).await
    }
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("state", &self.state())
            .finish()
    }
}

fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 正在运行的 Handler 占用的并发许可。
///
/// Handler 经 ctx.runtime() 发起 send 并等待响应时归还许可，最后一个嵌套 send 返回后重新获取；
/// Handler 返回后租约结束，之后借用该句柄的 send 不再触碰信号量。
struct PermitLease {
    semaphore: Arc<Semaphore>,
    slot: Mutex<LeaseSlot>,
}

struct LeaseSlot {
    permit: Option<OwnedSemaphorePermit>,
    /// 正在等待响应的嵌套 send 数
    suspended: usize,
    ended: bool,
}

impl PermitLease {
    fn new(semaphore: Arc<Semaphore>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            semaphore,
            slot: Mutex::new(LeaseSlot {
                permit: Some(permit),
                suspended: 0,
                ended: false,
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, LeaseSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn suspend(self: &Arc<Self>) -> Suspension {
        let mut slot = self.slot();
        slot.suspended += 1;
        slot.permit = None;
        Suspension {
            lease: self.clone(),
            resumed: false,
        }
    }

    /// 返回 true 表示调用方是最后一个返回的嵌套 send，需要取回许可
    fn leave(&self) -> bool {
        let mut slot = self.slot();
        slot.suspended = slot.suspended.saturating_sub(1);
        slot.suspended == 0 && !slot.ended
    }

    fn restore(&self, permit: OwnedSemaphorePermit) {
        let mut slot = self.slot();
        if !slot.ended && slot.suspended == 0 && slot.permit.is_none() {
            slot.permit = Some(permit);
        }
    }

    fn end(&self) {
        let mut slot = self.slot();
        slot.ended = true;
        slot.permit = None;
    }
}

/// 一次嵌套 send 期间归还的许可
struct Suspension {
    lease: Arc<PermitLease>,
    resumed: bool,
}

impl Suspension {
    async fn resume(mut self) {
        self.resumed = true;
        if self.lease.leave() {
            if let Ok(permit) = self.lease.semaphore.clone().acquire_owned().await {
                self.lease.restore(permit);
            }
        }
    }
}

impl Drop for Suspension {
    // send 在等待响应时被丢弃：能立即取回许可就取回，否则 Handler 余下部分不占许可
    fn drop(&mut self) {
        if !self.resumed && self.lease.leave() {
            if let Ok(permit) = self.lease.semaphore.clone().try_acquire_owned() {
                self.lease.restore(permit);
            }
        }
    }
}

/// 邮箱任务共享的只读资源
#[derive(Clone)]
struct WorkerShared {
    semaphore: Arc<Semaphore>,
    interventions: Arc<Vec<Arc<dyn InterventionHandler>>>,
    ignore_unhandled_publish: bool,
    runtime: AgentRuntime,
}

struct Delivery {
    message_id: String,
    payload: Payload,
    sender: Option<AgentId>,
    topic: Option<TopicId>,
    token: CancellationToken,
    /// None 表示 publish 投递，结果只记日志
    reply: Option<SendReply>,
}

struct Mailbox {
    tx: mpsc::UnboundedSender<Delivery>,
    description: String,
    worker: JoinHandle<()>,
}

/// 调度循环：唯一的写者
struct Dispatcher {
    shared: WorkerShared,
    state_tx: watch::Sender<RuntimeState>,
    state: RuntimeState,
    factories: HashMap<String, AgentFactory>,
    /// 保持注册顺序，publish 按此顺序投递
    subscriptions: Vec<(SubscriptionId, Subscription)>,
    mailboxes: HashMap<AgentId, Mailbox>,
    pending: VecDeque<Envelope>,
    in_flight: usize,
    idle_waiters: Vec<Reply<()>>,
}

impl Dispatcher {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            if let Command::Close { reply } = cmd {
                self.close(reply);
                break;
            }
            self.handle_command(cmd);
            self.check_idle();
        }
        tracing::debug!("dispatch loop exited");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterFactory {
                agent_type,
                factory,
                reply,
            } => {
                let result = if self.factories.contains_key(&agent_type) {
                    Err(RuntimeError::DuplicateType(agent_type))
                } else {
                    tracing::info!(agent_type = %agent_type, "agent type registered");
                    self.factories.insert(agent_type, factory);
                    Ok(())
                };
                let _ = reply.send(result);
            }
            Command::AddSubscription {
                subscription,
                reply,
            } => {
                let result = if self.subscriptions.iter().any(|(_, s)| *s == subscription) {
                    Err(RuntimeError::DuplicateSubscription(subscription.to_string()))
                } else {
                    let id = SubscriptionId::new();
                    tracing::info!(subscription = %subscription, id = %id, "subscription added");
                    self.subscriptions.push((id.clone(), subscription));
                    Ok(id)
                };
                let _ = reply.send(result);
            }
            Command::RemoveSubscription { id, reply } => {
                let result = match self.subscriptions.iter().position(|(sid, _)| *sid == id) {
                    Some(index) => {
                        self.subscriptions.remove(index);
                        Ok(())
                    }
                    None => Err(RuntimeError::UnknownSubscription(id.to_string())),
                };
                let _ = reply.send(result);
            }
            Command::Describe { agent, reply } => {
                let result = self.mailbox(&agent).map(|m| m.description.clone());
                let _ = reply.send(result);
            }
            Command::Dispatch(envelope) => {
                if self.state == RuntimeState::Stopped {
                    self.pending.push_back(envelope);
                } else {
                    self.dispatch(envelope);
                }
            }
            Command::Completed => {
                self.in_flight = self.in_flight.saturating_sub(1);
            }
            Command::Start => match self.state {
                RuntimeState::Stopped => {
                    self.set_state(RuntimeState::Running);
                    tracing::info!(pending = self.pending.len(), "runtime started");
                    while let Some(envelope) = self.pending.pop_front() {
                        self.dispatch(envelope);
                    }
                }
                state => tracing::debug!(?state, "start ignored"),
            },
            Command::StopWhenIdle { reply } => match self.state {
                RuntimeState::Stopped => {
                    let _ = reply.send(Ok(()));
                }
                _ => {
                    self.set_state(RuntimeState::Stopping);
                    self.idle_waiters.push(reply);
                }
            },
            Command::Close { reply } => {
                // run() 已单独处理
                let _ = reply.send(Err(RuntimeError::Closed));
            }
        }
    }

    fn set_state(&mut self, state: RuntimeState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }

    fn check_idle(&mut self) {
        if self.state == RuntimeState::Stopping && self.pending.is_empty() && self.in_flight == 0 {
            self.set_state(RuntimeState::Stopped);
            tracing::info!("runtime idle, stopped");
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    /// 取得实例邮箱；首次访问时调用工厂构造并缓存。构造失败不缓存，下次重试
    fn mailbox(&mut self, agent: &AgentId) -> Result<&mut Mailbox, RuntimeError> {
        match self.mailboxes.entry(agent.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let factory = self
                    .factories
                    .get(agent.agent_type())
                    .ok_or_else(|| RuntimeError::UnknownAgentType(agent.agent_type().to_string()))?;
                let constructed = std::panic::catch_unwind(AssertUnwindSafe(|| factory(agent)))
                    .unwrap_or_else(|_| Err(AgentError::failed("agent factory panicked")));
                let container = constructed.map_err(|source| {
                    tracing::error!(agent = %agent, error = %source, "agent construction failed");
                    RuntimeError::AgentConstruction {
                        agent: agent.clone(),
                        source,
                    }
                })?;
                tracing::debug!(agent = %agent, "agent instantiated");
                Ok(entry.insert(spawn_mailbox(agent.clone(), container, self.shared.clone())))
            }
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Send(env) => self.dispatch_send(env),
            Envelope::Publish(env) => self.dispatch_publish(env),
        }
    }

    fn dispatch_send(&mut self, env: SendEnvelope) {
        let SendEnvelope {
            message_id,
            payload,
            sender,
            recipient,
            token,
            reply,
        } = env;
        if token.is_cancelled() {
            let _ = reply.send(Err(RuntimeError::Cancelled));
            return;
        }
        let Some(payload) = apply(&self.shared.interventions, payload, |hook, p| {
            hook.on_send(p, sender.as_ref(), &recipient)
        }) else {
            tracing::debug!(agent = %recipient, "send dropped by intervention");
            let _ = reply.send(Ok(None));
            return;
        };
        tracing::debug!(agent = %recipient, message_type = payload.message_type(), "send");
        self.deliver(
            &recipient,
            Delivery {
                message_id,
                payload,
                sender,
                topic: None,
                token,
                reply: Some(reply),
            },
        );
    }

    fn dispatch_publish(&mut self, env: PublishEnvelope) {
        let PublishEnvelope {
            message_id,
            payload,
            sender,
            topic,
            token,
            reply,
        } = env;
        if token.is_cancelled() {
            let _ = reply.send(Err(RuntimeError::Cancelled));
            return;
        }
        let Some(payload) = apply(&self.shared.interventions, payload, |hook, p| {
            hook.on_publish(p, sender.as_ref(), &topic)
        }) else {
            tracing::debug!(topic = %topic, "publish dropped by intervention");
            let _ = reply.send(Ok(()));
            return;
        };
        let recipients: Vec<AgentId> = self
            .subscriptions
            .iter()
            .filter_map(|(_, s)| s.map_to_agent(&topic))
            .collect();
        tracing::debug!(
            topic = %topic,
            message_type = payload.message_type(),
            recipients = recipients.len(),
            "publish"
        );
        for recipient in recipients {
            self.deliver(
                &recipient,
                Delivery {
                    message_id: message_id.clone(),
                    payload: payload.clone(),
                    sender: sender.clone(),
                    topic: Some(topic.clone()),
                    token: token.clone(),
                    reply: None,
                },
            );
        }
        let _ = reply.send(Ok(()));
    }

    fn deliver(&mut self, recipient: &AgentId, delivery: Delivery) {
        match self.mailbox(recipient) {
            Ok(mailbox) => {
                if mailbox.tx.send(delivery).is_ok() {
                    self.in_flight += 1;
                } else {
                    tracing::error!(agent = %recipient, "mailbox worker gone, dropping instance");
                    self.mailboxes.remove(recipient);
                }
            }
            Err(err) => match delivery.reply {
                Some(reply) => {
                    let _ = reply.send(Err(err));
                }
                None => {
                    tracing::warn!(agent = %recipient, error = %err, "publish delivery skipped");
                }
            },
        }
    }

    fn close(&mut self, reply: Reply<()>) {
        self.set_state(RuntimeState::Closed);
        for envelope in self.pending.drain(..) {
            envelope.reject(RuntimeError::Closed);
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(Err(RuntimeError::Closed));
        }
        // 丢弃发送端即关闭邮箱：任务处理完已入队的投递后执行 on_close
        let workers: Vec<JoinHandle<()>> = self.mailboxes.drain().map(|(_, m)| m.worker).collect();
        tracing::info!(agents = workers.len(), "closing runtime");
        tokio::spawn(async move {
            for worker in workers {
                if let Err(e) = worker.await {
                    tracing::warn!("agent worker ended abnormally: {}", e);
                }
            }
            let _ = reply.send(Ok(()));
        });
    }
}

fn spawn_mailbox(agent: AgentId, container: AgentContainer, shared: WorkerShared) -> Mailbox {
    let (tx, rx) = mpsc::unbounded_channel();
    let description = container.description();
    let worker = tokio::spawn(run_mailbox(agent, container, rx, shared));
    Mailbox {
        tx,
        description,
        worker,
    }
}

async fn run_mailbox(
    agent: AgentId,
    mut container: AgentContainer,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    shared: WorkerShared,
) {
    while let Some(delivery) = rx.recv().await {
        let reply = delivery.reply;
        let topic = delivery.topic.clone();
        let message_type = delivery.payload.message_type().to_string();
        let outcome = invoke(
            &agent,
            &mut container,
            delivery.message_id,
            delivery.payload,
            delivery.sender,
            delivery.topic,
            delivery.token,
            &shared,
        )
        .await;

        match (reply, outcome) {
            (Some(reply), outcome) => {
                if let Err(e) = &outcome {
                    if !e.is_cancelled() {
                        tracing::warn!(agent = %agent, message_type = %message_type, error = %e, "send failed");
                    }
                }
                let _ = reply.send(outcome);
            }
            (None, Err(RuntimeError::UnhandledMessage { .. })) if shared.ignore_unhandled_publish => {
                tracing::debug!(agent = %agent, message_type = %message_type, "published message not handled");
            }
            (None, Err(e)) => {
                let topic = topic.map(|t| t.to_string()).unwrap_or_default();
                tracing::error!(agent = %agent, topic = %topic, error = %e, "publish delivery failed");
            }
            (None, Ok(_)) => {}
        }
        let _ = shared.runtime.cmd_tx.send(Command::Completed);
    }
    container.close().await;
    tracing::debug!(agent = %agent, "agent closed");
}

#[allow(clippy::too_many_arguments)]
async fn invoke(
    agent: &AgentId,
    container: &mut AgentContainer,
    message_id: String,
    payload: Payload,
    sender: Option<AgentId>,
    topic: Option<TopicId>,
    token: CancellationToken,
    shared: &WorkerShared,
) -> Result<Option<Payload>, RuntimeError> {
    if token.is_cancelled() {
        return Err(RuntimeError::Cancelled);
    }
    let permit = shared
        .semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| RuntimeError::Closed)?;
    // 等待许可期间可能已被取消，此时仍未开始处理
    if token.is_cancelled() {
        return Err(RuntimeError::Cancelled);
    }

    let is_rpc = topic.is_none();
    let lease = Arc::new(PermitLease::new(shared.semaphore.clone(), permit));
    let ctx = MessageContext::new(
        message_id,
        agent.clone(),
        sender.clone(),
        topic,
        token,
        shared.runtime.leased(lease.clone()),
    );
    let result = AssertUnwindSafe(container.handle(payload, &ctx))
        .catch_unwind()
        .await;
    lease.end();

    match result {
        Err(_) => {
            tracing::error!(agent = %agent, "handler panicked");
            Err(RuntimeError::Handler {
                agent: agent.clone(),
                source: AgentError::failed("handler panicked"),
            })
        }
        Ok(Ok(Some(response))) if is_rpc => Ok(apply(&shared.interventions, response, |hook, p| {
            hook.on_response(p, agent, sender.as_ref())
        })),
        Ok(Ok(_)) => Ok(None),
        Ok(Err(AgentError::Unhandled { message_type })) => Err(RuntimeError::UnhandledMessage {
            message_type,
            agent_type: agent.agent_type().to_string(),
        }),
        Ok(Err(AgentError::Cancelled)) => Err(RuntimeError::Cancelled),
        Ok(Err(source)) => Err(RuntimeError::Handler {
            agent: agent.clone(),
            source,
        }),
    }
}
