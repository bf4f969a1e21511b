//! Agent 与 AgentContainer
//!
//! Agent 在 `routes` 中为每种消息类型注册一个 Handler（显式路由表，不做运行时反射），
//! 构造 AgentContainer 时解析一次。容器按 Payload 的类型标签分派，找不到则返回 Unhandled。

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::runtime::{AgentError, Message, MessageContext, Payload};

/// Handler 的统一结果：可选响应
pub type HandlerResult = Result<Option<Payload>, AgentError>;

type HandlerFn<A> = for<'a> fn(&'a mut A, Payload, &'a MessageContext) -> BoxFuture<'a, HandlerResult>;

/// Agent：描述 + 路由注册 + 关闭钩子；内部历史等状态完全由实现者自己维护
#[async_trait]
pub trait Agent: Send + 'static {
    /// 一行描述（编排器构造 roster 提示词时使用）
    fn description(&self) -> &str {
        ""
    }

    /// 注册本 Agent 能处理的消息类型
    fn routes(routes: &mut Routes<Self>)
    where
        Self: Sized;

    /// 运行时 close 时调用
    async fn on_close(&mut self) {}
}

/// 处理某一种消息类型的能力
#[async_trait]
pub trait Handler<M: Message>: Agent {
    async fn handle(&mut self, message: M, ctx: &MessageContext) -> HandlerResult;
}

/// 消息类型标签 → Handler 的路由表
pub struct Routes<A> {
    handlers: HashMap<&'static str, HandlerFn<A>>,
}

impl<A: Agent> Routes<A> {
    fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 注册 M 的 Handler；同一类型重复注册时后者覆盖前者
    pub fn handle<M>(&mut self) -> &mut Self
    where
        A: Handler<M>,
        M: Message,
    {
        self.handlers.insert(M::TYPE, dispatch::<A, M> as HandlerFn<A>);
        self
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }
}

fn dispatch<'a, A, M>(
    agent: &'a mut A,
    payload: Payload,
    ctx: &'a MessageContext,
) -> BoxFuture<'a, HandlerResult>
where
    A: Handler<M>,
    M: Message,
{
    Box::pin(async move {
        let message = payload.decode::<M>()?;
        agent.handle(message, ctx).await
    })
}

trait ErasedAgent: Send {
    fn description(&self) -> String;
    fn handles(&self, message_type: &str) -> bool;
    fn dispatch<'a>(
        &'a mut self,
        payload: Payload,
        ctx: &'a MessageContext,
    ) -> BoxFuture<'a, HandlerResult>;
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

struct Routed<A: Agent> {
    agent: A,
    routes: Routes<A>,
}

impl<A: Agent> ErasedAgent for Routed<A> {
    fn description(&self) -> String {
        self.agent.description().to_string()
    }

    fn handles(&self, message_type: &str) -> bool {
        self.routes.handles(message_type)
    }

    fn dispatch<'a>(
        &'a mut self,
        payload: Payload,
        ctx: &'a MessageContext,
    ) -> BoxFuture<'a, HandlerResult> {
        match self.routes.handlers.get(payload.message_type()).copied() {
            Some(handler) => handler(&mut self.agent, payload, ctx),
            None => {
                let message_type = payload.message_type().to_string();
                Box::pin(async move { Err(AgentError::Unhandled { message_type }) })
            }
        }
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.agent.on_close()
    }
}

/// 把任意 Agent 适配为运行时统一的分派签名
pub struct AgentContainer {
    inner: Box<dyn ErasedAgent>,
}

impl AgentContainer {
    pub fn new<A: Agent>(agent: A) -> Self {
        let mut routes = Routes::new();
        A::routes(&mut routes);
        Self {
            inner: Box::new(Routed { agent, routes }),
        }
    }

    pub fn description(&self) -> String {
        self.inner.description()
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.inner.handles(message_type)
    }

    /// 按 Payload 类型标签分派到对应 Handler
    pub async fn handle(&mut self, payload: Payload, ctx: &MessageContext) -> HandlerResult {
        self.inner.dispatch(payload, ctx).await
    }

    pub async fn close(&mut self) {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{AgentId, AgentRuntime, CancellationToken, RuntimeOptions};
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Add {
        value: i64,
    }

    impl Message for Add {
        const TYPE: &'static str = "test.add";
    }

    #[derive(Serialize, Deserialize)]
    struct Total {
        value: i64,
    }

    impl Message for Total {
        const TYPE: &'static str = "test.total";
    }

    struct Counter {
        total: i64,
    }

    impl Agent for Counter {
        fn description(&self) -> &str {
            "adds numbers"
        }

        fn routes(routes: &mut Routes<Self>) {
            routes.handle::<Add>();
        }
    }

    #[async_trait]
    impl Handler<Add> for Counter {
        async fn handle(&mut self, message: Add, _ctx: &MessageContext) -> HandlerResult {
            self.total += message.value;
            Ok(Some(Payload::encode(&Total { value: self.total })?))
        }
    }

    fn context(runtime: AgentRuntime) -> MessageContext {
        MessageContext::new(
            "m1".to_string(),
            AgentId::new("counter", "default"),
            None,
            None,
            CancellationToken::new(),
            runtime,
        )
    }

    #[tokio::test]
    async fn test_container_dispatches_by_type() {
        let runtime = AgentRuntime::new(RuntimeOptions::default());
        let ctx = context(runtime);
        let mut container = AgentContainer::new(Counter { total: 0 });
        assert_eq!(container.description(), "adds numbers");
        assert!(container.handles("test.add"));

        container
            .handle(Payload::encode(&Add { value: 2 }).unwrap(), &ctx)
            .await
            .unwrap();
        let reply = container
            .handle(Payload::encode(&Add { value: 3 }).unwrap(), &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.decode::<Total>().unwrap().value, 5);
    }

    #[tokio::test]
    async fn test_container_reports_unhandled() {
        let runtime = AgentRuntime::new(RuntimeOptions::default());
        let ctx = context(runtime);
        let mut container = AgentContainer::new(Counter { total: 0 });
        let result = container
            .handle(Payload::encode(&Total { value: 1 }).unwrap(), &ctx)
            .await;
        match result {
            Err(AgentError::Unhandled { message_type }) => assert_eq!(message_type, "test.total"),
            other => panic!("Expected Unhandled, got {:?}", other),
        }
    }
}
