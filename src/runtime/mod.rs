//! Agent 运行时：寻址、按消息类型路由、Topic 发布/订阅、点对点请求/响应、协作式取消
//!
//! - **message**: AgentId / TopicId / Payload / MessageContext 等纯数据类型
//! - **subscription**: Topic → AgentId 的订阅谓词
//! - **cancellation**: 可传播、单调的取消令牌
//! - **agent**: Agent trait、按类型注册的 Handler 路由表与 AgentContainer
//! - **intervention**: 每一跳前后的拦截钩子（日志、策略、追踪）
//! - **engine**: 调度循环、实例缓存、每 Agent 串行邮箱

pub mod agent;
pub mod cancellation;
pub mod engine;
pub mod error;
pub mod intervention;
pub mod message;
pub mod subscription;

pub use agent::{Agent, AgentContainer, Handler, HandlerResult, Routes};
pub use cancellation::CancellationToken;
pub use engine::{AgentFactory, AgentRuntime, RuntimeOptions, RuntimeState};
pub use error::{AgentError, CodecError, RuntimeError};
pub use intervention::{Intervention, InterventionHandler, TracingIntervention};
pub use message::{AgentId, AgentType, Message, MessageContext, Payload, TopicId};
pub use subscription::{Subscription, SubscriptionId};
