//! Hive - Rust 多智能体编排内核
//!
//! 模块划分：
//! - **runtime**: 可寻址 Agent 运行时（按消息类型路由、Topic 发布/订阅、点对点 RPC、协作式取消）
//! - **orchestrator**: 账本式编排器（Oracle 评估进度、选择发言者、停滞检测与重规划）
//! - **llm**: LLM 客户端抽象与脚本化 Mock
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: 日志初始化

pub mod config;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod runtime;

pub use orchestrator::{LedgerOrchestrator, OrchestratorAgent, TaskOutcome, TaskRequest, TaskResult};
pub use runtime::{AgentId, AgentRuntime, CancellationToken, Payload, RuntimeError, RuntimeOptions, TopicId};
