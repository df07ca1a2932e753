//! Agent 注册表与管理器
//!
//! - **traits**: Agent 能力接口、调用上下文、回复
//! - **registry**: 名称唯一的注册表（单写多读），健康标记
//! - **task**: Task 状态机与进行中登记
//! - **manager**: single / broadcast 调度、超时、故障隔离、聚合
//! - **metrics**: 每个 Agent 的调用统计
//! - **builtin**: 兜底与演示 Agent

pub mod builtin;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod task;
pub mod traits;

pub use builtin::{ClockAgent, EchoAgent, FallbackAgent, DEFAULT_FALLBACK_AGENT};
pub use manager::{AgentManager, AgentManagerConfig, DispatchMode, DispatchOutcome, DispatchRequest};
pub use metrics::AgentMetrics;
pub use registry::{AgentDescriptor, AgentRegistry};
pub use task::{Task, TaskError, TaskErrorKind, TaskId, TaskKey, TaskLedger, TaskStatus};
pub use traits::{Agent, AgentContext, AgentReply};
