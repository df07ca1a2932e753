//! Switchboard - 对话式多智能体编排核心
//!
//! 模块划分：
//! - **agents**: Agent 契约、注册表、Task 生命周期与 AgentManager（超时、回退、广播聚合）
//! - **broker**: 按会话划分频道的消息总线（有序投递、重试、通配订阅）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、组件装配、优雅关闭
//! - **dispatcher**: 意图分类、路由决策、单轮调度与入站监听
//! - **llm**: LLM 客户端抽象（供 LLM 分类器使用）与 Mock
//! - **memory**: 会话、消息、摘要与持久化
//! - **observability**: tracing 初始化

pub mod agents;
pub mod broker;
pub mod config;
pub mod core;
pub mod dispatcher;
pub mod llm;
pub mod memory;
pub mod observability;

pub use agents::{Agent, AgentContext, AgentManager, AgentRegistry, AgentReply, DispatchOutcome};
pub use broker::MessageBroker;
pub use config::{load_config, AppConfig};
pub use core::{Switchboard, SwitchboardBuilder};
pub use dispatcher::{Dispatcher, Incoming};
pub use memory::{MemoryManager, Message};
