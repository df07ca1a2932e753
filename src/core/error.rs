//! 错误类型
//!
//! 按关注点划分：Broker（传输耗尽重试）、Memory（持久化失败）、Registry（注册冲突）、
//! Task 状态机非法迁移、Agent 领域错误、分类器错误。
//! `NoAgentAvailable` 与超时不是错误，分别体现为 `DispatchOutcome` 与 `TaskStatus::TimedOut`。

use thiserror::Error;

use crate::agents::TaskStatus;

/// 传输层错误：Transient 可重试，Closed 表示传输端已关闭
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport busy: {0}")]
    Transient(String),

    #[error("transport closed: {0}")]
    Closed(String),
}

/// 消息总线错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// 重试耗尽，调用方决定降级还是上抛
    #[error("broker unavailable on '{channel}' after {attempts} attempts: {reason}")]
    BrokerUnavailable {
        channel: String,
        attempts: u32,
        reason: String,
    },

    #[error("invalid channel pattern: {0}")]
    InvalidPattern(String),

    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// 记忆层错误（持久化失败不在内部重试，避免重复写入对话轮次）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("invalid conversation id: {0:?}")]
    InvalidConversationId(String),

    #[error("message {message_id} belongs to conversation {actual}, not {expected}")]
    ConversationMismatch {
        message_id: String,
        expected: String,
        actual: String,
    },
}

/// 注册表错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent '{0}' is already registered")]
    DuplicateAgent(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// 保留的 fallback agent 不允许注销
    #[error("agent '{0}' is reserved")]
    ReservedAgent(String),
}

/// Task 状态机非法迁移（终态不可离开）
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal task transition {from:?} -> {to:?}")]
pub struct TaskTransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Agent 调用时抛出的领域错误，只记录在对应 Task 上，不影响兄弟调用
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent failed: {0}")]
    Failed(String),

    #[error("agent unavailable: {0}")]
    Unavailable(String),

    #[error("agent cancelled")]
    Cancelled,
}

/// 意图分类器错误；Dispatcher 将其视为空候选列表
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("invalid classifier response: {0}")]
    InvalidResponse(String),
}
