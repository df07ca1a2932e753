//! Agent 能力接口
//!
//! 所有领域 Agent（天气、日历、搜索……）实现 Agent trait：名称、能力标签、优先级、
//! invoke(message, context)。多态通过 trait object 分派，不做运行时属性探测。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;
use crate::memory::{Message, Summary};

/// Agent 的回复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub content: String,
    /// 自评置信度，[0, 1]
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentReply {
    pub fn new(content: impl Into<String>, confidence: f64) -> Self {
        Self {
            content: content.into(),
            confidence: if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 调用 Agent 时传入的上下文
#[derive(Debug, Clone, Default)]
pub struct AgentContext {
    pub conversation_id: String,
    /// 最近若干轮消息（旧 → 新）
    pub recent: Vec<Message>,
    pub summary: Option<Summary>,
    /// 取消信号；Agent 应尽力响应
    pub cancel: CancellationToken,
}

impl AgentContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Default::default()
        }
    }

    pub fn with_recent(mut self, recent: Vec<Message>) -> Self {
        self.recent = recent;
        self
    }

    pub fn with_summary(mut self, summary: Option<Summary>) -> Self {
        self.summary = summary;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Agent trait
#[async_trait]
pub trait Agent: Send + Sync {
    /// 全局唯一名称
    fn name(&self) -> &str;

    /// 能力标签（如 weather、calendar、search）
    fn capability_tags(&self) -> Vec<String>;

    /// 优先级，数值越大越优先；聚合平局时使用
    fn priority(&self) -> i32 {
        0
    }

    /// 处理一条消息
    async fn invoke(&self, message: &Message, context: &AgentContext) -> Result<AgentReply, AgentError>;

    /// 健康检查，默认健康
    async fn health_check(&self) -> bool {
        true
    }

    /// 关闭时的清理钩子
    async fn shutdown(&self) {}
}
