//! 对话数据模型：Message / Conversation / Summary
//!
//! Message 创建后不可变；Conversation 的消息序列只追加、不重排、不原地修改，
//! 由 MemoryManager 独占持有。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::MemoryError;

pub type ConversationId = String;
pub type MessageId = String;

/// 会话 ID 不能为空白，也不能包含控制字符
pub fn validate_conversation_id(id: &str) -> Result<(), MemoryError> {
    if id.trim().is_empty() || id.chars().any(char::is_control) {
        return Err(MemoryError::InvalidConversationId(id.to_string()));
    }
    Ok(())
}

/// 元数据键：回复所对应的入站消息 ID
pub const META_IN_REPLY_TO: &str = "in_reply_to";

/// 消息发送方
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent(String),
    System,
}

impl Sender {
    pub fn agent(name: impl Into<String>) -> Self {
        Sender::Agent(name.into())
    }

    /// 持久化用的字符串形式：user / agent:<name> / system
    pub fn as_key(&self) -> String {
        match self {
            Sender::User => "user".to_string(),
            Sender::Agent(name) => format!("agent:{name}"),
            Sender::System => "system".to_string(),
        }
    }

    pub fn from_key(key: &str) -> Self {
        match key {
            "user" => Sender::User,
            "system" => Sender::System,
            other => match other.strip_prefix("agent:") {
                Some(name) => Sender::Agent(name.to_string()),
                None => Sender::System,
            },
        }
    }
}

impl std::fmt::Display for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key())
    }
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: Sender,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// 开放式元数据：置信度、识别出的意图、耗时等
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(conversation_id: impl Into<String>, sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4()),
            conversation_id: conversation_id.into(),
            sender,
            content: content.into(),
            created_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn user(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Sender::User, content)
    }

    pub fn agent(
        conversation_id: impl Into<String>,
        agent_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(conversation_id, Sender::agent(agent_name), content)
    }

    pub fn system(conversation_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(conversation_id, Sender::System, content)
    }

    /// 指定消息 ID（上游已分配 ID 时用于去重）
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 若此消息是某条入站消息的回复，返回其 ID
    pub fn in_reply_to(&self) -> Option<&str> {
        self.metadata.get(META_IN_REPLY_TO).and_then(Value::as_str)
    }
}

/// 会话状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// 进行中
    Active,
    /// 暂停
    Paused,
    /// 已完成
    Completed,
    /// 已归档
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Paused => "paused",
            ConversationStatus::Completed => "completed",
            ConversationStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paused" => ConversationStatus::Paused,
            "completed" => ConversationStatus::Completed,
            "archived" => ConversationStatus::Archived,
            _ => ConversationStatus::Active,
        }
    }
}

/// 长期上下文：对较早历史的压缩摘要
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub text: String,
    /// 摘要覆盖的消息条数（从会话开头算起）；只增不减
    pub covered_messages: usize,
    pub refreshed_at: DateTime<Utc>,
}

/// 会话
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_id: String,
    /// 插入顺序的消息序列
    #[serde(default)]
    pub messages: Vec<Message>,
    pub summary_context: Option<Summary>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self::with_id(format!("conv_{}", uuid::Uuid::new_v4()), participant_id)
    }

    pub fn with_id(id: impl Into<String>, participant_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            participant_id: participant_id.into(),
            messages: Vec::new(),
            summary_context: None,
            status: ConversationStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// 不含消息序列的头部副本（用于持久化头部字段）
    pub fn header(&self) -> Conversation {
        Conversation {
            messages: Vec::new(),
            ..self.clone()
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_conversation_id() {
        assert!(validate_conversation_id("c1").is_ok());
        assert!(validate_conversation_id("user.42").is_ok());
        assert!(validate_conversation_id("#general").is_ok());
        assert!(matches!(
            validate_conversation_id(""),
            Err(MemoryError::InvalidConversationId(_))
        ));
        assert!(validate_conversation_id("   ").is_err());
        assert!(validate_conversation_id("c1\n").is_err());
    }

    #[test]
    fn test_sender_key_roundtrip() {
        for sender in [Sender::User, Sender::System, Sender::agent("weather")] {
            assert_eq!(Sender::from_key(&sender.as_key()), sender);
        }
        assert_eq!(Sender::agent("weather").to_string(), "agent:weather");
    }

    #[test]
    fn test_in_reply_to() {
        let msg = Message::agent("c1", "echo", "hi").with_metadata(META_IN_REPLY_TO, "msg_1");
        assert_eq!(msg.in_reply_to(), Some("msg_1"));
        assert_eq!(Message::user("c1", "hi").in_reply_to(), None);
    }

    #[test]
    fn test_header_drops_messages() {
        let mut conv = Conversation::with_id("c1", "u1");
        conv.messages.push(Message::user("c1", "hello"));
        let header = conv.header();
        assert!(header.is_empty());
        assert_eq!(header.id, "c1");
        assert_eq!(conv.len(), 1);
    }
}
