//! 持久化协作者接口
//!
//! 按键有序的持久存储：会话头部按 conversation_id 存取，消息为每个会话的只追加序列，
//! Task 以 `(conversation_id, originating_message_id, agent_name)` 为键覆盖写入。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::conversation::{Conversation, Message};
use crate::agents::{Task, TaskKey};
use crate::core::MemoryError;

/// 会话存储接口
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// 写入或覆盖会话头部（不含消息序列）
    async fn put_conversation(&self, conversation: &Conversation) -> Result<(), MemoryError>;

    /// 读取会话头部及完整消息序列
    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, MemoryError>;

    /// 追加到会话消息序列末尾；同一消息 ID 重复追加不产生新条目
    async fn append_message(&self, message: &Message) -> Result<(), MemoryError>;

    /// 按追加顺序列出消息
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError>;

    /// 写入或覆盖 Task
    async fn put_task(&self, task: &Task) -> Result<(), MemoryError>;

    /// 列出会话的 Task（按创建时间）
    async fn list_tasks(&self, conversation_id: &str) -> Result<Vec<Task>, MemoryError>;
}

#[derive(Default)]
struct StoredConversation {
    header: Option<Conversation>,
    messages: Vec<Message>,
    tasks: Vec<Task>,
}

/// 内存存储
#[derive(Default)]
pub struct InMemoryStore {
    conversations: RwLock<HashMap<String, StoredConversation>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn put_conversation(&self, conversation: &Conversation) -> Result<(), MemoryError> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations.entry(conversation.id.clone()).or_default();
        stored.header = Some(conversation.header());
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, MemoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(conversation_id).and_then(|stored| {
            stored.header.as_ref().map(|header| Conversation {
                messages: stored.messages.clone(),
                ..header.clone()
            })
        }))
    }

    async fn append_message(&self, message: &Message) -> Result<(), MemoryError> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations
            .get_mut(&message.conversation_id)
            .filter(|s| s.header.is_some())
            .ok_or_else(|| MemoryError::UnknownConversation(message.conversation_id.clone()))?;
        if stored.messages.iter().any(|m| m.id == message.id) {
            return Ok(());
        }
        stored.messages.push(message.clone());
        if let Some(header) = stored.header.as_mut() {
            header.touch();
        }
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .get(conversation_id)
            .map(|s| s.messages.clone())
            .unwrap_or_default())
    }

    async fn put_task(&self, task: &Task) -> Result<(), MemoryError> {
        let mut conversations = self.conversations.write().await;
        let stored = conversations.entry(task.conversation_id.clone()).or_default();
        let key: TaskKey = task.key();
        match stored.tasks.iter_mut().find(|t| t.key() == key) {
            Some(existing) => *existing = task.clone(),
            None => stored.tasks.push(task.clone()),
        }
        Ok(())
    }

    async fn list_tasks(&self, conversation_id: &str) -> Result<Vec<Task>, MemoryError> {
        let conversations = self.conversations.read().await;
        let mut tasks = conversations
            .get(conversation_id)
            .map(|s| s.tasks.clone())
            .unwrap_or_default();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }
}

/// 创建会话存储
///
/// 提供 db_path 且启用 async-sqlite feature 时使用 SQLite；否则（或打开失败时）退回内存存储
pub async fn create_conversation_store(db_path: Option<&std::path::Path>) -> Arc<dyn ConversationStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = db_path {
        match super::sqlite::SqliteStore::new(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite conversation store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if db_path.is_some() {
        tracing::warn!("Persistent store requested but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory conversation store");
    Arc::new(InMemoryStore::new())
}
