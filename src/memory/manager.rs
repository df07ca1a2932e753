//! 记忆管理器
//!
//! 每个会话一把 RwLock：同一会话的写入串行化，不同会话之间互不阻塞。
//! 会话在首次访问时从存储懒加载（进程重启后恢复），并重建消息 ID 去重索引。
//! 持久化失败直接返回 `MemoryError::Persistence`，不在内部重试。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::conversation::{
    validate_conversation_id, Conversation, ConversationId, ConversationStatus, Message, MessageId, Summary,
};
use super::store::{ConversationStore, InMemoryStore};
use super::summary::{Summarizer, TruncatingSummarizer};
use super::token_budget::{ContextBudget, HeuristicTokenEstimator, TokenEstimator};
use crate::agents::Task;
use crate::core::MemoryError;

/// [memory] 段
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// recent_context 默认轮数；同时是摘要不覆盖的最近窗口
    pub context_turns: usize,
    /// 每追加 N 条消息自动刷新摘要，0 表示只手动刷新
    pub summary_every_n_turns: usize,
    pub summary_max_chars: usize,
    /// SQLite 文件路径（需要 async-sqlite feature）
    pub db_path: Option<String>,
    /// 内存中最多保留的会话数，超出时卸载最久未更新的空闲会话；0 表示不限
    pub max_loaded_conversations: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            context_turns: 20,
            summary_every_n_turns: 10,
            summary_max_chars: 1200,
            db_path: None,
            max_loaded_conversations: 1024,
        }
    }
}

/// 追加结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 新追加，position 为其在会话序列中的下标
    Appended { position: usize },
    /// 同 ID 消息已存在，未做任何修改
    Duplicate,
}

struct ConversationSlot {
    conversation: Conversation,
    seen: HashSet<MessageId>,
    appended_since_summary: usize,
    /// 会话头部已写入存储
    persisted: bool,
}

impl ConversationSlot {
    fn new(conversation: Conversation) -> Self {
        let seen = conversation.messages.iter().map(|m| m.id.clone()).collect();
        Self {
            conversation,
            seen,
            appended_since_summary: 0,
            persisted: true,
        }
    }

    fn ensure_persisted(&self) -> Result<(), MemoryError> {
        if self.persisted {
            Ok(())
        } else {
            Err(MemoryError::UnknownConversation(self.conversation.id.clone()))
        }
    }
}

type SharedSlot = Arc<RwLock<ConversationSlot>>;

/// 记忆管理器
pub struct MemoryManager {
    store: Arc<dyn ConversationStore>,
    summarizer: Arc<dyn Summarizer>,
    estimator: Arc<dyn TokenEstimator>,
    conversations: RwLock<HashMap<ConversationId, SharedSlot>>,
    config: MemoryConfig,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn ConversationStore>, config: MemoryConfig) -> Self {
        Self {
            store,
            summarizer: Arc::new(TruncatingSummarizer::new(config.summary_max_chars)),
            estimator: Arc::new(HeuristicTokenEstimator),
            conversations: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// 内存存储 + 默认配置
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStore::new()), MemoryConfig::default())
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// 取会话槽位；内存中没有时从存储加载
    async fn slot(&self, conversation_id: &str) -> Result<Option<SharedSlot>, MemoryError> {
        if let Some(slot) = self.conversations.read().await.get(conversation_id) {
            return Ok(Some(Arc::clone(slot)));
        }

        let Some(conversation) = self.store.get_conversation(conversation_id).await? else {
            return Ok(None);
        };
        tracing::debug!(
            conversation_id,
            messages = conversation.messages.len(),
            "conversation rehydrated from store"
        );

        // 并发加载时以先插入者为准
        let slot = {
            let mut conversations = self.conversations.write().await;
            Arc::clone(
                conversations
                    .entry(conversation_id.to_string())
                    .or_insert_with(|| Arc::new(RwLock::new(ConversationSlot::new(conversation)))),
            )
        };
        self.evict_idle().await;
        Ok(Some(slot))
    }

    async fn require_slot(&self, conversation_id: &str) -> Result<SharedSlot, MemoryError> {
        self.slot(conversation_id)
            .await?
            .ok_or_else(|| MemoryError::UnknownConversation(conversation_id.to_string()))
    }

    /// 以给定头部新建会话；同 ID 的会话已在内存中时直接返回它的头部
    ///
    /// 新槽位先登记再落盘，落盘期间持有其写锁，并发的追加在落盘完成后才会执行。
    async fn insert_new(&self, conversation: Conversation) -> Result<Conversation, MemoryError> {
        let header = conversation.header();
        let mut fresh = ConversationSlot::new(conversation);
        fresh.persisted = false;
        let slot = Arc::new(RwLock::new(fresh));
        let mut guard = Arc::clone(&slot).write_owned().await;

        let existing = {
            let mut conversations = self.conversations.write().await;
            match conversations.get(&header.id) {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    conversations.insert(header.id.clone(), Arc::clone(&slot));
                    None
                }
            }
        };
        if let Some(existing) = existing {
            drop(guard);
            let mut existing = existing.write().await;
            self.persist_header(&mut existing).await?;
            return Ok(existing.conversation.header());
        }

        if let Err(e) = self.store.put_conversation(&header).await {
            drop(guard);
            let mut conversations = self.conversations.write().await;
            if conversations.get(&header.id).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                conversations.remove(&header.id);
            }
            return Err(e);
        }
        guard.persisted = true;
        drop(guard);
        drop(slot);

        tracing::info!(conversation_id = %header.id, participant = %header.participant_id, "conversation created");
        self.evict_idle().await;
        Ok(header)
    }

    /// 补写创建者未完成落盘（例如调用被超时取消）的会话头部
    async fn persist_header(&self, slot: &mut ConversationSlot) -> Result<(), MemoryError> {
        if !slot.persisted {
            self.store.put_conversation(&slot.conversation.header()).await?;
            slot.persisted = true;
            tracing::info!(conversation_id = %slot.conversation.id, "pending conversation header persisted");
        }
        Ok(())
    }

    /// 超出 max_loaded_conversations 时卸载最久未更新的空闲会话
    ///
    /// 仅卸载没有其他持有者的槽位；数据仍在存储中，下次访问时重新加载。
    async fn evict_idle(&self) {
        let max = self.config.max_loaded_conversations;
        if max == 0 {
            return;
        }
        let mut conversations = self.conversations.write().await;
        if conversations.len() <= max {
            return;
        }
        let mut idle: Vec<_> = conversations
            .iter()
            .filter(|(_, slot)| Arc::strong_count(slot) == 1)
            .filter_map(|(id, slot)| {
                slot.try_read()
                    .ok()
                    .map(|s| (s.conversation.updated_at, id.clone()))
            })
            .collect();
        idle.sort();
        let excess = conversations.len() - max;
        let mut evicted = 0;
        for (_, id) in idle.into_iter().take(excess) {
            conversations.remove(&id);
            evicted += 1;
        }
        tracing::debug!(evicted, loaded = conversations.len(), "idle conversations unloaded");
    }

    /// 把会话从内存卸载（存储不受影响），返回是否卸载
    ///
    /// 会话正被其他调用使用时不卸载。
    pub async fn unload(&self, conversation_id: &str) -> bool {
        let mut conversations = self.conversations.write().await;
        match conversations.get(conversation_id) {
            Some(slot) if Arc::strong_count(slot) == 1 => {
                conversations.remove(conversation_id);
                true
            }
            _ => false,
        }
    }

    /// 新建会话，返回头部
    pub async fn create_conversation(&self, participant_id: &str) -> Result<Conversation, MemoryError> {
        self.insert_new(Conversation::new(participant_id)).await
    }

    /// 确保会话存在：不存在则以给定 ID 创建；已存在但非 active 时重新激活
    pub async fn ensure_conversation(
        &self,
        conversation_id: &str,
        participant_id: &str,
    ) -> Result<Conversation, MemoryError> {
        validate_conversation_id(conversation_id)?;
        match self.slot(conversation_id).await? {
            Some(slot) => {
                let mut slot = slot.write().await;
                self.persist_header(&mut slot).await?;
                if slot.conversation.status != ConversationStatus::Active {
                    let mut header = slot.conversation.header();
                    header.status = ConversationStatus::Active;
                    header.touch();
                    self.store.put_conversation(&header).await?;
                    slot.conversation.status = header.status;
                    slot.conversation.updated_at = header.updated_at;
                    tracing::info!(conversation_id, "conversation reactivated");
                }
                Ok(slot.conversation.header())
            }
            None => {
                self.insert_new(Conversation::with_id(conversation_id, participant_id))
                    .await
            }
        }
    }

    /// 完整会话（含消息序列）
    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, MemoryError> {
        match self.slot(conversation_id).await? {
            Some(slot) => Ok(Some(slot.read().await.conversation.clone())),
            None => Ok(None),
        }
    }

    pub async fn set_status(&self, conversation_id: &str, status: ConversationStatus) -> Result<(), MemoryError> {
        let slot = self.require_slot(conversation_id).await?;
        let mut slot = slot.write().await;
        slot.ensure_persisted()?;
        let mut header = slot.conversation.header();
        header.status = status;
        header.touch();
        self.store.put_conversation(&header).await?;
        slot.conversation.status = status;
        slot.conversation.updated_at = header.updated_at;
        Ok(())
    }

    /// 追加消息并持久化；同 ID 消息重复追加是无操作
    pub async fn append(&self, conversation_id: &str, message: Message) -> Result<AppendOutcome, MemoryError> {
        if message.conversation_id != conversation_id {
            return Err(MemoryError::ConversationMismatch {
                message_id: message.id,
                expected: conversation_id.to_string(),
                actual: message.conversation_id,
            });
        }

        let slot = self.require_slot(conversation_id).await?;
        let (position, refresh_due) = {
            let mut slot = slot.write().await;
            slot.ensure_persisted()?;
            if slot.seen.contains(&message.id) {
                tracing::debug!(conversation_id, message_id = %message.id, "duplicate message ignored");
                return Ok(AppendOutcome::Duplicate);
            }

            // 先落盘，失败时内存状态不变
            self.store.append_message(&message).await?;

            slot.seen.insert(message.id.clone());
            slot.conversation.messages.push(message);
            slot.conversation.touch();
            slot.appended_since_summary += 1;

            let every = self.config.summary_every_n_turns;
            (
                slot.conversation.messages.len() - 1,
                every > 0 && slot.appended_since_summary >= every,
            )
        };

        if refresh_due {
            if let Err(e) = self.refresh_summary(conversation_id).await {
                tracing::warn!(conversation_id, error = %e, "summary refresh failed");
            }
        }

        Ok(AppendOutcome::Appended { position })
    }

    /// 完整历史（旧 → 新）
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
        let slot = self.require_slot(conversation_id).await?;
        let slot = slot.read().await;
        Ok(slot.conversation.messages.clone())
    }

    /// 按预算取最近消息（旧 → 新）
    pub async fn recent_context(
        &self,
        conversation_id: &str,
        budget: ContextBudget,
    ) -> Result<Vec<Message>, MemoryError> {
        let slot = self.require_slot(conversation_id).await?;
        let slot = slot.read().await;
        Ok(budget
            .select(&slot.conversation.messages, self.estimator.as_ref())
            .to_vec())
    }

    /// 按配置的默认轮数取最近消息
    pub async fn default_context(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
        self.recent_context(conversation_id, ContextBudget::Turns(self.config.context_turns))
            .await
    }

    /// 长期上下文摘要
    pub async fn long_term_context(&self, conversation_id: &str) -> Result<Option<Summary>, MemoryError> {
        let slot = self.require_slot(conversation_id).await?;
        let slot = slot.read().await;
        Ok(slot.conversation.summary_context.clone())
    }

    /// 重新计算摘要，覆盖最近窗口之前的所有消息
    ///
    /// 只有新摘要覆盖的消息严格多于当前摘要时才会生效，摘要只前进不回退。
    pub async fn refresh_summary(&self, conversation_id: &str) -> Result<Option<Summary>, MemoryError> {
        let slot = self.require_slot(conversation_id).await?;

        let (previous, pending) = {
            let slot = slot.read().await;
            let messages = &slot.conversation.messages;
            let target = messages.len().saturating_sub(self.config.context_turns);
            let previous = slot.conversation.summary_context.clone();
            let covered = previous.as_ref().map(|s| s.covered_messages).unwrap_or(0);
            if target <= covered {
                return Ok(previous);
            }
            (previous, messages[covered..target].to_vec())
        };

        // 摘要计算不持有会话锁
        let text = self.summarizer.summarize(previous.as_ref(), &pending).await?;
        let covered = previous.as_ref().map(|s| s.covered_messages).unwrap_or(0) + pending.len();

        let mut slot = slot.write().await;
        let current = slot
            .conversation
            .summary_context
            .as_ref()
            .map(|s| s.covered_messages)
            .unwrap_or(0);
        if covered <= current {
            return Ok(slot.conversation.summary_context.clone());
        }

        let summary = Summary {
            text,
            covered_messages: covered,
            refreshed_at: Utc::now(),
        };
        let mut header = slot.conversation.header();
        header.summary_context = Some(summary.clone());
        self.store.put_conversation(&header).await?;

        slot.conversation.summary_context = Some(summary.clone());
        slot.appended_since_summary = 0;
        tracing::debug!(conversation_id, covered, "summary refreshed");
        Ok(Some(summary))
    }

    /// 查找入站消息对应的已存回复（metadata.in_reply_to 匹配）
    pub async fn find_reply(&self, conversation_id: &str, message_id: &str) -> Result<Option<Message>, MemoryError> {
        let Some(slot) = self.slot(conversation_id).await? else {
            return Ok(None);
        };
        let slot = slot.read().await;
        Ok(slot
            .conversation
            .messages
            .iter()
            .find(|m| m.in_reply_to() == Some(message_id))
            .cloned())
    }

    /// 记录终态 Task
    pub async fn record_task(&self, task: &Task) -> Result<(), MemoryError> {
        self.store.put_task(task).await
    }

    pub async fn tasks(&self, conversation_id: &str) -> Result<Vec<Task>, MemoryError> {
        self.store.list_tasks(conversation_id).await
    }

    /// 当前已加载到内存的会话数
    pub async fn loaded_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}
