//! 记忆层：会话消息序列、最近上下文、长期摘要、持久化

pub mod conversation;
pub mod manager;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;
pub mod store;
pub mod summary;
pub mod token_budget;

pub use conversation::{
    validate_conversation_id, Conversation, ConversationId, ConversationStatus, Message, MessageId, Sender, Summary,
    META_IN_REPLY_TO,
};
pub use manager::{AppendOutcome, MemoryConfig, MemoryManager};
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;
pub use store::{create_conversation_store, ConversationStore, InMemoryStore};
pub use summary::{Summarizer, TruncatingSummarizer};
pub use token_budget::{ContextBudget, HeuristicTokenEstimator, TokenEstimator};
