//! 异步 SQLite 会话存储（需要启用 `async-sqlite` feature）
//!
//! 表结构：
//! - `conversations`：会话头部，摘要以 JSON 存储
//! - `messages`：自增 seq 列保持追加顺序，消息 ID 在所属会话内唯一
//! - `tasks`：以 `(conversation_id, originating_message_id, agent_name)` 为主键

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::conversation::{Conversation, ConversationStatus, Message, Sender, Summary};
use super::store::ConversationStore;
use crate::agents::Task;
use crate::core::MemoryError;

fn persistence(e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Persistence(e.to_string())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, MemoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(persistence)
}

/// SQLite 会话存储
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;

        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                status TEXT NOT NULL,
                summary TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                sender TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (conversation_id, id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, seq)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                conversation_id TEXT NOT NULL,
                originating_message_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, originating_message_id, agent_name)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn message_from_row(row: &SqliteRow) -> Result<Message, MemoryError> {
        let sender: String = row.get("sender");
        let metadata: String = row.get("metadata");
        let created_at: String = row.get("created_at");
        Ok(Message {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            sender: Sender::from_key(&sender),
            content: row.get("content"),
            created_at: parse_time(&created_at)?,
            metadata: serde_json::from_str(&metadata).map_err(persistence)?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn put_conversation(&self, conversation: &Conversation) -> Result<(), MemoryError> {
        let summary = conversation
            .summary_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(persistence)?;

        sqlx::query(
            "INSERT INTO conversations (id, participant_id, status, summary, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                participant_id = excluded.participant_id,
                status = excluded.status,
                summary = excluded.summary,
                updated_at = excluded.updated_at",
        )
        .bind(&conversation.id)
        .bind(&conversation.participant_id)
        .bind(conversation.status.as_str())
        .bind(summary)
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, MemoryError> {
        let row = sqlx::query(
            "SELECT id, participant_id, status, summary, created_at, updated_at
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let status: String = row.get("status");
        let summary: Option<String> = row.get("summary");
        let created_at: String = row.get("created_at");
        let updated_at: String = row.get("updated_at");
        let summary_context = summary
            .map(|s| serde_json::from_str::<Summary>(&s))
            .transpose()
            .map_err(persistence)?;

        Ok(Some(Conversation {
            id: row.get("id"),
            participant_id: row.get("participant_id"),
            messages: self.list_messages(conversation_id).await?,
            summary_context,
            status: ConversationStatus::parse(&status),
            created_at: parse_time(&created_at)?,
            updated_at: parse_time(&updated_at)?,
        }))
    }

    async fn append_message(&self, message: &Message) -> Result<(), MemoryError> {
        let metadata = serde_json::to_string(&message.metadata).map_err(persistence)?;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(persistence)?;

        let updated = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&message.conversation_id)
            .execute(&mut *tx)
            .await
            .map_err(persistence)?;
        if updated.rows_affected() == 0 {
            return Err(MemoryError::UnknownConversation(message.conversation_id.clone()));
        }

        sqlx::query(
            "INSERT OR IGNORE INTO messages (id, conversation_id, sender, content, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.sender.as_key())
        .bind(&message.content)
        .bind(metadata)
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(persistence)?;

        tx.commit().await.map_err(persistence)?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, MemoryError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, sender, content, metadata, created_at
             FROM messages WHERE conversation_id = ? ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn put_task(&self, task: &Task) -> Result<(), MemoryError> {
        let payload = serde_json::to_string(task).map_err(persistence)?;
        sqlx::query(
            "INSERT INTO tasks (conversation_id, originating_message_id, agent_name, status, payload, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id, originating_message_id, agent_name) DO UPDATE SET
                status = excluded.status,
                payload = excluded.payload",
        )
        .bind(&task.conversation_id)
        .bind(&task.originating_message_id)
        .bind(&task.assigned_agent)
        .bind(task.status.as_str())
        .bind(payload)
        .bind(task.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(())
    }

    async fn list_tasks(&self, conversation_id: &str) -> Result<Vec<Task>, MemoryError> {
        let rows = sqlx::query("SELECT payload FROM tasks WHERE conversation_id = ? ORDER BY created_at ASC")
            .bind(conversation_id)
            .fetch_all(&self.pool)
            .await
            .map_err(persistence)?;

        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str(&payload).map_err(persistence)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentReply, TaskKey, TaskStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_sqlite_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("switchboard.db");

        {
            let store = SqliteStore::new(&db_path).await.unwrap();
            store.put_conversation(&Conversation::with_id("c1", "u1")).await.unwrap();
            let first = Message::user("c1", "天气怎么样");
            let reply = Message::agent("c1", "weather", "晴").with_metadata("in_reply_to", first.id.clone());
            store.append_message(&first).await.unwrap();
            store.append_message(&reply).await.unwrap();
            store.append_message(&first).await.unwrap();
            store.close().await;
        }

        let store = SqliteStore::new(&db_path).await.unwrap();
        let conv = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.messages[0].sender, Sender::User);
        assert_eq!(conv.messages[1].sender, Sender::agent("weather"));
        assert_eq!(conv.messages[1].in_reply_to(), Some(conv.messages[0].id.as_str()));
    }

    #[tokio::test]
    async fn test_sqlite_store_rejects_unknown_conversation() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).await.unwrap();
        assert!(matches!(
            store.append_message(&Message::user("missing", "hi")).await,
            Err(MemoryError::UnknownConversation(_))
        ));
    }

    #[tokio::test]
    async fn test_sqlite_store_tasks_and_summary() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::new(dir.path().join("t.db")).await.unwrap();

        let mut conv = Conversation::with_id("c1", "u1");
        conv.summary_context = Some(Summary {
            text: "earlier talk".to_string(),
            covered_messages: 4,
            refreshed_at: Utc::now(),
        });
        store.put_conversation(&conv).await.unwrap();

        let mut task = Task::new(&TaskKey::new("c1", "m1", "echo"));
        store.put_task(&task).await.unwrap();
        task.start().unwrap();
        task.succeed(AgentReply::new("ok", 0.8)).unwrap();
        store.put_task(&task).await.unwrap();

        let tasks = store.list_tasks("c1").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Succeeded);

        let loaded = store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(loaded.summary_context.map(|s| s.covered_messages), Some(4));
    }

    #[tokio::test]
    async fn test_sqlite_store_same_message_id_in_two_conversations() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("t.db");

        {
            let store = SqliteStore::new(&db_path).await.unwrap();
            for id in ["a", "b"] {
                store.put_conversation(&Conversation::with_id(id, "u1")).await.unwrap();
                let message = Message::user(id, format!("hello from {id}")).with_id("m1");
                store.append_message(&message).await.unwrap();
            }
            store.close().await;
        }

        let store = SqliteStore::new(&db_path).await.unwrap();
        for id in ["a", "b"] {
            let messages = store.list_messages(id).await.unwrap();
            assert_eq!(messages.len(), 1, "conversation {id}");
            assert_eq!(messages[0].id, "m1");
            assert_eq!(messages[0].content, format!("hello from {id}"));
        }
    }
}
