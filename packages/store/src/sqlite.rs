//! `SQLite`-backed [`ConversationStore`], generalizing
//! `crime_map_conversations`'s schema (`conversations`, `messages`) to spec
//! §6's schema exactly, adding the `memory` table for §4.J.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chatgraph_store_models::{
    ConversationDetail, ConversationMeta, ConversationUpdate, MemoryRecord, MemoryStatus,
    MessageEvaluation, NewMessage, Role, StoredMessage,
};
use chrono::{DateTime, Utc};
use moosicbox_json_utils::database::ToValue as _;
use switchy_database::{Database, DatabaseValue};
use switchy_database_connection::init_sqlite_rusqlite;

use crate::cache::{meta_key, msgs_key, CacheBackend, MokaCacheBackend};
use crate::{ConversationStore, StoreError};

fn db_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Database(err.to_string())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Durable conversation/message/memory store, mediated by a [`CacheBackend`].
pub struct SqliteConversationStore {
    db: Box<dyn Database>,
    cache: Arc<dyn CacheBackend>,
}

impl SqliteConversationStore {
    /// Opens (or creates) the database at `path` and ensures the schema
    /// exists, using the default in-process `moka` cache.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_cache(path, Arc::new(MokaCacheBackend::new())).await
    }

    /// Opens (or creates) the database at `path` with an explicit cache
    /// backend (e.g. a `redis`-backed one, selected by `CHAT_HISTORY_MODE`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened or the schema
    /// cannot be created.
    pub async fn open_with_cache(
        path: &Path,
        cache: Arc<dyn CacheBackend>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = init_sqlite_rusqlite(Some(path)).map_err(db_err)?;
        ensure_schema(db.as_ref()).await?;

        Ok(Self { db, cache })
    }

    async fn fetch_meta(&self, conversation_id: &str) -> Result<Option<ConversationMeta>, StoreError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT conversation_id, user_client_id, title, model,
                        agent_level_llm_overwrite, created_at, last_modified
                 FROM conversations WHERE conversation_id = $1",
                &[DatabaseValue::String(conversation_id.to_string())],
            )
            .await
            .map_err(db_err)?;

        Ok(rows.first().map(row_to_meta))
    }

    async fn fetch_messages(&self, conversation_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT message_id, conversation_id, sequence_number, role, content,
                        timestamp, is_satisfy, comment
                 FROM messages WHERE conversation_id = $1 ORDER BY sequence_number ASC",
                &[DatabaseValue::String(conversation_id.to_string())],
            )
            .await
            .map_err(db_err)?;

        Ok(rows.iter().map(row_to_message).collect())
    }
}

fn row_to_meta(row: &switchy_database::Row) -> ConversationMeta {
    let overwrite_json: Option<String> = row.to_value("agent_level_llm_overwrite").unwrap_or(None);
    ConversationMeta {
        conversation_id: row.to_value("conversation_id").unwrap_or_default(),
        user_client_id: row.to_value("user_client_id").unwrap_or_default(),
        title: row.to_value("title").unwrap_or_default(),
        model: row.to_value("model").unwrap_or_default(),
        agent_level_llm_overwrite: overwrite_json
            .and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: parse_timestamp(&row.to_value::<String>("created_at").unwrap_or_default()),
        last_modified: parse_timestamp(&row.to_value::<String>("last_modified").unwrap_or_default()),
    }
}

fn row_to_message(row: &switchy_database::Row) -> StoredMessage {
    let role_str: String = row.to_value("role").unwrap_or_default();
    let is_satisfy: Option<i64> = row.to_value("is_satisfy").unwrap_or(None);
    StoredMessage {
        message_id: row.to_value("message_id").unwrap_or_default(),
        conversation_id: row.to_value("conversation_id").unwrap_or_default(),
        sequence_number: row.to_value("sequence_number").unwrap_or(0),
        role: Role::from_str(&role_str).unwrap_or(Role::User),
        content: row.to_value("content").unwrap_or_default(),
        timestamp: parse_timestamp(&row.to_value::<String>("timestamp").unwrap_or_default()),
        is_satisfy: is_satisfy.map(|v| v != 0),
        comment: row.to_value("comment").unwrap_or(None),
    }
}

fn row_to_memory(row: &switchy_database::Row) -> MemoryRecord {
    let status_str: String = row.to_value("status").unwrap_or_default();
    let generation_time_ms: Option<i64> = row.to_value("generation_time_ms").unwrap_or(None);
    MemoryRecord {
        memory_id: row.to_value("memory_id").unwrap_or_default(),
        conversation_id: row.to_value("conversation_id").unwrap_or_default(),
        memory_text: row.to_value("memory_text").unwrap_or_default(),
        start_sequence: row.to_value("start_sequence").unwrap_or(0),
        end_sequence: row.to_value("end_sequence").unwrap_or(0),
        base_memory_id: row.to_value("base_memory_id").unwrap_or(None),
        status: MemoryStatus::from_str(&status_str).unwrap_or(MemoryStatus::Failed),
        created_at: parse_timestamp(&row.to_value::<String>("created_at").unwrap_or_default()),
        generation_time_ms,
    }
}

async fn ensure_schema(db: &dyn Database) -> Result<(), StoreError> {
    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS conversations (
            conversation_id TEXT PRIMARY KEY,
            user_client_id TEXT NOT NULL,
            title TEXT NOT NULL,
            model TEXT NOT NULL,
            agent_level_llm_overwrite TEXT,
            created_at TEXT NOT NULL,
            last_modified TEXT NOT NULL
        )",
    )
    .await
    .map_err(db_err)?;

    db.exec_raw(
        "CREATE INDEX IF NOT EXISTS idx_conversations_user_modified
         ON conversations (user_client_id, last_modified DESC)",
    )
    .await
    .map_err(db_err)?;

    db.exec_raw(
        "CREATE INDEX IF NOT EXISTS idx_conversations_user_created
         ON conversations (user_client_id, created_at DESC)",
    )
    .await
    .map_err(db_err)?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS messages (
            message_id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id) ON DELETE CASCADE,
            sequence_number INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            is_satisfy INTEGER,
            comment TEXT,
            UNIQUE(conversation_id, sequence_number)
        )",
    )
    .await
    .map_err(db_err)?;

    db.exec_raw(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_sequence
         ON messages (conversation_id, sequence_number ASC)",
    )
    .await
    .map_err(db_err)?;

    db.exec_raw(
        "CREATE TABLE IF NOT EXISTS memory (
            memory_id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id) ON DELETE CASCADE,
            memory_text TEXT NOT NULL,
            start_sequence INTEGER NOT NULL,
            end_sequence INTEGER NOT NULL,
            base_memory_id TEXT REFERENCES memory(memory_id),
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            generation_time_ms INTEGER
        )",
    )
    .await
    .map_err(db_err)?;

    db.exec_raw(
        "CREATE INDEX IF NOT EXISTS idx_memory_conversation_status_end
         ON memory (conversation_id, status, end_sequence DESC)",
    )
    .await
    .map_err(db_err)?;

    db.exec_raw("PRAGMA foreign_keys = ON").await.map_err(db_err)?;

    Ok(())
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_conversation(
        &self,
        user_client_id: &str,
        model: &str,
    ) -> Result<ConversationMeta, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        self.db
            .exec_raw_params(
                "INSERT INTO conversations
                    (conversation_id, user_client_id, title, model, agent_level_llm_overwrite,
                     created_at, last_modified)
                 VALUES ($1, $2, $3, $4, NULL, $5, $5)",
                &[
                    DatabaseValue::String(id.clone()),
                    DatabaseValue::String(user_client_id.to_string()),
                    DatabaseValue::String(crate::DEFAULT_CONVERSATION_TITLE.to_string()),
                    DatabaseValue::String(model.to_string()),
                    DatabaseValue::String(now_str),
                ],
            )
            .await
            .map_err(db_err)?;

        Ok(ConversationMeta {
            conversation_id: id,
            user_client_id: user_client_id.to_string(),
            title: crate::DEFAULT_CONVERSATION_TITLE.to_string(),
            model: model.to_string(),
            agent_level_llm_overwrite: None,
            created_at: now,
            last_modified: now,
        })
    }

    async fn get_conversation(
        &self,
        user_client_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationDetail>, StoreError> {
        let mkey = meta_key(user_client_id, conversation_id);
        let mut meta = self.cache.get_meta(&mkey).await;
        if meta.is_none() {
            meta = self.fetch_meta(conversation_id).await?;
            if let Some(ref m) = meta {
                self.cache.set_meta(&mkey, m.clone()).await;
            }
        }
        let Some(meta) = meta else {
            return Ok(None);
        };
        if meta.user_client_id != user_client_id {
            return Ok(None);
        }

        let mkey_msgs = msgs_key(conversation_id);
        let messages = match self.cache.get_msgs(&mkey_msgs).await {
            Some(messages) => messages,
            None => {
                let messages = self.fetch_messages(conversation_id).await?;
                self.cache.set_msgs(&mkey_msgs, messages.clone()).await;
                messages
            }
        };

        Ok(Some(ConversationDetail { meta, messages }))
    }

    async fn list_conversations(
        &self,
        user_client_id: &str,
    ) -> Result<Vec<ConversationMeta>, StoreError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT conversation_id, user_client_id, title, model,
                        agent_level_llm_overwrite, created_at, last_modified
                 FROM conversations WHERE user_client_id = $1
                 ORDER BY last_modified DESC",
                &[DatabaseValue::String(user_client_id.to_string())],
            )
            .await
            .map_err(db_err)?;

        Ok(rows.iter().map(row_to_meta).collect())
    }

    async fn update_conversation(
        &self,
        user_client_id: &str,
        conversation_id: &str,
        update: ConversationUpdate,
    ) -> Result<Option<ConversationMeta>, StoreError> {
        let Some(mut meta) = self.fetch_meta(conversation_id).await? else {
            return Ok(None);
        };
        if meta.user_client_id != user_client_id {
            return Ok(None);
        }

        if let Some(title) = update.title {
            meta.title = title;
        }
        if let Some(model) = update.model {
            meta.model = model;
        }
        if let Some(overwrite) = update.agent_level_llm_overwrite {
            meta.agent_level_llm_overwrite = Some(overwrite);
        }
        meta.last_modified = Utc::now();

        let overwrite_json = meta
            .agent_level_llm_overwrite
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.db
            .exec_raw_params(
                "UPDATE conversations SET title = $1, model = $2,
                    agent_level_llm_overwrite = $3, last_modified = $4
                 WHERE conversation_id = $5",
                &[
                    DatabaseValue::String(meta.title.clone()),
                    DatabaseValue::String(meta.model.clone()),
                    overwrite_json.map_or(DatabaseValue::Null, DatabaseValue::String),
                    DatabaseValue::String(meta.last_modified.to_rfc3339()),
                    DatabaseValue::String(conversation_id.to_string()),
                ],
            )
            .await
            .map_err(db_err)?;

        let mkey = meta_key(user_client_id, conversation_id);
        self.cache.invalidate_meta(&mkey).await;
        self.cache.invalidate_msgs(&msgs_key(conversation_id)).await;

        Ok(Some(meta))
    }

    async fn delete_conversation(
        &self,
        user_client_id: &str,
        conversation_id: &str,
    ) -> Result<bool, StoreError> {
        let deleted = self
            .db
            .exec_raw_params(
                "DELETE FROM conversations WHERE conversation_id = $1 AND user_client_id = $2",
                &[
                    DatabaseValue::String(conversation_id.to_string()),
                    DatabaseValue::String(user_client_id.to_string()),
                ],
            )
            .await
            .map_err(db_err)?;

        self.cache
            .invalidate_meta(&meta_key(user_client_id, conversation_id))
            .await;
        self.cache.invalidate_msgs(&msgs_key(conversation_id)).await;

        Ok(deleted > 0)
    }

    async fn save_turn(
        &self,
        user_client_id: &str,
        conversation_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let txn = self.db.begin_transaction().await.map_err(db_err)?;

        txn.exec_raw_params(
            "DELETE FROM messages WHERE conversation_id = $1",
            &[DatabaseValue::String(conversation_id.to_string())],
        )
        .await
        .map_err(db_err)?;

        let mut stored = Vec::with_capacity(messages.len());
        for (sequence_number, message) in messages.iter().enumerate() {
            let message_id = uuid::Uuid::new_v4().to_string();
            #[allow(clippy::cast_possible_wrap)]
            let sequence_number = sequence_number as i64;

            txn.exec_raw_params(
                "INSERT INTO messages
                    (message_id, conversation_id, sequence_number, role, content, timestamp)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    DatabaseValue::String(message_id.clone()),
                    DatabaseValue::String(conversation_id.to_string()),
                    DatabaseValue::Int64(sequence_number),
                    DatabaseValue::String(message.role.as_str().to_string()),
                    DatabaseValue::String(message.content.clone()),
                    DatabaseValue::String(now_str.clone()),
                ],
            )
            .await
            .map_err(db_err)?;

            stored.push(StoredMessage {
                message_id,
                conversation_id: conversation_id.to_string(),
                sequence_number,
                role: message.role,
                content: message.content.clone(),
                timestamp: now,
                is_satisfy: None,
                comment: None,
            });
        }

        txn.exec_raw_params(
            "UPDATE conversations SET last_modified = $1 WHERE conversation_id = $2",
            &[
                DatabaseValue::String(now_str),
                DatabaseValue::String(conversation_id.to_string()),
            ],
        )
        .await
        .map_err(db_err)?;

        txn.commit().await.map_err(db_err)?;

        self.cache
            .invalidate_meta(&meta_key(user_client_id, conversation_id))
            .await;
        self.cache.invalidate_msgs(&msgs_key(conversation_id)).await;

        Ok(stored)
    }

    async fn set_evaluation(
        &self,
        conversation_id: &str,
        sequence_number: i64,
        evaluation: Option<MessageEvaluation>,
    ) -> Result<bool, StoreError> {
        let (is_satisfy, comment) = match evaluation {
            Some(eval) => (Some(eval.is_satisfy), eval.comment),
            None => (None, None),
        };

        let updated = self
            .db
            .exec_raw_params(
                "UPDATE messages SET is_satisfy = $1, comment = $2
                 WHERE conversation_id = $3 AND sequence_number = $4",
                &[
                    is_satisfy.map_or(DatabaseValue::Null, DatabaseValue::Bool),
                    comment.map_or(DatabaseValue::Null, DatabaseValue::String),
                    DatabaseValue::String(conversation_id.to_string()),
                    DatabaseValue::Int64(sequence_number),
                ],
            )
            .await
            .map_err(db_err)?;

        self.cache.invalidate_msgs(&msgs_key(conversation_id)).await;

        Ok(updated > 0)
    }

    async fn messages_in_range(
        &self,
        conversation_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT message_id, conversation_id, sequence_number, role, content,
                        timestamp, is_satisfy, comment
                 FROM messages
                 WHERE conversation_id = $1 AND sequence_number >= $2 AND sequence_number <= $3
                 ORDER BY sequence_number ASC",
                &[
                    DatabaseValue::String(conversation_id.to_string()),
                    DatabaseValue::Int64(start),
                    DatabaseValue::Int64(end),
                ],
            )
            .await
            .map_err(db_err)?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn latest_completed_memory(
        &self,
        conversation_id: &str,
    ) -> Result<Option<MemoryRecord>, StoreError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT memory_id, conversation_id, memory_text, start_sequence, end_sequence,
                        base_memory_id, status, created_at, generation_time_ms
                 FROM memory
                 WHERE conversation_id = $1 AND status = 'completed'
                 ORDER BY end_sequence DESC LIMIT 1",
                &[DatabaseValue::String(conversation_id.to_string())],
            )
            .await
            .map_err(db_err)?;

        Ok(rows.first().map(row_to_memory))
    }

    async fn has_processing_memory(&self, conversation_id: &str) -> Result<bool, StoreError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT memory_id FROM memory
                 WHERE conversation_id = $1 AND status = 'processing' LIMIT 1",
                &[DatabaseValue::String(conversation_id.to_string())],
            )
            .await
            .map_err(db_err)?;

        Ok(!rows.is_empty())
    }

    async fn insert_processing_memory(
        &self,
        conversation_id: &str,
        start_sequence: i64,
        end_sequence: i64,
        base_memory_id: Option<&str>,
    ) -> Result<Option<MemoryRecord>, StoreError> {
        let txn = self.db.begin_transaction().await.map_err(db_err)?;

        let existing = txn
            .query_raw_params(
                "SELECT memory_id FROM memory
                 WHERE conversation_id = $1 AND status = 'processing' LIMIT 1",
                &[DatabaseValue::String(conversation_id.to_string())],
            )
            .await
            .map_err(db_err)?;

        if !existing.is_empty() {
            txn.commit().await.map_err(db_err)?;
            return Ok(None);
        }

        let memory_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();

        txn.exec_raw_params(
            "INSERT INTO memory
                (memory_id, conversation_id, memory_text, start_sequence, end_sequence,
                 base_memory_id, status, created_at, generation_time_ms)
             VALUES ($1, $2, '', $3, $4, $5, 'processing', $6, NULL)",
            &[
                DatabaseValue::String(memory_id.clone()),
                DatabaseValue::String(conversation_id.to_string()),
                DatabaseValue::Int64(start_sequence),
                DatabaseValue::Int64(end_sequence),
                base_memory_id.map_or(DatabaseValue::Null, |id| DatabaseValue::String(id.to_string())),
                DatabaseValue::String(now.to_rfc3339()),
            ],
        )
        .await
        .map_err(db_err)?;

        txn.commit().await.map_err(db_err)?;

        Ok(Some(MemoryRecord {
            memory_id,
            conversation_id: conversation_id.to_string(),
            memory_text: String::new(),
            start_sequence,
            end_sequence,
            base_memory_id: base_memory_id.map(str::to_string),
            status: MemoryStatus::Processing,
            created_at: now,
            generation_time_ms: None,
        }))
    }

    async fn complete_memory(
        &self,
        memory_id: &str,
        memory_text: &str,
        generation_time_ms: i64,
    ) -> Result<(), StoreError> {
        self.db
            .exec_raw_params(
                "UPDATE memory SET status = 'completed', memory_text = $1, generation_time_ms = $2
                 WHERE memory_id = $3",
                &[
                    DatabaseValue::String(memory_text.to_string()),
                    DatabaseValue::Int64(generation_time_ms),
                    DatabaseValue::String(memory_id.to_string()),
                ],
            )
            .await
            .map_err(db_err)?;

        Ok(())
    }

    async fn fail_memory(&self, memory_id: &str) -> Result<(), StoreError> {
        self.db
            .exec_raw_params(
                "UPDATE memory SET status = 'failed' WHERE memory_id = $1",
                &[DatabaseValue::String(memory_id.to_string())],
            )
            .await
            .map_err(db_err)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{assistant_message, user_message};

    async fn store() -> SqliteConversationStore {
        let path = std::env::temp_dir().join(format!("chatgraph-store-test-{}.db", uuid::Uuid::new_v4()));
        SqliteConversationStore::open(&path).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_fetch_round_trips() {
        let store = store().await;
        let meta = store.create_conversation("user-1", "gpt-4.1").await.unwrap();

        let fetched = store
            .get_conversation("user-1", &meta.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.meta.conversation_id, meta.conversation_id);
        assert!(fetched.messages.is_empty());
    }

    #[tokio::test]
    async fn wrong_user_sees_nothing() {
        let store = store().await;
        let meta = store.create_conversation("user-1", "gpt-4.1").await.unwrap();
        let fetched = store
            .get_conversation("user-2", &meta.conversation_id)
            .await
            .unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn save_turn_assigns_dense_alternating_sequence() {
        let store = store().await;
        let meta = store.create_conversation("user-1", "gpt-4.1").await.unwrap();

        let stored = store
            .save_turn(
                "user-1",
                &meta.conversation_id,
                &[user_message("hi"), assistant_message("hello")],
            )
            .await
            .unwrap();

        assert_eq!(stored[0].sequence_number, 0);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[1].sequence_number, 1);
        assert_eq!(stored[1].role, Role::Assistant);

        let detail = store
            .get_conversation("user-1", &meta.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(detail.messages.len(), 2);
    }

    #[tokio::test]
    async fn only_one_processing_memory_allowed() {
        let store = store().await;
        let meta = store.create_conversation("user-1", "gpt-4.1").await.unwrap();

        let first = store
            .insert_processing_memory(&meta.conversation_id, 0, 13, None)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .insert_processing_memory(&meta.conversation_id, 0, 13, None)
            .await
            .unwrap();
        assert!(second.is_none());

        assert!(store.has_processing_memory(&meta.conversation_id).await.unwrap());
    }

    #[tokio::test]
    async fn complete_memory_clears_processing_state() {
        let store = store().await;
        let meta = store.create_conversation("user-1", "gpt-4.1").await.unwrap();
        let record = store
            .insert_processing_memory(&meta.conversation_id, 0, 13, None)
            .await
            .unwrap()
            .unwrap();

        store
            .complete_memory(&record.memory_id, "summary text", 120)
            .await
            .unwrap();

        assert!(!store.has_processing_memory(&meta.conversation_id).await.unwrap());
        let latest = store
            .latest_completed_memory(&meta.conversation_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.memory_text, "summary text");
    }
}
