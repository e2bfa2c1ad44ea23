#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]

//! Write-through conversation and memory storage.
//!
//! Durable storage is `switchy_database` over `SQLite`, exactly as
//! `crime_map_conversations` used it. Reads and writes are mediated by a
//! pluggable [`CacheBackend`] (an in-process `moka` cache by default, an
//! optional `redis`-backed one behind the `redis-cache` feature) per the
//! write-through contract: durable is the record of truth, cache is a bounded
//! TTL convenience the store invalidates on every write.

pub mod cache;
pub mod interactive;
mod sqlite;

use async_trait::async_trait;
use chatgraph_store_models::{
    ConversationDetail, ConversationMeta, ConversationUpdate, MemoryRecord, MessageEvaluation,
    NewMessage, Role, StoredMessage,
};
use thiserror::Error;

pub use sqlite::SqliteConversationStore;

/// Default path for the conversations database, mirroring
/// `crime_map_conversations::DEFAULT_DB_PATH`.
pub const DEFAULT_DB_PATH: &str = "data/conversations.db";

/// Default cache TTL (seconds) per spec §6's cache layout.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 1800;

/// Title assigned to a conversation on creation; the orchestrator only
/// overwrites it with a derived title while it's still this value.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New conversation";

/// Errors from conversation and memory storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable + cached conversation, message, and memory storage.
///
/// Implementations must honor §4.I exactly: writes go to durable first, then
/// best-effort to cache (cache failures are logged via `log::warn!` and never
/// propagated); reads probe cache first and backfill on miss.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates a new, empty conversation for `user_client_id`.
    async fn create_conversation(
        &self,
        user_client_id: &str,
        model: &str,
    ) -> Result<ConversationMeta, StoreError>;

    /// Fetches a conversation and its full message list. `None` if it doesn't
    /// exist or doesn't belong to `user_client_id`.
    async fn get_conversation(
        &self,
        user_client_id: &str,
        conversation_id: &str,
    ) -> Result<Option<ConversationDetail>, StoreError>;

    /// Lists conversations for a user, most recently modified first.
    async fn list_conversations(
        &self,
        user_client_id: &str,
    ) -> Result<Vec<ConversationMeta>, StoreError>;

    /// Applies a partial update to a conversation's metadata. Invalidates
    /// both cache entries on success, per §4.I's "caching of metadata".
    async fn update_conversation(
        &self,
        user_client_id: &str,
        conversation_id: &str,
        update: ConversationUpdate,
    ) -> Result<Option<ConversationMeta>, StoreError>;

    /// Deletes a conversation, cascading to its messages and memory records.
    async fn delete_conversation(
        &self,
        user_client_id: &str,
        conversation_id: &str,
    ) -> Result<bool, StoreError>;

    /// Atomically replaces a conversation's full message sequence with
    /// `messages` (delete-then-insert, transactional), assigning dense
    /// `sequence_number`s in order, and touches `last_modified`. Returns the
    /// stored rows with their assigned sequence numbers.
    async fn save_turn(
        &self,
        user_client_id: &str,
        conversation_id: &str,
        messages: &[NewMessage],
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// Sets or clears the evaluation (`is_satisfy`/`comment`) on one message.
    async fn set_evaluation(
        &self,
        conversation_id: &str,
        sequence_number: i64,
        evaluation: Option<MessageEvaluation>,
    ) -> Result<bool, StoreError>;

    /// The messages in `[start..=end]` sequence numbers, ascending.
    async fn messages_in_range(
        &self,
        conversation_id: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// The highest-`end_sequence` `completed` memory record, if any.
    async fn latest_completed_memory(
        &self,
        conversation_id: &str,
    ) -> Result<Option<MemoryRecord>, StoreError>;

    /// `true` if a `processing` memory record already exists for this
    /// conversation (the "one processing record" invariant, §8 property 3).
    async fn has_processing_memory(&self, conversation_id: &str) -> Result<bool, StoreError>;

    /// Inserts a new `processing` memory row inside a transaction that also
    /// re-checks the "no other processing record" invariant, returning the
    /// inserted row, or `None` if a processing record appeared concurrently.
    async fn insert_processing_memory(
        &self,
        conversation_id: &str,
        start_sequence: i64,
        end_sequence: i64,
        base_memory_id: Option<&str>,
    ) -> Result<Option<MemoryRecord>, StoreError>;

    /// Marks a memory record `completed`, filling its text and timing.
    async fn complete_memory(
        &self,
        memory_id: &str,
        memory_text: &str,
        generation_time_ms: i64,
    ) -> Result<(), StoreError>;

    /// Marks a memory record `failed`.
    async fn fail_memory(&self, memory_id: &str) -> Result<(), StoreError>;
}

/// Builds a [`NewMessage`] for a user turn. Small convenience so callers
/// don't need to import [`Role`] directly.
#[must_use]
pub fn user_message(content: impl Into<String>) -> NewMessage {
    NewMessage {
        role: Role::User,
        content: content.into(),
    }
}

/// Builds a [`NewMessage`] for an assistant turn.
#[must_use]
pub fn assistant_message(content: impl Into<String>) -> NewMessage {
    NewMessage {
        role: Role::Assistant,
        content: content.into(),
    }
}
