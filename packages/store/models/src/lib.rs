//! Row and wire types shared between `chatgraph_store` and `chatgraph_server`.
//!
//! These mirror the durable schema in spec §6 directly: one struct per table
//! plus the aggregate shapes (`ConversationDetail`) the HTTP layer returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a stored message. `sequence_number = 2k` is always `User`,
/// `2k + 1` is always `Assistant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    /// The role implied by a sequence number: even is `User`, odd is `Assistant`.
    #[must_use]
    pub fn for_sequence(sequence_number: i64) -> Self {
        if sequence_number % 2 == 0 {
            Self::User
        } else {
            Self::Assistant
        }
    }
}

/// Status of a memory (summarization) record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    Processing,
    Completed,
    Failed,
}

impl MemoryStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// `conversations` row: owning user, title, model defaults, timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation_id: String,
    pub user_client_id: String,
    pub title: String,
    pub model: String,
    /// Per-agent-key model overrides, serialized as a JSON object column.
    pub agent_level_llm_overwrite: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// `messages` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sequence_number: i64,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_satisfy: Option<bool>,
    pub comment: Option<String>,
}

/// `memory` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub memory_id: String,
    pub conversation_id: String,
    pub memory_text: String,
    pub start_sequence: i64,
    pub end_sequence: i64,
    pub base_memory_id: Option<String>,
    pub status: MemoryStatus,
    pub created_at: DateTime<Utc>,
    pub generation_time_ms: Option<i64>,
}

/// A conversation plus its full, sequence-ordered message list, as returned
/// by `GET /api/conversations/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDetail {
    #[serde(flatten)]
    pub meta: ConversationMeta,
    pub messages: Vec<StoredMessage>,
}

/// A single message appended to durable storage, with its assigned
/// `sequence_number` and timestamp filled in by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
}

/// The context a workflow run is built from: the prior rolling summary (if
/// any) plus the messages not yet covered by it, per §4.J's read contract.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    pub memory_text: Option<String>,
    pub gap_messages: Vec<StoredMessage>,
}

/// Patchable fields on `PUT /api/conversations/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationUpdate {
    pub title: Option<String>,
    pub model: Option<String>,
    pub agent_level_llm_overwrite: Option<serde_json::Value>,
}

/// Patchable fields on the per-message evaluation endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvaluation {
    pub is_satisfy: bool,
    pub comment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_for_sequence_alternates() {
        assert_eq!(Role::for_sequence(0), Role::User);
        assert_eq!(Role::for_sequence(1), Role::Assistant);
        assert_eq!(Role::for_sequence(2), Role::User);
        assert_eq!(Role::for_sequence(7), Role::Assistant);
    }

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!(Role::from_str(Role::User.as_str()), Some(Role::User));
        assert_eq!(Role::from_str(Role::Assistant.as_str()), Some(Role::Assistant));
        assert_eq!(Role::from_str("bogus"), None);
    }

    #[test]
    fn memory_status_round_trips_through_str() {
        for status in [MemoryStatus::Processing, MemoryStatus::Completed, MemoryStatus::Failed] {
            assert_eq!(MemoryStatus::from_str(status.as_str()), Some(status));
        }
    }
}
