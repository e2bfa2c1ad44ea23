#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Sliding-window conversation memory.
//!
//! [`MemoryService::trigger`] decides, after a turn completes, whether the
//! rolling window has grown far enough past the last summary to warrant a
//! new one, and if so kicks off background summarization without blocking
//! the caller. [`MemoryService::read`] builds the context a workflow run
//! should see: the latest completed summary plus whatever messages haven't
//! been folded into one yet.

use std::sync::Arc;
use std::time::Instant;

use chatgraph_agent::{Agent, AgentError, AgentRunContext};
use chatgraph_llm::{LlmProvider, Message, MessageContent};
use chatgraph_store::{ConversationStore, StoreError};
use chatgraph_store_models::{ConversationContext, MemoryRecord, StoredMessage};
use chatgraph_tools::ToolRegistry;
use thiserror::Error;

/// Default rolling window size, in messages, matching the scenario a
/// 14-message window with an even-aligned start.
pub const DEFAULT_ROLLING_WINDOW: u32 = 14;

/// Summarization doesn't kick in until the conversation has grown past this
/// many messages, avoiding pointless work on short conversations. Default is
/// the end of round 3 (`seq = 5`).
pub const DEFAULT_SUMMARIZE_AFTER_SEQ: i64 = 5;

/// Default model for the summarizer agent — a cheaper tier than the main
/// conversation model, since summarization doesn't need frontier quality.
pub const DEFAULT_MEMORY_MODEL: &str = "claude-haiku-4-5-20251001";

const SUMMARIZER_INSTRUCTIONS: &str = "You maintain a running summary of a \
conversation. You will be given the previous summary (if any) and a batch of \
new messages. Produce an updated summary that preserves every fact, decision, \
and open question a continuation of the conversation would need, and drops \
everything else. Write plain prose, no preamble.";

/// Errors from memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("summarizer agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Configuration for the memory service, read once from the environment at
/// startup and passed by reference — never a process-global.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Number of messages (always aligned to an even boundary) a summary
    /// window spans.
    pub rolling_window_size: u32,
    /// Minimum completed sequence number before summarization can trigger.
    pub summarize_after_seq: i64,
    /// Model used for the summarizer agent.
    pub memory_model: String,
}

impl MemoryConfig {
    /// Reads `MEMORY_ROLLING_WINDOW`, `MEMORY_SUMMARIZE_AFTER_SEQ`, and
    /// `MEMORY_MODEL`, falling back to defaults for anything unset or
    /// unparseable.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            rolling_window_size: std::env::var("MEMORY_ROLLING_WINDOW")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_ROLLING_WINDOW),
            summarize_after_seq: std::env::var("MEMORY_SUMMARIZE_AFTER_SEQ")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SUMMARIZE_AFTER_SEQ),
            memory_model: std::env::var("MEMORY_MODEL")
                .unwrap_or_else(|_| DEFAULT_MEMORY_MODEL.to_string()),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            rolling_window_size: DEFAULT_ROLLING_WINDOW,
            summarize_after_seq: DEFAULT_SUMMARIZE_AFTER_SEQ,
            memory_model: DEFAULT_MEMORY_MODEL.to_string(),
        }
    }
}

/// Drives the summarization trigger and the context read, against a durable
/// store and an LLM provider threaded through explicitly.
pub struct MemoryService {
    store: Arc<dyn ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    config: MemoryConfig,
}

impl MemoryService {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        provider: Arc<dyn LlmProvider>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Decides whether a new rolling summary should start after a message at
    /// `completed_sequence` was persisted, and if so starts it in the
    /// background.
    ///
    /// Returns the new memory record's id if one was started, `None` if the
    /// sequence is too early, a summary is already processing, or a
    /// concurrent caller won the race to start one.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Store`] if the existence check or the
    /// transactional insert fails.
    pub async fn trigger(
        &self,
        conversation_id: &str,
        completed_sequence: i64,
    ) -> Result<Option<String>, MemoryError> {
        if completed_sequence < self.config.summarize_after_seq {
            return Ok(None);
        }

        if self.store.has_processing_memory(conversation_id).await? {
            return Ok(None);
        }

        let end = completed_sequence;
        let mut start = (end - i64::from(self.config.rolling_window_size) + 1).max(0);
        if start % 2 != 0 {
            start += 1;
        }

        let base = self.store.latest_completed_memory(conversation_id).await?;
        let base_memory_id = base.as_ref().map(|record| record.memory_id.as_str());

        let Some(record) = self
            .store
            .insert_processing_memory(conversation_id, start, end, base_memory_id)
            .await?
        else {
            return Ok(None);
        };

        let memory_id = record.memory_id.clone();
        self.spawn_summarization(conversation_id.to_string(), record, base);
        Ok(Some(memory_id))
    }

    /// Spawns the fire-and-forget background summarization task. Not tied to
    /// the caller's lifetime or cancellation — a disconnecting HTTP response
    /// must not abort a summary already in flight.
    fn spawn_summarization(
        &self,
        conversation_id: String,
        record: MemoryRecord,
        base: Option<MemoryRecord>,
    ) {
        let store = Arc::clone(&self.store);
        let provider = Arc::clone(&self.provider);
        let model = self.config.memory_model.clone();

        tokio::spawn(async move {
            let read_start = base
                .as_ref()
                .map_or(record.start_sequence, |b| b.end_sequence + 1);

            let messages = match store
                .messages_in_range(&conversation_id, read_start, record.end_sequence)
                .await
            {
                Ok(messages) => messages,
                Err(err) => {
                    log::error!(
                        "memory {}: failed to read messages {read_start}..={}: {err}",
                        record.memory_id,
                        record.end_sequence
                    );
                    if let Err(fail_err) = store.fail_memory(&record.memory_id).await {
                        log::error!("memory {}: failed to mark failed: {fail_err}", record.memory_id);
                    }
                    return;
                }
            };

            let prompt = build_summary_prompt(base.as_ref().map(|b| b.memory_text.as_str()), &messages);
            let tools = ToolRegistry::new();
            let agent = Agent::new("memory_summarizer", SUMMARIZER_INSTRUCTIONS)
                .with_model_override(model.clone());
            let ctx = AgentRunContext {
                provider: provider.as_ref(),
                tools: &tools,
                workflow_model_default: None,
                process_model_default: &model,
            };

            let started = Instant::now();
            let input = vec![Message {
                role: "user".to_string(),
                content: MessageContent::Text(prompt),
            }];

            match agent.run(&ctx, input).await {
                Ok(response) => {
                    let elapsed_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
                    if let Err(err) = store
                        .complete_memory(&record.memory_id, &response.text, elapsed_ms)
                        .await
                    {
                        log::error!("memory {}: failed to persist summary: {err}", record.memory_id);
                    }
                }
                Err(err) => {
                    log::error!("memory {}: summarization failed: {err}", record.memory_id);
                    if let Err(fail_err) = store.fail_memory(&record.memory_id).await {
                        log::error!("memory {}: failed to mark failed: {fail_err}", record.memory_id);
                    }
                }
            }
        });
    }

    /// Builds the context a workflow run should see for `conversation_id`:
    /// the latest completed summary (if any) and the messages since it,
    /// excluding the just-posted user message which the caller threads in
    /// separately as the current turn's input.
    ///
    /// `messages` must be the conversation's full message list in ascending
    /// `sequence_number` order, including the just-posted message.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Store`] if the lookup fails.
    pub async fn read(
        &self,
        conversation_id: &str,
        messages: &[StoredMessage],
    ) -> Result<ConversationContext, MemoryError> {
        let latest = self.store.latest_completed_memory(conversation_id).await?;

        let mut gap_messages: Vec<StoredMessage> = match &latest {
            None => messages.to_vec(),
            Some(record) => messages
                .iter()
                .filter(|m| m.sequence_number > record.end_sequence)
                .cloned()
                .collect(),
        };
        gap_messages.pop();

        Ok(ConversationContext {
            memory_text: latest.map(|record| record.memory_text),
            gap_messages,
        })
    }
}

fn build_summary_prompt(previous: Option<&str>, messages: &[StoredMessage]) -> String {
    let mut prompt = String::new();
    match previous {
        Some(summary) => {
            prompt.push_str("Previous summary:\n");
            prompt.push_str(summary);
            prompt.push_str("\n\nIncorporate the new messages below, dropping any content the previous summary covered.\n\n");
        }
        None => prompt.push_str("No previous summary exists. Summarize the messages below.\n\n"),
    }

    prompt.push_str("New messages:\n");
    for message in messages {
        prompt.push_str(message.role.as_str());
        prompt.push_str(": ");
        prompt.push_str(&message.content);
        prompt.push('\n');
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::{
        build_summary_prompt, MemoryConfig, MemoryService, DEFAULT_ROLLING_WINDOW,
        DEFAULT_SUMMARIZE_AFTER_SEQ,
    };
    use async_trait::async_trait;
    use chatgraph_llm::{
        BoxStream, Completion, CompletionChunk, CompletionRequest, LlmError, LlmProvider, StopReason,
        Usage,
    };
    use chatgraph_store::{ConversationStore, StoreError};
    use chatgraph_store_models::{
        ConversationDetail, ConversationMeta, ConversationUpdate, MemoryRecord, MemoryStatus,
        MessageEvaluation, NewMessage, Role, StoredMessage,
    };
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    fn msg(seq: i64, role: Role, content: &str) -> StoredMessage {
        StoredMessage {
            message_id: format!("m{seq}"),
            conversation_id: "conv-1".to_string(),
            sequence_number: seq,
            role,
            content: content.to_string(),
            timestamp: chrono::Utc::now(),
            is_satisfy: None,
            comment: None,
        }
    }

    fn memory_record(id: &str, start: i64, end: i64, status: MemoryStatus) -> MemoryRecord {
        MemoryRecord {
            memory_id: id.to_string(),
            conversation_id: "conv-1".to_string(),
            memory_text: format!("summary up to {end}"),
            start_sequence: start,
            end_sequence: end,
            base_memory_id: None,
            status,
            created_at: chrono::Utc::now(),
            generation_time_ms: None,
        }
    }

    #[derive(Default)]
    struct FakeStore {
        processing: Mutex<bool>,
        latest_completed: Mutex<Option<MemoryRecord>>,
        completed_notify: Notify,
        insert_called: Mutex<bool>,
    }

    #[async_trait]
    impl ConversationStore for FakeStore {
        async fn create_conversation(
            &self,
            _user_client_id: &str,
            _model: &str,
        ) -> Result<ConversationMeta, StoreError> {
            unimplemented!()
        }

        async fn get_conversation(
            &self,
            _user_client_id: &str,
            _conversation_id: &str,
        ) -> Result<Option<ConversationDetail>, StoreError> {
            unimplemented!()
        }

        async fn list_conversations(
            &self,
            _user_client_id: &str,
        ) -> Result<Vec<ConversationMeta>, StoreError> {
            unimplemented!()
        }

        async fn update_conversation(
            &self,
            _user_client_id: &str,
            _conversation_id: &str,
            _update: ConversationUpdate,
        ) -> Result<Option<ConversationMeta>, StoreError> {
            unimplemented!()
        }

        async fn delete_conversation(
            &self,
            _user_client_id: &str,
            _conversation_id: &str,
        ) -> Result<bool, StoreError> {
            unimplemented!()
        }

        async fn save_turn(
            &self,
            _user_client_id: &str,
            _conversation_id: &str,
            _messages: &[NewMessage],
        ) -> Result<Vec<StoredMessage>, StoreError> {
            unimplemented!()
        }

        async fn set_evaluation(
            &self,
            _conversation_id: &str,
            _sequence_number: i64,
            _evaluation: Option<MessageEvaluation>,
        ) -> Result<bool, StoreError> {
            unimplemented!()
        }

        async fn messages_in_range(
            &self,
            _conversation_id: &str,
            _start: i64,
            _end: i64,
        ) -> Result<Vec<StoredMessage>, StoreError> {
            Ok(vec![msg(4, Role::User, "hi"), msg(5, Role::Assistant, "hello")])
        }

        async fn latest_completed_memory(
            &self,
            _conversation_id: &str,
        ) -> Result<Option<MemoryRecord>, StoreError> {
            Ok(self.latest_completed.lock().unwrap().clone())
        }

        async fn has_processing_memory(&self, _conversation_id: &str) -> Result<bool, StoreError> {
            Ok(*self.processing.lock().unwrap())
        }

        async fn insert_processing_memory(
            &self,
            conversation_id: &str,
            start_sequence: i64,
            end_sequence: i64,
            base_memory_id: Option<&str>,
        ) -> Result<Option<MemoryRecord>, StoreError> {
            *self.insert_called.lock().unwrap() = true;
            Ok(Some(MemoryRecord {
                memory_id: "new-memory".to_string(),
                conversation_id: conversation_id.to_string(),
                memory_text: String::new(),
                start_sequence,
                end_sequence,
                base_memory_id: base_memory_id.map(ToString::to_string),
                status: MemoryStatus::Processing,
                created_at: chrono::Utc::now(),
                generation_time_ms: None,
            }))
        }

        async fn complete_memory(
            &self,
            _memory_id: &str,
            _memory_text: &str,
            _generation_time_ms: i64,
        ) -> Result<(), StoreError> {
            self.completed_notify.notify_one();
            Ok(())
        }

        async fn fail_memory(&self, _memory_id: &str) -> Result<(), StoreError> {
            self.completed_notify.notify_one();
            Ok(())
        }
    }

    struct StubProvider;

    #[async_trait]
    impl LlmProvider for StubProvider {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            Ok(Completion {
                content: vec![chatgraph_llm::ContentBlock::Text {
                    text: "a tidy summary".to_string(),
                }],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            })
        }

        async fn complete_stream(
            &self,
            _request: &CompletionRequest,
        ) -> Result<BoxStream<Result<CompletionChunk, LlmError>>, LlmError> {
            unimplemented!()
        }

        fn default_model(&self) -> &str {
            "test-model"
        }
    }

    #[test]
    fn config_from_env_falls_back_to_defaults() {
        std::env::remove_var("MEMORY_ROLLING_WINDOW");
        std::env::remove_var("MEMORY_SUMMARIZE_AFTER_SEQ");
        std::env::remove_var("MEMORY_MODEL");
        let config = MemoryConfig::from_env();
        assert_eq!(config.rolling_window_size, DEFAULT_ROLLING_WINDOW);
        assert_eq!(config.summarize_after_seq, DEFAULT_SUMMARIZE_AFTER_SEQ);
    }

    #[tokio::test]
    async fn trigger_is_noop_before_threshold() {
        let store: Arc<dyn ConversationStore> = Arc::new(FakeStore::default());
        let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider);
        let service = MemoryService::new(store, provider, MemoryConfig::default());

        let result = service.trigger("conv-1", 3).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn trigger_is_noop_when_already_processing() {
        let fake = Arc::new(FakeStore::default());
        *fake.processing.lock().unwrap() = true;
        let store: Arc<dyn ConversationStore> = fake;
        let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider);
        let service = MemoryService::new(store, provider, MemoryConfig::default());

        let result = service.trigger("conv-1", 25).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn trigger_aligns_start_to_even_and_starts_background_summary() {
        let fake = Arc::new(FakeStore::default());
        let store: Arc<dyn ConversationStore> = Arc::clone(&fake) as Arc<dyn ConversationStore>;
        let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider);
        let config = MemoryConfig {
            rolling_window_size: 14,
            summarize_after_seq: 5,
            memory_model: "test-model".to_string(),
        };
        let service = MemoryService::new(store, provider, config);

        let memory_id = service.trigger("conv-1", 17).await.unwrap();
        assert_eq!(memory_id.as_deref(), Some("new-memory"));
        assert!(*fake.insert_called.lock().unwrap());

        tokio::time::timeout(std::time::Duration::from_secs(1), fake.completed_notify.notified())
            .await
            .expect("background summarization should complete");
    }

    #[tokio::test]
    async fn read_with_no_prior_summary_excludes_current_message() {
        let store: Arc<dyn ConversationStore> = Arc::new(FakeStore::default());
        let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider);
        let service = MemoryService::new(store, provider, MemoryConfig::default());

        let messages = vec![
            msg(0, Role::User, "first"),
            msg(1, Role::Assistant, "reply"),
            msg(2, Role::User, "current"),
        ];

        let context = service.read("conv-1", &messages).await.unwrap();
        assert!(context.memory_text.is_none());
        assert_eq!(context.gap_messages.len(), 2);
        assert_eq!(context.gap_messages[1].sequence_number, 1);
    }

    #[tokio::test]
    async fn read_with_prior_summary_returns_only_the_gap() {
        let fake = FakeStore::default();
        *fake.latest_completed.lock().unwrap() = Some(memory_record("m1", 0, 9, MemoryStatus::Completed));
        let store: Arc<dyn ConversationStore> = Arc::new(fake);
        let provider: Arc<dyn LlmProvider> = Arc::new(StubProvider);
        let service = MemoryService::new(store, provider, MemoryConfig::default());

        let messages = vec![
            msg(9, Role::Assistant, "old"),
            msg(10, Role::User, "gap user"),
            msg(11, Role::Assistant, "gap assistant"),
            msg(12, Role::User, "current"),
        ];

        let context = service.read("conv-1", &messages).await.unwrap();
        assert_eq!(context.memory_text.as_deref(), Some("summary up to 9"));
        assert_eq!(context.gap_messages.len(), 2);
        assert_eq!(context.gap_messages[0].sequence_number, 10);
        assert_eq!(context.gap_messages[1].sequence_number, 11);
    }

    #[test]
    fn prompt_mentions_previous_summary_when_present() {
        let messages = vec![msg(0, Role::User, "hi")];
        let prompt = build_summary_prompt(Some("earlier context"), &messages);
        assert!(prompt.contains("earlier context"));
        assert!(prompt.contains("hi"));
    }
}
