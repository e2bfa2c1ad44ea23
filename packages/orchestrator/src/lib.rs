#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-request glue between the HTTP layer, the conversation store, the
//! memory service, and a workflow run.
//!
//! [`MessageOrchestrator::handle_message`] persists the user's turn, asks
//! the memory service for context, runs a fresh workflow graph with an
//! event bus scoped to the request, and translates everything into
//! [`WireEvent`]s an HTTP handler can serialize as server-sent records.

use std::collections::HashMap;
use std::sync::Arc;

use chatgraph_agent::AgentRunUpdate;
use chatgraph_bus::{Event, EventBus};
use chatgraph_memory::MemoryService;
use chatgraph_store::{assistant_message, user_message, ConversationStore, StoreError, DEFAULT_CONVERSATION_TITLE};
use chatgraph_store_models::{ConversationContext, NewMessage};
use chatgraph_workflow::{WorkflowError, WorkflowEvent, WorkflowGraph};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// A boxed, `Send` stream of wire-level events.
pub type BoxStream<T> = std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send>>;

/// The entry point every workflow graph built by this service starts at.
const WORKFLOW_ENTRY: &str = "store_query";

/// Longest prefix of a user's first message used to derive a conversation
/// title once it's accepted past the default placeholder.
const DERIVED_TITLE_MAX_CHARS: usize = 60;

/// Errors surfaced from [`MessageOrchestrator::handle_message`] before
/// streaming begins (store or workflow-construction failures).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),
}

/// The decoded `POST /api/conversations/{id}/messages` request, independent
/// of whatever wire shape the HTTP layer accepts it in.
#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub message: String,
    pub react_mode: bool,
    pub workflow_model: Option<String>,
    pub agent_model_mapping: Option<HashMap<String, String>>,
    pub memory_enabled: bool,
}

/// One server-sent record: an `event: <type>` line and its `data: <json>`
/// payload, per spec §6's streaming protocol.
#[derive(Debug, Clone)]
pub struct WireEvent {
    pub event: &'static str,
    pub data: serde_json::Value,
}

/// Builds a fresh [`WorkflowGraph`] for one request. Implementations close
/// over the sub-agent catalog, provider, and tool registry, and choose
/// between the triage and dynamic graphs based on `request.react_mode`.
pub type WorkflowFactory =
    Arc<dyn Fn(&MessageRequest) -> Result<WorkflowGraph, WorkflowError> + Send + Sync>;

/// Drives the per-request lifecycle: persist, contextualize, run, drain,
/// persist again, trigger memory.
pub struct MessageOrchestrator {
    store: Arc<dyn ConversationStore>,
    memory: Arc<MemoryService>,
    workflow_factory: WorkflowFactory,
}

impl MessageOrchestrator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ConversationStore>,
        memory: Arc<MemoryService>,
        workflow_factory: WorkflowFactory,
    ) -> Self {
        Self {
            store,
            memory,
            workflow_factory,
        }
    }

    /// Validates the request and builds the response stream.
    ///
    /// The conversation-existence check and workflow-graph construction both
    /// happen here, before any streaming begins, so a caller can turn them
    /// into an HTTP 404/500 instead of an SSE error record. Everything after
    /// that point — persistence, the run itself — happens lazily as the
    /// returned stream is polled, and failures there surface as `thinking`
    /// wire records instead, since the response has already started.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::NotFound`] if the conversation doesn't
    /// exist for `user_client_id`, [`OrchestratorError::Store`] if the
    /// existence check fails, or [`OrchestratorError::Workflow`] if the
    /// workflow graph fails to build.
    pub async fn handle_message(
        &self,
        user_client_id: String,
        conversation_id: String,
        request: MessageRequest,
        cancel: CancellationToken,
    ) -> Result<BoxStream<WireEvent>, OrchestratorError> {
        let detail = self
            .store
            .get_conversation(&user_client_id, &conversation_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(conversation_id.clone()))?;
        let graph = (self.workflow_factory)(&request)?;

        let store = Arc::clone(&self.store);
        let memory = Arc::clone(&self.memory);

        Ok(Box::pin(async_stream::stream! {
            let mut pending: Vec<NewMessage> = detail
                .messages
                .iter()
                .map(|m| NewMessage { role: m.role, content: m.content.clone() })
                .collect();
            pending.push(user_message(request.message.clone()));

            let stored = match store.save_turn(&user_client_id, &conversation_id, &pending).await {
                Ok(stored) => stored,
                Err(err) => {
                    yield error_event(&err.to_string());
                    return;
                }
            };
            let Some(user_turn) = stored.last() else {
                yield error_event("store returned no messages after save_turn");
                return;
            };
            let user_seq = user_turn.sequence_number;
            let user_time = user_turn.timestamp.to_rfc3339();

            let context = if request.memory_enabled {
                match memory.read(&conversation_id, &stored).await {
                    Ok(context) => context,
                    Err(err) => {
                        log::warn!("memory read failed for {conversation_id}: {err}");
                        ConversationContext::default()
                    }
                }
            } else {
                ConversationContext::default()
            };

            let workflow_input = serde_json::json!({
                "question": build_workflow_question(&context, &request.message),
            });

            let (bus, mut receiver) = EventBus::new();
            let (result_tx, mut result_rx) = tokio::sync::oneshot::channel::<WorkflowOutcome>();
            let user_message_text = request.message.clone();

            let workflow_task = tokio::spawn(chatgraph_bus::scope(bus, async move {
                chatgraph_bus::emit_current(Event::UserMessage {
                    content: user_message_text,
                    seq: user_seq,
                    time: user_time,
                })
                .await;

                let outcome = drain_workflow(&graph, workflow_input).await;
                let _ = result_tx.send(outcome);
                chatgraph_bus::emit_current(Event::Done).await;
            }));

            let mut final_text: Option<String> = None;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        workflow_task.abort();
                        return;
                    }
                    received = receiver.recv() => {
                        let Some(event) = received else { break };
                        let is_done = matches!(event, Event::Done);
                        if let Some(wire) = translate_event(event) {
                            yield wire;
                        }
                        if is_done {
                            break;
                        }
                    }
                }
            }

            if let Ok(outcome) = result_rx.try_recv() {
                final_text = Some(match outcome {
                    WorkflowOutcome::Text(text) => text,
                    WorkflowOutcome::Failed(message) => {
                        log::error!("workflow run failed for {conversation_id}: {message}");
                        "Something went wrong while processing that request.".to_string()
                    }
                });
            }
            let final_text = final_text.unwrap_or_else(|| {
                log::error!("workflow run for {conversation_id} produced no output");
                "Something went wrong while processing that request.".to_string()
            });

            let mut all_messages: Vec<NewMessage> = stored
                .iter()
                .map(|m| NewMessage { role: m.role, content: m.content.clone() })
                .collect();
            all_messages.push(assistant_message(final_text.clone()));

            let assistant_turn = match store.save_turn(&user_client_id, &conversation_id, &all_messages).await {
                Ok(saved) => saved.last().cloned(),
                Err(err) => {
                    log::error!("failed to persist assistant turn for {conversation_id}: {err}");
                    None
                }
            };

            let mut title = None;
            if detail.meta.title == DEFAULT_CONVERSATION_TITLE {
                let derived = derive_title(&request.message);
                if let Ok(Some(updated)) = store
                    .update_conversation(
                        &user_client_id,
                        &conversation_id,
                        chatgraph_store_models::ConversationUpdate {
                            title: Some(derived.clone()),
                            model: None,
                            agent_level_llm_overwrite: None,
                        },
                    )
                    .await
                {
                    title = Some(updated.title);
                } else {
                    title = Some(derived);
                }
            }

            if let Some(turn) = &assistant_turn {
                yield WireEvent {
                    event: "message",
                    data: serde_json::json!({
                        "type": "assistant",
                        "content": turn.content,
                        "seq": turn.sequence_number,
                        "time": turn.timestamp.to_rfc3339(),
                        "title": title,
                    }),
                };

                if request.memory_enabled {
                    let memory = Arc::clone(&memory);
                    let conversation_id = conversation_id.clone();
                    let seq = turn.sequence_number;
                    tokio::spawn(async move {
                        if let Err(err) = memory.trigger(&conversation_id, seq).await {
                            log::error!("memory trigger failed for {conversation_id}: {err}");
                        }
                    });
                }
            }

            yield WireEvent { event: "done", data: serde_json::json!({}) };
        })
    }
}

/// What a workflow run produced, handed from the spawned workflow task back
/// to the draining loop over a oneshot channel (not the bus — the bus only
/// carries what's relayed to the client as it happens).
enum WorkflowOutcome {
    Text(String),
    Failed(String),
}

/// Runs `graph` to completion, relaying streamed text as bus `stream`
/// events and returning the final text (or failure description).
///
/// Text deltas arrive via [`WorkflowEvent::AgentRunUpdate`] untagged with an
/// executor id; the engine always yields them immediately before the
/// `ExecutorCompleted` of the executor that produced them, so they're
/// buffered and tagged once that event arrives.
async fn drain_workflow(graph: &WorkflowGraph, input: serde_json::Value) -> WorkflowOutcome {
    use futures::StreamExt as _;

    let mut stream = graph.run_stream(WORKFLOW_ENTRY, input);
    let mut pending_updates: Vec<AgentRunUpdate> = Vec::new();
    let mut stream_seq: HashMap<String, u64> = HashMap::new();

    while let Some(event) = stream.next().await {
        match event {
            WorkflowEvent::AgentRunUpdate(update) => pending_updates.push(update),
            WorkflowEvent::ExecutorCompleted { id } => {
                for update in pending_updates.drain(..) {
                    if let AgentRunUpdate::TextDelta(text) = update {
                        let seq = stream_seq.entry(id.clone()).or_insert(0);
                        chatgraph_bus::emit_current(Event::Stream {
                            executor_id: id.clone(),
                            text,
                            seq: *seq,
                        })
                        .await;
                        *seq += 1;
                    }
                }
            }
            WorkflowEvent::WorkflowOutput(payload) => {
                let text = payload
                    .get("text")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return WorkflowOutcome::Text(text);
            }
            WorkflowEvent::WorkflowFailed(err) => {
                return WorkflowOutcome::Failed(err.to_string());
            }
            WorkflowEvent::ExecutorInvoked { .. } | WorkflowEvent::ExecutorFailed { .. }
            | WorkflowEvent::WorkflowStatus(_) => {}
        }
    }

    WorkflowOutcome::Failed("workflow stream ended without producing output".to_string())
}

/// Translates a bus event into a wire record per spec §6's `event: <type>`
/// framing. `Event::AssistantMessage` and the user-turn persistence side of
/// things are handled directly by the caller, not routed through here.
fn translate_event(event: Event) -> Option<WireEvent> {
    match event {
        Event::UserMessage { content, seq, time } => Some(WireEvent {
            event: "message",
            data: serde_json::json!({ "type": "user", "content": content, "seq": seq, "time": time }),
        }),
        Event::AgentInvoked { name } => Some(WireEvent {
            event: "thinking",
            data: serde_json::json!({ "type": "agent_invoked", "name": name }),
        }),
        Event::AgentFinished {
            name,
            model,
            usage,
            execution_time_ms,
            output,
        } => Some(WireEvent {
            event: "thinking",
            data: serde_json::json!({
                "type": "agent_finished",
                "name": name,
                "model": model,
                "usage": usage,
                "execution_time_ms": execution_time_ms,
                "output": output,
            }),
        }),
        Event::FunctionStart { name, arguments } => Some(WireEvent {
            event: "thinking",
            data: serde_json::json!({ "type": "function_start", "name": name, "arguments": arguments }),
        }),
        Event::FunctionEnd { name, result } => Some(WireEvent {
            event: "thinking",
            data: serde_json::json!({ "type": "function_end", "name": name, "result": result }),
        }),
        Event::Stream { executor_id, text, seq } => Some(WireEvent {
            event: "stream",
            data: serde_json::json!({ "executor_id": executor_id, "text": text, "seq": seq }),
        }),
        Event::AssistantMessage { .. } | Event::Done => None,
    }
}

/// Builds the text the workflow's entry executor sees: the rolling summary
/// (if any) as a preamble, the messages the summary doesn't cover, then the
/// current message — per §4.K step 2.
fn build_workflow_question(context: &ConversationContext, current_message: &str) -> String {
    let mut sections = Vec::new();

    if let Some(summary) = &context.memory_text {
        sections.push(format!("Conversation summary so far:\n{summary}"));
    }

    if !context.gap_messages.is_empty() {
        let gap = context
            .gap_messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        sections.push(format!("Recent messages:\n{gap}"));
    }

    sections.push(format!("Current message:\n{current_message}"));
    sections.join("\n\n")
}

/// Derives a short conversation title from the first user message, used
/// once the conversation is renamed off its placeholder title.
fn derive_title(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.chars().count() <= DERIVED_TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let truncated: String = trimmed.chars().take(DERIVED_TITLE_MAX_CHARS).collect();
    format!("{}…", truncated.trim_end())
}

/// A wire-level error record, sent in place of a `done` sequence when the
/// request can't proceed at all.
fn error_event(message: &str) -> WireEvent {
    WireEvent {
        event: "thinking",
        data: serde_json::json!({ "type": "error", "message": message }),
    }
}

#[cfg(test)]
mod tests {
    use super::{build_workflow_question, derive_title, translate_event, Event, WireEvent};
    use chatgraph_store_models::{ConversationContext, Role, StoredMessage};

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

    #[test]
    fn question_includes_summary_and_gap_and_current() {
        let context = ConversationContext {
            memory_text: Some("prior context".to_string()),
            gap_messages: vec![msg(4, Role::User, "earlier question")],
        };
        let question = build_workflow_question(&context, "what now?");
        assert!(question.contains("prior context"));
        assert!(question.contains("earlier question"));
        assert!(question.contains("what now?"));
    }

    #[test]
    fn question_without_context_is_just_current_message() {
        let context = ConversationContext::default();
        let question = build_workflow_question(&context, "hello");
        assert_eq!(question, "Current message:\nhello");
    }

    #[test]
    fn derive_title_passes_through_short_messages() {
        assert_eq!(derive_title("  hi there  "), "hi there");
    }

    #[test]
    fn derive_title_truncates_long_messages() {
        let long = "x".repeat(100);
        let title = derive_title(&long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= 61);
    }

    #[test]
    fn translates_user_message_to_message_event() {
        let wire = translate_event(Event::UserMessage {
            content: "hi".to_string(),
            seq: 0,
            time: "t".to_string(),
        })
        .unwrap();
        assert_eq!(wire.event, "message");
        assert_eq!(wire.data["type"], "user");
    }

    #[test]
    fn assistant_message_and_done_are_not_relayed_from_the_bus() {
        assert!(translate_event(Event::AssistantMessage {
            content: "x".to_string(),
            seq: 1,
            time: "t".to_string(),
            title: None,
        })
        .is_none());
        assert!(translate_event(Event::Done).is_none());
    }

    fn _use(_: WireEvent) {}
}
