#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Per-request bounded event bus with an ambient task-local handle.
//!
//! Middleware and workflow executors run deep inside framework internals
//! that do not accept an extra bus parameter, so the bus is published via
//! [`tokio::task_local!`] for the duration of a request rather than threaded
//! through every call. Each request gets its own bus instance; the
//! task-local scoping keeps concurrent requests from colliding.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// Bounded queue capacity. Producers that would exceed this block until the
/// consumer drains the queue.
pub const BUS_CAPACITY: usize = 1024;

/// Errors from publishing to the bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// `emit` was called after `close()`.
    #[error("event bus is closed")]
    Closed,
}

/// A tagged record emitted onto the request bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Echoes the saved user message.
    UserMessage {
        /// Message text.
        content: String,
        /// Assigned sequence number.
        seq: i64,
        /// RFC 3339 timestamp.
        time: String,
    },
    /// An agent has started running.
    AgentInvoked {
        /// Agent name.
        name: String,
    },
    /// An agent has finished running.
    AgentFinished {
        /// Agent name.
        name: String,
        /// Model used for this run.
        model: String,
        /// Token usage, when known.
        usage: Option<chatgraph_llm::Usage>,
        /// Wall time for the run.
        execution_time_ms: u64,
        /// Structured output, for orchestration agents (triage, plan,
        /// replan, review, clarify, summary).
        output: Option<serde_json::Value>,
    },
    /// A tool invocation has started.
    FunctionStart {
        /// Tool name.
        name: String,
        /// Serialized tool arguments.
        arguments: serde_json::Value,
    },
    /// A tool invocation has finished (successfully or with an error).
    FunctionEnd {
        /// Tool name.
        name: String,
        /// Serialized tool result (or an error-shaped result).
        result: serde_json::Value,
    },
    /// An incremental text chunk from a streaming executor.
    Stream {
        /// Executor that produced this chunk.
        executor_id: String,
        /// The text chunk.
        text: String,
        /// Monotonically increasing sequence within this executor's stream.
        seq: u64,
    },
    /// The final answer.
    AssistantMessage {
        /// Final text.
        content: String,
        /// Assigned sequence number.
        seq: i64,
        /// RFC 3339 timestamp.
        time: String,
        /// Conversation title, if this turn set it.
        title: Option<String>,
    },
    /// Terminator sentinel; the consumer stops iterating after this.
    Done,
}

/// A per-request event bus: bounded multi-producer, single-consumer.
pub struct EventBus {
    tx: mpsc::Sender<Event>,
    closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

/// The consuming half of an [`EventBus`], held by the orchestrator.
pub struct EventBusReceiver {
    rx: mpsc::Receiver<Event>,
}

impl EventBus {
    /// Creates a new bus and its receiver, with capacity [`BUS_CAPACITY`].
    #[must_use]
    pub fn new() -> (Self, EventBusReceiver) {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        (
            Self {
                tx,
                closed: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false)),
            },
            EventBusReceiver { rx },
        )
    }

    /// Enqueues an event, blocking (without a timeout) if the bus is at
    /// capacity.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] if `close()` was already called.
    pub async fn emit(&self, event: Event) -> Result<(), BusError> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            log::warn!("dropped event on closed bus: {event:?}");
            return Err(BusError::Closed);
        }
        // The receiver is held by the orchestrator for the request's
        // lifetime; a send error here means it was dropped early (e.g. the
        // client disconnected), which is not itself an error worth
        // propagating to agent code.
        let _ = self.tx.send(event).await;
        Ok(())
    }

    /// Enqueues the `done` sentinel and marks the bus closed: subsequent
    /// `emit` calls return `Err(BusError::Closed)` instead of panicking or
    /// blocking forever on a receiver that may already be gone.
    pub async fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Release);
        let _ = self.tx.send(Event::Done).await;
    }
}

impl EventBusReceiver {
    /// Receives the next event, or `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

tokio::task_local! {
    static CURRENT_BUS: EventBus;
}

/// Runs `fut` with `bus` published as the ambient handle for the duration of
/// the future, so any code it calls (transitively) can reach it via
/// [`current`].
pub async fn scope<F, T>(bus: EventBus, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    CURRENT_BUS.scope(bus, fut).await
}

/// Emits an event on the ambient bus, if one is set for the current task.
/// Silent (no-op) when no bus is set, e.g. offline or test execution.
pub async fn emit_current(event: Event) {
    if !CURRENT_BUS.is_set() {
        return;
    }
    let result = CURRENT_BUS.with(|bus| {
        let event = event.clone();
        async move { bus.emit(event).await }
    });
    if let Err(e) = result.await {
        log::debug!("ambient bus emit failed: {e}");
    }
}

/// Returns whether an ambient bus is set for the current task.
#[must_use]
pub fn has_current() -> bool {
    CURRENT_BUS.is_set()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_and_receives_in_order() {
        let (bus, mut rx) = EventBus::new();
        bus.emit(Event::UserMessage {
            content: "hi".to_string(),
            seq: 0,
            time: "t".to_string(),
        })
        .await
        .unwrap();
        bus.close().await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::UserMessage { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::Done));
    }

    #[tokio::test]
    async fn emit_after_close_is_rejected() {
        let (bus, _rx) = EventBus::new();
        bus.close().await;
        let result = bus.emit(Event::Done).await;
        assert_eq!(result, Err(BusError::Closed));
    }

    #[tokio::test]
    async fn ambient_handle_round_trips_through_scope() {
        let (bus, mut rx) = EventBus::new();
        scope(bus, async {
            assert!(has_current());
            emit_current(Event::AgentInvoked {
                name: "triage".to_string(),
            })
            .await;
        })
        .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::AgentInvoked { .. }));
    }

    #[tokio::test]
    async fn silent_without_ambient_bus() {
        assert!(!has_current());
        // Should not panic even though no bus is set.
        emit_current(Event::Done).await;
    }
}
