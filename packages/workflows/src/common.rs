//! Small terminal executors shared by the triage and dynamic graphs:
//! `reject_query` and `clarify_executor` both just echo a single reason
//! field back as the final user-facing text.

use chatgraph_agent::AgentRunUpdate;
use chatgraph_workflow::{Envelope, Executor, ExecutorOutput, WorkflowError};

/// Yields a single text message (the workflow's final output, and its sole
/// streaming update) derived from one field of the incoming payload.
pub(crate) struct TextTerminal {
    pub id: String,
    pub reason_field: String,
    pub prefix: String,
    pub fallback: String,
}

#[async_trait::async_trait]
impl Executor for TextTerminal {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_response(&self) -> bool {
        true
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let reason = envelope.payload[&self.reason_field]
            .as_str()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.fallback);
        let text = format!("{}{reason}", self.prefix);

        Ok(ExecutorOutput {
            payload: serde_json::json!({ "text": text.clone() }),
            terminal: true,
            updates: vec![AgentRunUpdate::TextDelta(text)],
        })
    }
}
