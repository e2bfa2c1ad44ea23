//! Adapts a [`chatgraph_agent::Agent`] into a workflow [`Executor`].
//!
//! The same adapter backs every LLM-driven node in both the triage and
//! dynamic graphs: orchestration agents (schema-constrained, non-streaming,
//! non-terminal), sub-agents (tools, non-streaming, non-terminal), and the
//! final summary agents (no schema, streaming, terminal).

use std::sync::Arc;

use chatgraph_agent::{Agent, AgentResponse, AgentRunContext};
use chatgraph_llm::{LlmProvider, Message, MessageContent};
use chatgraph_tools::ToolRegistry;
use chatgraph_workflow::{Envelope, Executor, ExecutorOutput, WorkflowError};
use futures::StreamExt as _;
use serde_json::Value;

/// Wraps an [`Agent`] as a workflow node.
pub struct AgentExecutor {
    id: String,
    agent: Agent,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    workflow_model_default: Option<String>,
    process_model_default: String,
    streams_to_ui: bool,
    terminal: bool,
}

impl AgentExecutor {
    /// Wraps `agent` as a non-streaming, non-terminal workflow node (the
    /// common case: orchestration agents and tool-using sub-agents).
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        agent: Agent,
        provider: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        workflow_model_default: Option<String>,
        process_model_default: String,
    ) -> Self {
        Self {
            id: id.into(),
            agent,
            provider,
            tools,
            workflow_model_default,
            process_model_default,
            streams_to_ui: false,
            terminal: false,
        }
    }

    /// Marks this node as the user-visible streaming terminal of its branch
    /// (`summary_agent`, `streaming_summary`).
    #[must_use]
    pub fn streaming_terminal(mut self) -> Self {
        self.streams_to_ui = true;
        self.terminal = true;
        self
    }
}

#[async_trait::async_trait]
impl Executor for AgentExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_response(&self) -> bool {
        self.streams_to_ui
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let (question, carry_forward) = resolve_input(&envelope.payload, &self.id);
        let ctx = AgentRunContext {
            provider: self.provider.as_ref(),
            tools: self.tools.as_ref(),
            workflow_model_default: self.workflow_model_default.as_deref(),
            process_model_default: &self.process_model_default,
        };
        let input = vec![Message {
            role: "user".to_string(),
            content: MessageContent::Text(question),
        }];

        let (response, updates) = if self.streams_to_ui {
            let mut stream =
                chatgraph_middleware::AgentMiddleware::run_stream(&self.agent, &ctx, input, self.id.clone(), false);
            let mut collected = Vec::new();
            while let Some(update) = stream.next().await {
                let update = update.map_err(|e| WorkflowError::ExecutorFailed {
                    executor: self.id.clone(),
                    message: e.to_string(),
                })?;
                collected.push(update);
            }
            let response = AgentResponse::from_stream(&collected);
            (response, collected)
        } else {
            let response = chatgraph_middleware::AgentMiddleware::run(
                &self.agent,
                &ctx,
                input,
                self.agent.response_schema.is_some(),
            )
            .await
            .map_err(|e| WorkflowError::ExecutorFailed {
                executor: self.id.clone(),
                message: e.to_string(),
            })?;
            (response, Vec::new())
        };

        let payload = if self.agent.response_schema.is_some() {
            serde_json::from_str(&response.text).unwrap_or_else(|_| {
                serde_json::json!({ "text": response.text, "should_reject": false, "tasks": [] })
            })
        } else {
            let mut obj = serde_json::json!({ "agent": self.id, "text": response.text });
            if let (Value::Object(extra), Value::Object(target)) = (carry_forward, &mut obj) {
                for (key, value) in extra {
                    target.insert(key, value);
                }
            }
            obj
        };

        Ok(ExecutorOutput {
            payload,
            terminal: self.terminal,
            updates,
        })
    }
}

/// Pulls the question text (and any sibling fields to carry forward, e.g.
/// `expected`) that `id` should act on out of an incoming payload, trying
/// progressively more generic shapes.
fn resolve_input(payload: &Value, id: &str) -> (String, Value) {
    if let Some(task) = payload.get("tasks").and_then(|t| t.get(id)) {
        let question = task
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut extra = task.clone();
        if let Value::Object(map) = &mut extra {
            map.remove("question");
        }
        return (question, extra);
    }

    for key in ["question", "query", "text"] {
        if let Some(text) = payload.get(key).and_then(Value::as_str) {
            return (text.to_string(), Value::Null);
        }
    }

    (payload.to_string(), Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_question_from_task_map() {
        let payload = serde_json::json!({
            "tasks": { "servicenow": { "question": "check INC123", "expected": 2 } }
        });
        let (question, extra) = resolve_input(&payload, "servicenow");
        assert_eq!(question, "check INC123");
        assert_eq!(extra["expected"], 2);
    }

    #[test]
    fn falls_back_to_query_field() {
        let payload = serde_json::json!({ "query": "hello" });
        let (question, _) = resolve_input(&payload, "triage_agent");
        assert_eq!(question, "hello");
    }
}
