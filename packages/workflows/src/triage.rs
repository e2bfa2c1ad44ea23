//! Triage workflow: `store_query` → `triage_agent` → selector →
//! `reject_query` | `dispatcher` → parallel sub-agents → `aggregator` →
//! `summary_agent`.

use std::collections::HashMap;
use std::sync::Arc;

use chatgraph_agent::Agent;
use chatgraph_llm::LlmProvider;
use chatgraph_tools::ToolRegistry;
use chatgraph_workflow::{
    multi_selection_edge_group, Envelope, Executor, ExecutorOutput, WorkflowError, WorkflowGraph,
    WorkflowGraphBuilder,
};
use serde_json::Value;

use crate::agent_executor::AgentExecutor;
use crate::common::TextTerminal;
use crate::schemas::build_triage_schema;

/// Everything needed to build a fresh triage graph for one request. A new
/// [`WorkflowGraph`] (and thus a fresh `aggregator`) must be built per
/// request — the aggregator's fan-in state does not outlive one run.
pub struct TriageConfig {
    /// Sub-agent key -> agent definition, already scoped to its own tools.
    pub sub_agents: HashMap<String, Agent>,
    /// Synthesizes the final answer from the aggregated sections.
    pub summary_agent: Agent,
    /// System prompt for `triage_agent`, appended with the dynamically
    /// built sub-agent-key schema.
    pub triage_instructions: String,
    /// Shared LLM provider.
    pub provider: Arc<dyn LlmProvider>,
    /// Shared tool registry.
    pub tools: Arc<ToolRegistry>,
    /// Workflow-level model default, second in the resolution chain.
    pub workflow_model_default: Option<String>,
    /// Process-wide default model.
    pub process_model_default: String,
}

/// Builds a fresh triage [`WorkflowGraph`] per §4.G.
///
/// # Errors
///
/// Returns [`WorkflowError::Config`] if graph construction is invalid.
pub fn build(config: TriageConfig) -> Result<WorkflowGraph, WorkflowError> {
    let agent_keys: Vec<String> = config.sub_agents.keys().cloned().collect();

    let triage_agent = Agent::new(
        "triage_agent",
        format!(
            "{}\n\nRespond only with JSON matching the required schema.",
            config.triage_instructions
        ),
    )
    .with_schema(build_triage_schema(&agent_keys));

    let mut builder = WorkflowGraphBuilder::new()
        .add_executor(Arc::new(StoreQuery))
        .add_executor(Arc::new(AgentExecutor::new(
            "triage_agent",
            triage_agent,
            config.provider.clone(),
            config.tools.clone(),
            config.workflow_model_default.clone(),
            config.process_model_default.clone(),
        )))
        .add_executor(Arc::new(TextTerminal {
            id: "reject_query".to_string(),
            reason_field: "reject_reason".to_string(),
            prefix: "I can't help with that: ".to_string(),
            fallback: "that request is outside what this assistant can help with".to_string(),
        }))
        .add_executor(Arc::new(Dispatcher {
            id: "dispatcher".to_string(),
        }))
        .add_executor(Arc::new(Aggregator {
            id: "aggregator".to_string(),
            state: tokio::sync::Mutex::new(Vec::new()),
        }))
        .add_executor(Arc::new(
            AgentExecutor::new(
                "summary_agent",
                config.summary_agent,
                config.provider.clone(),
                config.tools.clone(),
                config.workflow_model_default.clone(),
                config.process_model_default.clone(),
            )
            .streaming_terminal(),
        ))
        .add_edge("store_query", "triage_agent")
        .add_conditional_edge(multi_selection_edge_group(
            "triage_agent",
            vec!["reject_query".to_string(), "dispatcher".to_string()],
            Arc::new(|output, _targets| {
                if output["should_reject"].as_bool().unwrap_or(false) {
                    vec!["reject_query".to_string()]
                } else {
                    vec!["dispatcher".to_string()]
                }
            }),
        ))
        .add_conditional_edge(multi_selection_edge_group(
            "aggregator",
            vec!["summary_agent".to_string()],
            Arc::new(|output, _targets| {
                if output["status"] == "complete" {
                    vec!["summary_agent".to_string()]
                } else {
                    Vec::new()
                }
            }),
        ))
        .mark_yields_output("reject_query")
        .mark_yields_output("summary_agent");

    for key in &agent_keys {
        let Some(agent) = config.sub_agents.get(key) else {
            continue;
        };
        builder = builder
            .add_executor(Arc::new(AgentExecutor::new(
                key.clone(),
                agent.clone(),
                config.provider.clone(),
                config.tools.clone(),
                config.workflow_model_default.clone(),
                config.process_model_default.clone(),
            )))
            .add_edge(key.clone(), "aggregator");
    }

    builder = builder.add_conditional_edge(multi_selection_edge_group(
        "dispatcher",
        agent_keys.clone(),
        Arc::new(|output, targets| {
            let Some(tasks) = output.get("tasks").and_then(Value::as_object) else {
                return Vec::new();
            };
            targets
                .iter()
                .filter(|t| tasks.contains_key(t.as_str()))
                .cloned()
                .collect()
        }),
    ));

    builder.build()
}

struct StoreQuery;

#[async_trait::async_trait]
impl Executor for StoreQuery {
    fn id(&self) -> &str {
        "store_query"
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        Ok(ExecutorOutput::routed(envelope.payload))
    }
}

struct Dispatcher {
    id: String,
}

#[async_trait::async_trait]
impl Executor for Dispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let tasks = envelope.payload["tasks"].as_array().cloned().unwrap_or_default();

        if tasks.is_empty() {
            return Ok(ExecutorOutput::terminal(serde_json::json!({
                "text": "There was nothing to look into for that request."
            })));
        }

        let mut task_map = serde_json::Map::new();
        for task in &tasks {
            let Some(agent) = task["agent"].as_str() else {
                continue;
            };
            let question = task["question"].as_str().unwrap_or_default();
            task_map.insert(agent.to_string(), serde_json::json!({ "question": question }));
        }

        // Dispatch is keyed by agent, so fan-out for the same agent collapses
        // into a single envelope; `expected` must match the dispatched count,
        // not the original (possibly duplicate-keyed) task list length.
        let expected = task_map.len();
        for task in task_map.values_mut() {
            task["expected"] = serde_json::json!(expected);
        }

        Ok(ExecutorOutput::routed(serde_json::json!({
            "tasks": Value::Object(task_map),
        })))
    }
}

struct Aggregator {
    id: String,
    state: tokio::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl Executor for Aggregator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let agent = envelope.payload["agent"].as_str().unwrap_or_default().to_string();
        let text = envelope.payload["text"].as_str().unwrap_or_default().to_string();
        let expected = envelope.payload["expected"].as_u64().unwrap_or(1) as usize;

        let mut state = self.state.lock().await;
        state.push((agent, text));

        if state.len() < expected {
            return Ok(ExecutorOutput::routed(serde_json::json!({ "status": "pending" })));
        }

        let sections: Vec<String> = state
            .iter()
            .map(|(agent, text)| format!("## {agent}\n{text}"))
            .collect();

        Ok(ExecutorOutput::routed(serde_json::json!({
            "status": "complete",
            "text": sections.join("\n\n---\n\n"),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgraph_llm::{
        BoxStream, Completion, CompletionChunk, CompletionRequest, ContentBlock, LlmError,
        StopReason, Usage,
    };
    use futures::StreamExt as _;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<Vec<Completion>>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            Ok(self.responses.lock().unwrap().remove(0))
        }

        async fn complete_stream(
            &self,
            _request: &CompletionRequest,
        ) -> Result<BoxStream<Result<CompletionChunk, LlmError>>, LlmError> {
            let completion = self.responses.lock().unwrap().remove(0);
            let stream = futures::stream::iter(vec![
                Ok(CompletionChunk::TextDelta(completion.text())),
                Ok(CompletionChunk::Done {
                    stop_reason: completion.stop_reason,
                    usage: completion.usage,
                }),
            ]);
            Ok(Box::pin(stream))
        }

        fn default_model(&self) -> &str {
            "test-model"
        }
    }

    fn text_completion(text: &str) -> Completion {
        Completion {
            content: vec![ContentBlock::Text {
                text: text.to_string(),
            }],
            stop_reason: StopReason::EndTurn,
            usage: Usage::default(),
        }
    }

    #[tokio::test]
    async fn rejects_out_of_scope_query() {
        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![text_completion(
                r#"{"should_reject": true, "reject_reason": "writing poetry", "tasks": []}"#,
            )]),
        });
        let tools = Arc::new(ToolRegistry::new());

        let mut sub_agents = HashMap::new();
        sub_agents.insert("servicenow".to_string(), Agent::new("servicenow", "help"));

        let graph = build(TriageConfig {
            sub_agents,
            summary_agent: Agent::new("summary_agent", "summarize"),
            triage_instructions: "classify".to_string(),
            provider,
            tools,
            workflow_model_default: None,
            process_model_default: "default-model".to_string(),
        })
        .unwrap();

        let events: Vec<_> = graph
            .run_stream("store_query", serde_json::json!({ "query": "write me a haiku" }))
            .collect()
            .await;

        let output = events.iter().find_map(|e| match e {
            chatgraph_workflow::WorkflowEvent::WorkflowOutput(v) => Some(v.clone()),
            _ => None,
        });
        assert!(output.is_some());
        assert!(output.unwrap()["text"].as_str().unwrap().contains("can't help"));
    }

    #[tokio::test]
    async fn single_sub_agent_reaches_summary() {
        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![
                text_completion(
                    r#"{"should_reject": false, "tasks": [{"agent": "servicenow", "question": "check INC123"}]}"#,
                ),
                text_completion("incident INC123 is resolved"),
                text_completion("INC123 has been resolved."),
            ]),
        });
        let tools = Arc::new(ToolRegistry::new());

        let mut sub_agents = HashMap::new();
        sub_agents.insert("servicenow".to_string(), Agent::new("servicenow", "help"));

        let graph = build(TriageConfig {
            sub_agents,
            summary_agent: Agent::new("summary_agent", "summarize"),
            triage_instructions: "classify".to_string(),
            provider,
            tools,
            workflow_model_default: None,
            process_model_default: "default-model".to_string(),
        })
        .unwrap();

        let events: Vec<_> = graph
            .run_stream("store_query", serde_json::json!({ "query": "Check incident INC123" }))
            .collect()
            .await;

        let output = events.iter().find_map(|e| match e {
            chatgraph_workflow::WorkflowEvent::WorkflowOutput(v) => Some(v.clone()),
            _ => None,
        });
        assert!(output.is_some());
        assert!(output.unwrap()["text"].as_str().unwrap().contains("INC123"));
    }
}
