//! Dynamic plan/review workflow: `store_query` → `triage_executor`
//! (plan/replan) → unified selector → `clarify_executor` | `reject_query` |
//! `orchestrator` | `streaming_summary` → `orchestrator` → `review_executor`
//! → loop back to `triage_executor`, or `streaming_summary`.

use std::collections::HashMap;
use std::sync::Arc;

use chatgraph_agent::{Agent, AgentResponse, AgentRunContext};
use chatgraph_llm::{LlmProvider, Message, MessageContent};
use chatgraph_tools::ToolRegistry;
use chatgraph_workflow::{
    multi_selection_edge_group, Envelope, Executor, ExecutorOutput, WorkflowError, WorkflowGraph,
    WorkflowGraphBuilder,
};
use futures::StreamExt as _;
use serde_json::Value;

use crate::agent_executor::AgentExecutor;
use crate::common::TextTerminal;
use crate::schemas::{build_plan_schema, build_replan_schema, build_review_schema};

/// Everything needed to build a fresh dynamic graph for one request.
pub struct DynamicConfig {
    /// Sub-agent key -> agent definition.
    pub sub_agents: HashMap<String, Agent>,
    /// Produces a plan from fresh user input.
    pub plan_instructions: String,
    /// Produces a replan decision from review feedback.
    pub replan_instructions: String,
    /// Judges whether the orchestrator's results satisfy the plan.
    pub review_instructions: String,
    /// Synthesizes the final streamed answer.
    pub summary_instructions: String,
    /// Shared LLM provider.
    pub provider: Arc<dyn LlmProvider>,
    /// Shared tool registry.
    pub tools: Arc<ToolRegistry>,
    /// Workflow-level model default.
    pub workflow_model_default: Option<String>,
    /// Process-wide default model.
    pub process_model_default: String,
}

/// Builds a fresh dynamic [`WorkflowGraph`] per §4.H.
///
/// # Errors
///
/// Returns [`WorkflowError::Config`] if graph construction is invalid.
pub fn build(config: DynamicConfig) -> Result<WorkflowGraph, WorkflowError> {
    let agent_keys: Vec<String> = config.sub_agents.keys().cloned().collect();

    let plan_agent = Agent::new(
        "plan_agent",
        format!(
            "{}\n\nRespond only with JSON matching the required schema.",
            config.plan_instructions
        ),
    )
    .with_schema(build_plan_schema(&agent_keys));

    let replan_agent = Agent::new(
        "replan_agent",
        format!(
            "{}\n\nRespond only with JSON matching the required schema.",
            config.replan_instructions
        ),
    )
    .with_schema(build_replan_schema(&agent_keys));

    let review_agent = Agent::new(
        "review_agent",
        format!(
            "{}\n\nRespond only with JSON matching the required schema.",
            config.review_instructions
        ),
    )
    .with_schema(build_review_schema());

    let summary_agent = Agent::new("summary_agent", config.summary_instructions.clone());

    let triage_executor = Arc::new(TriageExecutor {
        id: "triage_executor".to_string(),
        plan_agent,
        replan_agent,
        provider: config.provider.clone(),
        tools: config.tools.clone(),
        workflow_model_default: config.workflow_model_default.clone(),
        process_model_default: config.process_model_default.clone(),
    });

    let orchestrator = Arc::new(Orchestrator {
        id: "orchestrator".to_string(),
        sub_agents: config.sub_agents.clone(),
        provider: config.provider.clone(),
        tools: config.tools.clone(),
        workflow_model_default: config.workflow_model_default.clone(),
        process_model_default: config.process_model_default.clone(),
    });

    let review_executor = Arc::new(ReviewExecutor {
        id: "review_executor".to_string(),
        review_agent,
        summary_agent,
        provider: config.provider.clone(),
        tools: config.tools.clone(),
        workflow_model_default: config.workflow_model_default.clone(),
        process_model_default: config.process_model_default.clone(),
    });

    let streaming_summary = Arc::new(
        AgentExecutor::new(
            "streaming_summary",
            Agent::new(
                "streaming_summary",
                "Restate the gathered findings as a clear final answer for the user.",
            ),
            config.provider.clone(),
            config.tools.clone(),
            config.workflow_model_default.clone(),
            config.process_model_default.clone(),
        )
        .streaming_terminal(),
    );

    WorkflowGraphBuilder::new()
        .add_executor(Arc::new(StoreQuery))
        .add_executor(triage_executor)
        .add_executor(Arc::new(TextTerminal {
            id: "reject_query".to_string(),
            reason_field: "reject_reason".to_string(),
            prefix: "I can't help with that: ".to_string(),
            fallback: "that request is outside what this assistant can help with".to_string(),
        }))
        .add_executor(Arc::new(TextTerminal {
            id: "clarify_executor".to_string(),
            reason_field: "plan_reason".to_string(),
            prefix: String::new(),
            fallback: "could you clarify what you'd like help with?".to_string(),
        }))
        .add_executor(orchestrator)
        .add_executor(review_executor)
        .add_executor(streaming_summary)
        .add_edge("store_query", "triage_executor")
        .add_conditional_edge(multi_selection_edge_group(
            "triage_executor",
            vec![
                "clarify_executor".to_string(),
                "reject_query".to_string(),
                "orchestrator".to_string(),
                "streaming_summary".to_string(),
            ],
            Arc::new(unified_selector),
        ))
        .add_edge("orchestrator", "review_executor")
        .add_edge("review_executor", "triage_executor")
        .mark_yields_output("reject_query")
        .mark_yields_output("clarify_executor")
        .mark_yields_output("review_executor")
        .mark_yields_output("streaming_summary")
        .max_iterations(10)
        .build()
}

fn unified_selector(output: &Value, _targets: &[String]) -> Vec<String> {
    if output.get("accept_review").is_some() {
        let accepted = output["accept_review"].as_bool().unwrap_or(false);
        let has_plan = output["new_plan"]
            .as_array()
            .is_some_and(|plan| !plan.is_empty());
        if accepted && has_plan {
            vec!["orchestrator".to_string()]
        } else {
            vec!["streaming_summary".to_string()]
        }
    } else {
        match output["action"].as_str() {
            Some("clarify") => vec!["clarify_executor".to_string()],
            Some("reject") => vec!["reject_query".to_string()],
            _ => vec!["orchestrator".to_string()],
        }
    }
}

/// Pulls the user's question out of an incoming payload, trying the same
/// progressively more generic keys as `agent_executor::resolve_input`. The
/// orchestrator builds the initial payload as `{"question": ...}`.
fn question_text(payload: &Value) -> String {
    for key in ["question", "query", "text"] {
        if let Some(text) = payload.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    String::new()
}

struct StoreQuery;

#[async_trait::async_trait]
impl Executor for StoreQuery {
    fn id(&self) -> &str {
        "store_query"
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let mut payload = envelope.payload;
        if let Value::Object(map) = &mut payload {
            map.entry("kind").or_insert_with(|| Value::String("user_query".to_string()));
        }
        Ok(ExecutorOutput::routed(payload))
    }
}

/// Polymorphic over fresh user input (`plan_agent`) and review feedback
/// (`replan_agent`), distinguished by `envelope.payload["kind"]`.
struct TriageExecutor {
    id: String,
    plan_agent: Agent,
    replan_agent: Agent,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    workflow_model_default: Option<String>,
    process_model_default: String,
}

impl TriageExecutor {
    fn ctx(&self) -> AgentRunContext<'_> {
        AgentRunContext {
            provider: self.provider.as_ref(),
            tools: self.tools.as_ref(),
            workflow_model_default: self.workflow_model_default.as_deref(),
            process_model_default: &self.process_model_default,
        }
    }
}

#[async_trait::async_trait]
impl Executor for TriageExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let ctx = self.ctx();
        let is_replan = envelope.payload.get("kind").and_then(Value::as_str) == Some("replan_request");

        if is_replan {
            let question = format!(
                "Review feedback: missing {:?}. Suggested approach: {}.",
                envelope.payload["missing_aspects"].as_array().cloned().unwrap_or_default(),
                envelope.payload["suggested_approach"].as_str().unwrap_or_default(),
            );
            let response = chatgraph_middleware::AgentMiddleware::run(
                &self.replan_agent,
                &ctx,
                vec![Message {
                    role: "user".to_string(),
                    content: MessageContent::Text(question),
                }],
                true,
            )
            .await
            .map_err(|e| WorkflowError::ExecutorFailed {
                executor: self.id.clone(),
                message: e.to_string(),
            })?;

            let mut output: Value = serde_json::from_str(&response.text).unwrap_or_else(|_| {
                serde_json::json!({ "accept_review": false, "rejection_reason": response.text })
            });
            if let Value::Object(map) = &mut output {
                map.insert("text".to_string(), envelope.payload["text"].clone());
            }
            return Ok(ExecutorOutput::routed(output));
        }

        let question = question_text(&envelope.payload);
        let response = chatgraph_middleware::AgentMiddleware::run(
            &self.plan_agent,
            &ctx,
            vec![Message {
                role: "user".to_string(),
                content: MessageContent::Text(question),
            }],
            true,
        )
        .await
        .map_err(|e| WorkflowError::ExecutorFailed {
            executor: self.id.clone(),
            message: e.to_string(),
        })?;

        let output: Value = serde_json::from_str(&response.text)
            .unwrap_or_else(|_| serde_json::json!({ "action": "clarify", "plan_reason": response.text }));
        Ok(ExecutorOutput::routed(output))
    }
}

/// Executes a plan's steps sequentially; within a step, tasks fan out in
/// parallel to the referenced sub-agents.
struct Orchestrator {
    id: String,
    sub_agents: HashMap<String, Agent>,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    workflow_model_default: Option<String>,
    process_model_default: String,
}

#[async_trait::async_trait]
impl Executor for Orchestrator {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let steps = envelope
            .payload
            .get("plan")
            .or_else(|| envelope.payload.get("new_plan"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut step_numbers: Vec<i64> = steps
            .iter()
            .filter_map(|s| s["step"].as_i64())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        step_numbers.sort_unstable();

        let mut context = String::new();
        let mut sections = Vec::new();

        for step in step_numbers {
            let tasks: Vec<&Value> = steps.iter().filter(|s| s["step"].as_i64() == Some(step)).collect();

            let context_for_step = context.clone();
            let futures = tasks.into_iter().map(|task| {
                let agent_key = task["agent"].as_str().unwrap_or_default().to_string();
                let question = task["question"].as_str().unwrap_or_default().to_string();
                let context_for_step = context_for_step.clone();
                async move {
                    let Some(agent) = self.sub_agents.get(&agent_key) else {
                        return (agent_key, String::new());
                    };
                    let ctx = AgentRunContext {
                        provider: self.provider.as_ref(),
                        tools: self.tools.as_ref(),
                        workflow_model_default: self.workflow_model_default.as_deref(),
                        process_model_default: &self.process_model_default,
                    };
                    let prompt = if context_for_step.is_empty() {
                        question
                    } else {
                        format!("Context from previous step:\n{context_for_step}\n\nTask: {question}")
                    };
                    let result = chatgraph_middleware::AgentMiddleware::run(
                        agent,
                        &ctx,
                        vec![Message {
                            role: "user".to_string(),
                            content: MessageContent::Text(prompt),
                        }],
                        false,
                    )
                    .await;
                    (agent_key, result.map(|r| r.text).unwrap_or_default())
                }
            });

            let results = futures::future::join_all(futures).await;
            for (agent_key, text) in results {
                sections.push(format!("## {agent_key}\n{text}"));
            }
            context = sections.join("\n\n---\n\n");
        }

        Ok(ExecutorOutput::routed(serde_json::json!({ "text": context })))
    }
}

/// Two internal LLM calls: `review_agent` first, then `summary_agent` when
/// complete. Never fused into one call, per the review/summary split this
/// workflow requires.
struct ReviewExecutor {
    id: String,
    review_agent: Agent,
    summary_agent: Agent,
    provider: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    workflow_model_default: Option<String>,
    process_model_default: String,
}

impl ReviewExecutor {
    fn ctx(&self) -> AgentRunContext<'_> {
        AgentRunContext {
            provider: self.provider.as_ref(),
            tools: self.tools.as_ref(),
            workflow_model_default: self.workflow_model_default.as_deref(),
            process_model_default: &self.process_model_default,
        }
    }
}

#[async_trait::async_trait]
impl Executor for ReviewExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_response(&self) -> bool {
        true
    }

    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
        let aggregated = envelope.payload["text"].as_str().unwrap_or_default().to_string();
        let ctx = self.ctx();

        let review_response = chatgraph_middleware::AgentMiddleware::run(
            &self.review_agent,
            &ctx,
            vec![Message {
                role: "user".to_string(),
                content: MessageContent::Text(format!(
                    "Review these findings for completeness:\n\n{aggregated}"
                )),
            }],
            true,
        )
        .await
        .map_err(|e| WorkflowError::ExecutorFailed {
            executor: self.id.clone(),
            message: e.to_string(),
        })?;

        let review: Value = serde_json::from_str(&review_response.text)
            .unwrap_or_else(|_| serde_json::json!({ "is_complete": true }));

        if review["is_complete"].as_bool().unwrap_or(true) {
            let mut stream = chatgraph_middleware::AgentMiddleware::run_stream(
                &self.summary_agent,
                &ctx,
                vec![Message {
                    role: "user".to_string(),
                    content: MessageContent::Text(aggregated),
                }],
                self.id.clone(),
                false,
            );
            let mut updates = Vec::new();
            while let Some(update) = stream.next().await {
                let update = update.map_err(|e| WorkflowError::ExecutorFailed {
                    executor: self.id.clone(),
                    message: e.to_string(),
                })?;
                updates.push(update);
            }
            let response = AgentResponse::from_stream(&updates);
            return Ok(ExecutorOutput {
                payload: serde_json::json!({ "text": response.text }),
                terminal: true,
                updates,
            });
        }

        Ok(ExecutorOutput::routed(serde_json::json!({
            "kind": "replan_request",
            "missing_aspects": review["missing_aspects"].clone(),
            "suggested_approach": review["suggested_approach"].clone(),
            "text": aggregated,
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
    async fn single_pass_reaches_review_and_streams() {
        use futures::StreamExt as _;

        let provider = Arc::new(ScriptedProvider {
            responses: Mutex::new(vec![
                text_completion(
                    r#"{"action": "plan", "plan": [{"step": 1, "agent": "servicenow", "question": "check INC123"}]}"#,
                ),
                text_completion("incident resolved"),
                text_completion(r#"{"is_complete": true, "confidence": 0.9}"#),
                text_completion("Here is the summary."),
            ]),
        });
        let tools = Arc::new(ToolRegistry::new());

        let mut sub_agents = HashMap::new();
        sub_agents.insert("servicenow".to_string(), Agent::new("servicenow", "help"));

        let graph = build(DynamicConfig {
            sub_agents,
            plan_instructions: "plan".to_string(),
            replan_instructions: "replan".to_string(),
            review_instructions: "review".to_string(),
            summary_instructions: "summarize".to_string(),
            provider,
            tools,
            workflow_model_default: None,
            process_model_default: "default-model".to_string(),
        })
        .unwrap();

        let events: Vec<_> = graph
            .run_stream(
                "store_query",
                serde_json::json!({ "query": "Summarize incidents" }),
            )
            .collect()
            .await;

        let output = events.iter().find_map(|e| match e {
            chatgraph_workflow::WorkflowEvent::WorkflowOutput(v) => Some(v.clone()),
            _ => None,
        });
        assert!(output.is_some());
        assert_eq!(output.unwrap()["text"], "Here is the summary.");
    }
}
