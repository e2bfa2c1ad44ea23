#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Agent definition and the agentic tool-use loop, buffered and streaming.
//!
//! An [`Agent`] pairs a system prompt with an optional tool subset and an
//! optional response schema. [`Agent::run`] drives the loop to completion
//! and returns a full [`AgentResponse`]; [`Agent::run_stream`] drives the
//! same loop but yields [`AgentRunUpdate`]s as they occur, recoverable back
//! into an [`AgentResponse`] via [`AgentResponse::from_stream`].

use chatgraph_llm::{
    BoxStream, Completion, CompletionChunk, CompletionRequest, ContentBlock, LlmError, LlmProvider,
    Message, MessageContent, StopReason, Usage,
};
use chatgraph_tools::{ToolError, ToolRegistry};
use futures::StreamExt as _;
use thiserror::Error;

/// Maximum number of tool-call iterations before giving up.
pub const TOOL_CALL_BUDGET: u32 = 8;

/// Errors from running an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The underlying LLM call failed.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// The agent performed [`TOOL_CALL_BUDGET`] tool-call iterations
    /// without producing a final answer.
    #[error("agent exceeded the tool-call budget of {budget}")]
    ToolLoopExhausted {
        /// The configured budget.
        budget: u32,
    },
}

/// A single recorded tool invocation within a run, kept for observability
/// and for the `tool_calls` field of [`AgentResponse`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallRecord {
    /// Tool name.
    pub name: String,
    /// Input passed to the tool.
    pub input: serde_json::Value,
    /// The tool's result, or an error-shaped result on failure.
    pub output: serde_json::Value,
}

/// The buffered result of an agent run.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    /// Concatenated final text.
    pub text: String,
    /// Token usage from the final completion call.
    pub usage: Usage,
    /// Every tool call made during the run, in order.
    pub tool_calls: Vec<ToolCallRecord>,
}

impl AgentResponse {
    /// Reconstructs an [`AgentResponse`] from a completed stream of
    /// [`AgentRunUpdate`]s by concatenating text deltas and pairing
    /// `function_start`/`function_end` updates into [`ToolCallRecord`]s.
    #[must_use]
    pub fn from_stream(updates: &[AgentRunUpdate]) -> Self {
        let mut text = String::new();
        let mut usage = Usage::default();
        let mut tool_calls = Vec::new();
        let mut pending: Option<(String, serde_json::Value)> = None;

        for update in updates {
            match update {
                AgentRunUpdate::TextDelta(delta) => text.push_str(delta),
                AgentRunUpdate::FunctionStart { name, arguments } => {
                    pending = Some((name.clone(), arguments.clone()));
                }
                AgentRunUpdate::FunctionEnd { name, result } => {
                    let input = pending
                        .take()
                        .filter(|(n, _)| n == name)
                        .map_or(serde_json::Value::Null, |(_, input)| input);
                    tool_calls.push(ToolCallRecord {
                        name: name.clone(),
                        input,
                        output: result.clone(),
                    });
                }
                AgentRunUpdate::Done { usage: final_usage } => usage = *final_usage,
            }
        }

        Self {
            text,
            usage,
            tool_calls,
        }
    }
}

/// An incremental update from [`Agent::run_stream`].
#[derive(Debug, Clone)]
pub enum AgentRunUpdate {
    /// A tool invocation is starting.
    FunctionStart {
        /// Tool name.
        name: String,
        /// Serialized arguments.
        arguments: serde_json::Value,
    },
    /// A tool invocation has finished.
    FunctionEnd {
        /// Tool name.
        name: String,
        /// Serialized result (or error-shaped result).
        result: serde_json::Value,
    },
    /// A chunk of generated text.
    TextDelta(String),
    /// Terminal update carrying final usage.
    Done {
        /// Token usage for the run.
        usage: Usage,
    },
}

/// Everything an [`Agent`] needs to run a single request, threaded through
/// explicitly rather than read from process-global state.
pub struct AgentRunContext<'a> {
    /// The LLM provider to call.
    pub provider: &'a dyn LlmProvider,
    /// The tool registry tools are looked up and invoked against.
    pub tools: &'a ToolRegistry,
    /// Workflow-level default model, second in the resolution chain.
    pub workflow_model_default: Option<&'a str>,
    /// Process-wide default model, last in the resolution chain.
    pub process_model_default: &'a str,
}

/// An LLM-backed unit of work: a system prompt, an optional tool subset,
/// and an optional structured-output constraint.
#[derive(Debug, Clone)]
pub struct Agent {
    /// Agent name, used in bus events and logs.
    pub name: String,
    /// System prompt.
    pub instructions: String,
    /// When set, responses are constrained to this JSON schema.
    pub response_schema: Option<serde_json::Value>,
    /// Names of tools (from the registry) this agent may call. `None`
    /// means no tools are offered.
    pub tools: Option<Vec<String>>,
    /// Per-agent model override, first in the resolution chain.
    pub model_override: Option<String>,
}

impl Agent {
    /// Creates an agent with no tools and no schema.
    #[must_use]
    pub fn new(name: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instructions: instructions.into(),
            response_schema: None,
            tools: None,
            model_override: None,
        }
    }

    /// Restricts this agent to the named tools.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Constrains this agent's output to the given JSON schema.
    #[must_use]
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Overrides the model this agent uses, first in the resolution chain.
    #[must_use]
    pub fn with_model_override(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }

    fn resolve_model(&self, ctx: &AgentRunContext<'_>) -> String {
        chatgraph_llm::resolve_model(
            self.model_override.as_deref(),
            ctx.workflow_model_default,
            ctx.process_model_default,
        )
    }

    fn base_request(&self, ctx: &AgentRunContext<'_>, messages: Vec<Message>) -> CompletionRequest {
        let tool_schemas = self
            .tools
            .as_deref()
            .map_or_else(Vec::new, |names| ctx.tools.list_schemas(Some(&names.to_vec())));

        let mut request = CompletionRequest::new(self.instructions.clone(), messages)
            .with_model(self.resolve_model(ctx));
        request.tools = tool_schemas;
        if let Some(schema) = &self.response_schema {
            request = request.with_schema(schema.clone());
        }
        request
    }

    /// Runs the tool-use loop to completion and returns the final response.
    ///
    /// # Errors
    ///
    /// Returns [`AgentError::Llm`] if a completion call fails, or
    /// [`AgentError::ToolLoopExhausted`] if [`TOOL_CALL_BUDGET`] iterations
    /// pass without a final answer.
    pub async fn run(
        &self,
        ctx: &AgentRunContext<'_>,
        input: Vec<Message>,
    ) -> Result<AgentResponse, AgentError> {
        if self.response_schema.is_some() {
            let request = self.base_request(ctx, input);
            let (value, usage) = chatgraph_llm::complete_with_schema(ctx.provider, &request).await?;
            return Ok(AgentResponse {
                text: value.to_string(),
                usage,
                tool_calls: Vec::new(),
            });
        }

        let mut messages = input;
        let mut tool_calls = Vec::new();

        for _ in 0..TOOL_CALL_BUDGET {
            let request = self.base_request(ctx, messages.clone());
            let completion = ctx.provider.complete(&request).await?;

            if completion.stop_reason != StopReason::ToolUse {
                return Ok(AgentResponse {
                    text: completion.text(),
                    usage: completion.usage,
                    tool_calls,
                });
            }

            let (assistant_msg, result_msg, executed) =
                self.execute_tool_round(ctx, &completion).await;
            tool_calls.extend(executed);
            messages.push(assistant_msg);
            messages.push(result_msg);
        }

        Err(AgentError::ToolLoopExhausted {
            budget: TOOL_CALL_BUDGET,
        })
    }

    /// Runs the tool-use loop, yielding [`AgentRunUpdate`]s as they occur.
    pub fn run_stream<'a>(
        &'a self,
        ctx: &'a AgentRunContext<'a>,
        input: Vec<Message>,
    ) -> BoxStream<Result<AgentRunUpdate, AgentError>> {
        let stream = async_stream::stream! {
            let mut messages = input;

            for _ in 0..TOOL_CALL_BUDGET {
                let request = self.base_request(ctx, messages.clone());
                let mut chunk_stream = match ctx.provider.complete_stream(&request).await {
                    Ok(s) => s,
                    Err(e) => {
                        yield Err(AgentError::Llm(e));
                        return;
                    }
                };

                let mut chunks = Vec::new();
                while let Some(chunk) = chunk_stream.next().await {
                    match chunk {
                        Ok(CompletionChunk::TextDelta(text)) => {
                            yield Ok(AgentRunUpdate::TextDelta(text.clone()));
                            chunks.push(CompletionChunk::TextDelta(text));
                        }
                        Ok(other) => chunks.push(other),
                        Err(e) => {
                            yield Err(AgentError::Llm(e));
                            return;
                        }
                    }
                }

                let completion = Completion::from_chunks(&chunks);

                if completion.stop_reason != StopReason::ToolUse {
                    yield Ok(AgentRunUpdate::Done {
                        usage: completion.usage,
                    });
                    return;
                }

                for block in &completion.content {
                    if let ContentBlock::ToolUse { name, input, .. } = block {
                        yield Ok(AgentRunUpdate::FunctionStart {
                            name: name.clone(),
                            arguments: input.clone(),
                        });
                    }
                }

                let (assistant_msg, result_msg, executed) =
                    self.execute_tool_round(ctx, &completion).await;
                for call in &executed {
                    yield Ok(AgentRunUpdate::FunctionEnd {
                        name: call.name.clone(),
                        result: call.output.clone(),
                    });
                }
                messages.push(assistant_msg);
                messages.push(result_msg);
            }

            yield Err(AgentError::ToolLoopExhausted {
                budget: TOOL_CALL_BUDGET,
            });
        };

        Box::pin(stream)
    }

    /// Executes every `tool_use` block in `completion` against the
    /// registry, returning the assistant message (echoing the tool-use
    /// blocks), the follow-up user message carrying the tool results, and
    /// the records of each call made.
    async fn execute_tool_round(
        &self,
        ctx: &AgentRunContext<'_>,
        completion: &Completion,
    ) -> (Message, Message, Vec<ToolCallRecord>) {
        let assistant_msg = Message {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(completion.content.clone()),
        };

        let mut result_blocks = Vec::new();
        let mut records = Vec::new();

        for block in &completion.content {
            if let ContentBlock::ToolUse { id, name, input } = block {
                let result = ctx.tools.invoke(name, input.clone()).await;
                let result_json = match &result {
                    Ok(value) => value.clone(),
                    Err(e) => error_result(e),
                };
                let raw = result_json.to_string();
                let truncated = chatgraph_tools::truncate_result(&raw);

                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: id.clone(),
                    content: truncated,
                });
                records.push(ToolCallRecord {
                    name: name.clone(),
                    input: input.clone(),
                    output: result_json,
                });
            }
        }

        let result_msg = Message {
            role: "user".to_string(),
            content: MessageContent::Blocks(result_blocks),
        };

        (assistant_msg, result_msg, records)
    }
}

fn error_result(err: &ToolError) -> serde_json::Value {
    serde_json::json!({ "error": err.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgraph_tools::ToolRegistry;
    use std::sync::Arc;

    struct ScriptedProvider {
        model: String,
        responses: std::sync::Mutex<Vec<Completion>>,
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
            unimplemented!("not exercised in buffered tests")
        }

        fn default_model(&self) -> &str {
            &self.model
        }
    }

    #[tokio::test]
    async fn run_returns_final_answer_without_tools() {
        let provider = ScriptedProvider {
            model: "test-model".to_string(),
            responses: std::sync::Mutex::new(vec![Completion {
                content: vec![ContentBlock::Text {
                    text: "hello".to_string(),
                }],
                stop_reason: StopReason::EndTurn,
                usage: Usage {
                    input_tokens: 1,
                    output_tokens: 1,
                    total_tokens: 2,
                },
            }]),
        };
        let tools = ToolRegistry::new();
        let ctx = AgentRunContext {
            provider: &provider,
            tools: &tools,
            workflow_model_default: None,
            process_model_default: "default-model",
        };

        let agent = Agent::new("test", "be helpful");
        let response = agent
            .run(
                &ctx,
                vec![Message {
                    role: "user".to_string(),
                    content: MessageContent::Text("hi".to_string()),
                }],
            )
            .await
            .unwrap();

        assert_eq!(response.text, "hello");
        assert!(response.tool_calls.is_empty());
    }

    struct Echo;

    #[async_trait::async_trait]
    impl chatgraph_tools::ToolHandler for Echo {
        async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn run_executes_tool_then_final_answer() {
        let provider = ScriptedProvider {
            model: "test-model".to_string(),
            responses: std::sync::Mutex::new(vec![
                Completion {
                    content: vec![ContentBlock::ToolUse {
                        id: "call_1".to_string(),
                        name: "echo".to_string(),
                        input: serde_json::json!({"x": 1}),
                    }],
                    stop_reason: StopReason::ToolUse,
                    usage: Usage::default(),
                },
                Completion {
                    content: vec![ContentBlock::Text {
                        text: "done".to_string(),
                    }],
                    stop_reason: StopReason::EndTurn,
                    usage: Usage::default(),
                },
            ]),
        };

        let mut tools = ToolRegistry::new();
        tools
            .register(
                chatgraph_tools::ToolDefinition::new("echo", "echoes", serde_json::json!({}), &[]),
                Arc::new(Echo),
            )
            .unwrap();

        let ctx = AgentRunContext {
            provider: &provider,
            tools: &tools,
            workflow_model_default: None,
            process_model_default: "default-model",
        };

        let agent = Agent::new("test", "be helpful").with_tools(vec!["echo".to_string()]);
        let response = agent
            .run(
                &ctx,
                vec![Message {
                    role: "user".to_string(),
                    content: MessageContent::Text("hi".to_string()),
                }],
            )
            .await
            .unwrap();

        assert_eq!(response.text, "done");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].name, "echo");
    }

    #[test]
    fn response_reconstructs_from_stream_updates() {
        let updates = vec![
            AgentRunUpdate::TextDelta("hel".to_string()),
            AgentRunUpdate::TextDelta("lo".to_string()),
            AgentRunUpdate::Done {
                usage: Usage {
                    input_tokens: 3,
                    output_tokens: 2,
                    total_tokens: 5,
                },
            },
        ];
        let response = AgentResponse::from_stream(&updates);
        assert_eq!(response.text, "hello");
        assert_eq!(response.usage.total_tokens, 5);
    }
}
