#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Bus instrumentation around agent runs and tool invocations.
//!
//! Agents and tools know nothing about the event bus; these wrappers emit
//! the observability events a workflow run is expected to produce, reading
//! the ambient bus via [`chatgraph_bus::emit_current`] so callers that run
//! offline (tests, a CLI with no bus scoped) get silent no-ops for free.

use std::time::Instant;

use chatgraph_agent::{Agent, AgentError, AgentResponse, AgentRunContext, AgentRunUpdate};
use chatgraph_bus::Event;
use chatgraph_llm::Message;
use chatgraph_tools::{ToolError, ToolRegistry};
use futures::{Stream, StreamExt as _};

/// Wraps [`Agent::run`] and [`Agent::run_stream`] with `agent_invoked` /
/// `agent_finished` bus events.
pub struct AgentMiddleware;

impl AgentMiddleware {
    /// Runs `agent` to completion, emitting `agent_invoked` before and
    /// `agent_finished` after. When `emit_output` is set, the agent's final
    /// text is parsed as JSON and attached to `agent_finished` for
    /// orchestration agents (triage, plan, review, ...) whose structured
    /// output the caller needs off the bus.
    ///
    /// # Errors
    ///
    /// Propagates whatever [`Agent::run`] returns; an error still emits no
    /// `agent_finished` event, matching the teacher's abort-on-error
    /// instrumentation.
    pub async fn run(
        agent: &Agent,
        ctx: &AgentRunContext<'_>,
        input: Vec<Message>,
        emit_output: bool,
    ) -> Result<AgentResponse, AgentError> {
        chatgraph_bus::emit_current(Event::AgentInvoked {
            name: agent.name.clone(),
        })
        .await;

        let model = resolved_model(agent, ctx);
        let start = Instant::now();
        let response = agent.run(ctx, input).await?;
        let execution_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let output = if emit_output {
            serde_json::from_str(&response.text).ok()
        } else {
            None
        };

        chatgraph_bus::emit_current(Event::AgentFinished {
            name: agent.name.clone(),
            model,
            usage: Some(response.usage),
            execution_time_ms,
            output,
        })
        .await;

        for call in &response.tool_calls {
            chatgraph_bus::emit_current(Event::FunctionStart {
                name: call.name.clone(),
                arguments: call.input.clone(),
            })
            .await;
            chatgraph_bus::emit_current(Event::FunctionEnd {
                name: call.name.clone(),
                result: call.output.clone(),
            })
            .await;
        }

        Ok(response)
    }

    /// Runs `agent` in streaming mode, mirroring every [`AgentRunUpdate`]
    /// onto the bus (`stream` for text, `function_start`/`function_end` for
    /// tool calls) as it passes through, and emitting `agent_finished` once
    /// the stream completes. The returned stream still yields every
    /// [`AgentRunUpdate`] unchanged to the caller.
    pub fn run_stream<'a>(
        agent: &'a Agent,
        ctx: &'a AgentRunContext<'a>,
        input: Vec<Message>,
        executor_id: String,
        emit_output: bool,
    ) -> chatgraph_llm::BoxStream<Result<AgentRunUpdate, AgentError>> {
        let model = resolved_model(agent, ctx);
        let name = agent.name.clone();

        let stream = async_stream::stream! {
            chatgraph_bus::emit_current(Event::AgentInvoked { name: name.clone() }).await;
            let start = Instant::now();
            let mut updates = agent.run_stream(ctx, input);
            let mut seq: u64 = 0;
            let mut collected = Vec::new();

            while let Some(update) = updates.next().await {
                match &update {
                    Ok(AgentRunUpdate::TextDelta(text)) => {
                        chatgraph_bus::emit_current(Event::Stream {
                            executor_id: executor_id.clone(),
                            text: text.clone(),
                            seq,
                        })
                        .await;
                        seq += 1;
                    }
                    Ok(AgentRunUpdate::FunctionStart { name, arguments }) => {
                        chatgraph_bus::emit_current(Event::FunctionStart {
                            name: name.clone(),
                            arguments: arguments.clone(),
                        })
                        .await;
                    }
                    Ok(AgentRunUpdate::FunctionEnd { name, result }) => {
                        chatgraph_bus::emit_current(Event::FunctionEnd {
                            name: name.clone(),
                            result: result.clone(),
                        })
                        .await;
                    }
                    Ok(AgentRunUpdate::Done { .. }) | Err(_) => {}
                }

                let is_terminal = matches!(update, Ok(AgentRunUpdate::Done { .. }) | Err(_));
                if let Ok(u) = &update {
                    collected.push(u.clone());
                }
                yield update;
                if is_terminal {
                    break;
                }
            }

            let response = AgentResponse::from_stream(&collected);
            let execution_time_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            let output = if emit_output {
                serde_json::from_str(&response.text).ok()
            } else {
                None
            };
            chatgraph_bus::emit_current(Event::AgentFinished {
                name,
                model,
                usage: Some(response.usage),
                execution_time_ms,
                output,
            })
            .await;
        };

        Box::pin(stream)
    }
}

fn resolved_model(agent: &Agent, ctx: &AgentRunContext<'_>) -> String {
    chatgraph_llm::resolve_model(
        agent.model_override.as_deref(),
        ctx.workflow_model_default,
        ctx.process_model_default,
    )
}

/// Wraps a direct [`ToolRegistry::invoke`] call with `function_start` /
/// `function_end` bus events, for workflow executors that call tools
/// outside of an agent's own tool-use loop.
pub struct ToolMiddleware;

impl ToolMiddleware {
    /// Invokes `name` against `registry`, emitting the surrounding bus
    /// events regardless of outcome.
    ///
    /// # Errors
    ///
    /// Returns whatever [`ToolRegistry::invoke`] returns.
    pub async fn wrap(
        registry: &ToolRegistry,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        chatgraph_bus::emit_current(Event::FunctionStart {
            name: name.to_string(),
            arguments: input.clone(),
        })
        .await;

        let result = registry.invoke(name, input).await;

        let result_json = match &result {
            Ok(value) => value.clone(),
            Err(e) => serde_json::json!({ "error": e.to_string() }),
        };
        chatgraph_bus::emit_current(Event::FunctionEnd {
            name: name.to_string(),
            result: result_json,
        })
        .await;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatgraph_llm::{BoxStream, Completion, CompletionChunk, CompletionRequest, ContentBlock, LlmError, LlmProvider, MessageContent, StopReason, Usage};
    use std::sync::Mutex;

    struct ScriptedProvider {
        model: String,
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
            unimplemented!()
        }

        fn default_model(&self) -> &str {
            &self.model
        }
    }

    #[tokio::test]
    async fn run_emits_invoked_and_finished_on_ambient_bus() {
        let (bus, mut rx) = chatgraph_bus::EventBus::new();

        let provider = ScriptedProvider {
            model: "m".to_string(),
            responses: Mutex::new(vec![Completion {
                content: vec![ContentBlock::Text {
                    text: "hi".to_string(),
                }],
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
            }]),
        };
        let tools = ToolRegistry::new();
        let ctx = AgentRunContext {
            provider: &provider,
            tools: &tools,
            workflow_model_default: None,
            process_model_default: "default",
        };
        let agent = Agent::new("triage", "be helpful");

        chatgraph_bus::scope(bus, async {
            AgentMiddleware::run(
                &agent,
                &ctx,
                vec![Message {
                    role: "user".to_string(),
                    content: MessageContent::Text("hi".to_string()),
                }],
                false,
            )
            .await
            .unwrap();
        })
        .await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::AgentInvoked { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::AgentFinished { .. }));
    }

    struct Echo;

    #[async_trait::async_trait]
    impl chatgraph_tools::ToolHandler for Echo {
        async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn tool_wrap_emits_start_and_end() {
        let (bus, mut rx) = chatgraph_bus::EventBus::new();
        let mut registry = ToolRegistry::new();
        registry
            .register(
                chatgraph_tools::ToolDefinition::new("echo", "d", serde_json::json!({}), &[]),
                std::sync::Arc::new(Echo),
            )
            .unwrap();

        chatgraph_bus::scope(bus, async {
            ToolMiddleware::wrap(&registry, "echo", serde_json::json!({"x": 1}))
                .await
                .unwrap();
        })
        .await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, Event::FunctionStart { .. }));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, Event::FunctionEnd { .. }));
    }
}
