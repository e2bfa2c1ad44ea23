#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! LLM provider abstraction with buffered and streaming completions.
//!
//! Supports Anthropic Claude and `OpenAI`-compatible chat completion APIs
//! behind a single [`LlmProvider`] trait. Buffered calls return a complete
//! [`Completion`]; streaming calls return a [`BoxStream`] of
//! [`CompletionChunk`]s that a caller can fold back into a [`Completion`]
//! via [`Completion::from_chunks`] when it needs both views of a run.

pub mod providers;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A boxed, `Send` stream — the return type of every streaming operation
/// in this crate.
pub type BoxStream<T> = std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send>>;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Retryable failure: rate limit, 5xx, connection reset.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Non-retryable failure: bad request, auth failure, invalid model.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// The provider's response did not satisfy the requested response schema.
    #[error("response violated the requested schema: {0}")]
    SchemaViolation(String),

    /// The request did not complete within the provider's time budget.
    #[error("request to LLM provider timed out")]
    Timeout,

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (missing API key, unknown provider name).
    #[error("configuration error: {message}")]
    Config {
        /// Description of what is missing or invalid.
        message: String,
    },
}

/// A message in the conversation sent to or received from the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role: "system", "user", or "assistant".
    pub role: String,
    /// Message content.
    pub content: MessageContent,
}

/// Content of a message — either simple text or structured blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content.
    Text(String),
    /// Structured content blocks (tool calls / tool results).
    Blocks(Vec<ContentBlock>),
}

/// A structured content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// A tool invocation requested by the model.
    ToolUse {
        /// Unique ID for this tool use, echoed back in the matching result.
        id: String,
        /// Tool name.
        name: String,
        /// Tool input parameters.
        input: serde_json::Value,
    },
    /// A tool result sent back to the model.
    ToolResult {
        /// The `tool_use` ID this result corresponds to.
        tool_use_id: String,
        /// The result content, serialized as a string.
        content: String,
    },
}

/// Token accounting for a single completion.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    pub input_tokens: u32,
    /// Tokens in the generated response.
    pub output_tokens: u32,
    /// Sum of input and output tokens.
    pub total_tokens: u32,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Model finished its response naturally.
    EndTurn,
    /// Model wants to call one or more tools.
    ToolUse,
    /// Maximum tokens reached.
    MaxTokens,
}

/// A complete response from the provider.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Content blocks in the response.
    pub content: Vec<ContentBlock>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token usage for this completion.
    pub usage: Usage,
}

impl Completion {
    /// Concatenates the text blocks of the response into a single string.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Folds a stream of [`CompletionChunk`]s into a single [`Completion`],
    /// assembling incremental tool-call deltas by stream index.
    #[must_use]
    pub fn from_chunks(chunks: &[CompletionChunk]) -> Self {
        let mut text = String::new();
        let mut tool_calls: std::collections::BTreeMap<u32, PartialToolCall> =
            std::collections::BTreeMap::new();
        let mut stop_reason = StopReason::EndTurn;
        let mut usage = Usage::default();

        for chunk in chunks {
            match chunk {
                CompletionChunk::TextDelta(delta) => text.push_str(delta),
                CompletionChunk::ToolCallDelta {
                    index,
                    id,
                    name,
                    arguments_delta,
                } => {
                    let entry = tool_calls.entry(*index).or_default();
                    if let Some(id) = id {
                        entry.id.clone_from(id);
                    }
                    if let Some(name) = name {
                        entry.name.clone_from(name);
                    }
                    if let Some(delta) = arguments_delta {
                        entry.arguments.push_str(delta);
                    }
                }
                CompletionChunk::Done {
                    stop_reason: sr,
                    usage: u,
                } => {
                    stop_reason = *sr;
                    usage = *u;
                }
            }
        }

        let mut content = Vec::new();
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
        for (_, call) in tool_calls {
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.name,
                input: serde_json::from_str(&call.arguments).unwrap_or(serde_json::Value::Null),
            });
        }

        Self {
            content,
            stop_reason,
            usage,
        }
    }
}

/// Accumulator for a streaming tool-call being assembled one delta at a time.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// A single increment of a streaming completion.
#[derive(Debug, Clone)]
pub enum CompletionChunk {
    /// A chunk of generated text.
    TextDelta(String),
    /// A partial tool-call update, keyed by the provider's stream index.
    ToolCallDelta {
        /// Index of the tool call within the response (providers emit tool
        /// calls as parallel, interleaved streams keyed by this index).
        index: u32,
        /// Tool-call ID, present on the first delta for this index.
        id: Option<String>,
        /// Tool name, present on the first delta for this index.
        name: Option<String>,
        /// Incremental JSON-arguments text to append.
        arguments_delta: Option<String>,
    },
    /// Terminal chunk carrying the stop reason and final usage.
    Done {
        /// Why generation stopped.
        stop_reason: StopReason,
        /// Final token usage.
        usage: Usage,
    },
}

/// A request to complete a conversation, optionally with tools and a
/// response schema.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt.
    pub system_prompt: String,
    /// Conversation history, oldest first.
    pub messages: Vec<Message>,
    /// Tool definitions available to the model, in `{name, description,
    /// parameters}` JSON form.
    pub tools: Vec<serde_json::Value>,
    /// When set, the model is asked to produce JSON matching this schema;
    /// [`complete_with_schema`] retries on violation.
    pub response_schema: Option<serde_json::Value>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Overrides the provider's configured default model for this request,
    /// per the agent ▸ workflow ▸ process resolution chain ([`resolve_model`]).
    pub model: Option<String>,
}

impl CompletionRequest {
    /// Builds a request with no tools and no schema.
    #[must_use]
    pub fn new(system_prompt: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            tools: Vec::new(),
            response_schema: None,
            max_tokens: 4096,
            model: None,
        }
    }

    /// Overrides the model for this request.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Attaches tool definitions.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    /// Attaches a response schema.
    #[must_use]
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

/// Trait for LLM providers, implemented once per wire protocol.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Sends a buffered completion request and waits for the full response.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] if the request fails or the provider returns an
    /// error body.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    /// Sends a streaming completion request.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`] if the request cannot be established.
    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<BoxStream<Result<CompletionChunk, LlmError>>, LlmError>;

    /// The model name this provider uses absent an override.
    fn default_model(&self) -> &str;
}

/// Maximum number of retries when a response schema is violated.
const MAX_SCHEMA_RETRIES: u32 = 3;

/// Completes a request and validates the result against
/// `request.response_schema`, retrying up to [`MAX_SCHEMA_RETRIES`] times
/// on violation before returning [`LlmError::SchemaViolation`]. Returns the
/// parsed value alongside the usage of the attempt that finally succeeded,
/// so callers that need both views (e.g. to build an `AgentResponse`) don't
/// have to re-derive usage themselves.
///
/// # Errors
///
/// Returns [`LlmError`] from the underlying provider call, or
/// [`LlmError::SchemaViolation`] if every retry still fails validation.
pub async fn complete_with_schema(
    provider: &dyn LlmProvider,
    request: &CompletionRequest,
) -> Result<(serde_json::Value, Usage), LlmError> {
    let Some(schema) = &request.response_schema else {
        return Err(LlmError::Config {
            message: "complete_with_schema called without a response_schema".to_string(),
        });
    };

    let mut last_error = String::new();
    for attempt in 0..=MAX_SCHEMA_RETRIES {
        let completion = provider.complete(request).await?;
        let text = completion.text();
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(value) => {
                if let Err(e) = validate_against_schema(&value, schema) {
                    last_error = e;
                    log::warn!(
                        "schema validation failed on attempt {attempt}/{MAX_SCHEMA_RETRIES}: {last_error}"
                    );
                    continue;
                }
                return Ok((value, completion.usage));
            }
            Err(e) => {
                last_error = format!("response was not valid JSON: {e}");
                log::warn!(
                    "schema parse failed on attempt {attempt}/{MAX_SCHEMA_RETRIES}: {last_error}"
                );
            }
        }
    }

    Err(LlmError::SchemaViolation(last_error))
}

/// Minimal structural check: the schema's top-level `required` keys must be
/// present on the value, and if `type` is `"object"` the value must be one.
fn validate_against_schema(value: &serde_json::Value, schema: &serde_json::Value) -> Result<(), String> {
    if schema.get("type").and_then(serde_json::Value::as_str) == Some("object")
        && !value.is_object()
    {
        return Err("expected a JSON object".to_string());
    }

    if let Some(required) = schema.get("required").and_then(serde_json::Value::as_array) {
        for key in required {
            let Some(key) = key.as_str() else { continue };
            if value.get(key).is_none() {
                return Err(format!("missing required field '{key}'"));
            }
        }
    }

    Ok(())
}

/// Resolves the model name to use for a run, following the priority chain:
/// an explicit per-agent override, then a workflow-level default, then the
/// process-wide default model.
#[must_use]
pub fn resolve_model(
    agent_override: Option<&str>,
    workflow_default: Option<&str>,
    process_default: &str,
) -> String {
    agent_override
        .or(workflow_default)
        .unwrap_or(process_default)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_model_priority_chain() {
        assert_eq!(resolve_model(Some("a"), Some("b"), "c"), "a");
        assert_eq!(resolve_model(None, Some("b"), "c"), "b");
        assert_eq!(resolve_model(None, None, "c"), "c");
    }

    #[test]
    fn folds_text_and_tool_chunks() {
        let chunks = vec![
            CompletionChunk::TextDelta("hello ".to_string()),
            CompletionChunk::TextDelta("world".to_string()),
            CompletionChunk::ToolCallDelta {
                index: 0,
                id: Some("call_1".to_string()),
                name: Some("lookup".to_string()),
                arguments_delta: Some("{\"q\":".to_string()),
            },
            CompletionChunk::ToolCallDelta {
                index: 0,
                id: None,
                name: None,
                arguments_delta: Some("\"x\"}".to_string()),
            },
            CompletionChunk::Done {
                stop_reason: StopReason::ToolUse,
                usage: Usage {
                    input_tokens: 10,
                    output_tokens: 5,
                    total_tokens: 15,
                },
            },
        ];

        let completion = Completion::from_chunks(&chunks);
        assert_eq!(completion.text(), "hello world");
        assert_eq!(completion.stop_reason, StopReason::ToolUse);
        assert_eq!(completion.usage.total_tokens, 15);
        assert!(completion.content.iter().any(|b| matches!(
            b,
            ContentBlock::ToolUse { name, .. } if name == "lookup"
        )));
    }

    #[test]
    fn schema_validation_checks_required_fields() {
        let schema = serde_json::json!({"type": "object", "required": ["a"]});
        assert!(validate_against_schema(&serde_json::json!({"a": 1}), &schema).is_ok());
        assert!(validate_against_schema(&serde_json::json!({}), &schema).is_err());
        assert!(validate_against_schema(&serde_json::json!([1, 2]), &schema).is_err());
    }
}
