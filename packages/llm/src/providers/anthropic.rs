//! Anthropic Claude provider implementation, buffered and streaming.

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};

use crate::{
    BoxStream, CompletionChunk, CompletionRequest, LlmError, LlmProvider,
};
use crate::{Completion, ContentBlock, Message, MessageContent, StopReason, Usage};

/// Anthropic Claude API provider.
pub struct AnthropicProvider {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Creates a new Anthropic provider.
    #[must_use]
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            client: reqwest::Client::new(),
        }
    }

    fn api_messages(messages: &[Message]) -> Vec<AnthropicMessage> {
        messages
            .iter()
            .map(|m| {
                let content = match &m.content {
                    MessageContent::Text(text) => serde_json::json!(text),
                    MessageContent::Blocks(blocks) => {
                        serde_json::json!(blocks.iter().map(block_to_json).collect::<Vec<_>>())
                    }
                };
                AnthropicMessage {
                    role: m.role.clone(),
                    content,
                }
            })
            .collect()
    }

    fn api_tools(tools: &[serde_json::Value]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "name": t["name"],
                    "description": t["description"],
                    "input_schema": t["parameters"],
                })
            })
            .collect()
    }
}

fn block_to_json(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({ "type": "text", "text": text }),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
        }),
    }
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Deserialize)]
struct AnthropicErrorBody {
    error: AnthropicErrorDetail,
}

#[derive(Deserialize)]
struct AnthropicErrorDetail {
    message: String,
}

fn classify_status(status: reqwest::StatusCode, message: String) -> LlmError {
    if status.as_u16() == 429 || status.is_server_error() {
        LlmError::Transient(message)
    } else {
        LlmError::Permanent(message)
    }
}

fn stop_reason_from(s: Option<&str>) -> StopReason {
    match s {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = AnthropicRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            max_tokens: request.max_tokens,
            system: &request.system_prompt,
            messages: Self::api_messages(&request.messages),
            tools: Self::api_tools(&request.tools),
            stream: false,
        };

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<AnthropicErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status}: {text}"));
            return Err(classify_status(status, message));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&text)?;
        let content = parsed
            .content
            .into_iter()
            .map(|b| match b {
                AnthropicContentBlock::Text { text } => ContentBlock::Text { text },
                AnthropicContentBlock::ToolUse { id, name, input } => {
                    ContentBlock::ToolUse { id, name, input }
                }
            })
            .collect();

        let usage = parsed.usage.map_or(Usage::default(), |u| Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            total_tokens: u.input_tokens + u.output_tokens,
        });

        Ok(Completion {
            content,
            stop_reason: stop_reason_from(parsed.stop_reason.as_deref()),
            usage,
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<BoxStream<Result<CompletionChunk, LlmError>>, LlmError> {
        let body = AnthropicRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            max_tokens: request.max_tokens,
            system: &request.system_prompt,
            messages: Self::api_messages(&request.messages),
            tools: Self::api_tools(&request.tools),
            stream: true,
        };

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status}: {text}"));
            return Err(classify_status(status, message));
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut buf = String::new();
            let mut input_tokens = 0_u32;
            let mut output_tokens = 0_u32;
            let mut stop_reason = StopReason::EndTurn;
            let mut byte_stream = Box::pin(byte_stream);

            // index -> is this block a tool_use block (needs a ToolCallDelta)
            let mut block_kinds: std::collections::HashMap<u32, bool> = std::collections::HashMap::new();

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(LlmError::Http(e));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buf.find("\n\n") {
                    let record: String = buf.drain(..pos + 2).collect();
                    for line in record.lines() {
                        let Some(data) = line.strip_prefix("data: ") else { continue };
                        let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else { continue };
                        let event_type = event["type"].as_str().unwrap_or_default();

                        match event_type {
                            "message_start" => {
                                if let Some(tokens) = event["message"]["usage"]["input_tokens"].as_u64() {
                                    input_tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
                                }
                            }
                            "content_block_start" => {
                                if let Some(index) = event["index"].as_u64() {
                                    let index = u32::try_from(index).unwrap_or(u32::MAX);
                                    let block = &event["content_block"];
                                    if block["type"].as_str() == Some("tool_use") {
                                        block_kinds.insert(index, true);
                                        yield Ok(CompletionChunk::ToolCallDelta {
                                            index,
                                            id: block["id"].as_str().map(ToString::to_string),
                                            name: block["name"].as_str().map(ToString::to_string),
                                            arguments_delta: None,
                                        });
                                    } else {
                                        block_kinds.insert(index, false);
                                    }
                                }
                            }
                            "content_block_delta" => {
                                let index = event["index"].as_u64().map(|i| u32::try_from(i).unwrap_or(u32::MAX));
                                let delta = &event["delta"];
                                match delta["type"].as_str() {
                                    Some("text_delta") => {
                                        if let Some(text) = delta["text"].as_str() {
                                            yield Ok(CompletionChunk::TextDelta(text.to_string()));
                                        }
                                    }
                                    Some("input_json_delta") => {
                                        if let (Some(index), Some(partial)) = (index, delta["partial_json"].as_str()) {
                                            yield Ok(CompletionChunk::ToolCallDelta {
                                                index,
                                                id: None,
                                                name: None,
                                                arguments_delta: Some(partial.to_string()),
                                            });
                                        }
                                    }
                                    _ => {}
                                }
                            }
                            "message_delta" => {
                                if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                                    stop_reason = stop_reason_from(Some(reason));
                                }
                                if let Some(tokens) = event["usage"]["output_tokens"].as_u64() {
                                    output_tokens = u32::try_from(tokens).unwrap_or(u32::MAX);
                                }
                            }
                            "message_stop" => {
                                yield Ok(CompletionChunk::Done {
                                    stop_reason,
                                    usage: Usage {
                                        input_tokens,
                                        output_tokens,
                                        total_tokens: input_tokens + output_tokens,
                                    },
                                });
                                return;
                            }
                            "error" => {
                                let message = event["error"]["message"].as_str().unwrap_or("unknown streaming error").to_string();
                                yield Err(LlmError::Transient(message));
                                return;
                            }
                            _ => {}
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    fn default_model(&self) -> &str {
        &self.model
    }
}
