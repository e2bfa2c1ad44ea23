//! `OpenAI`-compatible chat completion provider, buffered and streaming.

use futures::StreamExt as _;
use serde::{Deserialize, Serialize};

use crate::{
    BoxStream, Completion, CompletionChunk, CompletionRequest, ContentBlock, LlmError,
    LlmProvider, Message, MessageContent, StopReason, Usage,
};

/// `OpenAI` chat completion API provider. Also serves `OpenAI`-compatible
/// self-hosted servers (Ollama, vLLM) when `base_url` is overridden via
/// [`OpenAiProvider::with_base_url`].
pub struct OpenAiProvider {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Creates a new `OpenAI` provider targeting the public API.
    #[must_use]
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Overrides the base URL, for `OpenAI`-compatible self-hosted servers.
    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn api_messages(system_prompt: &str, messages: &[Message]) -> Vec<OpenAiMessage> {
        let mut out = vec![OpenAiMessage {
            role: "system".to_string(),
            content: Some(system_prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }];

        for msg in messages {
            match &msg.content {
                MessageContent::Text(text) => out.push(OpenAiMessage {
                    role: msg.role.clone(),
                    content: Some(text.clone()),
                    tool_calls: None,
                    tool_call_id: None,
                }),
                MessageContent::Blocks(blocks) if msg.role == "assistant" => {
                    let tool_calls: Vec<OpenAiToolCall> = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::ToolUse { id, name, input } => Some(OpenAiToolCall {
                                id: id.clone(),
                                call_type: "function".to_string(),
                                function: OpenAiFunction {
                                    name: name.clone(),
                                    arguments: serde_json::to_string(input).unwrap_or_default(),
                                },
                            }),
                            ContentBlock::Text { .. } | ContentBlock::ToolResult { .. } => None,
                        })
                        .collect();

                    let text: String = blocks
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");

                    out.push(OpenAiMessage {
                        role: "assistant".to_string(),
                        content: if text.is_empty() { None } else { Some(text) },
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        tool_call_id: None,
                    });
                }
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } = block
                        {
                            out.push(OpenAiMessage {
                                role: "tool".to_string(),
                                content: Some(content.clone()),
                                tool_calls: None,
                                tool_call_id: Some(tool_use_id.clone()),
                            });
                        }
                    }
                }
            }
        }

        out
    }

    fn api_tools(tools: &[serde_json::Value]) -> Vec<OpenAiTool> {
        tools
            .iter()
            .map(|t| OpenAiTool {
                tool_type: "function".to_string(),
                function: OpenAiToolFunction {
                    name: t["name"].as_str().unwrap_or_default().to_string(),
                    description: t["description"].as_str().unwrap_or_default().to_string(),
                    parameters: t["parameters"].clone(),
                },
            })
            .collect()
    }
}

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct OpenAiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunction,
}

#[derive(Serialize, Deserialize, Clone, Default)]
struct OpenAiFunction {
    #[serde(default)]
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAiToolFunction,
}

#[derive(Serialize)]
struct OpenAiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Deserialize)]
struct OpenAiErrorBody {
    error: OpenAiErrorDetail,
}

#[derive(Deserialize)]
struct OpenAiErrorDetail {
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
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = OpenAiRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages: Self::api_messages(&request.system_prompt, &request.messages),
            tools: Self::api_tools(&request.tools),
            max_tokens: request.max_tokens,
            stream: false,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<OpenAiErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status}: {text}"));
            return Err(classify_status(status, message));
        }

        let parsed: OpenAiResponse = serde_json::from_str(&text)?;
        let Some(choice) = parsed.choices.into_iter().next() else {
            return Err(LlmError::Permanent("no choices in response".to_string()));
        };

        let mut content = Vec::new();
        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text });
            }
        }
        for call in choice.message.tool_calls.into_iter().flatten() {
            content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Null),
            });
        }

        let usage = parsed.usage.map_or(Usage::default(), |u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.prompt_tokens + u.completion_tokens,
        });

        Ok(Completion {
            content,
            stop_reason: stop_reason_from(choice.finish_reason.as_deref()),
            usage,
        })
    }

    async fn complete_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<BoxStream<Result<CompletionChunk, LlmError>>, LlmError> {
        let body = OpenAiRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages: Self::api_messages(&request.system_prompt, &request.messages),
            tools: Self::api_tools(&request.tools),
            max_tokens: request.max_tokens,
            stream: true,
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<OpenAiErrorBody>(&text)
                .map(|e| e.error.message)
                .unwrap_or_else(|_| format!("HTTP {status}: {text}"));
            return Err(classify_status(status, message));
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut buf = String::new();
            let mut output_tokens = 0_u32;
            let mut input_tokens = 0_u32;
            let mut stop_reason = StopReason::EndTurn;
            let mut byte_stream = Box::pin(byte_stream);

            while let Some(chunk) = byte_stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(LlmError::Http(e));
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(newline) = buf.find('\n') {
                    let line: String = buf.drain(..=newline).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data: ") else { continue };
                    if data == "[DONE]" {
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

                    let Ok(event) = serde_json::from_str::<serde_json::Value>(data) else { continue };

                    if let Some(usage) = event.get("usage") {
                        if let Some(p) = usage["prompt_tokens"].as_u64() {
                            input_tokens = u32::try_from(p).unwrap_or(u32::MAX);
                        }
                        if let Some(c) = usage["completion_tokens"].as_u64() {
                            output_tokens = u32::try_from(c).unwrap_or(u32::MAX);
                        }
                    }

                    let Some(choice) = event["choices"].as_array().and_then(|c| c.first()) else { continue };

                    if let Some(reason) = choice["finish_reason"].as_str() {
                        stop_reason = stop_reason_from(Some(reason));
                    }

                    let delta = &choice["delta"];
                    if let Some(text) = delta["content"].as_str() {
                        yield Ok(CompletionChunk::TextDelta(text.to_string()));
                    }

                    if let Some(tool_calls) = delta["tool_calls"].as_array() {
                        for call in tool_calls {
                            let index = call["index"].as_u64().map(|i| u32::try_from(i).unwrap_or(u32::MAX)).unwrap_or(0);
                            yield Ok(CompletionChunk::ToolCallDelta {
                                index,
                                id: call["id"].as_str().map(ToString::to_string),
                                name: call["function"]["name"].as_str().map(ToString::to_string),
                                arguments_delta: call["function"]["arguments"].as_str().map(ToString::to_string),
                            });
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
