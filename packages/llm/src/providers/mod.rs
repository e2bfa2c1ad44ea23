//! Concrete [`crate::LlmProvider`] implementations.

pub mod anthropic;
pub mod openai;

use crate::{LlmError, LlmProvider};

/// Creates an LLM provider based on environment variables.
///
/// Checks `AI_PROVIDER` (default: "anthropic") and uses the corresponding
/// API key env var (`ANTHROPIC_API_KEY` or `OPENAI_API_KEY`), with the model
/// taken from `AI_MODEL` if set.
///
/// # Errors
///
/// Returns [`LlmError::Config`] if the required API key is not set or the
/// provider name is unrecognized.
pub fn create_provider_from_env() -> Result<Box<dyn LlmProvider>, LlmError> {
    let provider = std::env::var("AI_PROVIDER").unwrap_or_else(|_| "anthropic".to_string());

    match provider.to_lowercase().as_str() {
        "anthropic" | "claude" => {
            let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| LlmError::Config {
                message: "ANTHROPIC_API_KEY environment variable not set".to_string(),
            })?;
            let model = std::env::var("AI_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
            Ok(Box::new(anthropic::AnthropicProvider::new(api_key, model)))
        }
        "openai" | "gpt" => {
            let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| LlmError::Config {
                message: "OPENAI_API_KEY environment variable not set".to_string(),
            })?;
            let model = std::env::var("AI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
            Ok(Box::new(openai::OpenAiProvider::new(api_key, model)))
        }
        other => Err(LlmError::Config {
            message: format!("unknown AI provider: {other}. Use 'anthropic' or 'openai'."),
        }),
    }
}
