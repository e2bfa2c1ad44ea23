#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Tool definition registry and bounded concurrent invocation.
//!
//! A [`ToolRegistry`] holds a named set of [`ToolDefinition`]s (the JSON
//! schema shown to the model) paired with [`ToolHandler`]s (the code that
//! actually runs). Invocation is gated by a semaphore so a single agent run
//! cannot flood downstream systems with concurrent tool calls.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;

/// Errors from tool registration or invocation.
#[derive(Debug, Error)]
pub enum ToolError {
    /// No tool registered under this name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The tool's handler failed.
    #[error("tool '{name}' failed: {message}")]
    Failed {
        /// Name of the tool that failed.
        name: String,
        /// Failure description.
        message: String,
    },

    /// Input did not deserialize into the tool's expected parameter type.
    #[error("invalid input for tool '{name}': {source}")]
    InvalidInput {
        /// Name of the tool.
        name: String,
        /// The deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// A tool was registered twice under the same name.
    #[error("tool '{0}' is already registered")]
    DuplicateName(String),
}

/// Describes a tool's name, purpose, and JSON-schema input shape, in the
/// form sent to the model alongside a completion request.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    /// Tool name, as invoked by the model.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// JSON schema for the tool's input object.
    pub parameters: serde_json::Value,
}

impl ToolDefinition {
    /// Builds a tool definition from an object-schema's properties and
    /// required-field list.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        properties: serde_json::Value,
        required: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    /// Renders this definition as the `{name, description, parameters}`
    /// JSON object the LLM client expects.
    #[must_use]
    pub fn to_json_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

/// A runnable tool.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Executes the tool with the given JSON input and returns a JSON
    /// result.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError`] on any failure; callers treat this as a normal
    /// outcome to report back to the model, never as a crash.
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError>;
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
}

/// A named collection of tools available to one or more agents, with a
/// shared concurrency budget across all invocations.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    permits: Arc<Semaphore>,
}

/// Default number of tool invocations allowed to run concurrently.
const DEFAULT_POOL_SIZE: usize = 32;

impl ToolRegistry {
    /// Creates an empty registry with the default concurrency budget,
    /// overridable via `TOOL_POOL_SIZE`.
    #[must_use]
    pub fn new() -> Self {
        let pool_size = std::env::var("TOOL_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        Self {
            tools: HashMap::new(),
            permits: Arc::new(Semaphore::new(pool_size)),
        }
    }

    /// Registers a tool under `definition.name`.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::DuplicateName`] if a tool with this name is
    /// already registered.
    pub fn register(
        &mut self,
        definition: ToolDefinition,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), ToolError> {
        if self.tools.contains_key(&definition.name) {
            return Err(ToolError::DuplicateName(definition.name));
        }
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool { definition, handler },
        );
        Ok(())
    }

    /// Returns the JSON schema for every registered tool, or the subset
    /// named in `names` when given.
    #[must_use]
    pub fn list_schemas(&self, names: Option<&[String]>) -> Vec<serde_json::Value> {
        match names {
            Some(names) => names
                .iter()
                .filter_map(|n| self.tools.get(n))
                .map(|t| t.definition.to_json_schema())
                .collect(),
            None => self
                .tools
                .values()
                .map(|t| t.definition.to_json_schema())
                .collect(),
        }
    }

    /// Looks up a tool's definition by name.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name).map(|t| &t.definition)
    }

    /// Invokes a tool by name, gated by the registry's shared concurrency
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`ToolError::UnknownTool`] if no tool is registered under
    /// `name`, or the error the tool's handler returned.
    pub async fn invoke(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .expect("tool semaphore closed");

        tool.handler.call(input).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Maximum size of a tool result string before truncation, to avoid
/// overwhelming the model's context window.
pub const MAX_TOOL_RESULT_BYTES: usize = 8000;

/// Truncates an oversized tool result to [`MAX_TOOL_RESULT_BYTES`],
/// appending a marker noting the original size.
#[must_use]
pub fn truncate_result(raw: &str) -> String {
    if raw.len() <= MAX_TOOL_RESULT_BYTES {
        return raw.to_string();
    }
    let cut = &raw[..MAX_TOOL_RESULT_BYTES];
    format!("{cut}... (truncated, {} bytes total)", raw.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
            Ok(input)
        }
    }

    #[tokio::test]
    async fn registers_and_invokes() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("echo", "echoes input", serde_json::json!({}), &[]),
                Arc::new(Echo),
            )
            .unwrap();

        let result = registry
            .invoke("echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"x": 1}));
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("missing", serde_json::json!({})).await;
        assert!(matches!(err, Err(ToolError::UnknownTool(_))));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        let def = || ToolDefinition::new("echo", "d", serde_json::json!({}), &[]);
        registry.register(def(), Arc::new(Echo)).unwrap();
        assert!(matches!(
            registry.register(def(), Arc::new(Echo)),
            Err(ToolError::DuplicateName(_))
        ));
    }

    #[test]
    fn truncates_long_results() {
        let long = "x".repeat(MAX_TOOL_RESULT_BYTES + 100);
        let truncated = truncate_result(&long);
        assert!(truncated.len() < long.len());
        assert!(truncated.contains("truncated"));
    }
}
