#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Wire request and response types for the chatgraph HTTP API, separate
//! from the store's durable row types so the API contract in spec §6 can
//! evolve independently of the schema.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// `GET /api/user`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiUser {
    pub user_id: String,
    pub user_name: String,
    pub first_name: Option<String>,
    pub principal_name: Option<String>,
    pub is_authenticated: bool,
    pub mode: String,
}

/// `GET /api/models`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiModels {
    pub models: Vec<String>,
}

/// `GET /api/agents?react_mode=`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiAgents {
    pub agents: Vec<String>,
}

/// `GET /api/settings`.
#[derive(Debug, Clone, Serialize)]
pub struct ApiSettings {
    pub show_func_result: bool,
}

/// Query string for `GET /api/agents`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentsQuery {
    #[serde(default)]
    pub react_mode: bool,
}

/// `POST /api/conversations` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateConversationRequest {
    pub model: String,
}

/// `POST /api/conversations/{id}/messages` body, the wire shape of
/// [`chatgraph_orchestrator::MessageRequest`].
#[derive(Debug, Clone, Deserialize)]
pub struct PostMessageRequest {
    pub message: String,
    #[serde(default)]
    pub react_mode: bool,
    pub workflow_model: Option<String>,
    pub agent_model_mapping: Option<HashMap<String, String>>,
    #[serde(default = "default_memory_enabled")]
    pub memory_enabled: bool,
}

fn default_memory_enabled() -> bool {
    true
}

/// `PATCH /api/conversations/{id}/messages/{seq}/evaluation` body.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationRequest {
    pub is_satisfy: bool,
    pub comment: Option<String>,
}

/// A generic `{error: message}` body for non-2xx JSON responses.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_message_request_defaults_memory_enabled_when_absent() {
        let request: PostMessageRequest =
            serde_json::from_str(r#"{"message": "hi"}"#).unwrap();
        assert!(request.memory_enabled);
        assert!(!request.react_mode);
    }

    #[test]
    fn post_message_request_honors_explicit_flags() {
        let request: PostMessageRequest = serde_json::from_str(
            r#"{"message": "hi", "react_mode": true, "memory_enabled": false}"#,
        )
        .unwrap();
        assert!(request.react_mode);
        assert!(!request.memory_enabled);
    }
}
