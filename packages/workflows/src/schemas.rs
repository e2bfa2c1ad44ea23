//! Structured-output shapes produced by the orchestration agents.
//!
//! These mirror the JSON schemas handed to the LLM via
//! [`chatgraph_agent::Agent::with_schema`]; the schema itself is built
//! dynamically from the registered sub-agent set (`build_triage_schema`) so
//! the validator never hard-codes a fixed agent enum.

use serde::Deserialize;

/// One task dispatched to a sub-agent.
#[derive(Debug, Clone, Deserialize)]
pub struct TriageTask {
    /// Sub-agent key, validated against the registered set.
    pub agent: String,
    /// The question routed to that sub-agent.
    pub question: String,
}

/// `triage_agent`'s structured output.
#[derive(Debug, Clone, Deserialize)]
pub struct TriageOutput {
    /// Whether the query is out of scope.
    pub should_reject: bool,
    /// Shown to the user when rejected.
    #[serde(default)]
    pub reject_reason: String,
    /// Sub-agent tasks to dispatch, empty when rejected.
    #[serde(default)]
    pub tasks: Vec<TriageTask>,
}

/// One step of a `plan_agent`/`replan_agent` plan.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanStep {
    /// Step ordinal, steps execute sequentially.
    pub step: u32,
    /// Sub-agent key.
    pub agent: String,
    /// The question routed to that sub-agent within the step.
    pub question: String,
}

/// `plan_agent`'s structured output, produced by `triage_executor` on fresh
/// user input.
#[derive(Debug, Clone, Deserialize)]
pub struct TriagePlanOutput {
    /// What to do with the request.
    pub action: PlanAction,
    /// Shown to the user when `action = reject`.
    #[serde(default)]
    pub reject_reason: String,
    /// Steps to execute, present when `action = plan`.
    #[serde(default)]
    pub plan: Vec<PlanStep>,
    /// Clarifying text shown to the user when `action = clarify`.
    #[serde(default)]
    pub plan_reason: String,
}

/// `plan_agent`'s chosen action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Execute `plan`.
    Plan,
    /// Ask the user a clarifying question.
    Clarify,
    /// Decline the request.
    Reject,
}

/// `replan_agent`'s structured output, produced by `triage_executor` on
/// review feedback (the loop edge).
#[derive(Debug, Clone, Deserialize)]
pub struct TriageReplanOutput {
    /// Whether the review feedback warrants another orchestrator pass.
    pub accept_review: bool,
    /// Replacement plan, present when `accept_review = true`.
    #[serde(default)]
    pub new_plan: Vec<PlanStep>,
    /// Shown to the user when the review is rejected.
    #[serde(default)]
    pub rejection_reason: String,
}

/// `review_agent`'s structured output.
#[derive(Debug, Clone, Deserialize)]
pub struct ReviewOutput {
    /// Whether the orchestrator's results satisfy the plan.
    pub is_complete: bool,
    /// What's missing, when incomplete.
    #[serde(default)]
    pub missing_aspects: Vec<String>,
    /// Suggested next approach, when incomplete.
    #[serde(default)]
    pub suggested_approach: String,
    /// Model's confidence in this verdict, 0.0-1.0.
    #[serde(default)]
    pub confidence: f64,
}

/// Builds the JSON schema handed to `triage_agent`, constraining
/// `tasks[].agent` to the currently registered sub-agent keys.
#[must_use]
pub fn build_triage_schema(agent_keys: &[String]) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["should_reject", "tasks"],
        "properties": {
            "should_reject": { "type": "boolean" },
            "reject_reason": { "type": "string" },
            "tasks": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["agent", "question"],
                    "properties": {
                        "agent": { "type": "string", "enum": agent_keys },
                        "question": { "type": "string" }
                    }
                }
            }
        }
    })
}

/// Builds the JSON schema handed to `plan_agent`, constraining
/// `plan[].agent` the same way.
#[must_use]
pub fn build_plan_schema(agent_keys: &[String]) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["action"],
        "properties": {
            "action": { "type": "string", "enum": ["plan", "clarify", "reject"] },
            "reject_reason": { "type": "string" },
            "plan_reason": { "type": "string" },
            "plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["step", "agent", "question"],
                    "properties": {
                        "step": { "type": "integer" },
                        "agent": { "type": "string", "enum": agent_keys },
                        "question": { "type": "string" }
                    }
                }
            }
        }
    })
}

/// Builds the JSON schema handed to `replan_agent`.
#[must_use]
pub fn build_replan_schema(agent_keys: &[String]) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["accept_review"],
        "properties": {
            "accept_review": { "type": "boolean" },
            "rejection_reason": { "type": "string" },
            "new_plan": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["step", "agent", "question"],
                    "properties": {
                        "step": { "type": "integer" },
                        "agent": { "type": "string", "enum": agent_keys },
                        "question": { "type": "string" }
                    }
                }
            }
        }
    })
}

/// Builds the JSON schema handed to `review_agent`.
#[must_use]
pub fn build_review_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "required": ["is_complete"],
        "properties": {
            "is_complete": { "type": "boolean" },
            "missing_aspects": { "type": "array", "items": { "type": "string" } },
            "suggested_approach": { "type": "string" },
            "confidence": { "type": "number" }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_schema_enumerates_agent_keys() {
        let schema = build_triage_schema(&["servicenow".to_string(), "log_analytics".to_string()]);
        let enum_values = schema["properties"]["tasks"]["items"]["properties"]["agent"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(enum_values.len(), 2);
    }

    #[test]
    fn parses_triage_output() {
        let raw = serde_json::json!({
            "should_reject": false,
            "tasks": [{"agent": "servicenow", "question": "check INC123"}]
        });
        let parsed: TriageOutput = serde_json::from_value(raw).unwrap();
        assert!(!parsed.should_reject);
        assert_eq!(parsed.tasks.len(), 1);
    }
}
