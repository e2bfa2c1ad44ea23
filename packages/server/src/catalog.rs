//! The process-wide sub-agent and tool catalog.
//!
//! Sub-agents, their tool grants, and the orchestration-agent instructions
//! are configuration, not protocol — an operator deploying chatgraph for a
//! different domain swaps this module out. What's here is a small, working
//! default catalog: a general-purpose agent with two utility tools, and a
//! research-style agent with none.

use std::collections::HashMap;

use chatgraph_agent::Agent;
use chatgraph_tools::{ToolDefinition, ToolError, ToolHandler, ToolRegistry};

/// System prompt for `triage_agent` (§4.G) / `plan_agent` + `replan_agent`
/// (§4.H): decides whether a request is answerable by the sub-agent set and,
/// if so, how to split it into tasks.
pub const TRIAGE_INSTRUCTIONS: &str = "\
You are the triage step of a multi-agent assistant. Given the user's \
question and the available sub-agents, decide whether the request is \
something this assistant can help with. If not, reject it with a short \
reason. Otherwise split it into one task per relevant sub-agent.";

pub const PLAN_INSTRUCTIONS: &str = TRIAGE_INSTRUCTIONS;

pub const REPLAN_INSTRUCTIONS: &str = "\
You are revising a multi-step plan after reviewing partial results. Decide \
whether to accept the review's feedback and produce a revised plan, or \
reject it and stop.";

pub const REVIEW_INSTRUCTIONS: &str = "\
You are reviewing the results gathered so far against the original \
request. Judge whether they're sufficient to answer it, and if not, say \
what's missing and how to address it.";

pub const SUMMARY_INSTRUCTIONS: &str = "\
You are the final step of a multi-agent assistant. Synthesize the \
gathered results into one clear, direct answer for the user. Do not \
mention the agents or tools that produced the results.";

const GENERAL_AGENT_INSTRUCTIONS: &str = "\
You are a general-purpose assistant with access to small utility tools. \
Use them when they help answer the question precisely.";

const RESEARCH_AGENT_INSTRUCTIONS: &str = "\
You answer questions from your own knowledge, without tools. Be concise \
and say when you're uncertain.";

/// Returns the current UTC time in RFC 3339 form. Takes no parameters.
struct CurrentTimeTool;

#[async_trait::async_trait]
impl ToolHandler for CurrentTimeTool {
    async fn call(&self, _input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        Ok(serde_json::json!({ "now": chrono::Utc::now().to_rfc3339() }))
    }
}

/// Counts words in the given `text` parameter.
struct WordCountTool;

#[async_trait::async_trait]
impl ToolHandler for WordCountTool {
    async fn call(&self, input: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let text = input
            .get("text")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ToolError::Failed {
                name: "word_count".to_string(),
                message: "missing required `text` parameter".to_string(),
            })?;
        Ok(serde_json::json!({ "count": text.split_whitespace().count() }))
    }
}

/// The process-wide tool registry plus the sub-agent set built atop it.
pub struct Catalog {
    pub tools: ToolRegistry,
    pub sub_agents: HashMap<String, Agent>,
}

/// Builds the default tool registry and sub-agent catalog.
///
/// # Panics
///
/// Panics if a tool name is registered twice, which would indicate a bug in
/// this module, not a runtime condition.
#[must_use]
pub fn build_catalog() -> Catalog {
    let mut tools = ToolRegistry::new();
    tools
        .register(
            ToolDefinition::new(
                "current_time",
                "Returns the current UTC time",
                serde_json::json!({}),
                &[],
            ),
            std::sync::Arc::new(CurrentTimeTool),
        )
        .expect("tool names are unique in this catalog");
    tools
        .register(
            ToolDefinition::new(
                "word_count",
                "Counts words in a piece of text",
                serde_json::json!({ "text": { "type": "string" } }),
                &["text"],
            ),
            std::sync::Arc::new(WordCountTool),
        )
        .expect("tool names are unique in this catalog");

    let mut sub_agents = HashMap::new();
    sub_agents.insert(
        "general_agent".to_string(),
        Agent::new("general_agent", GENERAL_AGENT_INSTRUCTIONS)
            .with_tools(vec!["current_time".to_string(), "word_count".to_string()]),
    );
    sub_agents.insert(
        "research_agent".to_string(),
        Agent::new("research_agent", RESEARCH_AGENT_INSTRUCTIONS),
    );

    Catalog { tools, sub_agents }
}

/// The synthesis agent used on the triage graph's summary step.
#[must_use]
pub fn summary_agent() -> Agent {
    Agent::new("summary_agent", SUMMARY_INSTRUCTIONS)
}
