//! Concrete workflow graphs built atop [`chatgraph_workflow`] and
//! [`chatgraph_agent`]: the triage (single dispatch round) and dynamic
//! (multi-step plan/review loop) assistant flows.

mod agent_executor;
mod common;
pub mod dynamic;
pub mod schemas;
pub mod triage;

pub use dynamic::{build as build_dynamic, DynamicConfig};
pub use triage::{build as build_triage, TriageConfig};
