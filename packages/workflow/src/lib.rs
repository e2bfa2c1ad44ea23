#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Superstep-driven executor graph.
//!
//! A [`WorkflowGraph`] composes [`Executor`]s (LLM agents, aggregators,
//! routers) into a directed graph. [`WorkflowGraph::run_stream`] drives a
//! Pregel-style superstep loop: each round runs every executor whose
//! envelope is ready, concurrently, then routes each output through the
//! matching [`EdgeGroup`]s to build the next round's envelopes. A round
//! that ends with no envelope reaching a terminal executor and no further
//! targets simply produces nothing further; a graph is expected to reach a
//! terminal executor well before `max_iterations`.

use std::collections::HashMap;
use std::sync::Arc;

use chatgraph_agent::AgentRunUpdate;
use futures::future::join_all;
use thiserror::Error;

/// A boxed, `Send` stream of [`WorkflowEvent`]s.
pub type BoxStream<T> = std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send>>;

/// Default superstep bound.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Errors from workflow construction or execution.
#[derive(Debug, Error, Clone)]
pub enum WorkflowError {
    /// A superstep counter exceeded `max_iterations`.
    #[error("workflow exceeded the iteration limit of {limit}")]
    IterationLimitExceeded {
        /// The configured bound.
        limit: u32,
    },

    /// An executor's `execute` call failed.
    #[error("executor '{executor}' failed: {message}")]
    ExecutorFailed {
        /// Failing executor's id.
        executor: String,
        /// Failure description.
        message: String,
    },

    /// Graph construction was invalid.
    #[error("invalid workflow graph: {message}")]
    Config {
        /// What was wrong.
        message: String,
    },
}

/// A message delivered to an executor: its input payload, the id of the
/// executor (or entry point) that produced it, and the superstep iteration
/// it was produced in.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The input payload.
    pub payload: serde_json::Value,
    /// Id of the executor (or `"__entry__"`) that produced this envelope.
    pub source: String,
    /// Superstep iteration this envelope was produced in.
    pub iteration: u32,
}

/// What an executor produced for one envelope.
#[derive(Debug, Clone)]
pub struct ExecutorOutput {
    /// The payload to route downstream, or the final value if `terminal`.
    pub payload: serde_json::Value,
    /// When true, routing stops here and `payload` becomes the workflow's
    /// [`WorkflowEvent::WorkflowOutput`].
    pub terminal: bool,
    /// Incremental text/tool-call updates produced while computing
    /// `payload`, replayed as [`WorkflowEvent::AgentRunUpdate`] for
    /// executors where [`Executor::output_response`] is `true`.
    pub updates: Vec<AgentRunUpdate>,
}

impl ExecutorOutput {
    /// A non-terminal output with no streaming updates.
    #[must_use]
    pub fn routed(payload: serde_json::Value) -> Self {
        Self {
            payload,
            terminal: false,
            updates: Vec::new(),
        }
    }

    /// A terminal output with no streaming updates.
    #[must_use]
    pub fn terminal(payload: serde_json::Value) -> Self {
        Self {
            payload,
            terminal: true,
            updates: Vec::new(),
        }
    }
}

/// A node in the workflow graph.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    /// Stable id used in edges and events.
    fn id(&self) -> &str;

    /// Whether this executor's updates are relayed to the UI as `stream`
    /// events. Discovered at graph-construction time, not hard-coded.
    fn output_response(&self) -> bool {
        false
    }

    /// Processes one envelope.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::ExecutorFailed`] (or a variant the executor
    /// chooses) on failure; the engine cancels the rest of the superstep.
    async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError>;
}

/// A function choosing, from an executor's output, which of `targets` to
/// route to.
pub type Selector =
    Arc<dyn Fn(&serde_json::Value, &[String]) -> Vec<String> + Send + Sync>;

/// A set of edges leaving one executor, resolved by `selector` at runtime.
#[derive(Clone)]
pub struct EdgeGroup {
    /// Source executor id.
    pub source: String,
    /// Candidate target executor ids.
    pub targets: Vec<String>,
    /// Chooses the subset of `targets` to route to, given the source's
    /// output payload.
    pub selector: Selector,
}

/// An unconditional edge: the selector always returns the single target.
#[must_use]
pub fn plain_edge(source: impl Into<String>, target: impl Into<String>) -> EdgeGroup {
    let target = target.into();
    EdgeGroup {
        source: source.into(),
        targets: vec![target.clone()],
        selector: Arc::new(move |_, _| vec![target.clone()]),
    }
}

/// A conditional edge group: `selector(output, targets)` picks the routed
/// subset, enabling both branching (one of many) and fan-out (several of
/// many).
#[must_use]
pub fn multi_selection_edge_group(
    source: impl Into<String>,
    targets: Vec<String>,
    selector: Selector,
) -> EdgeGroup {
    EdgeGroup {
        source: source.into(),
        targets,
        selector,
    }
}

/// An event from a running workflow.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A streaming update from an `output_response` executor.
    AgentRunUpdate(AgentRunUpdate),
    /// An executor started processing an envelope.
    ExecutorInvoked {
        /// Executor id.
        id: String,
    },
    /// An executor finished processing an envelope.
    ExecutorCompleted {
        /// Executor id.
        id: String,
    },
    /// An executor failed.
    ExecutorFailed {
        /// Executor id.
        id: String,
        /// Failure description.
        message: String,
    },
    /// A coarse status update (e.g. `"superstep 2"`).
    WorkflowStatus(String),
    /// The workflow's final value.
    WorkflowOutput(serde_json::Value),
    /// The workflow failed.
    WorkflowFailed(WorkflowError),
}

/// Builds a [`WorkflowGraph`], checking at `build()` time that every
/// `output_response` executor has been marked so via
/// [`WorkflowGraphBuilder::mark_yields_output`].
pub struct WorkflowGraphBuilder {
    executors: HashMap<String, Arc<dyn Executor>>,
    edges: Vec<EdgeGroup>,
    yields_output: std::collections::HashSet<String>,
    max_iterations: u32,
}

impl WorkflowGraphBuilder {
    /// Starts a new builder with [`DEFAULT_MAX_ITERATIONS`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            edges: Vec::new(),
            yields_output: std::collections::HashSet::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Registers an executor.
    #[must_use]
    pub fn add_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executors.insert(executor.id().to_string(), executor);
        self
    }

    /// Adds an unconditional edge.
    #[must_use]
    pub fn add_edge(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.edges.push(plain_edge(source, target));
        self
    }

    /// Adds a selector-resolved edge group.
    #[must_use]
    pub fn add_conditional_edge(mut self, group: EdgeGroup) -> Self {
        self.edges.push(group);
        self
    }

    /// Marks an executor id as a construction-time-confirmed streaming
    /// terminal, satisfying the invariant `build()` checks.
    #[must_use]
    pub fn mark_yields_output(mut self, id: impl Into<String>) -> Self {
        self.yields_output.insert(id.into());
        self
    }

    /// Overrides the superstep bound.
    #[must_use]
    pub const fn max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    /// Finalizes the graph.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Config`] if any executor with
    /// `output_response() == true` was not passed to
    /// [`WorkflowGraphBuilder::mark_yields_output`].
    pub fn build(self) -> Result<WorkflowGraph, WorkflowError> {
        for executor in self.executors.values() {
            if executor.output_response() && !self.yields_output.contains(executor.id()) {
                return Err(WorkflowError::Config {
                    message: format!(
                        "executor '{}' streams to the UI but was not marked with mark_yields_output",
                        executor.id()
                    ),
                });
            }
        }

        Ok(WorkflowGraph {
            executors: self.executors,
            edges: self.edges,
            max_iterations: self.max_iterations,
        })
    }
}

impl Default for WorkflowGraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A built, runnable workflow graph.
pub struct WorkflowGraph {
    executors: HashMap<String, Arc<dyn Executor>>,
    edges: Vec<EdgeGroup>,
    max_iterations: u32,
}

impl WorkflowGraph {
    /// Runs the graph starting at `entry` with `input`, yielding
    /// [`WorkflowEvent`]s as the superstep loop progresses.
    pub fn run_stream(&self, entry: &str, input: serde_json::Value) -> BoxStream<WorkflowEvent> {
        let executors = self.executors.clone();
        let edges = self.edges.clone();
        let max_iterations = self.max_iterations;
        let entry = entry.to_string();

        let stream = async_stream::stream! {
            let mut ready: Vec<(String, Envelope)> = vec![(
                entry,
                Envelope {
                    payload: input,
                    source: "__entry__".to_string(),
                    iteration: 0,
                },
            )];

            for iteration in 0..max_iterations {
                if ready.is_empty() {
                    return;
                }

                yield WorkflowEvent::WorkflowStatus(format!("superstep {iteration}"));

                for (id, _) in &ready {
                    yield WorkflowEvent::ExecutorInvoked { id: id.clone() };
                }

                let futures = ready.into_iter().map(|(id, envelope)| {
                    let executors = &executors;
                    async move {
                        let Some(executor) = executors.get(&id) else {
                            return (
                                id.clone(),
                                Err(WorkflowError::Config {
                                    message: format!("no executor registered for id '{id}'"),
                                }),
                            );
                        };
                        (id, executor.execute(envelope).await)
                    }
                });
                let results = join_all(futures).await;

                let mut next_ready = Vec::new();
                let mut failed = false;

                for (id, result) in results {
                    match result {
                        Ok(output) => {
                            let executor_streams = executors
                                .get(&id)
                                .is_some_and(|e| e.output_response());
                            if executor_streams {
                                for update in output.updates {
                                    yield WorkflowEvent::AgentRunUpdate(update);
                                }
                            }

                            yield WorkflowEvent::ExecutorCompleted { id: id.clone() };

                            if output.terminal {
                                yield WorkflowEvent::WorkflowOutput(output.payload);
                                return;
                            }

                            for edge in edges.iter().filter(|e| e.source == id) {
                                for target in (edge.selector)(&output.payload, &edge.targets) {
                                    next_ready.push((
                                        target,
                                        Envelope {
                                            payload: output.payload.clone(),
                                            source: id.clone(),
                                            iteration: iteration + 1,
                                        },
                                    ));
                                }
                            }
                        }
                        Err(e) => {
                            yield WorkflowEvent::ExecutorFailed {
                                id: id.clone(),
                                message: e.to_string(),
                            };
                            yield WorkflowEvent::WorkflowFailed(e);
                            failed = true;
                        }
                    }
                }

                if failed {
                    return;
                }

                ready = next_ready;
            }

            yield WorkflowEvent::WorkflowFailed(WorkflowError::IterationLimitExceeded {
                limit: max_iterations,
            });
        };

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough {
        id: String,
    }

    #[async_trait::async_trait]
    impl Executor for Passthrough {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
            Ok(ExecutorOutput::routed(envelope.payload))
        }
    }

    struct Terminal {
        id: String,
    }

    #[async_trait::async_trait]
    impl Executor for Terminal {
        fn id(&self) -> &str {
            &self.id
        }

        fn output_response(&self) -> bool {
            true
        }

        async fn execute(&self, envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
            Ok(ExecutorOutput::terminal(envelope.payload))
        }
    }

    struct Failing {
        id: String,
    }

    #[async_trait::async_trait]
    impl Executor for Failing {
        fn id(&self) -> &str {
            &self.id
        }

        async fn execute(&self, _envelope: Envelope) -> Result<ExecutorOutput, WorkflowError> {
            Err(WorkflowError::ExecutorFailed {
                executor: self.id.clone(),
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn routes_through_two_hops_to_terminal() {
        use futures::StreamExt as _;

        let graph = WorkflowGraphBuilder::new()
            .add_executor(Arc::new(Passthrough {
                id: "a".to_string(),
            }))
            .add_executor(Arc::new(Terminal {
                id: "b".to_string(),
            }))
            .add_edge("a", "b")
            .mark_yields_output("b")
            .build()
            .unwrap();

        let events: Vec<_> = graph
            .run_stream("a", serde_json::json!({"q": "hi"}))
            .collect()
            .await;

        assert!(events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::WorkflowOutput(v) if v["q"] == "hi")));
    }

    #[tokio::test]
    async fn build_rejects_unmarked_streaming_executor() {
        let result = WorkflowGraphBuilder::new()
            .add_executor(Arc::new(Terminal {
                id: "b".to_string(),
            }))
            .build();

        assert!(matches!(result, Err(WorkflowError::Config { .. })));
    }

    #[tokio::test]
    async fn executor_failure_yields_workflow_failed() {
        use futures::StreamExt as _;

        let graph = WorkflowGraphBuilder::new()
            .add_executor(Arc::new(Failing {
                id: "a".to_string(),
            }))
            .build()
            .unwrap();

        let events: Vec<_> = graph
            .run_stream("a", serde_json::json!({}))
            .collect()
            .await;

        assert!(events
            .iter()
            .any(|e| matches!(e, WorkflowEvent::WorkflowFailed(_))));
    }

    #[tokio::test]
    async fn iteration_limit_is_enforced() {
        use futures::StreamExt as _;

        let graph = WorkflowGraphBuilder::new()
            .add_executor(Arc::new(Passthrough {
                id: "loop".to_string(),
            }))
            .add_edge("loop", "loop")
            .max_iterations(3)
            .build()
            .unwrap();

        let events: Vec<_> = graph.run_stream("loop", serde_json::json!({})).collect().await;

        assert!(events.iter().any(|e| matches!(
            e,
            WorkflowEvent::WorkflowFailed(WorkflowError::IterationLimitExceeded { limit: 3 })
        )));
    }
}
