//! Scripted scenario vectors.
//!
//! A scenario is a list of steps with expectations, stored as JSON so new
//! cases can be added without writing Rust. Batch contents are unordered,
//! so expectations on scheduling compare sizes unless every candidate ends
//! up in the same batch.

use crate::fixtures::{shared_graph, RecordingTranscoder, TestEngine, TestResponse};
use objsync_engine::{Batch, ResponseStatus, SharedDependencyGraph, SyncEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome reported for a batch in a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// See [`ResponseStatus::Success`].
    Success,
    /// See [`ResponseStatus::PermanentFailure`].
    Rejected,
    /// See [`ResponseStatus::TransientFailure`].
    Transient,
    /// See [`ResponseStatus::Expired`].
    Expired,
}

impl From<Outcome> for ResponseStatus {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => ResponseStatus::Success,
            Outcome::Rejected => ResponseStatus::PermanentFailure,
            Outcome::Transient => ResponseStatus::TransientFailure,
            Outcome::Expired => ResponseStatus::Expired,
        }
    }
}

/// Delegate callback names used in expectations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedEvent {
    /// [`SyncEvent::Finished`].
    Finished,
    /// [`SyncEvent::Failed`].
    Failed,
    /// [`SyncEvent::RequestsAvailable`].
    RequestsAvailable,
}

impl From<ExpectedEvent> for SyncEvent {
    fn from(event: ExpectedEvent) -> Self {
        match event {
            ExpectedEvent::Finished => SyncEvent::Finished,
            ExpectedEvent::Failed => SyncEvent::Failed,
            ExpectedEvent::RequestsAvailable => SyncEvent::RequestsAvailable,
        }
    }
}

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Synchronize entities.
    Synchronize {
        /// Entities to synchronize.
        ids: Vec<u32>,
    },
    /// Cancel entities.
    Cancel {
        /// Entities to cancel.
        ids: Vec<u32>,
    },
    /// Ask for the next request.
    Schedule {
        /// Expected batch size; 0 means no request.
        expect_size: usize,
    },
    /// Complete the oldest outstanding batch.
    Complete {
        /// Outcome reported by the remote.
        outcome: Outcome,
    },
    /// Register a dependency edge.
    Depend {
        /// Entity that waits.
        dependent: u32,
        /// What it waits on.
        dependency: u32,
    },
    /// Release every dependent of a dependency.
    Release {
        /// The resolved dependency.
        dependency: u32,
    },
    /// Check the working set and delegate events.
    Expect {
        /// Exact pending set, if given.
        #[serde(default)]
        pending: Option<Vec<u32>>,
        /// Exact in-flight set, if given.
        #[serde(default)]
        in_flight: Option<Vec<u32>>,
        /// Pending set size, if given.
        #[serde(default)]
        pending_count: Option<usize>,
        /// Delegate events since the previous `expect`, if given.
        #[serde(default)]
        events: Option<Vec<ExpectedEvent>>,
    },
}

/// A named scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique identifier.
    pub id: String,
    /// Human-readable description.
    pub description: String,
    /// Transcoder fetch limit.
    pub fetch_limit: usize,
    /// Steps to replay.
    pub steps: Vec<Step>,
}

/// Why a scenario failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioFailure {
    /// Scenario identifier.
    pub scenario: String,
    /// Index of the failing step.
    pub step: usize,
    /// What went wrong.
    pub message: String,
}

impl std::fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} step {}: {}", self.scenario, self.step, self.message)
    }
}

fn as_set(ids: &[u32]) -> HashSet<u32> {
    ids.iter().copied().collect()
}

struct Replay {
    engine: TestEngine,
    graph: SharedDependencyGraph<u32, u32>,
    outstanding: Vec<Batch<u32>>,
    seen_events: usize,
}

impl Replay {
    fn new(fetch_limit: usize) -> Self {
        let graph = shared_graph();
        let mut engine = TestEngine::with_transcoder(RecordingTranscoder::new(fetch_limit));
        engine.add_dependency_graph(Arc::clone(&graph));
        Self {
            engine,
            graph,
            outstanding: Vec::new(),
            seen_events: 0,
        }
    }

    fn step(&mut self, step: &Step) -> Result<(), String> {
        match step {
            Step::Synchronize { ids } => self.engine.synchronize_all(ids.iter().copied()),
            Step::Cancel { ids } => self.engine.cancel_all(ids.iter().copied()),
            Step::Schedule { expect_size } => {
                let size = match self.engine.next_request() {
                    Some(outbound) => {
                        let size = outbound.batch.len();
                        self.outstanding.push(outbound.batch);
                        size
                    }
                    None => 0,
                };
                if size != *expect_size {
                    return Err(format!("expected batch of {expect_size}, got {size}"));
                }
            }
            Step::Complete { outcome } => {
                if self.outstanding.is_empty() {
                    return Err("no outstanding batch to complete".into());
                }
                let batch = self.outstanding.remove(0);
                self.engine
                    .complete(batch, TestResponse::new((*outcome).into()));
            }
            Step::Depend {
                dependent,
                dependency,
            } => self.graph.lock().add(*dependent, *dependency),
            Step::Release { dependency } => {
                self.graph.lock().enumerate_and_remove(dependency, |_| true);
            }
            Step::Expect {
                pending,
                in_flight,
                pending_count,
                events,
            } => {
                let actual_pending = self.engine.pending();
                if let Some(expected) = pending {
                    if actual_pending != as_set(expected) {
                        return Err(format!("pending {actual_pending:?}, expected {expected:?}"));
                    }
                }
                if let Some(expected) = in_flight {
                    let actual = self.engine.in_flight();
                    if actual != as_set(expected) {
                        return Err(format!("in flight {actual:?}, expected {expected:?}"));
                    }
                }
                if let Some(expected) = pending_count {
                    if actual_pending.len() != *expected {
                        return Err(format!(
                            "{} pending, expected {expected}",
                            actual_pending.len()
                        ));
                    }
                }
                let recorded = self.engine.delegate.events();
                if let Some(expected) = events {
                    let expected: Vec<SyncEvent> = expected.iter().map(|e| (*e).into()).collect();
                    let actual = &recorded[self.seen_events..];
                    if actual != expected.as_slice() {
                        return Err(format!("events {actual:?}, expected {expected:?}"));
                    }
                }
                self.seen_events = recorded.len();
            }
        }
        Ok(())
    }
}

/// Replays a scenario against a fresh engine.
pub fn run_scenario(scenario: &Scenario) -> Result<(), ScenarioFailure> {
    let mut replay = Replay::new(scenario.fetch_limit);
    for (index, step) in scenario.steps.iter().enumerate() {
        replay.step(step).map_err(|message| ScenarioFailure {
            scenario: scenario.id.clone(),
            step: index,
            message,
        })?;
    }
    Ok(())
}

/// Parses scenarios from a JSON array.
pub fn parse_scenarios(json: &str) -> serde_json::Result<Vec<Scenario>> {
    serde_json::from_str(json)
}

/// Built-in scenarios covering the engine's documented behaviour.
pub fn builtin_scenarios() -> Vec<Scenario> {
    use Step::*;

    fn expect_pending(ids: &[u32]) -> Step {
        Expect {
            pending: Some(ids.to_vec()),
            in_flight: None,
            pending_count: None,
            events: None,
        }
    }

    fn expect_events(events: &[ExpectedEvent]) -> Step {
        Expect {
            pending: None,
            in_flight: None,
            pending_count: None,
            events: Some(events.to_vec()),
        }
    }

    vec![
        Scenario {
            id: "idle_empty_synchronize".into(),
            description: "Synchronizing nothing while idle reports completion once".into(),
            fetch_limit: 1,
            steps: vec![
                Synchronize { ids: vec![] },
                expect_events(&[ExpectedEvent::Finished]),
            ],
        },
        Scenario {
            id: "synchronize_then_cancel".into(),
            description: "Cancelling before scheduling undoes a synchronize".into(),
            fetch_limit: 1,
            steps: vec![
                Synchronize { ids: vec![1] },
                Cancel { ids: vec![1] },
                expect_pending(&[]),
                Schedule { expect_size: 0 },
            ],
        },
        Scenario {
            id: "fetch_limit_batches".into(),
            description: "Three entities with a limit of two go out as 2 then 1".into(),
            fetch_limit: 2,
            steps: vec![
                Synchronize { ids: vec![1, 2, 3] },
                Schedule { expect_size: 2 },
                Expect {
                    pending: None,
                    in_flight: None,
                    pending_count: Some(1),
                    events: None,
                },
                Schedule { expect_size: 1 },
                expect_pending(&[]),
            ],
        },
        Scenario {
            id: "transient_retry".into(),
            description: "A transient failure returns the whole batch to pending".into(),
            fetch_limit: 2,
            steps: vec![
                Synchronize { ids: vec![1, 2] },
                Schedule { expect_size: 2 },
                Complete {
                    outcome: Outcome::Transient,
                },
                Expect {
                    pending: Some(vec![1, 2]),
                    in_flight: Some(vec![]),
                    pending_count: None,
                    events: None,
                },
            ],
        },
        Scenario {
            id: "cancel_in_flight".into(),
            description: "Cancelling an in-flight entity leaves it in flight".into(),
            fetch_limit: 1,
            steps: vec![
                Synchronize { ids: vec![7] },
                Schedule { expect_size: 1 },
                Cancel { ids: vec![7] },
                Expect {
                    pending: Some(vec![]),
                    in_flight: Some(vec![7]),
                    pending_count: None,
                    events: None,
                },
            ],
        },
        Scenario {
            id: "rejection_then_idle".into(),
            description: "A rejected last batch reports failure then completion".into(),
            fetch_limit: 1,
            steps: vec![
                Synchronize { ids: vec![4] },
                expect_events(&[ExpectedEvent::RequestsAvailable]),
                Schedule { expect_size: 1 },
                Complete {
                    outcome: Outcome::Rejected,
                },
                expect_events(&[ExpectedEvent::Failed, ExpectedEvent::Finished]),
            ],
        },
        Scenario {
            id: "dependency_release".into(),
            description: "Dependents wait until their dependency is released".into(),
            fetch_limit: 4,
            steps: vec![
                Depend {
                    dependent: 1,
                    dependency: 100,
                },
                Depend {
                    dependent: 3,
                    dependency: 100,
                },
                Synchronize { ids: vec![1, 2, 3] },
                Schedule { expect_size: 1 },
                Schedule { expect_size: 0 },
                Release { dependency: 100 },
                Schedule { expect_size: 2 },
                Expect {
                    pending: Some(vec![]),
                    in_flight: Some(vec![1, 2, 3]),
                    pending_count: None,
                    events: None,
                },
            ],
        },
    ]
}
