//! Invariant-checking harness for engine operation sequences.
//!
//! The harness applies [`EngineOp`]s to a real engine while keeping a small
//! model of which entities should still be tracked, and panics as soon as
//! the engine disagrees with the model.

use crate::fixtures::{shared_graph, TestEngine, TestResponse};
use crate::generators::EngineOp;
use objsync_engine::{Batch, ObjectTranscoder, ResponseStatus, SharedDependencyGraph, SyncEvent};
use std::collections::HashSet;
use std::sync::Arc;

/// Drives a [`TestEngine`] and checks it against a model.
pub struct EngineHarness {
    engine: TestEngine,
    graph: SharedDependencyGraph<u32, u32>,
    outstanding: Vec<Batch<u32>>,
    tracked: HashSet<u32>,
    limit: usize,
}

impl EngineHarness {
    /// Creates a harness whose transcoder has the given fetch limit.
    pub fn new(limit: usize) -> Self {
        let graph = shared_graph();
        let mut engine = TestEngine::new(limit);
        engine.add_dependency_graph(Arc::clone(&graph));
        Self {
            engine,
            graph,
            outstanding: Vec::new(),
            tracked: HashSet::new(),
            limit: limit.max(1),
        }
    }

    /// Returns the engine under test.
    pub fn engine(&self) -> &TestEngine {
        &self.engine
    }

    /// Returns the dependency graph registered with the engine.
    pub fn graph(&self) -> &SharedDependencyGraph<u32, u32> {
        &self.graph
    }

    /// Entities the model expects to be pending or in flight.
    pub fn tracked(&self) -> &HashSet<u32> {
        &self.tracked
    }

    /// Number of batches handed out and not yet completed.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    fn modelled_in_flight(&self) -> HashSet<u32> {
        self.outstanding
            .iter()
            .flat_map(|batch| batch.objects().iter().copied())
            .collect()
    }

    /// Applies one operation, asserting its immediate effects.
    pub fn apply(&mut self, op: &EngineOp) {
        match op {
            EngineOp::Synchronize(ids) => {
                let was_idle = self.tracked.is_empty();
                let finished = self.engine.delegate.count(SyncEvent::Finished);

                self.tracked.extend(ids.iter().copied());
                self.engine.synchronize_all(ids.iter().copied());

                if ids.is_empty() && was_idle {
                    assert_eq!(
                        self.engine.delegate.count(SyncEvent::Finished),
                        finished + 1,
                        "idle empty synchronize must report completion"
                    );
                }
            }
            EngineOp::Cancel(ids) => {
                let in_flight = self.modelled_in_flight();
                let mut cancelled = Vec::new();
                for id in ids {
                    if self.tracked.contains(id) && !in_flight.contains(id) {
                        self.tracked.remove(id);
                        cancelled.push(*id);
                    }
                }

                self.engine.cancel_all(ids.iter().copied());

                let graph = self.graph.lock();
                for id in cancelled {
                    assert!(
                        !graph.is_blocked(&id),
                        "cancelled entity {id} kept its dependencies"
                    );
                }
            }
            EngineOp::Schedule => {
                let Some(outbound) = self.engine.next_request() else {
                    if self.engine.transcoder().is_available() {
                        let graph = self.graph.lock();
                        for id in self.engine.pending() {
                            assert!(
                                graph.is_blocked(&id),
                                "entity {id} was eligible but nothing was scheduled"
                            );
                        }
                    }
                    return;
                };

                let batch = outbound.batch;
                assert!(!batch.is_empty(), "scheduled an empty batch");
                assert!(
                    batch.len() <= self.limit,
                    "batch of {} exceeds fetch limit {}",
                    batch.len(),
                    self.limit
                );
                let graph = self.graph.lock();
                for id in batch.objects() {
                    assert!(self.tracked.contains(id), "scheduled untracked entity {id}");
                    assert!(!graph.is_blocked(id), "scheduled blocked entity {id}");
                }
                drop(graph);
                self.outstanding.push(batch);
            }
            EngineOp::Complete { index, status } => {
                if self.outstanding.is_empty() {
                    return;
                }
                let batch = self.outstanding.swap_remove(index % self.outstanding.len());
                let ids = batch.objects().clone();
                let finished = self.engine.delegate.count(SyncEvent::Finished);

                self.engine.complete(batch, TestResponse::new(*status));

                match status {
                    ResponseStatus::Success | ResponseStatus::PermanentFailure => {
                        let graph = self.graph.lock();
                        for id in &ids {
                            self.tracked.remove(id);
                            assert!(!graph.is_blocked(id), "resolved entity {id} kept its edges");
                        }
                    }
                    ResponseStatus::TransientFailure | ResponseStatus::Expired => {
                        let pending = self.engine.pending();
                        assert!(ids.is_subset(&pending), "retried batch did not return to pending");
                    }
                }

                if !self.engine.is_syncing() {
                    assert_eq!(
                        self.engine.delegate.count(SyncEvent::Finished),
                        finished + 1,
                        "going idle must report completion"
                    );
                }
            }
            EngineOp::AddDependency {
                dependent,
                dependency,
            } => {
                self.graph.lock().add(*dependent, *dependency);
            }
            EngineOp::Release { dependency } => {
                self.graph
                    .lock()
                    .enumerate_and_remove(dependency, |_| true);
            }
            EngineOp::Expire { dependency } => {
                let in_flight = self.modelled_in_flight();
                let expected: HashSet<u32> = self
                    .graph
                    .lock()
                    .dependents(dependency)
                    .into_iter()
                    .filter(|id| self.tracked.contains(id) && !in_flight.contains(id))
                    .collect();
                let failed = self.engine.delegate.count(SyncEvent::Failed);

                let expired = self.engine.expire_dependents(&self.graph, dependency);

                assert_eq!(expired, expected, "expired the wrong entities");
                for id in &expired {
                    self.tracked.remove(id);
                }
                assert!(
                    self.graph.lock().dependents(dependency).is_empty(),
                    "expired dependency kept its edges"
                );
                let expected_failed = failed + usize::from(!expired.is_empty());
                assert_eq!(self.engine.delegate.count(SyncEvent::Failed), expected_failed);
            }
            EngineOp::SetAvailable(available) => {
                self.engine.transcoder_mut().set_available(*available);
            }
        }
    }

    /// Asserts the invariants that must hold between any two operations.
    pub fn check_invariants(&self) {
        let pending = self.engine.pending();
        let in_flight = self.engine.in_flight();

        assert!(
            pending.is_disjoint(&in_flight),
            "pending and in flight overlap: {:?}",
            pending.intersection(&in_flight).collect::<Vec<_>>()
        );
        assert_eq!(in_flight, self.modelled_in_flight(), "in flight != outstanding batches");

        let known: HashSet<u32> = pending.union(&in_flight).copied().collect();
        assert_eq!(known, self.tracked, "engine and model disagree on tracked entities");
        assert_eq!(self.engine.is_syncing(), !self.tracked.is_empty());
        assert_eq!(self.engine.outstanding_batches(), self.outstanding.len());
        assert!(self.graph.lock().is_consistent(), "dependency graph mirror broken");
    }

    /// Releases every dependency and completes everything successfully.
    ///
    /// Returns the number of scheduling rounds it took to go idle.
    pub fn settle(&mut self) -> usize {
        self.engine.transcoder_mut().set_available(true);
        self.graph.lock().clear();

        let mut rounds = 0;
        loop {
            while let Some(outbound) = self.engine.next_request() {
                self.outstanding.push(outbound.batch);
            }
            if self.outstanding.is_empty() {
                break;
            }
            rounds += 1;
            for batch in std::mem::take(&mut self.outstanding) {
                for id in batch.objects() {
                    self.tracked.remove(id);
                }
                self.engine.complete(batch, TestResponse::success());
            }
            self.check_invariants();
        }

        assert!(!self.engine.is_syncing(), "engine still busy after settling");
        rounds
    }
}
