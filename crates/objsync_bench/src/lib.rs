//! Benchmark utilities.

#![warn(missing_docs)]

use objsync_engine::{
    DependencyGraph, ObjectSync, ObjectTranscoder, ResponseStatus, SharedDependencyGraph,
};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;

/// Transcoder that builds requests without doing any work.
///
/// The request is the number of entities in the batch.
#[derive(Debug, Clone, Copy)]
pub struct NullTranscoder {
    limit: usize,
}

impl NullTranscoder {
    /// Creates a transcoder with the given fetch limit.
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

impl ObjectTranscoder<u64> for NullTranscoder {
    type Request = usize;
    type Response = ResponseStatus;

    fn fetch_limit(&self) -> usize {
        self.limit
    }

    fn request_for(&mut self, _object: &u64) -> Option<usize> {
        Some(1)
    }

    fn request_for_batch(&mut self, objects: &HashSet<u64>) -> Option<usize> {
        Some(objects.len())
    }

    fn handle_response(&mut self, _response: &ResponseStatus, _object: &u64) {}

    fn handle_batch_response(&mut self, _response: &ResponseStatus, _objects: &HashSet<u64>) {}
}

/// Creates an engine with `count` pending entities.
pub fn loaded_engine(count: u64, limit: usize) -> ObjectSync<u64, NullTranscoder> {
    let mut engine = ObjectSync::new(NullTranscoder::new(limit));
    engine.synchronize_all(0..count);
    engine
}

/// Schedules and completes every pending batch with `status`.
///
/// Returns the number of batches processed.
pub fn drain(engine: &mut ObjectSync<u64, NullTranscoder>, status: ResponseStatus) -> usize {
    let mut batches = 0;
    while let Some(outbound) = engine.next_request() {
        engine.complete(outbound.batch, status);
        batches += 1;
    }
    batches
}

/// Generate entity ids in random order.
pub fn shuffled_ids(count: u64) -> Vec<u64> {
    let mut ids: Vec<u64> = (0..count).collect();
    ids.shuffle(&mut rand::thread_rng());
    ids
}

/// Generate `count` random edges between `dependents` entities and
/// `dependencies` dependencies.
pub fn random_edges(count: usize, dependents: u64, dependencies: u64) -> Vec<(u64, u64)> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| (rng.gen_range(0..dependents), rng.gen_range(0..dependencies)))
        .collect()
}

/// Builds a shared graph from `(dependent, dependency)` edges.
pub fn shared_graph<I>(edges: I) -> SharedDependencyGraph<u64, u64>
where
    I: IntoIterator<Item = (u64, u64)>,
{
    let mut graph = DependencyGraph::new();
    for (dependent, dependency) in edges {
        graph.add(dependent, dependency);
    }
    Arc::new(Mutex::new(graph))
}
