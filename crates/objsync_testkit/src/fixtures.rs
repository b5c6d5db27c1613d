//! Test fixtures.
//!
//! Provides a transcoder and a delegate that record everything the engine
//! asks of them, plus a record type for source and store tests.

use objsync_engine::{
    DependencyGraph, ModifiedKeys, ObjectSync, ObjectTranscoder, Record, ResponseStatus,
    SharedDependencyGraph, SyncDelegate, SyncEvent, TransportResponse,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Request built by [`RecordingTranscoder`]: the batch's entities, sorted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestRequest {
    /// Entities covered by the request.
    pub ids: Vec<u32>,
}

/// Response consumed by [`RecordingTranscoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestResponse {
    /// Outcome reported by the simulated remote.
    pub status: ResponseStatus,
}

impl TestResponse {
    /// Creates a response with `status`.
    pub fn new(status: ResponseStatus) -> Self {
        Self { status }
    }

    /// A successful response.
    pub fn success() -> Self {
        Self::new(ResponseStatus::Success)
    }

    /// A permanent rejection.
    pub fn rejected() -> Self {
        Self::new(ResponseStatus::PermanentFailure)
    }

    /// A retryable failure.
    pub fn transient() -> Self {
        Self::new(ResponseStatus::TransientFailure)
    }

    /// An expired request.
    pub fn expired() -> Self {
        Self::new(ResponseStatus::Expired)
    }
}

impl TransportResponse for TestResponse {
    fn status(&self) -> ResponseStatus {
        self.status
    }
}

/// Everything a [`RecordingTranscoder`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct TranscoderLog {
    /// Requests built, in order.
    pub requests: Vec<TestRequest>,
    /// Responses handled, with the entities they were handled for.
    pub responses: Vec<(ResponseStatus, Vec<u32>)>,
    /// Number of calls to the single-entity methods.
    pub single_calls: usize,
    /// Number of calls to the batch-shaped methods.
    pub batch_calls: usize,
}

impl TranscoderLog {
    /// Entities whose response was handled with `status`.
    pub fn handled_with(&self, status: ResponseStatus) -> HashSet<u32> {
        self.responses
            .iter()
            .filter(|(s, _)| *s == status)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}

/// A transcoder whose behaviour is configured per test and whose calls are
/// logged to a shared [`TranscoderLog`].
#[derive(Debug, Clone)]
pub struct RecordingTranscoder {
    limit: usize,
    declined: HashSet<u32>,
    available: bool,
    retry_on_expiration: bool,
    resend: bool,
    log: Arc<Mutex<TranscoderLog>>,
}

impl RecordingTranscoder {
    /// Creates a transcoder with the given fetch limit.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            declined: HashSet::new(),
            available: true,
            retry_on_expiration: true,
            resend: true,
            log: Arc::new(Mutex::new(TranscoderLog::default())),
        }
    }

    /// Refuses to build requests containing any of `ids`.
    pub fn with_declined(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.declined.extend(ids);
        self
    }

    /// Sets whether expired requests are retried.
    pub fn with_retry_on_expiration(mut self, retry: bool) -> Self {
        self.retry_on_expiration = retry;
        self
    }

    /// Sets whether transient failures are resent.
    pub fn with_resend(mut self, resend: bool) -> Self {
        self.resend = resend;
        self
    }

    /// Pauses or resumes request building.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Stops declining `id`.
    pub fn accept(&mut self, id: u32) {
        self.declined.remove(&id);
    }

    /// Returns the shared log.
    pub fn log(&self) -> Arc<Mutex<TranscoderLog>> {
        Arc::clone(&self.log)
    }

    /// Returns a snapshot of the log.
    pub fn snapshot(&self) -> TranscoderLog {
        self.log.lock().clone()
    }

    fn build(&self, ids: impl IntoIterator<Item = u32>) -> Option<TestRequest> {
        let mut ids: Vec<u32> = ids.into_iter().collect();
        if ids.iter().any(|id| self.declined.contains(id)) {
            return None;
        }
        ids.sort_unstable();
        let request = TestRequest { ids };
        self.log.lock().requests.push(request.clone());
        Some(request)
    }
}

fn sorted_ids(objects: &HashSet<u32>) -> Vec<u32> {
    let mut ids: Vec<u32> = objects.iter().copied().collect();
    ids.sort_unstable();
    ids
}

impl ObjectTranscoder<u32> for RecordingTranscoder {
    type Request = TestRequest;
    type Response = TestResponse;

    fn fetch_limit(&self) -> usize {
        self.limit
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn should_retry_on_expiration(&self) -> bool {
        self.retry_on_expiration
    }

    fn request_for(&mut self, object: &u32) -> Option<TestRequest> {
        self.log.lock().single_calls += 1;
        self.build([*object])
    }

    fn request_for_batch(&mut self, objects: &HashSet<u32>) -> Option<TestRequest> {
        self.log.lock().batch_calls += 1;
        self.build(objects.iter().copied())
    }

    fn handle_response(&mut self, response: &TestResponse, object: &u32) {
        let mut log = self.log.lock();
        log.single_calls += 1;
        log.responses.push((response.status, vec![*object]));
    }

    fn handle_batch_response(&mut self, response: &TestResponse, objects: &HashSet<u32>) {
        let mut log = self.log.lock();
        log.batch_calls += 1;
        log.responses.push((response.status, sorted_ids(objects)));
    }

    fn should_try_to_resend(&self, _objects: &HashSet<u32>, _response: &TestResponse) -> bool {
        self.resend
    }
}

/// A delegate that appends every callback to a shared list.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelegate {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl RecordingDelegate {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded events.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Number of times `event` was recorded.
    pub fn count(&self, event: SyncEvent) -> usize {
        self.events.lock().iter().filter(|e| **e == event).count()
    }

    /// Forgets recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl SyncDelegate for RecordingDelegate {
    fn did_finish_syncing_all_objects(&mut self) {
        self.events.lock().push(SyncEvent::Finished);
    }

    fn did_fail_to_sync_all_objects(&mut self) {
        self.events.lock().push(SyncEvent::Failed);
    }

    fn new_requests_available(&mut self) {
        self.events.lock().push(SyncEvent::RequestsAvailable);
    }
}

/// A record for source and store tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRecord {
    /// Identity.
    pub id: u32,
    /// Whether the record should be synchronized.
    pub needs_sync: bool,
    /// Keys modified locally and not yet pushed.
    pub modified: HashSet<String>,
}

impl TestRecord {
    /// Creates a record that does not need syncing.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            needs_sync: false,
            modified: HashSet::new(),
        }
    }

    /// Marks the record as needing a sync.
    pub fn needing_sync(mut self) -> Self {
        self.needs_sync = true;
        self
    }

    /// Marks `key` as modified.
    pub fn with_modified(mut self, key: impl Into<String>) -> Self {
        self.modified.insert(key.into());
        self
    }
}

impl Record for TestRecord {
    type Id = u32;

    fn id(&self) -> u32 {
        self.id
    }
}

impl ModifiedKeys for TestRecord {
    fn has_modified_key(&self, key: &str) -> bool {
        self.modified.contains(key)
    }
}

/// Creates an empty shared dependency graph.
pub fn shared_graph<D>() -> SharedDependencyGraph<u32, D>
where
    D: Eq + std::hash::Hash + Clone,
{
    Arc::new(Mutex::new(DependencyGraph::new()))
}

/// An engine over a [`RecordingTranscoder`] wired to a [`RecordingDelegate`].
pub struct TestEngine {
    /// The engine.
    pub engine: ObjectSync<u32, RecordingTranscoder>,
    /// Delegate callbacks.
    pub delegate: RecordingDelegate,
    /// Transcoder calls.
    pub log: Arc<Mutex<TranscoderLog>>,
}

impl TestEngine {
    /// Creates an engine with the given fetch limit.
    pub fn new(limit: usize) -> Self {
        Self::with_transcoder(RecordingTranscoder::new(limit))
    }

    /// Creates an engine around a preconfigured transcoder.
    pub fn with_transcoder(transcoder: RecordingTranscoder) -> Self {
        let log = transcoder.log();
        let delegate = RecordingDelegate::new();
        let mut engine = ObjectSync::new(transcoder);
        engine.set_delegate(delegate.clone());
        Self {
            engine,
            delegate,
            log,
        }
    }
}

impl std::ops::Deref for TestEngine {
    type Target = ObjectSync<u32, RecordingTranscoder>;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl std::ops::DerefMut for TestEngine {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}
