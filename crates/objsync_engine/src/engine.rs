//! Object sync state machine.

use crate::config::SyncConfig;
use crate::delegate::SyncDelegate;
use crate::entity::Entity;
use crate::error::{SyncError, SyncResult};
use crate::filter::{DependencyFilter, DependencyTracker, ObjectFilter, SharedDependencyGraph};
use crate::source::{ObjectSource, Publisher, SourceEvent};
use crate::transcoder::{ObjectTranscoder, ResponseStatus, TransportResponse};
use crate::transport::CompletionSender;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

static NEXT_ENGINE: AtomicU64 = AtomicU64::new(0);

/// Identifies a scheduled batch.
///
/// Ids carry the identity of the engine that issued them, so a batch is
/// only ever accepted by that engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId {
    engine: u64,
    seq: u64,
}

impl BatchId {
    /// Returns the per-engine sequence number.
    pub fn as_u64(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.seq)
    }
}

/// Entities sent together in one request.
///
/// A batch can only be created by [`ObjectSync::next_request`] and is
/// consumed by [`ObjectSync::complete`], so each one is reconciled once.
#[derive(Debug)]
pub struct Batch<E> {
    id: BatchId,
    objects: HashSet<E>,
}

impl<E: Entity> Batch<E> {
    /// Returns the batch identifier.
    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Returns the entities in the batch.
    pub fn objects(&self) -> &HashSet<E> {
        &self.objects
    }

    /// Number of entities in the batch.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Returns true if the batch is empty. Scheduled batches never are.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Returns true if `object` is part of the batch.
    pub fn contains(&self, object: &E) -> bool {
        self.objects.contains(object)
    }
}

/// A request ready to be handed to the transport, with the batch it covers.
#[derive(Debug)]
pub struct OutboundRequest<E, R> {
    /// The batch to hand back to [`ObjectSync::complete`].
    pub batch: Batch<E>,
    /// The transcoder-built request.
    pub request: R,
}

impl<E, R> OutboundRequest<E, R> {
    /// Splits into batch and request.
    pub fn into_parts(self) -> (Batch<E>, R) {
        (self.batch, self.request)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Batches handed out by `next_request`.
    pub batches_scheduled: u64,
    /// Batches returned to pending after a transient failure or expiry.
    pub batches_retried: u64,
    /// Entities resolved successfully.
    pub entities_synced: u64,
    /// Entities resolved with an error.
    pub entities_failed: u64,
    /// Times the transcoder declined to build a request.
    pub structural_failures: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

type CompletionHandler<R> = Box<dyn FnOnce(SyncResult<()>, Option<&R>) + Send>;
type ScheduledHandler<E> = Box<dyn FnMut(&E) + Send>;
type CompletedHandler<E> = Box<dyn FnMut(&E, &SyncResult<()>) + Send>;

/// Synchronizes entities using configurable sources, filters and a
/// transcoder.
///
/// Every entity the engine knows about is either pending (waiting to be
/// sent) or in flight (part of an outstanding batch), never both.
/// Entities move from pending to in flight in [`next_request`] and leave
/// in flight in [`complete`].
///
/// [`next_request`]: ObjectSync::next_request
/// [`complete`]: ObjectSync::complete
pub struct ObjectSync<E: Entity, T: ObjectTranscoder<E>> {
    config: SyncConfig,
    transcoder: T,
    pending: HashSet<E>,
    in_flight: HashSet<E>,
    outstanding: HashSet<BatchId>,
    attempts: HashMap<E, u32>,
    filters: Vec<Box<dyn ObjectFilter<E> + Send>>,
    dependency_trackers: Vec<Box<dyn DependencyTracker<E>>>,
    delegate: Option<Box<dyn SyncDelegate>>,
    completion_handlers: HashMap<E, Vec<CompletionHandler<T::Response>>>,
    scheduled_handler: Option<ScheduledHandler<E>>,
    completed_handler: Option<CompletedHandler<E>>,
    events_tx: Sender<SourceEvent<E>>,
    events_rx: Receiver<SourceEvent<E>>,
    completions_tx: Sender<(Batch<E>, T::Response)>,
    completions_rx: Receiver<(Batch<E>, T::Response)>,
    instance: u64,
    next_batch_id: u64,
    stats: SyncStats,
}

impl<E: Entity, T: ObjectTranscoder<E>> ObjectSync<E, T> {
    /// Creates an engine with the default configuration.
    pub fn new(transcoder: T) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let (completions_tx, completions_rx) = mpsc::channel();
        Self {
            config: SyncConfig::default(),
            transcoder,
            pending: HashSet::new(),
            in_flight: HashSet::new(),
            outstanding: HashSet::new(),
            attempts: HashMap::new(),
            filters: Vec::new(),
            dependency_trackers: Vec::new(),
            delegate: None,
            completion_handlers: HashMap::new(),
            scheduled_handler: None,
            completed_handler: None,
            events_tx,
            events_rx,
            completions_tx,
            completions_rx,
            instance: NEXT_ENGINE.fetch_add(1, Ordering::Relaxed),
            next_batch_id: 0,
            stats: SyncStats::default(),
        }
    }

    /// Creates an engine with a validated configuration.
    pub fn with_config(transcoder: T, config: SyncConfig) -> SyncResult<Self> {
        config.validate()?;
        let mut engine = Self::new(transcoder);
        engine.config = config;
        Ok(engine)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the transcoder.
    pub fn transcoder(&self) -> &T {
        &self.transcoder
    }

    /// Returns the transcoder mutably.
    pub fn transcoder_mut(&mut self) -> &mut T {
        &mut self.transcoder
    }

    /// Sets the delegate, replacing any previous one.
    pub fn set_delegate<D: SyncDelegate + 'static>(&mut self, delegate: D) {
        self.delegate = Some(Box::new(delegate));
    }

    /// Registers a handler called for each entity placed into a batch.
    pub fn on_scheduled<F>(&mut self, handler: F)
    where
        F: FnMut(&E) + Send + 'static,
    {
        self.scheduled_handler = Some(Box::new(handler));
    }

    /// Registers a handler called for each entity that finishes syncing,
    /// successfully or not.
    pub fn on_completed<F>(&mut self, handler: F)
    where
        F: FnMut(&E, &SyncResult<()>) + Send + 'static,
    {
        self.completed_handler = Some(Box::new(handler));
    }

    /// Returns a publisher feeding this engine.
    ///
    /// Publications are applied the next time the engine drains its queue.
    pub fn publisher(&self) -> Publisher<E> {
        Publisher::new(self.events_tx.clone())
    }

    /// Attaches a source. Its publications become `synchronize` calls and
    /// its unpublications become `cancel` calls.
    pub fn add_source<S: ObjectSource<E>>(&mut self, source: &mut S) {
        source.attach(self.publisher());
    }

    /// Adds an inclusion filter. Filters are combined with logical AND.
    pub fn add_filter<F>(&mut self, filter: F)
    where
        F: ObjectFilter<E> + Send + 'static,
    {
        self.filters.push(Box::new(filter));
    }

    /// Holds back entities that still have a dependency in `graph`, and
    /// drops an entity's edges when it stops being tracked.
    pub fn add_dependency_graph<D>(&mut self, graph: SharedDependencyGraph<E, D>)
    where
        D: Eq + Hash + Clone + Send + 'static,
    {
        let filter = DependencyFilter::new(graph);
        self.filters.push(Box::new(filter.clone()));
        self.dependency_trackers.push(Box::new(filter));
    }

    /// Schedules `object` for synchronization.
    pub fn synchronize(&mut self, object: E) {
        self.synchronize_all(std::iter::once(object));
    }

    /// Schedules `object` and calls `handler` once it has been resolved.
    ///
    /// The handler is not called for transient failures that lead to a
    /// retry. It receives `Err(SyncError::Cancelled)` and no response if the
    /// entity is cancelled before it is sent.
    pub fn synchronize_with<F>(&mut self, object: E, handler: F)
    where
        F: FnOnce(SyncResult<()>, Option<&T::Response>) + Send + 'static,
    {
        self.completion_handlers
            .entry(object.clone())
            .or_default()
            .push(Box::new(handler));
        self.synchronize(object);
    }

    /// Schedules several entities for synchronization.
    ///
    /// Entities already in flight are skipped. Passing nothing while the
    /// engine is idle reports completion to the delegate right away.
    pub fn synchronize_all<I>(&mut self, objects: I)
    where
        I: IntoIterator<Item = E>,
    {
        let before = self.pending.len();
        let mut offered = 0usize;

        for object in objects {
            offered += 1;
            if self.in_flight.contains(&object) {
                trace!(?object, "already in flight");
                continue;
            }
            self.pending.insert(object);
        }

        if offered == 0 && !self.is_syncing() {
            self.notify_finished();
            return;
        }

        let added = self.pending.len() - before;
        if added > 0 {
            trace!(added, pending = self.pending.len(), "new requests available");
            if let Some(delegate) = self.delegate.as_mut() {
                delegate.new_requests_available();
            }
        }
    }

    /// Stops `object` from being synchronized unless it is already in flight.
    pub fn cancel(&mut self, object: &E) {
        self.cancel_all(std::iter::once(object.clone()));
    }

    /// Stops several entities from being synchronized. In-flight entities
    /// are left alone.
    pub fn cancel_all<I>(&mut self, objects: I)
    where
        I: IntoIterator<Item = E>,
    {
        for object in objects {
            if !self.pending.remove(&object) {
                continue;
            }
            trace!(?object, "cancelled");
            self.attempts.remove(&object);
            self.clear_dependencies(&object);
            if let Some(handlers) = self.completion_handlers.remove(&object) {
                for handler in handlers {
                    handler(Err(SyncError::Cancelled), None);
                }
            }
        }
    }

    /// Applies queued source publications.
    ///
    /// Returns the number of events applied.
    pub fn process_source_events(&mut self) -> usize {
        let events: Vec<SourceEvent<E>> = self.events_rx.try_iter().collect();
        let count = events.len();
        for event in events {
            match event {
                SourceEvent::Publish(object) => self.synchronize(object),
                SourceEvent::Unpublish(object) => self.cancel(&object),
            }
        }
        count
    }

    /// Returns a handle a transport can use to post responses from any
    /// thread.
    pub fn completion_sender(&self) -> CompletionSender<E, T::Response> {
        CompletionSender::new(self.completions_tx.clone())
    }

    /// Reconciles responses posted through [`CompletionSender`]s.
    ///
    /// Returns the number of batches reconciled.
    pub fn process_completions(&mut self) -> usize {
        let completions: Vec<(Batch<E>, T::Response)> = self.completions_rx.try_iter().collect();
        let count = completions.len();
        for (batch, response) in completions {
            self.complete(batch, response);
        }
        count
    }

    /// Returns true while any entity is pending or in flight.
    pub fn is_syncing(&self) -> bool {
        !self.pending.is_empty() || !self.in_flight.is_empty()
    }

    /// Returns a copy of the pending set.
    pub fn pending(&self) -> HashSet<E> {
        self.pending.clone()
    }

    /// Returns a copy of the in-flight set.
    pub fn in_flight(&self) -> HashSet<E> {
        self.in_flight.clone()
    }

    /// Number of batches awaiting a response.
    pub fn outstanding_batches(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.clone()
    }

    /// The batch size actually used: the transcoder's limit clamped to at
    /// least 1 and capped by the configured override.
    pub fn effective_fetch_limit(&self) -> usize {
        let limit = self.transcoder.fetch_limit().max(1);
        match self.config.fetch_limit_override {
            Some(cap) => limit.min(cap.max(1)),
            None => limit,
        }
    }

    fn is_included(&self, object: &E) -> bool {
        self.filters.iter().all(|filter| filter.is_included(object))
    }

    /// Builds the next request, moving its entities from pending to in
    /// flight.
    ///
    /// Returns `None` if the transcoder is unavailable, nothing is eligible,
    /// or the transcoder declines to build a request. In the last case the
    /// entities go back to pending.
    pub fn next_request(&mut self) -> Option<OutboundRequest<E, T::Request>> {
        self.process_source_events();

        if !self.transcoder.is_available() {
            trace!("transcoder unavailable");
            return None;
        }

        let limit = self.effective_fetch_limit();
        let objects: HashSet<E> = self
            .pending
            .iter()
            .filter(|object| self.is_included(object))
            .take(limit)
            .cloned()
            .collect();

        if objects.is_empty() {
            return None;
        }

        for object in &objects {
            self.pending.remove(object);
            self.in_flight.insert(object.clone());
        }

        let request = if limit == 1 {
            objects
                .iter()
                .next()
                .and_then(|object| self.transcoder.request_for(object))
        } else {
            self.transcoder.request_for_batch(&objects)
        };

        let Some(request) = request else {
            for object in &objects {
                self.in_flight.remove(object);
                self.pending.insert(object.clone());
            }
            self.stats.structural_failures += 1;
            warn!(size = objects.len(), "transcoder declined to build a request");
            return None;
        };

        let id = BatchId {
            engine: self.instance,
            seq: self.next_batch_id,
        };
        self.next_batch_id += 1;
        self.outstanding.insert(id);
        self.stats.batches_scheduled += 1;

        if let Some(handler) = self.scheduled_handler.as_mut() {
            for object in &objects {
                handler(object);
            }
        }

        debug!(
            batch = %id,
            size = objects.len(),
            pending = self.pending.len(),
            in_flight = self.in_flight.len(),
            "scheduled batch"
        );

        Some(OutboundRequest {
            batch: Batch { id, objects },
            request,
        })
    }

    /// Reconciles a batch against its response.
    ///
    /// Batches this engine is not waiting for are ignored.
    pub fn complete(&mut self, batch: Batch<E>, response: T::Response) {
        if !self.outstanding.remove(&batch.id) {
            warn!(batch = %batch.id, "ignoring response for unknown batch");
            return;
        }

        let status = response.status();
        debug!(batch = %batch.id, size = batch.len(), ?status, "reconciling batch");
        let objects = batch.objects;

        match status {
            ResponseStatus::Success => {
                self.clear(&objects);
                self.deliver_response(&response, &objects);
                for object in objects {
                    self.report(object, Ok(()), Some(&response));
                }
            }
            ResponseStatus::PermanentFailure => {
                self.clear(&objects);
                self.deliver_response(&response, &objects);
                warn!(size = objects.len(), "remote store rejected batch");
                for object in objects {
                    self.report(object, Err(SyncError::Rejected), Some(&response));
                }
                self.notify_failed();
            }
            ResponseStatus::Expired => {
                if self.transcoder.should_retry_on_expiration() {
                    self.retry(objects, Some(&response));
                } else {
                    self.clear(&objects);
                    warn!(size = objects.len(), "request expired");
                    for object in objects {
                        self.report(object, Err(SyncError::Expired), Some(&response));
                    }
                    self.notify_failed();
                }
            }
            ResponseStatus::TransientFailure => {
                if self.transcoder.should_try_to_resend(&objects, &response) {
                    self.retry(objects, Some(&response));
                } else {
                    let attempts: HashMap<E, u32> = objects
                        .iter()
                        .map(|object| {
                            let failed = self
                                .attempts
                                .get(object)
                                .copied()
                                .unwrap_or(0)
                                .saturating_add(1);
                            (object.clone(), failed)
                        })
                        .collect();
                    self.deliver_response(&response, &objects);
                    self.clear(&objects);
                    warn!(size = objects.len(), "transcoder gave up resending");
                    for (object, attempts) in attempts {
                        self.report(
                            object,
                            Err(SyncError::GaveUpRetrying { attempts }),
                            Some(&response),
                        );
                    }
                    self.notify_failed();
                }
            }
        }

        if !self.is_syncing() {
            self.notify_finished();
        }
    }

    /// Returns a batch that will never get a response to pending, as if it
    /// had failed transiently.
    ///
    /// This counts toward the retry ceiling. Returns false, and does
    /// nothing, for batches this engine is not waiting for.
    pub fn requeue(&mut self, batch: Batch<E>) -> bool {
        if !self.outstanding.remove(&batch.id) {
            warn!(batch = %batch.id, "ignoring requeue of unknown batch");
            return false;
        }

        debug!(batch = %batch.id, size = batch.len(), "requeueing unanswered batch");
        self.retry(batch.objects, None);

        if !self.is_syncing() {
            self.notify_finished();
        }
        true
    }

    /// Gives up on every pending entity waiting on `dependency`.
    ///
    /// All edges pointing at `dependency` are removed from `graph`. Pending
    /// dependents are dropped and reported with [`SyncError::Expired`];
    /// in-flight dependents only lose the edge. Returns the expired
    /// entities.
    pub fn expire_dependents<D>(
        &mut self,
        graph: &SharedDependencyGraph<E, D>,
        dependency: &D,
    ) -> HashSet<E>
    where
        D: Eq + Hash + Clone,
    {
        let dependents = graph.lock().remove_dependency(dependency);

        let mut expired = HashSet::new();
        for object in dependents {
            if self.pending.remove(&object) {
                expired.insert(object);
            }
        }
        if expired.is_empty() {
            return expired;
        }

        warn!(size = expired.len(), "expiring entities blocked on a dependency");
        for object in &expired {
            self.attempts.remove(object);
            self.clear_dependencies(object);
            self.report(object.clone(), Err(SyncError::Expired), None);
        }
        self.notify_failed();

        if !self.is_syncing() {
            self.notify_finished();
        }
        expired
    }

    /// Returns entities to pending, giving up on those past the retry
    /// ceiling.
    fn retry(&mut self, objects: HashSet<E>, response: Option<&T::Response>) {
        let ceiling = self.config.max_transient_retries;
        let mut exhausted = HashMap::new();
        let mut requeued = 0usize;

        for object in objects {
            self.in_flight.remove(&object);
            let attempts = self.attempts.entry(object.clone()).or_insert(0);
            *attempts = attempts.saturating_add(1);
            match ceiling {
                Some(max) if *attempts > max => {
                    exhausted.insert(object, *attempts);
                }
                _ => {
                    self.pending.insert(object);
                    requeued += 1;
                }
            }
        }

        if requeued > 0 {
            self.stats.batches_retried += 1;
        }
        if exhausted.is_empty() {
            trace!(pending = self.pending.len(), "batch rescheduled");
            return;
        }

        let given_up: HashSet<E> = exhausted.keys().cloned().collect();
        warn!(size = given_up.len(), "giving up after repeated transient failures");
        if let Some(response) = response {
            self.deliver_response(response, &given_up);
        }
        for (object, attempts) in exhausted {
            self.attempts.remove(&object);
            self.clear_dependencies(&object);
            self.report(object, Err(SyncError::GaveUpRetrying { attempts }), response);
        }
        self.notify_failed();
    }

    /// Drops resolved entities from in flight and forgets their bookkeeping.
    fn clear(&mut self, objects: &HashSet<E>) {
        for object in objects {
            self.in_flight.remove(object);
            self.attempts.remove(object);
            self.clear_dependencies(object);
        }
    }

    fn clear_dependencies(&self, object: &E) {
        for tracker in &self.dependency_trackers {
            tracker.clear_dependent(object);
        }
    }

    fn deliver_response(&mut self, response: &T::Response, objects: &HashSet<E>) {
        if objects.is_empty() {
            return;
        }
        if self.effective_fetch_limit() == 1 {
            for object in objects {
                self.transcoder.handle_response(response, object);
            }
        } else {
            self.transcoder.handle_batch_response(response, objects);
        }
    }

    fn report(&mut self, object: E, result: SyncResult<()>, response: Option<&T::Response>) {
        match &result {
            Ok(()) => self.stats.entities_synced += 1,
            Err(error) => {
                self.stats.entities_failed += 1;
                self.stats.last_error = Some(error.to_string());
            }
        }

        if let Some(handler) = self.completed_handler.as_mut() {
            handler(&object, &result);
        }
        if let Some(handlers) = self.completion_handlers.remove(&object) {
            for handler in handlers {
                handler(result.clone(), response);
            }
        }
    }

    fn notify_finished(&mut self) {
        debug!("finished syncing all objects");
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.did_finish_syncing_all_objects();
        }
    }

    fn notify_failed(&mut self) {
        if let Some(delegate) = self.delegate.as_mut() {
            delegate.did_fail_to_sync_all_objects();
        }
    }
}

impl<E: Entity, T: ObjectTranscoder<E>> fmt::Debug for ObjectSync<E, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectSync")
            .field("pending", &self.pending)
            .field("in_flight", &self.in_flight)
            .field("outstanding", &self.outstanding.len())
            .field("filters", &self.filters.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::SyncEvent;
    use crate::DependencyGraph;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        limit: usize,
        declined: HashSet<u32>,
        unavailable: bool,
        retry_expired: bool,
        resend: bool,
        handled: Vec<Vec<u32>>,
    }

    impl Recorder {
        fn with_limit(limit: usize) -> Self {
            Self {
                limit,
                retry_expired: true,
                resend: true,
                ..Self::default()
            }
        }
    }

    fn sorted(objects: &HashSet<u32>) -> Vec<u32> {
        let mut objects: Vec<u32> = objects.iter().copied().collect();
        objects.sort_unstable();
        objects
    }

    impl ObjectTranscoder<u32> for Recorder {
        type Request = Vec<u32>;
        type Response = ResponseStatus;

        fn fetch_limit(&self) -> usize {
            self.limit
        }

        fn is_available(&self) -> bool {
            !self.unavailable
        }

        fn should_retry_on_expiration(&self) -> bool {
            self.retry_expired
        }

        fn request_for(&mut self, object: &u32) -> Option<Vec<u32>> {
            (!self.declined.contains(object)).then(|| vec![*object])
        }

        fn request_for_batch(&mut self, objects: &HashSet<u32>) -> Option<Vec<u32>> {
            if objects.iter().any(|o| self.declined.contains(o)) {
                return None;
            }
            Some(sorted(objects))
        }

        fn handle_response(&mut self, _response: &ResponseStatus, object: &u32) {
            self.handled.push(vec![*object]);
        }

        fn handle_batch_response(&mut self, _response: &ResponseStatus, objects: &HashSet<u32>) {
            self.handled.push(sorted(objects));
        }

        fn should_try_to_resend(&self, _objects: &HashSet<u32>, _response: &ResponseStatus) -> bool {
            self.resend
        }
    }

    fn engine(limit: usize) -> (ObjectSync<u32, Recorder>, Receiver<SyncEvent>) {
        let mut engine = ObjectSync::new(Recorder::with_limit(limit));
        let (tx, rx) = mpsc::channel();
        engine.set_delegate(tx);
        (engine, rx)
    }

    fn assert_disjoint(engine: &ObjectSync<u32, Recorder>) {
        assert!(engine.pending().is_disjoint(&engine.in_flight()));
    }

    #[test]
    fn idle_empty_synchronize_finishes_immediately() {
        let (mut engine, events) = engine(1);
        engine.synchronize_all(Vec::new());

        assert_eq!(events.try_iter().collect::<Vec<_>>(), vec![SyncEvent::Finished]);
    }

    #[test]
    fn empty_synchronize_while_busy_is_silent() {
        let (mut engine, events) = engine(1);
        engine.synchronize(1);
        let _ = events.try_iter().count();

        engine.synchronize_all(Vec::new());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn synchronize_announces_new_requests() {
        let (mut engine, events) = engine(1);
        engine.synchronize_all([1, 2]);
        engine.synchronize(1);

        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SyncEvent::RequestsAvailable]
        );
    }

    #[test]
    fn synchronize_then_cancel_is_noop() {
        let (mut engine, _events) = engine(1);
        engine.synchronize(1);
        engine.cancel(&1);

        assert!(engine.pending().is_empty());
        assert!(!engine.is_syncing());
        assert!(engine.next_request().is_none());
    }

    #[test]
    fn batches_respect_fetch_limit() {
        let (mut engine, _events) = engine(2);
        engine.synchronize_all([1, 2, 3]);

        let first = engine.next_request().unwrap();
        assert_eq!(first.batch.len(), 2);
        assert_eq!(engine.pending().len(), 1);
        assert_disjoint(&engine);

        let second = engine.next_request().unwrap();
        assert_eq!(second.batch.len(), 1);
        assert!(engine.pending().is_empty());
        assert_eq!(engine.in_flight().len(), 3);
        assert!(engine.next_request().is_none());
    }

    #[test]
    fn zero_fetch_limit_is_clamped() {
        let (mut engine, _events) = engine(0);
        engine.synchronize_all([1, 2]);

        assert_eq!(engine.effective_fetch_limit(), 1);
        assert_eq!(engine.next_request().unwrap().batch.len(), 1);
    }

    #[test]
    fn fetch_limit_override_caps_batches() {
        let config = SyncConfig::new().with_fetch_limit_override(2);
        let mut engine = ObjectSync::with_config(Recorder::with_limit(10), config).unwrap();
        engine.synchronize_all(0..5);

        assert_eq!(engine.next_request().unwrap().batch.len(), 2);
    }

    #[test]
    fn with_config_validates() {
        let config = SyncConfig::new().with_max_concurrent_requests(0);
        let result = ObjectSync::with_config(Recorder::with_limit(1), config);
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[test]
    fn single_entity_limit_uses_single_methods() {
        let (mut engine, events) = engine(1);
        engine.synchronize(4);

        let (batch, request) = engine.next_request().unwrap().into_parts();
        assert_eq!(request, vec![4]);

        engine.complete(batch, ResponseStatus::Success);
        assert_eq!(engine.transcoder().handled, vec![vec![4]]);
        assert!(!engine.is_syncing());
        assert!(events.try_iter().any(|e| e == SyncEvent::Finished));
    }

    #[test]
    fn cancel_leaves_in_flight_alone() {
        let (mut engine, _events) = engine(1);
        engine.synchronize(1);
        let request = engine.next_request().unwrap();

        engine.cancel(&1);
        assert!(engine.in_flight().contains(&1));

        engine.complete(request.batch, ResponseStatus::Success);
        assert!(!engine.is_syncing());
    }

    #[test]
    fn synchronize_skips_in_flight() {
        let (mut engine, _events) = engine(1);
        engine.synchronize(1);
        let _request = engine.next_request().unwrap();

        engine.synchronize(1);
        assert!(engine.pending().is_empty());
        assert_disjoint(&engine);
    }

    #[test]
    fn transient_failure_reschedules_batch() {
        let (mut engine, events) = engine(2);
        engine.synchronize_all([1, 2]);
        let request = engine.next_request().unwrap();

        engine.complete(request.batch, ResponseStatus::TransientFailure);

        assert_eq!(sorted(&engine.pending()), vec![1, 2]);
        assert!(engine.in_flight().is_empty());
        assert!(engine.transcoder().handled.is_empty());
        assert_eq!(engine.stats().batches_retried, 1);
        assert!(!events.try_iter().any(|e| e == SyncEvent::Finished));
    }

    #[test]
    fn permanent_failure_drops_and_notifies() {
        let (mut engine, events) = engine(2);
        engine.synchronize_all([1, 2]);
        let request = engine.next_request().unwrap();
        let _ = events.try_iter().count();

        engine.complete(request.batch, ResponseStatus::PermanentFailure);

        assert!(!engine.is_syncing());
        assert_eq!(engine.transcoder().handled, vec![vec![1, 2]]);
        assert_eq!(
            events.try_iter().collect::<Vec<_>>(),
            vec![SyncEvent::Failed, SyncEvent::Finished]
        );
        let stats = engine.stats();
        assert_eq!(stats.entities_failed, 2);
        assert_eq!(stats.last_error.as_deref(), Some("remote store rejected the batch"));
    }

    #[test]
    fn expired_requests_follow_transcoder_policy() {
        let (mut engine, _events) = engine(1);
        engine.synchronize(1);
        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::Expired);
        assert!(engine.pending().contains(&1));

        engine.transcoder_mut().retry_expired = false;
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        engine.synchronize_with(1, move |r, _| *slot.lock() = Some(r));

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::Expired);

        assert!(!engine.is_syncing());
        assert_eq!(*result.lock(), Some(Err(SyncError::Expired)));
        assert!(engine.transcoder().handled.is_empty());
    }

    #[test]
    fn refusing_to_resend_gives_up() {
        let (mut engine, events) = engine(1);
        engine.transcoder_mut().resend = false;

        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        engine.synchronize_with(9, move |r, _| *slot.lock() = Some(r));

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::TransientFailure);

        assert_eq!(
            *result.lock(),
            Some(Err(SyncError::GaveUpRetrying { attempts: 1 }))
        );
        assert_eq!(engine.transcoder().handled, vec![vec![9]]);
        assert!(events.try_iter().any(|e| e == SyncEvent::Failed));
    }

    #[test]
    fn retry_ceiling_gives_up() {
        let config = SyncConfig::new().with_max_transient_retries(1);
        let mut engine = ObjectSync::with_config(Recorder::with_limit(1), config).unwrap();
        engine.synchronize(3);

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::TransientFailure);
        assert!(engine.pending().contains(&3));

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::TransientFailure);
        assert!(!engine.is_syncing());

        let stats = engine.stats();
        assert_eq!(stats.entities_failed, 1);
        assert_eq!(
            stats.last_error.as_deref(),
            Some("gave up retrying after 2 failed attempts")
        );
    }

    #[test]
    fn unknown_batches_are_ignored() {
        let (mut a, _ea) = engine(1);
        let (mut b, _eb) = engine(1);
        a.synchronize(1);
        b.synchronize(1);

        let from_a = a.next_request().unwrap();
        let from_b = b.next_request().unwrap();
        b.complete(from_b.batch, ResponseStatus::Success);

        // Same id, but b is no longer waiting for it.
        b.synchronize(2);
        b.complete(from_a.batch, ResponseStatus::Success);
        assert!(b.pending().contains(&2));
        assert_eq!(b.stats().entities_synced, 1);
    }

    #[test]
    fn filters_hold_back_entities() {
        let (mut engine, _events) = engine(10);
        engine.add_filter(|n: &u32| n % 2 == 0);
        engine.add_filter(|n: &u32| *n < 6);
        engine.synchronize_all(0..10);

        let request = engine.next_request().unwrap();
        assert_eq!(sorted(request.batch.objects()), vec![0, 2, 4]);
        assert!(engine.next_request().is_none());
        assert_eq!(engine.pending().len(), 7);
    }

    #[test]
    fn declined_request_returns_batch_to_pending() {
        let (mut engine, _events) = engine(1);
        engine.transcoder_mut().declined.insert(5);
        engine.synchronize(5);

        assert!(engine.next_request().is_none());
        assert!(engine.pending().contains(&5));
        assert!(engine.in_flight().is_empty());
        assert_eq!(engine.stats().structural_failures, 1);
    }

    #[test]
    fn unavailable_transcoder_pauses_scheduling() {
        let (mut engine, _events) = engine(1);
        engine.transcoder_mut().unavailable = true;
        engine.synchronize(1);

        assert!(engine.next_request().is_none());
        assert!(engine.pending().contains(&1));

        engine.transcoder_mut().unavailable = false;
        assert!(engine.next_request().is_some());
    }

    #[test]
    fn sources_drive_the_pending_set() {
        let (mut engine, _events) = engine(1);
        let publisher = engine.publisher();
        publisher.publish(1);
        publisher.publish(2);
        publisher.unpublish(1);

        assert_eq!(engine.process_source_events(), 3);
        assert_eq!(sorted(&engine.pending()), vec![2]);
    }

    #[test]
    fn completion_handlers_fire_once() {
        let (mut engine, _events) = engine(1);
        let calls = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let calls = Arc::clone(&calls);
            engine.synchronize_with(1, move |result, response| {
                calls.lock().push((tag, result, response.copied()));
            });
        }

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::TransientFailure);
        assert!(calls.lock().is_empty());

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::Success);
        assert_eq!(
            *calls.lock(),
            vec![
                ("first", Ok(()), Some(ResponseStatus::Success)),
                ("second", Ok(()), Some(ResponseStatus::Success)),
            ]
        );
    }

    #[test]
    fn cancel_reports_to_completion_handler() {
        let (mut engine, _events) = engine(1);
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        engine.synchronize_with(1, move |r, response| {
            assert!(response.is_none());
            *slot.lock() = Some(r);
        });

        engine.cancel(&1);
        assert_eq!(*result.lock(), Some(Err(SyncError::Cancelled)));
    }

    #[test]
    fn lifecycle_hooks() {
        let (mut engine, _events) = engine(2);
        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(Mutex::new(Vec::new()));
        {
            let scheduled = Arc::clone(&scheduled);
            engine.on_scheduled(move |object| scheduled.lock().push(*object));
            let completed = Arc::clone(&completed);
            engine.on_completed(move |object, result| completed.lock().push((*object, result.is_ok())));
        }

        engine.synchronize_all([1, 2]);
        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::Success);

        let mut scheduled = scheduled.lock().clone();
        scheduled.sort_unstable();
        assert_eq!(scheduled, vec![1, 2]);

        let mut completed = completed.lock().clone();
        completed.sort_unstable();
        assert_eq!(completed, vec![(1, true), (2, true)]);
    }

    #[test]
    fn dependency_graph_blocks_until_released() {
        let (mut engine, _events) = engine(10);
        let graph: SharedDependencyGraph<u32, &str> = Arc::new(Mutex::new(DependencyGraph::new()));
        engine.add_dependency_graph(Arc::clone(&graph));

        graph.lock().add(1, "conversation");
        engine.synchronize_all([1, 2]);

        let request = engine.next_request().unwrap();
        assert_eq!(sorted(request.batch.objects()), vec![2]);
        engine.complete(request.batch, ResponseStatus::Success);

        graph.lock().enumerate_and_remove(&"conversation", |_| true);
        let request = engine.next_request().unwrap();
        assert_eq!(sorted(request.batch.objects()), vec![1]);
    }

    #[test]
    fn cancellation_clears_dependency_edges() {
        let (mut engine, _events) = engine(1);
        let graph: SharedDependencyGraph<u32, u32> = Arc::new(Mutex::new(DependencyGraph::new()));
        engine.add_dependency_graph(Arc::clone(&graph));

        graph.lock().add(1, 100);
        graph.lock().add(1, 101);
        engine.synchronize(1);
        engine.cancel(&1);

        let graph = graph.lock();
        assert!(graph.is_empty());
        assert!(graph.is_consistent());
    }

    #[test]
    fn completion_sender_round_trip() {
        let (mut engine, _events) = engine(1);
        engine.synchronize(1);
        let sender = engine.completion_sender();

        let request = engine.next_request().unwrap();
        sender.send(request.batch, ResponseStatus::Success).unwrap();
        assert!(engine.in_flight().contains(&1));

        assert_eq!(engine.process_completions(), 1);
        assert!(!engine.is_syncing());
    }

    #[test]
    fn batch_ids_are_sequential() {
        let (mut engine, _events) = engine(1);
        engine.synchronize_all([1, 2]);

        let first = engine.next_request().unwrap().batch.id();
        let second = engine.next_request().unwrap().batch.id();
        assert_eq!(second.as_u64(), first.as_u64() + 1);
        assert_eq!(first.to_string(), "batch-0");
        assert_eq!(engine.outstanding_batches(), 2);
    }

    #[test]
    fn foreign_batches_are_ignored() {
        let (mut a, _ea) = engine(1);
        let (mut b, _eb) = engine(1);
        a.synchronize(1);
        b.synchronize(2);

        let from_a = a.next_request().unwrap();
        let from_b = b.next_request().unwrap();
        assert_eq!(from_a.batch.id().as_u64(), from_b.batch.id().as_u64());
        assert_ne!(from_a.batch.id(), from_b.batch.id());

        // b is still waiting on a batch with the same sequence number.
        b.complete(from_a.batch, ResponseStatus::Success);
        assert_eq!(b.in_flight(), HashSet::from([2]));
        assert_eq!(b.outstanding_batches(), 1);
        assert_eq!(b.stats().entities_synced, 0);

        b.complete(from_b.batch, ResponseStatus::Success);
        assert!(!b.is_syncing());
    }

    #[test]
    fn attempt_counter_saturates() {
        let (mut engine, _events) = engine(1);
        engine.synchronize(1);
        engine.attempts.insert(1, u32::MAX);

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::TransientFailure);

        assert_eq!(engine.pending(), HashSet::from([1]));
        assert_eq!(engine.attempts.get(&1), Some(&u32::MAX));
    }

    #[test]
    fn requeue_returns_batch_to_pending() {
        let (mut engine, events) = engine(2);
        engine.synchronize_all([1, 2]);

        let request = engine.next_request().unwrap();
        assert!(engine.requeue(request.batch));

        assert_eq!(engine.pending(), HashSet::from([1, 2]));
        assert!(engine.in_flight().is_empty());
        assert_eq!(engine.outstanding_batches(), 0);
        assert_eq!(engine.stats().batches_retried, 1);
        assert!(engine.transcoder().handled.is_empty());
        assert!(!events.try_iter().any(|e| e == SyncEvent::Failed));

        let request = engine.next_request().unwrap();
        engine.complete(request.batch, ResponseStatus::Success);
        assert!(!engine.is_syncing());
    }

    #[test]
    fn requeue_ignores_unknown_batches() {
        let (mut a, _ea) = engine(1);
        let (mut b, _eb) = engine(1);
        a.synchronize(1);
        b.synchronize(1);

        let from_a = a.next_request().unwrap();
        let _from_b = b.next_request().unwrap();
        assert!(!b.requeue(from_a.batch));
        assert_eq!(b.in_flight(), HashSet::from([1]));
    }

    #[test]
    fn requeue_counts_toward_retry_ceiling() {
        let config = SyncConfig::new().with_max_transient_retries(0);
        let mut engine = ObjectSync::with_config(Recorder::with_limit(1), config).unwrap();
        let (tx, events) = mpsc::channel();
        engine.set_delegate(tx);
        engine.synchronize(5);

        let request = engine.next_request().unwrap();
        engine.requeue(request.batch);

        assert!(!engine.is_syncing());
        assert_eq!(engine.stats().entities_failed, 1);
        assert!(engine.transcoder().handled.is_empty());
        let events: Vec<SyncEvent> = events.try_iter().collect();
        assert!(events.contains(&SyncEvent::Failed));
        assert!(events.contains(&SyncEvent::Finished));
    }

    #[test]
    fn expire_dependents_drops_blocked_entities() {
        let (mut engine, events) = engine(10);
        let graph: SharedDependencyGraph<u32, &str> = Arc::new(Mutex::new(DependencyGraph::new()));
        engine.add_dependency_graph(Arc::clone(&graph));

        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        engine.synchronize_with(1, move |outcome, response| {
            *slot.lock() = Some((outcome, response.copied()));
        });
        engine.synchronize_all([2, 3]);

        graph.lock().add(1, "conversation");
        graph.lock().add(1, "session");
        graph.lock().add(2, "conversation");
        graph.lock().add(4, "conversation");

        let expired = engine.expire_dependents(&graph, &"conversation");

        assert_eq!(expired, HashSet::from([1, 2]));
        assert_eq!(engine.pending(), HashSet::from([3]));
        assert_eq!(*result.lock(), Some((Err(SyncError::Expired), None)));
        assert_eq!(engine.stats().entities_failed, 2);

        let graph = graph.lock();
        assert!(graph.is_empty());
        assert!(graph.is_consistent());
        drop(graph);

        let events: Vec<SyncEvent> = events.try_iter().collect();
        assert_eq!(events.iter().filter(|e| **e == SyncEvent::Failed).count(), 1);
        assert!(!events.contains(&SyncEvent::Finished));
    }

    #[test]
    fn expire_dependents_spares_in_flight_entities() {
        let (mut engine, events) = engine(1);
        let graph: SharedDependencyGraph<u32, u32> = Arc::new(Mutex::new(DependencyGraph::new()));
        engine.add_dependency_graph(Arc::clone(&graph));

        engine.synchronize(1);
        let request = engine.next_request().unwrap();
        graph.lock().add(1, 100);

        assert!(engine.expire_dependents(&graph, &100).is_empty());
        assert_eq!(engine.in_flight(), HashSet::from([1]));
        assert!(!graph.lock().is_blocked(&1));
        assert!(!events.try_iter().any(|e| e == SyncEvent::Failed));

        engine.complete(request.batch, ResponseStatus::Success);
        assert_eq!(engine.stats().entities_synced, 1);
    }

    #[test]
    fn expiring_the_last_entity_finishes() {
        let (mut engine, events) = engine(1);
        let graph: SharedDependencyGraph<u32, u32> = Arc::new(Mutex::new(DependencyGraph::new()));
        engine.add_dependency_graph(Arc::clone(&graph));

        graph.lock().add(7, 1);
        engine.synchronize(7);
        assert!(engine.next_request().is_none());

        engine.expire_dependents(&graph, &1);
        assert!(!engine.is_syncing());
        let events: Vec<SyncEvent> = events.try_iter().collect();
        assert!(events.ends_with(&[SyncEvent::Failed, SyncEvent::Finished]));
    }
}
