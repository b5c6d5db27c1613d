//! Async driver that feeds an engine's batches through a transport.

use crate::engine::{Batch, ObjectSync, SyncStats};
use crate::entity::Entity;
use crate::error::{SyncError, SyncResult};
use crate::transcoder::ObjectTranscoder;
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{Id, JoinSet};
use tracing::{debug, warn};

/// Runs an [`ObjectSync`] against a [`Transport`].
///
/// The driver keeps up to `max_concurrent_requests` batches outstanding and
/// reconciles each response on the caller's task, so the engine itself is
/// never shared. Batches stay with the driver, keyed by the task sending
/// their request, so a task that never answers cannot strand them.
pub struct SyncDriver<E, T, X>
where
    E: Entity,
    T: ObjectTranscoder<E>,
{
    engine: ObjectSync<E, T>,
    transport: Arc<X>,
    tasks: JoinSet<T::Response>,
    batches: HashMap<Id, Batch<E>>,
}

impl<E, T, X> SyncDriver<E, T, X>
where
    E: Entity,
    T: ObjectTranscoder<E>,
    T::Request: Send + 'static,
    T::Response: Send + 'static,
    X: Transport<T::Request, T::Response>,
{
    /// Creates a driver.
    pub fn new(engine: ObjectSync<E, T>, transport: X) -> Self {
        Self {
            engine,
            transport: Arc::new(transport),
            tasks: JoinSet::new(),
            batches: HashMap::new(),
        }
    }

    /// Returns the engine.
    pub fn engine(&self) -> &ObjectSync<E, T> {
        &self.engine
    }

    /// Returns the engine mutably, e.g. to synchronize more entities
    /// between runs.
    pub fn engine_mut(&mut self) -> &mut ObjectSync<E, T> {
        &mut self.engine
    }

    /// Returns the transport.
    pub fn transport(&self) -> &X {
        &self.transport
    }

    /// Consumes the driver and returns the engine.
    ///
    /// Requests still in progress are aborted and their batches go back to
    /// pending.
    pub fn into_engine(mut self) -> ObjectSync<E, T> {
        self.tasks.abort_all();
        for (_, batch) in self.batches.drain() {
            self.engine.requeue(batch);
        }
        self.engine
    }

    /// Number of requests currently awaiting a response.
    pub fn requests_in_progress(&self) -> usize {
        self.tasks.len()
    }

    fn dispatch_ready(&mut self) -> usize {
        let max = self.engine.config().max_concurrent_requests;
        let mut dispatched = 0;

        while self.tasks.len() < max {
            let Some(outbound) = self.engine.next_request() else {
                break;
            };
            let (batch, request) = outbound.into_parts();
            let transport = Arc::clone(&self.transport);
            let handle = self
                .tasks
                .spawn(async move { transport.send(request).await });
            self.batches.insert(handle.id(), batch);
            dispatched += 1;
        }

        dispatched
    }

    /// Dispatches and reconciles batches until no request can be built and
    /// none is outstanding.
    ///
    /// Entities that stay pending (held back by a filter, or refused by the
    /// transcoder) do not keep the driver running.
    ///
    /// # Errors
    ///
    /// Returns a fatal transport error if a request task panicked or was
    /// aborted. That batch goes back to pending as if it had failed
    /// transiently, and other requests keep running, so calling this again
    /// resumes the session.
    pub async fn run_until_idle(&mut self) -> SyncResult<SyncStats> {
        loop {
            self.engine.process_completions();
            self.dispatch_ready();

            match self.tasks.join_next_with_id().await {
                Some(Ok((id, response))) => {
                    if let Some(batch) = self.batches.remove(&id) {
                        self.engine.complete(batch, response);
                    }
                }
                Some(Err(error)) => {
                    if let Some(batch) = self.batches.remove(&error.id()) {
                        self.engine.requeue(batch);
                    }
                    warn!(%error, "request task failed");
                    return Err(SyncError::transport_fatal(format!(
                        "request task failed: {error}"
                    )));
                }
                None => break,
            }
        }

        let stats = self.engine.stats();
        debug!(
            batches = stats.batches_scheduled,
            synced = stats.entities_synced,
            failed = stats.entities_failed,
            pending = self.engine.pending().len(),
            "driver idle"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockTransport, ResponseStatus, SyncConfig, SyncEvent};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    struct Batched(usize);

    impl ObjectTranscoder<u32> for Batched {
        type Request = Vec<u32>;
        type Response = ResponseStatus;

        fn fetch_limit(&self) -> usize {
            self.0
        }

        fn request_for(&mut self, object: &u32) -> Option<Vec<u32>> {
            Some(vec![*object])
        }

        fn request_for_batch(&mut self, objects: &HashSet<u32>) -> Option<Vec<u32>> {
            Some(objects.iter().copied().collect())
        }

        fn handle_response(&mut self, _response: &ResponseStatus, _object: &u32) {}
    }

    #[tokio::test]
    async fn driver_runs_to_idle() {
        let mut engine = ObjectSync::new(Batched(3));
        let (tx, events) = mpsc::channel();
        engine.set_delegate(tx);
        engine.synchronize_all(0..10);

        let transport = MockTransport::new(|_: &Vec<u32>| ResponseStatus::Success);
        let mut driver = SyncDriver::new(engine, transport);
        let stats = driver.run_until_idle().await.unwrap();

        assert_eq!(stats.entities_synced, 10);
        assert_eq!(stats.batches_scheduled, 4);
        assert_eq!(driver.transport().request_count(), 4);
        assert!(!driver.engine().is_syncing());
        assert!(events.try_iter().any(|e| e == SyncEvent::Finished));
    }

    #[tokio::test]
    async fn driver_retries_transient_failures() {
        let failures = Arc::new(AtomicUsize::new(2));
        let remaining = Arc::clone(&failures);
        let transport = MockTransport::new(move |_: &Vec<u32>| {
            let left = remaining.load(Ordering::SeqCst);
            if left > 0 {
                remaining.store(left - 1, Ordering::SeqCst);
                ResponseStatus::TransientFailure
            } else {
                ResponseStatus::Success
            }
        });

        let config = SyncConfig::new().with_max_concurrent_requests(1);
        let mut engine = ObjectSync::with_config(Batched(1), config).unwrap();
        engine.synchronize(7);

        let mut driver = SyncDriver::new(engine, transport);
        let stats = driver.run_until_idle().await.unwrap();

        assert_eq!(stats.batches_retried, 2);
        assert_eq!(stats.entities_synced, 1);
        assert_eq!(driver.transport().request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn driver_bounds_concurrency() {
        let scheduled = Arc::new(Mutex::new(0usize));
        let config = SyncConfig::new().with_max_concurrent_requests(2);
        let mut engine = ObjectSync::with_config(Batched(1), config).unwrap();
        engine.synchronize_all(0..6);

        {
            let scheduled = Arc::clone(&scheduled);
            engine.on_scheduled(move |_| {
                let mut scheduled = scheduled.lock();
                *scheduled += 1;
            });
        }

        let transport = MockTransport::new(|_: &Vec<u32>| ResponseStatus::Success)
            .with_delay(Duration::from_millis(10));
        let mut driver = SyncDriver::new(engine, transport);

        driver.dispatch_ready();
        assert_eq!(driver.requests_in_progress(), 2);
        assert_eq!(*scheduled.lock(), 2);

        driver.run_until_idle().await.unwrap();
        assert_eq!(*scheduled.lock(), 6);
        assert_eq!(driver.requests_in_progress(), 0);
    }

    #[tokio::test]
    async fn panicking_request_returns_batch_to_pending() {
        let panicked = Arc::new(AtomicBool::new(false));
        let once = Arc::clone(&panicked);
        let transport = MockTransport::new(move |request: &Vec<u32>| {
            if request.contains(&1) && !once.swap(true, Ordering::SeqCst) {
                panic!("connection reset");
            }
            ResponseStatus::Success
        });

        let mut engine = ObjectSync::new(Batched(1));
        engine.synchronize_all([1, 2]);
        let mut driver = SyncDriver::new(engine, transport);

        let error = driver.run_until_idle().await.unwrap_err();
        assert!(!error.is_retryable());
        assert!(!driver.engine().in_flight().contains(&1));
        assert!(driver.engine().pending().contains(&1));

        let stats = driver.run_until_idle().await.unwrap();
        assert_eq!(stats.entities_synced, 2);
        assert!(stats.batches_retried >= 1);
        assert!(!driver.engine().is_syncing());
        assert_eq!(driver.engine().outstanding_batches(), 0);
        assert!(panicked.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn into_engine_returns_unfinished_batches() {
        let transport = MockTransport::new(|_: &Vec<u32>| ResponseStatus::Success)
            .with_delay(Duration::from_secs(60));
        let mut engine = ObjectSync::new(Batched(2));
        engine.synchronize_all([1, 2, 3]);

        let mut driver = SyncDriver::new(engine, transport);
        driver.dispatch_ready();
        assert_eq!(driver.requests_in_progress(), 2);

        let engine = driver.into_engine();
        assert!(engine.in_flight().is_empty());
        assert_eq!(engine.pending(), HashSet::from([1, 2, 3]));
        assert_eq!(engine.outstanding_batches(), 0);
    }

    #[tokio::test]
    async fn filtered_entities_do_not_block_idle() {
        let mut engine = ObjectSync::new(Batched(1));
        engine.add_filter(|n: &u32| *n != 3);
        engine.synchronize_all([1, 2, 3]);

        let transport = MockTransport::new(|_: &Vec<u32>| ResponseStatus::Success);
        let mut driver = SyncDriver::new(engine, transport);
        driver.run_until_idle().await.unwrap();

        let engine = driver.into_engine();
        assert_eq!(engine.pending(), HashSet::from([3]));
        assert!(engine.in_flight().is_empty());
    }
}
