//! Completion delegate.

use std::sync::mpsc::Sender;

/// Observer of working-set transitions.
pub trait SyncDelegate: Send {
    /// Called when nothing is pending or in flight any more.
    fn did_finish_syncing_all_objects(&mut self);

    /// Called when a batch failed permanently.
    fn did_fail_to_sync_all_objects(&mut self);

    /// Called when new entities were added to the pending set.
    fn new_requests_available(&mut self) {}
}

/// Delegate callbacks expressed as messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    /// See [`SyncDelegate::did_finish_syncing_all_objects`].
    Finished,
    /// See [`SyncDelegate::did_fail_to_sync_all_objects`].
    Failed,
    /// See [`SyncDelegate::new_requests_available`].
    RequestsAvailable,
}

/// Forwards delegate callbacks over a channel. A dropped receiver is ignored.
impl SyncDelegate for Sender<SyncEvent> {
    fn did_finish_syncing_all_objects(&mut self) {
        let _ = self.send(SyncEvent::Finished);
    }

    fn did_fail_to_sync_all_objects(&mut self) {
        let _ = self.send(SyncEvent::Failed);
    }

    fn new_requests_available(&mut self) {
        let _ = self.send(SyncEvent::RequestsAvailable);
    }
}
