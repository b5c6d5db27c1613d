//! Persistence adapter.
//!
//! The engine does not own storage. It needs three things from it:
//! - a way to query records matching a condition
//! - change notifications after records are saved
//! - a stable identity per record (see [`Record`])
//!
//! [`MemoryStore`] is an in-memory reference implementation; production code
//! implements [`EntityStore`] over its own database.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = MemoryStore::new();
//! let mut observer = StoreObserver::new(&store);
//!
//! let mut source = PredicateSource::new(|c: &Conversation| c.needs_update);
//! engine.add_source(&mut source);
//! observer.add_tracker(&store, source);
//!
//! store.put(conversation);
//! observer.process_changes();
//! ```

use crate::entity::Record;
use crate::source::ChangeTracker;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::trace;

/// Storage the sync layer observes.
pub trait EntityStore<R: Record> {
    /// Returns every stored record matching `predicate`.
    fn fetch_matching(&self, predicate: &dyn Fn(&R) -> bool) -> Vec<R>;

    /// Subscribes to change notifications.
    ///
    /// Each message carries the records touched by one save.
    fn subscribe(&self) -> Receiver<Vec<R>>;
}

/// An in-memory record store with change notifications.
///
/// The store:
/// - Keys records by their identity
/// - Emits one notification per save
/// - Supports multiple subscribers
/// - Is thread-safe
pub struct MemoryStore<R: Record> {
    records: RwLock<HashMap<R::Id, R>>,
    subscribers: RwLock<Vec<Sender<Vec<R>>>>,
}

impl<R: Record> MemoryStore<R> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Inserts or replaces a record and notifies subscribers.
    pub fn put(&self, record: R) {
        self.put_all(vec![record]);
    }

    /// Inserts or replaces several records as one save.
    pub fn put_all(&self, records: Vec<R>) {
        if records.is_empty() {
            return;
        }

        {
            let mut stored = self.records.write();
            for record in &records {
                stored.insert(record.id(), record.clone());
            }
        }

        trace!(count = records.len(), "store saved records");

        // Send to subscribers (remove disconnected ones)
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(records.clone()).is_ok());
    }

    /// Applies `update` to the stored record and saves the result.
    ///
    /// Returns false if no record with `id` exists.
    pub fn update<F>(&self, id: &R::Id, update: F) -> bool
    where
        F: FnOnce(&mut R),
    {
        let updated = {
            let mut stored = self.records.write();
            match stored.get_mut(id) {
                Some(record) => {
                    update(record);
                    record.clone()
                }
                None => return false,
            }
        };
        self.put(updated);
        true
    }

    /// Returns a copy of the record with `id`.
    pub fn get(&self, id: &R::Id) -> Option<R> {
        self.records.read().get(id).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Record> EntityStore<R> for MemoryStore<R> {
    fn fetch_matching(&self, predicate: &dyn Fn(&R) -> bool) -> Vec<R> {
        self.records
            .read()
            .values()
            .filter(|record| predicate(record))
            .cloned()
            .collect()
    }

    fn subscribe(&self) -> Receiver<Vec<R>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }
}

/// Routes store notifications to change trackers.
///
/// Notifications are buffered until [`StoreObserver::process_changes`] runs,
/// which should happen on the same context that drives the engine.
pub struct StoreObserver<R: Record> {
    changes: Receiver<Vec<R>>,
    trackers: Vec<Box<dyn ChangeTracker<R> + Send>>,
}

impl<R: Record> StoreObserver<R> {
    /// Subscribes to `store`.
    pub fn new<S: EntityStore<R>>(store: &S) -> Self {
        Self {
            changes: store.subscribe(),
            trackers: Vec::new(),
        }
    }

    /// Registers a tracker and feeds it the records it already matches.
    pub fn add_tracker<S, C>(&mut self, store: &S, tracker: C)
    where
        S: EntityStore<R>,
        C: ChangeTracker<R> + Send + 'static,
    {
        let initial = store.fetch_matching(&|record: &R| tracker.is_tracked(record));
        trace!(count = initial.len(), "bootstrapping tracker");
        tracker.add_tracked_objects(&initial);
        self.trackers.push(Box::new(tracker));
    }

    /// Delivers buffered notifications to every tracker.
    ///
    /// Returns the number of changed records processed.
    pub fn process_changes(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(records) = self.changes.try_recv() {
            for tracker in &self.trackers {
                tracker.objects_did_change(&records);
            }
            processed += records.len();
        }
        processed
    }

    /// Number of registered trackers.
    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }
}
