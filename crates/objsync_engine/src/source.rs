//! Change sources.
//!
//! A source decides when an entity starts or stops needing a round-trip and
//! reports it through a [`Publisher`]. Publications are queued and applied by
//! the engine on its own context, so sources may live anywhere.

use crate::entity::{ModifiedKeys, Record};
use std::sync::mpsc::Sender;

/// A relevance change reported by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent<E> {
    /// The entity needs to be synchronized.
    Publish(E),
    /// The entity no longer needs to be synchronized.
    Unpublish(E),
}

/// Sending half handed to sources by the engine.
#[derive(Debug)]
pub struct Publisher<E> {
    sender: Sender<SourceEvent<E>>,
}

impl<E> Publisher<E> {
    pub(crate) fn new(sender: Sender<SourceEvent<E>>) -> Self {
        Self { sender }
    }

    /// Reports that `object` needs to be synchronized.
    ///
    /// Returns false if the engine has been dropped.
    pub fn publish(&self, object: E) -> bool {
        self.sender.send(SourceEvent::Publish(object)).is_ok()
    }

    /// Reports that `object` no longer needs to be synchronized.
    ///
    /// Returns false if the engine has been dropped.
    pub fn unpublish(&self, object: E) -> bool {
        self.sender.send(SourceEvent::Unpublish(object)).is_ok()
    }
}

impl<E> Clone for Publisher<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// Something that reports relevance changes to an engine.
pub trait ObjectSource<E> {
    /// Connects the source to an engine. A source may be attached to several
    /// engines; each receives every event.
    fn attach(&mut self, publisher: Publisher<E>);
}

/// Persistence-facing side of a source.
pub trait ChangeTracker<R: Record> {
    /// The condition used to fetch the initial set of tracked records.
    fn is_tracked(&self, record: &R) -> bool;

    /// Called with records that changed in the store.
    fn objects_did_change(&self, records: &[R]);

    /// Called once with the records that matched when tracking started.
    fn add_tracked_objects(&self, records: &[R]) {
        self.objects_did_change(records);
    }
}

fn publish_all<E: Clone>(publishers: &[Publisher<E>], object: &E) {
    for publisher in publishers {
        publisher.publish(object.clone());
    }
}

fn unpublish_all<E: Clone>(publishers: &[Publisher<E>], object: &E) {
    for publisher in publishers {
        publisher.unpublish(object.clone());
    }
}

/// Publishes a record while a predicate holds and unpublishes it otherwise.
pub struct PredicateSource<R: Record> {
    predicate: Box<dyn Fn(&R) -> bool + Send + Sync>,
    publishers: Vec<Publisher<R::Id>>,
}

impl<R: Record> PredicateSource<R> {
    /// Creates a source for `predicate`.
    pub fn new<P>(predicate: P) -> Self
    where
        P: Fn(&R) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Box::new(predicate),
            publishers: Vec::new(),
        }
    }
}

impl<R: Record> ObjectSource<R::Id> for PredicateSource<R> {
    fn attach(&mut self, publisher: Publisher<R::Id>) {
        self.publishers.push(publisher);
    }
}

impl<R: Record> ChangeTracker<R> for PredicateSource<R> {
    fn is_tracked(&self, record: &R) -> bool {
        (self.predicate)(record)
    }

    fn objects_did_change(&self, records: &[R]) {
        for record in records {
            let id = record.id();
            if self.is_tracked(record) {
                publish_all(&self.publishers, &id);
            } else {
                unpublish_all(&self.publishers, &id);
            }
        }
    }
}

/// Publishes a record whenever a tracked key has been modified locally.
///
/// An optional predicate further restricts which modified records count.
/// This source never unpublishes.
pub struct ModifiedKeySource<R: Record> {
    tracked_key: String,
    predicate: Option<Box<dyn Fn(&R) -> bool + Send + Sync>>,
    publishers: Vec<Publisher<R::Id>>,
}

impl<R: Record + ModifiedKeys> ModifiedKeySource<R> {
    /// Creates a source tracking `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            tracked_key: key.into(),
            predicate: None,
            publishers: Vec::new(),
        }
    }

    /// Only records matching `predicate` are considered modified.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Box::new(predicate));
        self
    }

    /// Returns the tracked key.
    pub fn tracked_key(&self) -> &str {
        &self.tracked_key
    }
}

impl<R: Record> ObjectSource<R::Id> for ModifiedKeySource<R> {
    fn attach(&mut self, publisher: Publisher<R::Id>) {
        self.publishers.push(publisher);
    }
}

impl<R: Record + ModifiedKeys> ChangeTracker<R> for ModifiedKeySource<R> {
    fn is_tracked(&self, record: &R) -> bool {
        self.predicate
            .as_ref()
            .map_or(true, |predicate| predicate(record))
    }

    fn objects_did_change(&self, records: &[R]) {
        for record in records {
            if record.has_modified_key(&self.tracked_key) && self.is_tracked(record) {
                publish_all(&self.publishers, &record.id());
            }
        }
    }
}
