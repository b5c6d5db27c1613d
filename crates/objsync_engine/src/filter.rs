//! Inclusion filters.
//!
//! Filters temporarily hold back entities that are pending. Every registered
//! filter must include an entity for it to be scheduled.

use crate::entity::Entity;
use objsync_graph::DependencyGraph;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::Arc;

/// A predicate deciding whether a pending entity may be scheduled now.
pub trait ObjectFilter<E> {
    /// Returns true if `object` is eligible for the next batch.
    fn is_included(&self, object: &E) -> bool;
}

impl<E, F> ObjectFilter<E> for F
where
    F: Fn(&E) -> bool,
{
    fn is_included(&self, object: &E) -> bool {
        self(object)
    }
}

/// A dependency graph shared between the engine and the code that resolves
/// dependencies.
pub type SharedDependencyGraph<E, D> = Arc<Mutex<DependencyGraph<E, D>>>;

/// Dependency bookkeeping the engine keeps in step with entity lifecycle.
pub trait DependencyTracker<E>: Send {
    /// Returns true if `object` still waits on a dependency.
    fn is_blocked(&self, object: &E) -> bool;

    /// Drops every edge where `object` is the dependent.
    fn clear_dependent(&self, object: &E);
}

/// Excludes entities that still have a registered dependency.
pub struct DependencyFilter<E, D> {
    graph: SharedDependencyGraph<E, D>,
}

impl<E, D> DependencyFilter<E, D> {
    /// Creates a filter over a shared graph.
    pub fn new(graph: SharedDependencyGraph<E, D>) -> Self {
        Self { graph }
    }

    /// Returns the shared graph.
    pub fn graph(&self) -> &SharedDependencyGraph<E, D> {
        &self.graph
    }
}

impl<E, D> Clone for DependencyFilter<E, D> {
    fn clone(&self) -> Self {
        Self {
            graph: Arc::clone(&self.graph),
        }
    }
}

impl<E, D> ObjectFilter<E> for DependencyFilter<E, D>
where
    E: Entity,
    D: Eq + Hash + Clone,
{
    fn is_included(&self, object: &E) -> bool {
        !self.graph.lock().is_blocked(object)
    }
}

impl<E, D> DependencyTracker<E> for DependencyFilter<E, D>
where
    E: Entity,
    D: Eq + Hash + Clone + Send,
{
    fn is_blocked(&self, object: &E) -> bool {
        self.graph.lock().is_blocked(object)
    }

    fn clear_dependent(&self, object: &E) {
        self.graph.lock().remove_dependent(object);
    }
}
