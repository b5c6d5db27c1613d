//! Dependency graph storage.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;

/// A many-to-many index of `dependent -> dependency` edges.
///
/// Each edge is stored twice, keyed once by the dependent and once by the
/// dependency, so both "what blocks A?" and "what does B block?" are single
/// hash lookups. Graphs here are small (tens to low hundreds of live edges)
/// and queried on every scheduling tick.
///
/// # Example
///
/// ```rust
/// use objsync_graph::DependencyGraph;
///
/// let mut graph = DependencyGraph::new();
/// graph.add("message-1", "conversation-a");
/// graph.add("message-2", "conversation-a");
///
/// assert!(graph.is_blocked(&"message-1"));
///
/// let released = graph.enumerate_and_remove(&"conversation-a", |_| true);
/// assert_eq!(released.len(), 2);
/// assert!(graph.is_empty());
/// ```
pub struct DependencyGraph<T, D> {
    /// dependent -> its dependencies
    dependencies_by_dependent: HashMap<T, HashSet<D>>,
    /// dependency -> its dependents (inverse of the above)
    dependents_by_dependency: HashMap<D, HashSet<T>>,
}

impl<T, D> DependencyGraph<T, D>
where
    T: Eq + Hash + Clone,
    D: Eq + Hash + Clone,
{
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            dependencies_by_dependent: HashMap::new(),
            dependents_by_dependency: HashMap::new(),
        }
    }

    /// Registers that `dependent` cannot be treated as resolved until
    /// `dependency` clears.
    ///
    /// Adding an edge that already exists has no effect.
    pub fn add(&mut self, dependent: T, dependency: D) {
        self.dependents_by_dependency
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        self.dependencies_by_dependent
            .entry(dependent)
            .or_default()
            .insert(dependency);
    }

    /// Returns an arbitrary dependency still registered for `dependent`.
    ///
    /// Returns `None` once the dependent is fully resolved.
    pub fn any_dependency(&self, dependent: &T) -> Option<&D> {
        self.dependencies_by_dependent
            .get(dependent)
            .and_then(|dependencies| dependencies.iter().next())
    }

    /// Returns true if `dependent` has at least one registered dependency.
    pub fn is_blocked(&self, dependent: &T) -> bool {
        self.dependencies_by_dependent.contains_key(dependent)
    }

    /// Returns a copy of every dependency registered for `dependent`.
    pub fn dependencies(&self, dependent: &T) -> HashSet<D> {
        self.dependencies_by_dependent
            .get(dependent)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a copy of every dependent blocked on `dependency`.
    pub fn dependents(&self, dependency: &D) -> HashSet<T> {
        self.dependents_by_dependency
            .get(dependency)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns true if the edge `dependent -> dependency` is registered.
    pub fn contains(&self, dependent: &T, dependency: &D) -> bool {
        self.dependencies_by_dependent
            .get(dependent)
            .is_some_and(|dependencies| dependencies.contains(dependency))
    }

    /// Clears exactly one edge.
    ///
    /// Returns true if the edge existed.
    pub fn remove(&mut self, dependency: &D, dependent: &T) -> bool {
        let removed = detach(&mut self.dependencies_by_dependent, dependent, dependency);
        if removed {
            detach(&mut self.dependents_by_dependency, dependency, dependent);
        }
        removed
    }

    /// Releases the dependents of `dependency` selected by `predicate`.
    ///
    /// The predicate is evaluated for every dependent currently blocked on
    /// `dependency` before any edge is removed, so it always sees the
    /// complete set. Returns the dependents whose edge was removed.
    pub fn enumerate_and_remove<F>(&mut self, dependency: &D, mut predicate: F) -> HashSet<T>
    where
        F: FnMut(&T) -> bool,
    {
        let released: HashSet<T> = match self.dependents_by_dependency.get(dependency) {
            Some(dependents) => dependents
                .iter()
                .filter(|dependent| predicate(*dependent))
                .cloned()
                .collect(),
            None => return HashSet::new(),
        };

        for dependent in &released {
            self.remove(dependency, dependent);
        }
        released
    }

    /// Drops every edge where `dependent` is the blocked side.
    ///
    /// Returns the dependencies it was waiting on.
    pub fn remove_dependent(&mut self, dependent: &T) -> HashSet<D> {
        let dependencies = self
            .dependencies_by_dependent
            .remove(dependent)
            .unwrap_or_default();
        for dependency in &dependencies {
            detach(&mut self.dependents_by_dependency, dependency, dependent);
        }
        dependencies
    }

    /// Drops every edge pointing at `dependency`.
    ///
    /// Returns the dependents that were blocked on it.
    pub fn remove_dependency(&mut self, dependency: &D) -> HashSet<T> {
        let dependents = self
            .dependents_by_dependency
            .remove(dependency)
            .unwrap_or_default();
        for dependent in &dependents {
            detach(&mut self.dependencies_by_dependent, dependent, dependency);
        }
        dependents
    }

    /// Iterates over every registered edge as `(dependent, dependency)`.
    pub fn edges(&self) -> impl Iterator<Item = (&T, &D)> + '_ {
        self.dependencies_by_dependent
            .iter()
            .flat_map(|(dependent, dependencies)| {
                dependencies
                    .iter()
                    .map(move |dependency| (dependent, dependency))
            })
    }

    /// Number of registered edges.
    pub fn len(&self) -> usize {
        self.dependencies_by_dependent
            .values()
            .map(HashSet::len)
            .sum()
    }

    /// Returns true if no edges are registered.
    pub fn is_empty(&self) -> bool {
        self.dependencies_by_dependent.is_empty()
    }

    /// Number of distinct dependents with at least one edge.
    pub fn dependent_count(&self) -> usize {
        self.dependencies_by_dependent.len()
    }

    /// Number of distinct dependencies with at least one edge.
    pub fn dependency_count(&self) -> usize {
        self.dependents_by_dependency.len()
    }

    /// Removes all edges.
    pub fn clear(&mut self) {
        self.dependencies_by_dependent.clear();
        self.dependents_by_dependency.clear();
    }

    /// Returns true if the forward and inverse maps describe the same edges
    /// and neither holds an empty set.
    pub fn is_consistent(&self) -> bool {
        let forward_ok = self
            .dependencies_by_dependent
            .iter()
            .all(|(dependent, dependencies)| {
                !dependencies.is_empty()
                    && dependencies.iter().all(|dependency| {
                        self.dependents_by_dependency
                            .get(dependency)
                            .is_some_and(|dependents| dependents.contains(dependent))
                    })
            });
        let inverse_ok = self
            .dependents_by_dependency
            .iter()
            .all(|(dependency, dependents)| {
                !dependents.is_empty()
                    && dependents.iter().all(|dependent| {
                        self.dependencies_by_dependent
                            .get(dependent)
                            .is_some_and(|dependencies| dependencies.contains(dependency))
                    })
            });
        forward_ok && inverse_ok
    }
}

impl<T, D> Default for DependencyGraph<T, D>
where
    T: Eq + Hash + Clone,
    D: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone, D: Clone> Clone for DependencyGraph<T, D> {
    fn clone(&self) -> Self {
        Self {
            dependencies_by_dependent: self.dependencies_by_dependent.clone(),
            dependents_by_dependency: self.dependents_by_dependency.clone(),
        }
    }
}

impl<T: fmt::Debug, D: fmt::Debug> fmt::Debug for DependencyGraph<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.dependencies_by_dependent.iter())
            .finish()
    }
}

/// Removes `value` from the set stored under `key`, pruning the set if it
/// becomes empty.
fn detach<K, V>(map: &mut HashMap<K, HashSet<V>>, key: &K, value: &V) -> bool
where
    K: Eq + Hash,
    V: Eq + Hash,
{
    let Some(values) = map.get_mut(key) else {
        return false;
    };
    let removed = values.remove(value);
    if values.is_empty() {
        map.remove(key);
    }
    removed
}
