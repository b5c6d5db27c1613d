//! Entity and record traits.

use std::fmt;
use std::hash::Hash;

/// A uniquely identifiable unit of synchronizable state.
///
/// The engine never looks inside an entity; it only needs equality, hashing
/// and the ability to hand copies to callbacks. Typically this is an
/// identifier (a UUID, a numeric key) rather than the full record.
pub trait Entity: Clone + Eq + Hash + fmt::Debug + Send + 'static {}

impl<T> Entity for T where T: Clone + Eq + Hash + fmt::Debug + Send + 'static {}

/// A persisted record with a stable identity.
///
/// Sources observe records and publish their identity to the engine.
pub trait Record: Clone + Send + 'static {
    /// Identity type published to the engine.
    type Id: Entity;

    /// Returns the record's identity.
    fn id(&self) -> Self::Id;
}

/// Records that track which of their properties changed locally.
pub trait ModifiedKeys {
    /// Returns true if `key` has a local modification not yet pushed.
    fn has_modified_key(&self, key: &str) -> bool;
}
