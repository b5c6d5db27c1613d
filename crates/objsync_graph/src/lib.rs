//! # objsync graph
//!
//! Bidirectional many-to-many dependency index.
//!
//! This crate provides [`DependencyGraph`], a pure bookkeeping structure that
//! records "dependent A cannot be processed until dependency B is resolved".
//!
//! ## Key Invariants
//!
//! - Every edge is stored in a forward map and an inverse map
//! - The two maps are always exact mirror images
//! - Empty edge sets are never kept around
//! - No operation fails; misuse is a no-op
//!
//! The graph has no I/O and no locking of its own. Callers that share it
//! across owners are responsible for serializing access.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod graph;

pub use graph::DependencyGraph;
