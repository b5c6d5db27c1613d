//! # objsync testkit
//!
//! Test utilities for objsync.
//!
//! This crate provides:
//! - Recording transcoder and delegate fixtures
//! - A test record type for source and store tests
//! - Property-based generators for engine operation sequences
//! - An invariant-checking harness that replays those sequences
//! - Scripted scenario vectors stored as JSON
//!
//! ## Usage
//!
//! ```rust,ignore
//! use objsync_testkit::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn working_set_stays_disjoint(ops in engine_ops_strategy(1, 64)) {
//!         let mut harness = EngineHarness::new(3);
//!         for op in &ops {
//!             harness.apply(op);
//!             harness.check_invariants();
//!         }
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod harness;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::vectors::*;
    pub use proptest::prelude::*;
}

pub use fixtures::*;
pub use generators::*;
pub use harness::*;
pub use vectors::*;
