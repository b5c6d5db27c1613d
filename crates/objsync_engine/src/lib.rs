//! # objsync engine
//!
//! Synchronization core that keeps a working set of local entities in step
//! with an authoritative remote store.
//!
//! This crate provides:
//! - The object sync state machine (pending -> in flight -> resolved)
//! - Pluggable inclusion filters, including dependency-aware filtering
//! - Change sources that turn persistence notifications into sync events
//! - The transcoder contract for building batched requests
//! - A completion delegate and per-entity completion handlers
//! - An async driver that dispatches batches over a transport
//!
//! ## Architecture
//!
//! ```text
//! store --changes--> ChangeSource --publish/unpublish--> ObjectSync
//!                                                            |
//!                               filters + fetch limit        v
//!                         Transcoder <--- batch ---- next_request()
//!                             |                              ^
//!                          request --> Transport --> response/complete()
//! ```
//!
//! ## Key Invariants
//!
//! - `pending` and `in_flight` are always disjoint
//! - A batch is reconciled at most once (it is a move-only value)
//! - Cancellation never preempts an in-flight batch
//! - All mutation happens through `&mut ObjectSync`, so a single owner
//!   serializes scheduling and reconciliation

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod delegate;
mod driver;
mod engine;
mod entity;
mod error;
mod filter;
mod source;
mod store;
mod transcoder;
mod transport;

pub use config::SyncConfig;
pub use delegate::{SyncDelegate, SyncEvent};
pub use driver::SyncDriver;
pub use engine::{Batch, BatchId, ObjectSync, OutboundRequest, SyncStats};
pub use entity::{Entity, ModifiedKeys, Record};
pub use error::{SyncError, SyncResult};
pub use filter::{DependencyFilter, DependencyTracker, ObjectFilter, SharedDependencyGraph};
pub use source::{
    ChangeTracker, ModifiedKeySource, ObjectSource, PredicateSource, Publisher, SourceEvent,
};
pub use store::{EntityStore, MemoryStore, StoreObserver};
pub use transcoder::{ObjectTranscoder, ResponseStatus, TransportResponse};
pub use transport::{CompletionSender, MockTransport, Transport};

pub use objsync_graph::DependencyGraph;
