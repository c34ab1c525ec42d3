//! In-memory backends for reslayer.
//!
//! This crate provides thread-safe, in-memory implementations of every reslayer seam:
//!
//! - [`InMemoryStore`] - document store with journaled transactions
//! - [`InMemoryStagingLog`] - expiring staging log for staged transactions
//! - [`InMemoryEventLog`] - per-channel change event log
//!
//! They use async-aware read-write locks for concurrent access and are ideal for
//! development, testing, and single-process deployments.
//!
//! # Quick Start
//!
//! ```ignore
//! use reslayer::prelude::*;
//! use reslayer::memory::{InMemoryEventLog, InMemoryStagingLog, InMemoryStore};
//!
//! let service = ResourceService::new(
//!     InMemoryStore::new(),
//!     TransactionCoordinator::new(InMemoryStagingLog::new(), "app"),
//!     DocumentGateway::new(EventPublisher::new(InMemoryEventLog::new(), "app")),
//!     PolicyStore::new(PolicyTable::new().with("notes", CollectionPolicy::reachable())),
//! );
//! ```

#[allow(unused_extern_crates)]
extern crate self as reslayer_memory;

mod collection;
mod evaluator;
pub mod staging;
pub mod store;

pub use staging::{InMemoryEventLog, InMemoryStagingLog};
pub use store::{InMemoryStore, InMemoryStoreBuilder, InMemoryTransaction};
