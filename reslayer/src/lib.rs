//! Main reslayer crate: a resource layer over JSON document stores.
//!
//! This crate is the primary entry point for users of reslayer. It re-exports the core
//! types from the sub-crates, gives access to the storage backends, and assembles a
//! [`ResourceService`](service::ResourceService) from layered settings.
//!
//! # Features
//!
//! - **Policy-gated CRUD** - Only collections marked reachable can be touched
//! - **Transform pipeline** - Path rules coerce ids, dates, passwords and encrypted fields
//! - **Staged transactions** - Writes from several requests commit atomically, or not at all
//! - **Change events** - Every committed write can be published to an event log
//!
//! # Quick Start
//!
//! ```ignore
//! use reslayer::{prelude::*, bson::doc};
//!
//! #[tokio::main]
//! async fn main() -> ResourceResult<()> {
//!     let settings = reslayer::settings::load_or_default("reslayer.yaml");
//!     reslayer::telemetry::init(&settings.logging)?;
//!
//!     let service = reslayer::in_memory(&settings)?;
//!     let rules = TransformRules::new().rule("owner", CoercionKind::Oid);
//!
//!     // Stage two writes from separate requests, then commit them together
//!     let txn = service.begin().await?;
//!     service.create("orders", doc! { "owner": "64b7f0c2a1b2c3d4e5f60718" }, &rules, Some(&txn)).await?;
//!     service.update("stock", doc! { "sku": "A1" }, doc! { "$inc": { "count": -1 } }, &rules, Some(&txn)).await?;
//!
//!     let outcomes = service.commit(&txn).await?;
//!     println!("committed: {outcomes:?}");
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - In-process store, staging log and event log
//! - [`mongodb`] - MongoDB document store (requires `mongodb` feature)
//! - [`redis`] - Redis staging log and stream event log (requires `redis` feature)
//!
//! With both features enabled, [`connect`] builds a service on MongoDB and Redis.

pub mod assemble;
pub mod prelude;
pub mod telemetry;

pub use reslayer_core::{
    backend, error, event, gateway, operation, policy, query, secret, service, settings, staging,
    transaction, transform,
};

pub use assemble::{InMemoryService, assemble, in_memory};
#[cfg(all(feature = "mongodb", feature = "redis"))]
pub use assemble::{ConnectedService, connect};

// Re-export BSON types for convenience
pub use bson;

/// In-memory backend implementations.
pub mod memory {
    pub use reslayer_memory::{
        InMemoryEventLog, InMemoryStagingLog, InMemoryStore, InMemoryStoreBuilder,
        InMemoryTransaction,
    };
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use reslayer_mongodb::{MongoDbStore, MongoDbStoreBuilder, MongoDbTransaction};
}

/// Redis staging log and event log.
///
/// This module is only available when the `redis` feature is enabled.
#[cfg(feature = "redis")]
pub mod redis {
    pub use reslayer_redis::{RedisEventLog, RedisStagingLog};
}
