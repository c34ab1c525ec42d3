//! Storage backend abstraction for the document store.
//!
//! This module defines the traits that abstract over document store implementations so the
//! gateway and the transaction coordinator can run against MongoDB, an in-memory store, or
//! anything else that speaks filters and update operators.
//!
//! # Traits
//!
//! - [`StoreOps`]: CRUD primitives, shared by backends and their transactions
//! - [`StoreBackend`]: a store that can open multi-document transactions
//! - [`StoreTransaction`]: an open transaction; every [`StoreOps`] call made through it is
//!   invisible to other readers until [`StoreTransaction::commit`]
//! - [`StoreBackendBuilder`]: factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use reslayer::backend::{StoreBackend, StoreOps, StoreTransaction};
//! use bson::doc;
//!
//! let txn = backend.start_transaction().await?;
//! txn.insert_one("users", doc! { "name": "Alice" }).await?;
//! txn.insert_one("audit", doc! { "event": "signup" }).await?;
//! txn.commit().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::fmt::Debug;

use async_trait::async_trait;
use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::{
    error::ResourceResult,
    query::{Expr, Query, Update},
};

/// Matched and modified counts reported by update and replace calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCounts {
    pub matched: u64,
    pub modified: u64,
}

impl std::ops::AddAssign for UpdateCounts {
    fn add_assign(&mut self, other: Self) {
        self.matched += other.matched;
        self.modified += other.modified;
    }
}

/// CRUD primitives against named collections.
///
/// # Identity
///
/// Documents are identified by their `_id` field. Inserts without an `_id` get one
/// generated by the backend (an ObjectId), and the id is returned to the caller.
///
/// # Error Handling
///
/// Driver failures are reported as [`ResourceError::Store`](crate::error::ResourceError::Store).
#[async_trait]
pub trait StoreOps: Send + Sync + Debug {
    /// Inserts one document, returning its `_id`.
    ///
    /// Fails if a document with the same `_id` already exists.
    async fn insert_one(&self, collection: &str, document: Document) -> ResourceResult<Bson>;

    /// Inserts several documents, returning their `_id`s in input order.
    async fn insert_many(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> ResourceResult<Vec<Bson>>;

    /// Counts the documents matching `filter` exactly.
    async fn count_documents(&self, collection: &str, filter: &Expr) -> ResourceResult<u64>;

    /// Returns a fast, possibly approximate, count of the whole collection.
    async fn estimated_count(&self, collection: &str) -> ResourceResult<u64>;

    /// Runs a structured query.
    ///
    /// Applies the query's filter, then sort, offset and limit, then projection. A
    /// projection always keeps `_id`.
    async fn find(&self, collection: &str, query: Query) -> ResourceResult<Vec<Document>>;

    /// Returns the first document matched by `query`, if any.
    async fn find_one(&self, collection: &str, query: Query) -> ResourceResult<Option<Document>> {
        let mut query = query;
        query.limit = Some(1);

        Ok(self.find(collection, query).await?.into_iter().next())
    }

    /// Applies `update` to every document matching `filter`.
    async fn update_many(
        &self,
        collection: &str,
        filter: &Expr,
        update: &Update,
    ) -> ResourceResult<UpdateCounts>;

    /// Applies `update` to the first document matching `filter`.
    async fn update_one(
        &self,
        collection: &str,
        filter: &Expr,
        update: &Update,
    ) -> ResourceResult<UpdateCounts>;

    /// Applies each `(filter, update)` pair to the first document its filter matches, as
    /// one write: either every pair is applied or none is.
    async fn update_batch(
        &self,
        collection: &str,
        updates: &[(Expr, Update)],
    ) -> ResourceResult<UpdateCounts>;

    /// Replaces the first document matching `filter` with `replacement`, keeping its `_id`.
    async fn replace_one(
        &self,
        collection: &str,
        filter: &Expr,
        replacement: Document,
    ) -> ResourceResult<UpdateCounts>;

    /// Deletes the first document matching `filter`, returning the number removed.
    async fn delete_one(&self, collection: &str, filter: &Expr) -> ResourceResult<u64>;

    /// Deletes every document matching `filter`, returning the number removed.
    async fn delete_many(&self, collection: &str, filter: &Expr) -> ResourceResult<u64>;
}

/// A document store that can open multi-document transactions.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks. A [`StoreTransaction`] is owned by exactly one task.
#[async_trait]
pub trait StoreBackend: StoreOps {
    type Transaction: StoreTransaction;

    /// Opens a transaction.
    ///
    /// Writes made through the transaction become visible atomically on
    /// [`StoreTransaction::commit`] and are discarded on [`StoreTransaction::abort`].
    async fn start_transaction(&self) -> ResourceResult<Self::Transaction>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external connections
    /// should override this.
    async fn shutdown(self) -> ResourceResult<()>
    where
        Self: Sized,
    {
        Ok(())
    }
}

/// An open store transaction.
#[async_trait]
pub trait StoreTransaction: StoreOps {
    /// Makes every write of the transaction visible at once.
    async fn commit(self) -> ResourceResult<()>;

    /// Discards every write of the transaction.
    async fn abort(self) -> ResourceResult<()>;
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> ResourceResult<Self::Backend>;
}
