//! In-memory storage implementation for document stores.
//!
//! This module provides a simple in-memory backend that stores documents as BSON
//! documents in HashMaps guarded by async-safe read-write locks, together with
//! transactions that journal their writes and replay them at commit.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use async_trait::async_trait;
use bson::{Bson, Document};
use mea::rwlock::RwLock;

use reslayer_core::{
    backend::{StoreBackend, StoreBackendBuilder, StoreOps, StoreTransaction, UpdateCounts},
    error::ResourceResult,
    query::{Expr, Query, Update},
};

use crate::collection::{Collection, with_id};

type StoreMap = HashMap<String, Collection>;

/// Thread-safe in-memory document storage backend.
///
/// This struct implements the [`StoreBackend`] trait to provide a fully functional
/// document store that operates entirely in memory using async-aware read-write locks.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Multiple clones of the same instance
/// share the same underlying data.
///
/// # Transactions
///
/// A transaction works on private copies of the collections it touches and records
/// its writes. Commit replays them against the live collections, so it behaves as if
/// the whole transaction ran at commit time.
///
/// # Example
///
/// ```ignore
/// use reslayer_memory::InMemoryStore;
/// use reslayer::backend::{StoreBackend, StoreOps, StoreTransaction};
/// use bson::doc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///
///     let txn = store.start_transaction().await?;
///     txn.insert_one("users", doc! { "name": "Alice" }).await?;
///     assert_eq!(store.estimated_count("users").await?, 0);
///
///     txn.commit().await?;
///     assert_eq!(store.estimated_count("users").await?, 1);
///
///     Ok(())
/// }
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// collection_name -> documents
    collections: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder
    }

    async fn snapshot(&self, name: &str) -> Collection {
        self.collections
            .read()
            .await
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    async fn read<T>(&self, name: &str, f: impl FnOnce(&Collection) -> T + Send) -> T {
        let collections = self.collections.read().await;
        f(collections.get(name).unwrap_or(&Collection::default()))
    }

    async fn write<T>(&self, name: &str, f: impl FnOnce(&mut Collection) -> T + Send) -> T {
        let mut collections = self.collections.write().await;
        f(collections.entry(name.to_string()).or_default())
    }
}

#[async_trait]
impl StoreOps for InMemoryStore {
    async fn insert_one(&self, collection: &str, document: Document) -> ResourceResult<Bson> {
        self.write(collection, |c| c.insert(collection, document)).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> ResourceResult<Vec<Bson>> {
        self.write(collection, |c| c.insert_many(collection, documents)).await
    }

    async fn count_documents(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        Ok(self.read(collection, |c| c.count(filter)).await)
    }

    async fn estimated_count(&self, collection: &str) -> ResourceResult<u64> {
        Ok(self.read(collection, |c| c.len() as u64).await)
    }

    async fn find(&self, collection: &str, query: Query) -> ResourceResult<Vec<Document>> {
        Ok(self.read(collection, |c| c.find(&query)).await)
    }

    async fn update_many(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        self.write(collection, |c| c.update(filter, update, true)).await
    }

    async fn update_one(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        self.write(collection, |c| c.update(filter, update, false)).await
    }

    async fn update_batch(&self, collection: &str, updates: &[(Expr, Update)]) -> ResourceResult<UpdateCounts> {
        self.write(collection, |c| c.update_batch(updates)).await
    }

    async fn replace_one(&self, collection: &str, filter: &Expr, replacement: Document) -> ResourceResult<UpdateCounts> {
        Ok(self.write(collection, |c| c.replace(filter, replacement)).await)
    }

    async fn delete_one(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        Ok(self.write(collection, |c| c.delete(filter, false)).await)
    }

    async fn delete_many(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        Ok(self.write(collection, |c| c.delete(filter, true)).await)
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn start_transaction(&self) -> ResourceResult<InMemoryTransaction> {
        Ok(InMemoryTransaction {
            store: self.clone(),
            pending: RwLock::new(Pending::default()),
        })
    }
}

/// A recorded transaction write, replayed against the live collection on commit.
type Replay = Box<dyn Fn(&mut Collection) -> ResourceResult<()> + Send + Sync>;

#[derive(Default)]
struct Pending {
    /// Private copies of every collection the transaction has written.
    working: StoreMap,
    /// Every successful write, in order, with the collection it targets.
    journal: Vec<(String, Replay)>,
}

/// An open transaction on an [`InMemoryStore`].
///
/// Reads see the transaction's own writes; other readers see none of them until
/// [`StoreTransaction::commit`]. Commit replays the recorded writes against the live
/// collections under the store write lock, so writes made by others while the
/// transaction was open are kept. If any replayed write fails the store is left as
/// it was.
pub struct InMemoryTransaction {
    store: InMemoryStore,
    pending: RwLock<Pending>,
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction").finish_non_exhaustive()
    }
}

impl InMemoryTransaction {
    async fn read<T>(&self, name: &str, f: impl FnOnce(&Collection) -> T + Send) -> T {
        {
            let pending = self.pending.read().await;
            if let Some(collection) = pending.working.get(name) {
                return f(collection);
            }
        }

        self.store.read(name, f).await
    }

    /// Applies `op` to the working copy and records it for commit when it succeeds.
    async fn write<T, F>(&self, name: &str, op: F) -> ResourceResult<T>
    where
        T: 'static,
        F: Fn(&mut Collection) -> ResourceResult<T> + Send + Sync + 'static,
    {
        let mut pending = self.pending.write().await;
        let collection = match pending.working.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.store.snapshot(name).await),
        };

        let output = op(collection)?;
        let replay: Replay = Box::new(move |collection: &mut Collection| op(collection).map(|_| ()));
        pending.journal.push((name.to_string(), replay));

        Ok(output)
    }
}

#[async_trait]
impl StoreOps for InMemoryTransaction {
    async fn insert_one(&self, collection: &str, document: Document) -> ResourceResult<Bson> {
        let (id, document) = with_id(document);
        let name = collection.to_string();
        self.write(collection, move |c| c.insert(&name, document.clone())).await?;

        Ok(id)
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> ResourceResult<Vec<Bson>> {
        let documents = documents.into_iter().map(|document| with_id(document).1).collect::<Vec<_>>();
        let name = collection.to_string();
        self.write(collection, move |c| c.insert_many(&name, documents.clone())).await
    }

    async fn count_documents(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        Ok(self.read(collection, |c| c.count(filter)).await)
    }

    async fn estimated_count(&self, collection: &str) -> ResourceResult<u64> {
        Ok(self.read(collection, |c| c.len() as u64).await)
    }

    async fn find(&self, collection: &str, query: Query) -> ResourceResult<Vec<Document>> {
        Ok(self.read(collection, |c| c.find(&query)).await)
    }

    async fn update_many(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        let (filter, update) = (filter.clone(), update.clone());
        self.write(collection, move |c| c.update(&filter, &update, true)).await
    }

    async fn update_one(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        let (filter, update) = (filter.clone(), update.clone());
        self.write(collection, move |c| c.update(&filter, &update, false)).await
    }

    async fn update_batch(&self, collection: &str, updates: &[(Expr, Update)]) -> ResourceResult<UpdateCounts> {
        let updates = updates.to_vec();
        self.write(collection, move |c| c.update_batch(&updates)).await
    }

    async fn replace_one(&self, collection: &str, filter: &Expr, replacement: Document) -> ResourceResult<UpdateCounts> {
        let filter = filter.clone();
        self.write(collection, move |c| Ok(c.replace(&filter, replacement.clone())))
            .await
    }

    async fn delete_one(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        let filter = filter.clone();
        self.write(collection, move |c| Ok(c.delete(&filter, false))).await
    }

    async fn delete_many(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        let filter = filter.clone();
        self.write(collection, move |c| Ok(c.delete(&filter, true))).await
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(self) -> ResourceResult<()> {
        let Pending { journal, .. } = std::mem::take(&mut *self.pending.write().await);
        let mut collections = self.store.collections.write().await;

        let mut replayed = StoreMap::new();
        for (name, replay) in &journal {
            let collection = match replayed.entry(name.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    entry.insert(collections.get(name).cloned().unwrap_or_default())
                }
            };

            if let Err(err) = replay(collection) {
                tracing::warn!(collection = %name, error = %err, "in-memory transaction commit rejected");
                return Err(err);
            }
        }

        let touched = replayed.len();
        collections.extend(replayed);
        tracing::debug!(collections = touched, writes = journal.len(), "in-memory transaction committed");

        Ok(())
    }

    async fn abort(self) -> ResourceResult<()> {
        tracing::debug!("in-memory transaction aborted");
        Ok(())
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use reslayer_memory::InMemoryStore;
/// use reslayer::backend::StoreBackendBuilder;
///
/// #[tokio::main]
/// async fn main() {
///     let store = InMemoryStore::builder().build().await.unwrap();
/// }
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder;

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    async fn build(self) -> ResourceResult<Self::Backend> {
        Ok(InMemoryStore::new())
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use reslayer_core::{error::ResourceError, query::Filter};

    use super::*;

    #[tokio::test]
    async fn test_transaction_writes_are_isolated_until_commit() {
        let store = InMemoryStore::new();
        store.insert_one("notes", doc! { "_id": 1, "n": 1 }).await.unwrap();

        let txn = store.start_transaction().await.unwrap();
        txn.insert_one("notes", doc! { "_id": 2, "n": 2 }).await.unwrap();
        txn.update_one("notes", &Filter::id(1), &Update::new().set("n", 10))
            .await
            .unwrap();

        assert_eq!(txn.estimated_count("notes").await.unwrap(), 2);
        assert_eq!(store.estimated_count("notes").await.unwrap(), 1);
        assert_eq!(store.count_documents("notes", &Filter::eq("n", 10)).await.unwrap(), 0);

        txn.commit().await.unwrap();

        assert_eq!(store.estimated_count("notes").await.unwrap(), 2);
        assert_eq!(store.count_documents("notes", &Filter::eq("n", 10)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_keeps_writes_made_while_open() {
        let store = InMemoryStore::new();
        store.insert_one("notes", doc! { "_id": 1 }).await.unwrap();

        let txn = store.start_transaction().await.unwrap();
        txn.insert_one("notes", doc! { "_id": 2 }).await.unwrap();
        store.insert_one("notes", doc! { "_id": 3 }).await.unwrap();
        store
            .update_one("notes", &Filter::id(1), &Update::new().set("n", 1))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        assert_eq!(store.estimated_count("notes").await.unwrap(), 3);
        assert_eq!(store.count_documents("notes", &Filter::eq("n", 1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_commit_is_rejected_when_replay_conflicts() {
        let store = InMemoryStore::new();

        let txn = store.start_transaction().await.unwrap();
        txn.insert_one("notes", doc! { "_id": 1, "from": "txn" }).await.unwrap();
        txn.insert_one("other", doc! { "_id": 1 }).await.unwrap();
        store.insert_one("notes", doc! { "_id": 1, "from": "direct" }).await.unwrap();

        let err = txn.commit().await.unwrap_err();

        assert!(matches!(err, ResourceError::Store(_)));
        assert_eq!(store.count_documents("notes", &Filter::eq("from", "direct")).await.unwrap(), 1);
        assert_eq!(store.estimated_count("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let store = InMemoryStore::new();

        let txn = store.start_transaction().await.unwrap();
        txn.insert_one("notes", doc! { "n": 1 }).await.unwrap();
        txn.abort().await.unwrap();

        assert_eq!(store.estimated_count("notes").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_one_and_missing_collections() {
        let store = InMemoryStore::builder().build().await.unwrap();
        let id = store.insert_one("notes", doc! { "n": 1 }).await.unwrap();

        let found = store
            .find_one("notes", Query::builder().filter(Filter::id(id.clone())).build())
            .await
            .unwrap();

        assert_eq!(found, Some(doc! { "_id": id, "n": 1 }));
        assert!(store.find("other", Query::new()).await.unwrap().is_empty());
        assert_eq!(store.delete_many("other", &Expr::And(vec![])).await.unwrap(), 0);
    }
}
