use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::TryStreamExt;
use mea::mutex::Mutex;
use mongodb::{
    Client, ClientSession, Collection as MongoCollection,
    options::{
        Acknowledgment, ClientOptions, ReadConcern, ReadPreference, SelectionCriteria,
        TransactionOptions, WriteConcern,
    },
};

use reslayer_core::{
    backend::{StoreBackend, StoreBackendBuilder, StoreOps, StoreTransaction, UpdateCounts},
    error::{ResourceError, ResourceResult},
    query::{Expr, Query, Update},
};

use crate::query::find_options;

fn store_error(error: mongodb::error::Error) -> ResourceError {
    ResourceError::Store(error.to_string())
}

/// Runs a driver action, attaching `session` when one is given.
macro_rules! run {
    ($action:expr, $session:expr) => {
        match $session {
            Some(session) => $action.session(session).await,
            None => $action.await,
        }
        .map_err(store_error)
    };
}

#[derive(Debug, Clone)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client.database(&self.database).collection(collection_name)
    }

    fn transaction_options() -> TransactionOptions {
        TransactionOptions::builder()
            .read_concern(ReadConcern::majority())
            .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
            .selection_criteria(SelectionCriteria::ReadPreference(
                ReadPreference::PrimaryPreferred { options: None },
            ))
            .build()
    }

    async fn insert_one_in(
        &self,
        collection: &str,
        document: Document,
        session: Option<&mut ClientSession>,
    ) -> ResourceResult<Bson> {
        let target = self.get_collection(collection);
        let action = target.insert_one(document);
        Ok(run!(action, session)?.inserted_id)
    }

    async fn insert_many_in(
        &self,
        collection: &str,
        documents: Vec<Document>,
        session: Option<&mut ClientSession>,
    ) -> ResourceResult<Vec<Bson>> {
        let target = self.get_collection(collection);
        let action = target.insert_many(documents);
        let mut ids = run!(action, session)?.inserted_ids.into_iter().collect::<Vec<_>>();
        ids.sort_by_key(|(index, _)| *index);

        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn count_in(
        &self,
        collection: &str,
        filter: &Expr,
        session: Option<&mut ClientSession>,
    ) -> ResourceResult<u64> {
        let target = self.get_collection(collection);
        let action = target.count_documents(filter.to_document());
        run!(action, session)
    }

    async fn find_in(
        &self,
        collection: &str,
        query: Query,
        session: Option<&mut ClientSession>,
    ) -> ResourceResult<Vec<Document>> {
        let options = find_options(&query);
        let filter = query
            .filter
            .as_ref()
            .map(Expr::to_document)
            .unwrap_or_default();
        let target = self.get_collection(collection);
        let action = target.find(filter).with_options(options);

        match session {
            Some(session) => {
                let mut cursor = action.session(&mut *session).await.map_err(store_error)?;
                cursor.stream(session).try_collect().await.map_err(store_error)
            }
            None => action.await.map_err(store_error)?.try_collect().await.map_err(store_error),
        }
    }

    async fn update_in(
        &self,
        collection: &str,
        filter: &Expr,
        update: &Update,
        many: bool,
        session: Option<&mut ClientSession>,
    ) -> ResourceResult<UpdateCounts> {
        let target = self.get_collection(collection);
        let result = if many {
            run!(target.update_many(filter.to_document(), update.to_document()), session)?
        } else {
            run!(target.update_one(filter.to_document(), update.to_document()), session)?
        };

        Ok(UpdateCounts {
            matched: result.matched_count,
            modified: result.modified_count,
        })
    }

    async fn update_batch_in(
        &self,
        collection: &str,
        updates: &[(Expr, Update)],
        session: &mut ClientSession,
    ) -> ResourceResult<UpdateCounts> {
        let mut counts = UpdateCounts::default();
        for (filter, update) in updates {
            counts += self
                .update_in(collection, filter, update, false, Some(&mut *session))
                .await?;
        }

        Ok(counts)
    }

    async fn replace_in(
        &self,
        collection: &str,
        filter: &Expr,
        mut replacement: Document,
        session: Option<&mut ClientSession>,
    ) -> ResourceResult<UpdateCounts> {
        replacement.remove("_id");
        let target = self.get_collection(collection);
        let action = target
            .replace_one(filter.to_document(), replacement);
        let result = run!(action, session)?;

        Ok(UpdateCounts {
            matched: result.matched_count,
            modified: result.modified_count,
        })
    }

    async fn delete_in(
        &self,
        collection: &str,
        filter: &Expr,
        many: bool,
        session: Option<&mut ClientSession>,
    ) -> ResourceResult<u64> {
        let target = self.get_collection(collection);
        let result = if many {
            run!(target.delete_many(filter.to_document()), session)?
        } else {
            run!(target.delete_one(filter.to_document()), session)?
        };

        Ok(result.deleted_count)
    }
}

#[async_trait]
impl StoreOps for MongoDbStore {
    async fn insert_one(&self, collection: &str, document: Document) -> ResourceResult<Bson> {
        self.insert_one_in(collection, document, None).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> ResourceResult<Vec<Bson>> {
        self.insert_many_in(collection, documents, None).await
    }

    async fn count_documents(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        self.count_in(collection, filter, None).await
    }

    async fn estimated_count(&self, collection: &str) -> ResourceResult<u64> {
        self.get_collection(collection)
            .estimated_document_count()
            .await
            .map_err(store_error)
    }

    async fn find(&self, collection: &str, query: Query) -> ResourceResult<Vec<Document>> {
        self.find_in(collection, query, None).await
    }

    async fn update_many(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        self.update_in(collection, filter, update, true, None).await
    }

    async fn update_one(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        self.update_in(collection, filter, update, false, None).await
    }

    /// Runs the batch in a transaction of its own.
    async fn update_batch(&self, collection: &str, updates: &[(Expr, Update)]) -> ResourceResult<UpdateCounts> {
        let mut session = self.client.start_session().await.map_err(store_error)?;
        session
            .start_transaction()
            .with_options(Self::transaction_options())
            .await
            .map_err(store_error)?;

        match self.update_batch_in(collection, updates, &mut session).await {
            Ok(counts) => {
                session.commit_transaction().await.map_err(store_error)?;
                Ok(counts)
            }
            Err(err) => {
                if let Err(abort) = session.abort_transaction().await {
                    tracing::warn!(collection, error = %abort, "mongodb batch abort failed");
                }
                Err(err)
            }
        }
    }

    async fn replace_one(&self, collection: &str, filter: &Expr, replacement: Document) -> ResourceResult<UpdateCounts> {
        self.replace_in(collection, filter, replacement, None).await
    }

    async fn delete_one(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        self.delete_in(collection, filter, false, None).await
    }

    async fn delete_many(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        self.delete_in(collection, filter, true, None).await
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    type Transaction = MongoDbTransaction;

    async fn start_transaction(&self) -> ResourceResult<MongoDbTransaction> {
        let mut session = self.client.start_session().await.map_err(store_error)?;
        session
            .start_transaction()
            .with_options(Self::transaction_options())
            .await
            .map_err(store_error)?;

        Ok(MongoDbTransaction {
            store: self.clone(),
            session: Mutex::new(session),
        })
    }

    async fn shutdown(self) -> ResourceResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

/// A MongoDB transaction bound to one client session.
///
/// Every operation runs inside the session; nothing is visible outside it until
/// [`StoreTransaction::commit`].
pub struct MongoDbTransaction {
    store: MongoDbStore,
    session: Mutex<ClientSession>,
}

impl std::fmt::Debug for MongoDbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoDbTransaction")
            .field("database", &self.store.database)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StoreOps for MongoDbTransaction {
    async fn insert_one(&self, collection: &str, document: Document) -> ResourceResult<Bson> {
        let mut session = self.session.lock().await;
        self.store.insert_one_in(collection, document, Some(&mut *session)).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> ResourceResult<Vec<Bson>> {
        let mut session = self.session.lock().await;
        self.store.insert_many_in(collection, documents, Some(&mut *session)).await
    }

    async fn count_documents(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        let mut session = self.session.lock().await;
        self.store.count_in(collection, filter, Some(&mut *session)).await
    }

    /// Estimated counts are not allowed inside a transaction, so this counts exactly.
    async fn estimated_count(&self, collection: &str) -> ResourceResult<u64> {
        let mut session = self.session.lock().await;
        self.store
            .count_in(collection, &Expr::And(vec![]), Some(&mut *session))
            .await
    }

    async fn find(&self, collection: &str, query: Query) -> ResourceResult<Vec<Document>> {
        let mut session = self.session.lock().await;
        self.store.find_in(collection, query, Some(&mut *session)).await
    }

    async fn update_many(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        let mut session = self.session.lock().await;
        self.store
            .update_in(collection, filter, update, true, Some(&mut *session))
            .await
    }

    async fn update_one(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        let mut session = self.session.lock().await;
        self.store
            .update_in(collection, filter, update, false, Some(&mut *session))
            .await
    }

    async fn update_batch(&self, collection: &str, updates: &[(Expr, Update)]) -> ResourceResult<UpdateCounts> {
        let mut session = self.session.lock().await;
        self.store.update_batch_in(collection, updates, &mut *session).await
    }

    async fn replace_one(&self, collection: &str, filter: &Expr, replacement: Document) -> ResourceResult<UpdateCounts> {
        let mut session = self.session.lock().await;
        self.store
            .replace_in(collection, filter, replacement, Some(&mut *session))
            .await
    }

    async fn delete_one(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        let mut session = self.session.lock().await;
        self.store.delete_in(collection, filter, false, Some(&mut *session)).await
    }

    async fn delete_many(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        let mut session = self.session.lock().await;
        self.store.delete_in(collection, filter, true, Some(&mut *session)).await
    }
}

#[async_trait]
impl StoreTransaction for MongoDbTransaction {
    async fn commit(self) -> ResourceResult<()> {
        self.session
            .lock()
            .await
            .commit_transaction()
            .await
            .map_err(store_error)?;
        tracing::debug!(database = %self.store.database, "mongodb transaction committed");

        Ok(())
    }

    async fn abort(self) -> ResourceResult<()> {
        self.session
            .lock()
            .await
            .abort_transaction()
            .await
            .map_err(store_error)?;
        tracing::debug!(database = %self.store.database, "mongodb transaction aborted");

        Ok(())
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> ResourceResult<Self::Backend> {
        let client = Client::with_options(
            ClientOptions::parse(&self.dsn)
                .await
                .map_err(|e| ResourceError::Initialization(e.to_string()))?,
        )
        .map_err(|e| ResourceError::Initialization(e.to_string()))?;

        client
            .database(&self.database)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| ResourceError::Initialization(e.to_string()))?;
        tracing::info!(database = %self.database, "connected to mongodb");

        Ok(MongoDbStore::new(client, self.database))
    }
}
