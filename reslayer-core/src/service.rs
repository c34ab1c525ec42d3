//! The entry point for resource requests.
//!
//! Every call goes through the same steps: the collection is checked against the current
//! policy snapshot, request documents are rewritten by the caller's [`TransformRules`],
//! and the resulting write either runs immediately or, when a transaction id is given, is
//! staged for the transaction's commit.

use bson::{Bson, Document, oid::ObjectId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::{
    backend::StoreBackend,
    error::{ResourceError, ResourceResult},
    event::EventSink,
    gateway::DocumentGateway,
    operation::{PendingOperation, WriteOutcome},
    policy::{PolicyStore, PolicyTable},
    query::{Expr, Filter, Query, Sort, Update},
    staging::StagingLog,
    transaction::{TransactionCoordinator, TxnId},
    transform::{TransformRules, Transformer},
};

/// How a write request was handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Execution {
    Completed { outcome: WriteOutcome },
    Staged { txn: TxnId },
}

/// Parameters of a `find` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FindRequest {
    pub filter: Document,
    pub projection: Option<Vec<String>>,
    /// Sort keys in `field` / `-field` form.
    pub sort: Vec<String>,
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

/// Interprets a caller-supplied id: 24 hex digits are an ObjectId, anything else a string.
pub fn document_id(raw: &str) -> Bson {
    ObjectId::parse_str(raw)
        .map(Bson::ObjectId)
        .unwrap_or_else(|_| Bson::String(raw.to_string()))
}

#[derive(Debug)]
pub struct ResourceService<B, L, E> {
    backend: B,
    coordinator: TransactionCoordinator<L>,
    gateway: DocumentGateway<E>,
    transformer: Transformer,
    policies: PolicyStore,
}

impl<B, L, E> ResourceService<B, L, E>
where
    B: StoreBackend,
    L: StagingLog,
    E: EventSink,
{
    pub fn new(
        backend: B,
        coordinator: TransactionCoordinator<L>,
        gateway: DocumentGateway<E>,
        policies: PolicyStore,
    ) -> Self {
        ResourceService {
            backend,
            coordinator,
            gateway,
            transformer: Transformer::new(),
            policies,
        }
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<L> {
        &self.coordinator
    }

    pub fn gateway(&self) -> &DocumentGateway<E> {
        &self.gateway
    }

    pub fn policies(&self) -> &PolicyStore {
        &self.policies
    }

    pub async fn begin(&self) -> ResourceResult<TxnId> {
        self.coordinator.begin().await
    }

    pub async fn commit(&self, txn: &TxnId) -> ResourceResult<Vec<WriteOutcome>> {
        let policies = self.policies.snapshot().await;
        self.coordinator
            .commit(txn, &self.backend, &self.gateway, &policies)
            .await
    }

    pub async fn create(
        &self,
        collection: &str,
        mut document: Document,
        rules: &TransformRules,
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;
        self.transformer.apply(&mut document, rules)?;

        self.submit(
            &policies,
            PendingOperation::Create {
                collection: collection.to_string(),
                document,
            },
            txn,
        )
        .await
    }

    pub async fn bulk_create(
        &self,
        collection: &str,
        mut documents: Vec<Document>,
        rules: &TransformRules,
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;
        if documents.is_empty() {
            return Err(ResourceError::ValidationFailed(
                "bulk create needs at least one document".to_string(),
            ));
        }
        for document in documents.iter_mut() {
            self.transformer.apply(document, rules)?;
        }

        self.submit(
            &policies,
            PendingOperation::BulkCreate {
                collection: collection.to_string(),
                documents,
            },
            txn,
        )
        .await
    }

    /// Updates every document matching `filter` with an update-operator document.
    pub async fn update(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
        rules: &TransformRules,
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;
        let filter = self.filter(filter, rules)?;
        let update = self.update_document(&update, rules)?;

        self.submit(
            &policies,
            PendingOperation::Update {
                collection: collection.to_string(),
                filter,
                update,
            },
            txn,
        )
        .await
    }

    pub async fn update_by_id(
        &self,
        collection: &str,
        id: &str,
        update: Document,
        rules: &TransformRules,
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;
        let update = self.update_document(&update, rules)?;

        self.submit(
            &policies,
            PendingOperation::UpdateById {
                collection: collection.to_string(),
                id: document_id(id),
                update,
            },
            txn,
        )
        .await
    }

    pub async fn replace(
        &self,
        collection: &str,
        id: &str,
        mut document: Document,
        rules: &TransformRules,
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;
        self.transformer.apply(&mut document, rules)?;

        self.submit(
            &policies,
            PendingOperation::Replace {
                collection: collection.to_string(),
                id: document_id(id),
                document,
            },
            txn,
        )
        .await
    }

    pub async fn delete(&self, collection: &str, id: &str, txn: Option<&TxnId>) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;

        self.submit(
            &policies,
            PendingOperation::Delete {
                collection: collection.to_string(),
                id: document_id(id),
            },
            txn,
        )
        .await
    }

    pub async fn bulk_delete(
        &self,
        collection: &str,
        filter: Document,
        rules: &TransformRules,
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;
        let filter = self.filter(filter, rules)?;

        self.submit(
            &policies,
            PendingOperation::BulkDelete {
                collection: collection.to_string(),
                filter,
            },
            txn,
        )
        .await
    }

    /// Stores each listed document's position in `ids` under `key`.
    pub async fn sort(
        &self,
        collection: &str,
        key: &str,
        ids: &[String],
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        let policies = self.authorize(collection).await?;

        self.submit(
            &policies,
            PendingOperation::Sort {
                collection: collection.to_string(),
                key: key.to_string(),
                ids: ids.iter().map(|id| document_id(id)).collect(),
            },
            txn,
        )
        .await
    }

    pub async fn size(&self, collection: &str, filter: Document, rules: &TransformRules) -> ResourceResult<u64> {
        self.authorize(collection).await?;
        let filter = self.filter(filter, rules)?;

        self.gateway.size(&self.backend, collection, filter.as_ref()).await
    }

    pub async fn find(
        &self,
        collection: &str,
        request: FindRequest,
        rules: &TransformRules,
    ) -> ResourceResult<Vec<Document>> {
        let policies = self.authorize(collection).await?;
        let query = self.query(request, rules)?;

        self.gateway.find(&self.backend, &policies, collection, query).await
    }

    pub async fn find_one(
        &self,
        collection: &str,
        request: FindRequest,
        rules: &TransformRules,
    ) -> ResourceResult<Option<Document>> {
        let policies = self.authorize(collection).await?;
        let query = self.query(request, rules)?;

        self.gateway.find_one(&self.backend, &policies, collection, query).await
    }

    async fn authorize(&self, collection: &str) -> ResourceResult<Arc<PolicyTable>> {
        let policies = self.policies.snapshot().await;
        if policies.is_forbidden(collection) {
            tracing::debug!(collection, "request to unreachable collection rejected");
            return Err(ResourceError::PolicyForbidden(collection.to_string()));
        }

        Ok(policies)
    }

    fn filter(&self, mut filter: Document, rules: &TransformRules) -> ResourceResult<Option<Expr>> {
        self.transformer.apply(&mut filter, rules)?;
        Filter::from_document(&filter)
    }

    fn update_document(&self, update: &Document, rules: &TransformRules) -> ResourceResult<Update> {
        let mut update = Update::from_document(update)?;
        self.transformer.apply(&mut update.set, rules)?;
        Ok(update)
    }

    fn query(&self, request: FindRequest, rules: &TransformRules) -> ResourceResult<Query> {
        let mut builder = Query::builder().maybe_filter(self.filter(request.filter, rules)?);

        for key in &request.sort {
            let sort = Sort::parse(key)?;
            builder = builder.sort(sort.field, sort.direction);
        }
        if let Some(projection) = request.projection {
            builder = builder.project(projection);
        }
        if let Some(skip) = request.skip {
            builder = builder.offset(skip);
        }
        if let Some(limit) = request.limit {
            builder = builder.limit(limit);
        }

        Ok(builder.build())
    }

    async fn submit(
        &self,
        policies: &PolicyTable,
        op: PendingOperation,
        txn: Option<&TxnId>,
    ) -> ResourceResult<Execution> {
        match txn {
            Some(txn) => {
                self.coordinator.stage(txn, op).await?;
                Ok(Execution::Staged { txn: *txn })
            }
            None => {
                let outcome = self.gateway.execute(&self.backend, policies, op).await?;
                Ok(Execution::Completed { outcome })
            }
        }
    }
}
