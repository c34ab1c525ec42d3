//! CRUD primitives over a document store.
//!
//! The gateway owns the write rules every caller gets regardless of how a write arrives:
//!
//! - `create_time` and `update_time` are server stamped; caller values are overwritten
//! - updates always merge `update_time` into `$set` and drop caller writes to the stamps
//! - a replace keeps the stored `create_time` and moves `update_time` strictly forward; it
//!   only lands on the version it read and fails with [`ResourceError::Store`] otherwise
//! - a sort writes every position in one batched, all-or-nothing write
//! - deletes never touch records carrying `metadata.undeletable` or `metadata.retain`
//!
//! [`DocumentGateway::apply`] runs one [`PendingOperation`] against any [`StoreOps`],
//! including an open store transaction, and hands back the outcome together with the
//! change event to publish once the write is durable.

use bson::{Bson, DateTime, Document, doc};

use crate::{
    backend::{StoreOps, UpdateCounts},
    error::{ResourceError, ResourceResult},
    event::{ChangeEvent, EventPublisher, EventSink},
    operation::{PendingOperation, WriteOutcome},
    policy::PolicyTable,
    query::{Expr, Filter, Query, Update},
};

pub const CREATE_TIME: &str = "create_time";
pub const UPDATE_TIME: &str = "update_time";
pub const UNDELETABLE: &str = "metadata.undeletable";
pub const RETAIN: &str = "metadata.retain";

const RESERVED: [&str; 2] = [CREATE_TIME, UPDATE_TIME];

/// Filter clause excluding records protected from deletion.
pub fn deletable() -> Expr {
    Expr::And(vec![Filter::not_exists(UNDELETABLE), Filter::not_exists(RETAIN)])
}

#[derive(Debug, Clone)]
pub struct DocumentGateway<E> {
    publisher: EventPublisher<E>,
}

impl<E: EventSink> DocumentGateway<E> {
    pub fn new(publisher: EventPublisher<E>) -> Self {
        DocumentGateway { publisher }
    }

    pub fn publisher(&self) -> &EventPublisher<E> {
        &self.publisher
    }

    /// Runs `op` and publishes its change event.
    ///
    /// A publish failure is returned as [`ResourceError::Publish`]; the write itself
    /// has already been applied and stays applied.
    pub async fn execute<S>(
        &self,
        store: &S,
        policies: &PolicyTable,
        op: PendingOperation,
    ) -> ResourceResult<WriteOutcome>
    where
        S: StoreOps + ?Sized,
    {
        let (outcome, event) = self.apply(store, op).await?;
        self.publisher.publish(policies, &event).await?;

        Ok(outcome)
    }

    /// Runs `op` without publishing.
    pub async fn apply<S>(
        &self,
        store: &S,
        op: PendingOperation,
    ) -> ResourceResult<(WriteOutcome, ChangeEvent)>
    where
        S: StoreOps + ?Sized,
    {
        let now = DateTime::now();
        let action = op.action();
        let collection = op.collection().to_string();

        tracing::debug!(collection, %action, "applying write");

        let (target, data, outcome) = match op {
            PendingOperation::Create { collection, mut document } => {
                stamp_created(&mut document, now);
                let id = store.insert_one(&collection, document.clone()).await?;
                document.insert("_id", id.clone());

                (id.clone(), Bson::Document(document), WriteOutcome::Inserted { id })
            }
            PendingOperation::BulkCreate { collection, mut documents } => {
                if documents.is_empty() {
                    return Err(ResourceError::ValidationFailed(
                        "bulk create needs at least one document".to_string(),
                    ));
                }

                documents.iter_mut().for_each(|document| stamp_created(document, now));
                let ids = store.insert_many(&collection, documents.clone()).await?;
                for (document, id) in documents.iter_mut().zip(&ids) {
                    document.insert("_id", id.clone());
                }

                (
                    Bson::Array(ids.clone()),
                    Bson::Array(documents.into_iter().map(Bson::Document).collect()),
                    WriteOutcome::InsertedMany { ids },
                )
            }
            PendingOperation::Update { collection, filter, update } => {
                let update = touch(update, now);
                let filter = filter.unwrap_or(Expr::And(vec![]));
                let counts = store.update_many(&collection, &filter, &update).await?;

                (
                    Bson::Document(filter.to_document()),
                    Bson::Document(update.to_document()),
                    updated(counts),
                )
            }
            PendingOperation::UpdateById { collection, id, update } => {
                let update = touch(update, now);
                let counts = store
                    .update_one(&collection, &Filter::id(id.clone()), &update)
                    .await?;

                (id, Bson::Document(update.to_document()), updated(counts))
            }
            PendingOperation::Replace { collection, id, document } => {
                let (document, counts) = self.replace(store, &collection, &id, document, now).await?;

                (id, Bson::Document(document), updated(counts))
            }
            PendingOperation::Delete { collection, id } => {
                let deleted = store
                    .delete_one(&collection, &Filter::id(id.clone()).and(deletable()))
                    .await?;

                (id, Bson::Null, WriteOutcome::Deleted { deleted })
            }
            PendingOperation::BulkDelete { collection, filter } => {
                let filter = match filter {
                    Some(filter) => filter.and(deletable()),
                    None => deletable(),
                };
                let deleted = store.delete_many(&collection, &filter).await?;

                (Bson::Document(filter.to_document()), Bson::Null, WriteOutcome::Deleted { deleted })
            }
            PendingOperation::Sort { collection, key, ids } => {
                if key == "_id" || RESERVED.contains(&key.as_str()) {
                    return Err(ResourceError::ValidationFailed(format!(
                        "cannot sort into reserved field {key}"
                    )));
                }

                let updates = ids
                    .iter()
                    .enumerate()
                    .map(|(position, id)| {
                        let update = Update::new()
                            .set(key.as_str(), position as i64)
                            .set(UPDATE_TIME, now);
                        (Filter::id(id.clone()), update)
                    })
                    .collect::<Vec<_>>();
                let counts = store.update_batch(&collection, &updates).await?;

                (
                    Bson::String(key.clone()),
                    Bson::Document(doc! { "key": key, "ids": ids }),
                    updated(counts),
                )
            }
        };

        let result = bson::serialize_to_bson(&outcome)?;
        let event = ChangeEvent {
            action,
            collection,
            target,
            data,
            result,
            emitted_at: now,
        };

        Ok((outcome, event))
    }

    async fn replace<S>(
        &self,
        store: &S,
        collection: &str,
        id: &Bson,
        mut document: Document,
        now: DateTime,
    ) -> ResourceResult<(Document, UpdateCounts)>
    where
        S: StoreOps + ?Sized,
    {
        let Some(existing) = store
            .find_one(collection, Query::builder().filter(Filter::id(id.clone())).build())
            .await?
        else {
            return Ok((document, UpdateCounts::default()));
        };

        document.remove("_id");
        let created = existing.get(CREATE_TIME).cloned().unwrap_or(Bson::DateTime(now));
        let updated = match existing.get(UPDATE_TIME) {
            Some(Bson::DateTime(previous)) if previous.timestamp_millis() >= now.timestamp_millis() => {
                DateTime::from_millis(previous.timestamp_millis() + 1)
            }
            _ => now,
        };
        document.insert(CREATE_TIME, created);
        document.insert(UPDATE_TIME, updated);

        // Only replace the version that was read.
        let unchanged = match existing.get(UPDATE_TIME) {
            Some(previous) => Filter::eq(UPDATE_TIME, previous.clone()),
            None => Filter::not_exists(UPDATE_TIME),
        };
        let counts = store
            .replace_one(collection, &Filter::id(id.clone()).and(unchanged), document.clone())
            .await?;
        if counts.matched == 0 {
            return Err(ResourceError::Store(format!(
                "document {id} in {collection} changed while being replaced"
            )));
        }
        document.insert("_id", id.clone());

        Ok((document, counts))
    }

    /// Counts documents; exact with a filter, estimated without.
    pub async fn size<S>(&self, store: &S, collection: &str, filter: Option<&Expr>) -> ResourceResult<u64>
    where
        S: StoreOps + ?Sized,
    {
        match filter {
            Some(filter) => store.count_documents(collection, filter).await,
            None => store.estimated_count(collection).await,
        }
    }

    /// Runs `query` with its projection resolved through `policies`.
    pub async fn find<S>(
        &self,
        store: &S,
        policies: &PolicyTable,
        collection: &str,
        mut query: Query,
    ) -> ResourceResult<Vec<Document>>
    where
        S: StoreOps + ?Sized,
    {
        query.projection = policies.projection(collection, query.projection.as_deref());
        store.find(collection, query).await
    }

    pub async fn find_one<S>(
        &self,
        store: &S,
        policies: &PolicyTable,
        collection: &str,
        mut query: Query,
    ) -> ResourceResult<Option<Document>>
    where
        S: StoreOps + ?Sized,
    {
        query.projection = policies.projection(collection, query.projection.as_deref());
        store.find_one(collection, query).await
    }
}

fn stamp_created(document: &mut Document, now: DateTime) {
    document.insert(CREATE_TIME, now);
    document.insert(UPDATE_TIME, now);
}

fn touch(mut update: Update, now: DateTime) -> Update {
    for reserved in RESERVED {
        update.set.remove(reserved);
        update.inc.remove(reserved);
    }
    update.unset.retain(|field| !RESERVED.contains(&field.as_str()));
    update.set.insert(UPDATE_TIME, now);

    update
}

fn updated(counts: UpdateCounts) -> WriteOutcome {
    WriteOutcome::Updated {
        matched: counts.matched,
        modified: counts.modified,
    }
}
