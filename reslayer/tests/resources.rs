mod common;

use async_trait::async_trait;
use reslayer::{
    bson::{Bson, DateTime, Document, doc, oid::ObjectId},
    gateway::{CREATE_TIME, UPDATE_TIME},
    memory::{InMemoryEventLog, InMemoryStagingLog, InMemoryStore},
    prelude::*,
    secret::{FieldCipher, KEY_SIZE, SecretHasher},
};

use common::{MemoryService, UnreachableSink, events, policies, service};

fn no_rules() -> TransformRules {
    TransformRules::new()
}

async fn fetch(service: &MemoryService, collection: &str, id: impl Into<Bson>) -> Option<Document> {
    service
        .backend()
        .find_one(collection, Query::builder().filter(Filter::id(id)).build())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_unreachable_collections_are_rejected() {
    let service = service();

    let result = service.create("secrets", doc! { "n": 1 }, &no_rules(), None).await;
    assert!(matches!(result, Err(ResourceError::PolicyForbidden(c)) if c == "secrets"));

    let result = service
        .find("secrets", FindRequest::default(), &no_rules())
        .await;
    assert!(matches!(result, Err(ResourceError::PolicyForbidden(_))));
    assert_eq!(service.backend().estimated_count("secrets").await.unwrap(), 0);
}

#[tokio::test]
async fn test_create_stamps_times_and_publishes() {
    let service = service();

    let outcome = service
        .create(
            "orders",
            doc! { "_id": "o-1", CREATE_TIME: DateTime::from_millis(0) },
            &no_rules(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Execution::Completed {
            outcome: WriteOutcome::Inserted { id: Bson::String("o-1".into()) }
        }
    );

    let order = fetch(&service, "orders", "o-1").await.unwrap();
    let created = order.get_datetime(CREATE_TIME).unwrap();
    assert!(created.timestamp_millis() > 0);
    assert_eq!(order.get_datetime(UPDATE_TIME).unwrap(), created);

    let published = events(&service, "orders").await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0]["collection"], "orders");
    assert_eq!(published[0]["data"]["_id"], "o-1");
}

#[tokio::test]
async fn test_collections_without_events_publish_nothing() {
    let service = service();
    service
        .create("notes", doc! { "n": 1 }, &no_rules(), None)
        .await
        .unwrap();

    assert!(events(&service, "notes").await.is_empty());
}

#[tokio::test]
async fn test_updates_refresh_update_time_only() {
    let service = service();
    service
        .create("notes", doc! { "_id": "n-1", "n": 1 }, &no_rules(), None)
        .await
        .unwrap();
    let before = fetch(&service, "notes", "n-1").await.unwrap();

    service
        .update_by_id(
            "notes",
            "n-1",
            doc! {
                "$set": { "n": 2, CREATE_TIME: DateTime::from_millis(0) },
                "$unset": [UPDATE_TIME],
            },
            &no_rules(),
            None,
        )
        .await
        .unwrap();

    let after = fetch(&service, "notes", "n-1").await.unwrap();
    assert_eq!(after.get_i32("n").unwrap(), 2);
    assert_eq!(after.get_datetime(CREATE_TIME).unwrap(), before.get_datetime(CREATE_TIME).unwrap());
    assert!(after.get_datetime(UPDATE_TIME).unwrap() >= before.get_datetime(UPDATE_TIME).unwrap());
}

#[tokio::test]
async fn test_update_rejects_plain_documents() {
    let service = service();

    let result = service
        .update("notes", doc! {}, doc! { "n": 1 }, &no_rules(), None)
        .await;

    assert!(matches!(result, Err(ResourceError::ValidationFailed(_))));
}

#[tokio::test]
async fn test_replace_keeps_create_time_and_advances_update_time() {
    let service = service();
    service
        .create("notes", doc! { "_id": "n-1", "title": "a" }, &no_rules(), None)
        .await
        .unwrap();
    let original = fetch(&service, "notes", "n-1").await.unwrap();

    for title in ["b", "c"] {
        let before = fetch(&service, "notes", "n-1").await.unwrap();
        service
            .replace(
                "notes",
                "n-1",
                doc! { "_id": "other", "title": title, CREATE_TIME: DateTime::from_millis(0) },
                &no_rules(),
                None,
            )
            .await
            .unwrap();
        let after = fetch(&service, "notes", "n-1").await.unwrap();

        assert_eq!(after.get_str("title").unwrap(), title);
        assert_eq!(after.get_datetime(CREATE_TIME).unwrap(), original.get_datetime(CREATE_TIME).unwrap());
        assert!(after.get_datetime(UPDATE_TIME).unwrap() > before.get_datetime(UPDATE_TIME).unwrap());
    }

    assert!(fetch(&service, "notes", "other").await.is_none());
}

#[tokio::test]
async fn test_replace_with_own_contents_only_moves_update_time() {
    let service = service().with_transformer(
        Transformer::new().with_cipher(FieldCipher::new(&[7u8; KEY_SIZE]).unwrap()),
    );
    let owner = ObjectId::new();
    let rules = TransformRules::new()
        .rule("owner", CoercionKind::Oid)
        .rule("password", CoercionKind::Password)
        .rule("card", CoercionKind::Cipher);

    service
        .create(
            "notes",
            doc! {
                "_id": "n-1",
                "owner": owner.to_hex(),
                "password": "hunter2",
                "card": "4111 1111 1111 1111",
                "title": "a",
            },
            &rules,
            None,
        )
        .await
        .unwrap();
    let mut original = fetch(&service, "notes", "n-1").await.unwrap();

    service
        .replace("notes", "n-1", original.clone(), &rules, None)
        .await
        .unwrap();
    let mut after = fetch(&service, "notes", "n-1").await.unwrap();

    assert!(after.get_datetime(UPDATE_TIME).unwrap() > original.get_datetime(UPDATE_TIME).unwrap());
    after.remove(UPDATE_TIME);
    original.remove(UPDATE_TIME);
    assert_eq!(after, original);
}

/// Store whose replace is preceded by a competing write to the same documents.
#[derive(Debug, Default)]
struct InterleavedStore {
    inner: InMemoryStore,
}

#[async_trait]
impl StoreOps for InterleavedStore {
    async fn insert_one(&self, collection: &str, document: Document) -> ResourceResult<Bson> {
        self.inner.insert_one(collection, document).await
    }

    async fn insert_many(&self, collection: &str, documents: Vec<Document>) -> ResourceResult<Vec<Bson>> {
        self.inner.insert_many(collection, documents).await
    }

    async fn count_documents(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        self.inner.count_documents(collection, filter).await
    }

    async fn estimated_count(&self, collection: &str) -> ResourceResult<u64> {
        self.inner.estimated_count(collection).await
    }

    async fn find(&self, collection: &str, query: Query) -> ResourceResult<Vec<Document>> {
        self.inner.find(collection, query).await
    }

    async fn update_many(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        self.inner.update_many(collection, filter, update).await
    }

    async fn update_one(&self, collection: &str, filter: &Expr, update: &Update) -> ResourceResult<UpdateCounts> {
        self.inner.update_one(collection, filter, update).await
    }

    async fn update_batch(&self, collection: &str, updates: &[(Expr, Update)]) -> ResourceResult<UpdateCounts> {
        self.inner.update_batch(collection, updates).await
    }

    async fn replace_one(&self, collection: &str, filter: &Expr, replacement: Document) -> ResourceResult<UpdateCounts> {
        let competing = Update::new()
            .set("title", "theirs")
            .set(UPDATE_TIME, DateTime::from_millis(DateTime::now().timestamp_millis() + 60_000));
        self.inner
            .update_many(collection, &Expr::And(vec![]), &competing)
            .await?;

        self.inner.replace_one(collection, filter, replacement).await
    }

    async fn delete_one(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        self.inner.delete_one(collection, filter).await
    }

    async fn delete_many(&self, collection: &str, filter: &Expr) -> ResourceResult<u64> {
        self.inner.delete_many(collection, filter).await
    }
}

#[tokio::test]
async fn test_replace_does_not_overwrite_a_newer_version() {
    let store = InterleavedStore::default();
    let gateway = DocumentGateway::new(EventPublisher::new(InMemoryEventLog::new(), common::NAMESPACE));
    gateway
        .apply(
            &store,
            PendingOperation::Create {
                collection: "notes".into(),
                document: doc! { "_id": "n-1", "title": "a" },
            },
        )
        .await
        .unwrap();

    let result = gateway
        .apply(
            &store,
            PendingOperation::Replace {
                collection: "notes".into(),
                id: "n-1".into(),
                document: doc! { "title": "ours" },
            },
        )
        .await;

    assert!(matches!(result, Err(ResourceError::Store(_))));
    let note = store
        .find_one("notes", Query::builder().filter(Filter::id("n-1")).build())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(note.get_str("title").unwrap(), "theirs");
}

#[tokio::test]
async fn test_replace_of_missing_document_writes_nothing() {
    let service = service();

    let outcome = service
        .replace("notes", "ghost", doc! { "title": "x" }, &no_rules(), None)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Execution::Completed {
            outcome: WriteOutcome::Updated { matched: 0, modified: 0 }
        }
    );
    assert_eq!(service.backend().estimated_count("notes").await.unwrap(), 0);
}

#[tokio::test]
async fn test_deletes_skip_protected_documents() {
    let service = service();
    service
        .bulk_create(
            "notes",
            vec![
                doc! { "_id": "plain" },
                doc! { "_id": "locked", "metadata": { "undeletable": true } },
                doc! { "_id": "kept", "metadata": { "retain": false } },
                doc! { "_id": "other" },
            ],
            &no_rules(),
            None,
        )
        .await
        .unwrap();

    let outcome = service.delete("notes", "locked", None).await.unwrap();
    assert_eq!(
        outcome,
        Execution::Completed {
            outcome: WriteOutcome::Deleted { deleted: 0 }
        }
    );

    let outcome = service
        .bulk_delete("notes", doc! {}, &no_rules(), None)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Execution::Completed {
            outcome: WriteOutcome::Deleted { deleted: 2 }
        }
    );

    assert!(fetch(&service, "notes", "locked").await.is_some());
    assert!(fetch(&service, "notes", "kept").await.is_some());
    assert_eq!(service.backend().estimated_count("notes").await.unwrap(), 2);
}

#[tokio::test]
async fn test_sort_stores_positions() {
    let service = service();
    service
        .bulk_create(
            "notes",
            vec![doc! { "_id": "a" }, doc! { "_id": "b" }, doc! { "_id": "c" }],
            &no_rules(),
            None,
        )
        .await
        .unwrap();

    service
        .sort("notes", "rank", &["c".into(), "a".into(), "b".into()], None)
        .await
        .unwrap();

    let ordered = service
        .find(
            "notes",
            FindRequest {
                sort: vec!["rank".into()],
                ..FindRequest::default()
            },
            &no_rules(),
        )
        .await
        .unwrap()
        .into_iter()
        .map(|document| document.get_str("_id").unwrap().to_string())
        .collect::<Vec<_>>();
    assert_eq!(ordered, vec!["c", "a", "b"]);

    let result = service.sort("notes", CREATE_TIME, &["a".into()], None).await;
    assert!(matches!(result, Err(ResourceError::ValidationFailed(_))));
}

#[tokio::test]
async fn test_sort_failure_writes_no_position() {
    let service = service();
    service
        .bulk_create(
            "notes",
            vec![doc! { "_id": "a" }, doc! { "_id": "b", "meta": "flat" }, doc! { "_id": "c" }],
            &no_rules(),
            None,
        )
        .await
        .unwrap();

    let result = service
        .sort("notes", "meta.rank", &["a".into(), "b".into(), "c".into()], None)
        .await;

    assert!(matches!(result, Err(ResourceError::Store(_))));
    assert_eq!(
        service
            .backend()
            .count_documents("notes", &Filter::exists("meta.rank"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(fetch(&service, "notes", "b").await.unwrap().get_str("meta").unwrap(), "flat");
}

#[tokio::test]
async fn test_size_with_and_without_filter() {
    let service = service();
    service
        .bulk_create(
            "notes",
            vec![doc! { "n": 1 }, doc! { "n": 2 }, doc! { "n": 3 }],
            &no_rules(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(service.size("notes", doc! {}, &no_rules()).await.unwrap(), 3);
    assert_eq!(
        service
            .size("notes", doc! { "n": { "$gte": 2 } }, &no_rules())
            .await
            .unwrap(),
        2
    );
}

#[tokio::test]
async fn test_projection_is_limited_to_default_keys() {
    let service = service();
    service
        .create(
            "users",
            doc! { "_id": "u-1", "name": "Ada", "email": "ada@example.com", "password": "x" },
            &no_rules(),
            None,
        )
        .await
        .unwrap();

    let user = service
        .find_one("users", FindRequest::default(), &no_rules())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user, doc! { "_id": "u-1", "name": "Ada", "email": "ada@example.com" });

    let user = service
        .find_one(
            "users",
            FindRequest {
                projection: Some(vec!["email".into(), "password".into()]),
                ..FindRequest::default()
            },
            &no_rules(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(user, doc! { "_id": "u-1", "email": "ada@example.com" });
}

#[tokio::test]
async fn test_transform_rules_apply_to_writes_and_filters() {
    let service = service();
    let owner = ObjectId::new();
    let rules = TransformRules::new()
        .rule("items.$.owner", CoercionKind::Oid)
        .rule("owner", CoercionKind::Oid)
        .rule("password", CoercionKind::Password);

    service
        .create(
            "notes",
            doc! {
                "_id": "n-1",
                "owner": owner.to_hex(),
                "password": "hunter2",
                "items": [{ "owner": owner.to_hex() }, { "owner": Bson::Null }],
            },
            &rules,
            None,
        )
        .await
        .unwrap();

    let note = fetch(&service, "notes", "n-1").await.unwrap();
    assert_eq!(note.get_object_id("owner").unwrap(), owner);
    assert_eq!(
        note.get_array("items").unwrap()[0].as_document().unwrap().get_object_id("owner").unwrap(),
        owner
    );
    SecretHasher::new()
        .verify("hunter2", note.get_str("password").unwrap())
        .unwrap();

    assert_eq!(
        service
            .size("notes", doc! { "owner": owner.to_hex() }, &rules)
            .await
            .unwrap(),
        1
    );

    let result = service
        .create("notes", doc! { "owner": "not-an-id" }, &rules, None)
        .await;
    assert!(matches!(
        result,
        Err(ResourceError::TransformFailed { kind: CoercionKind::Oid, .. })
    ));
}

#[tokio::test]
async fn test_publish_failure_keeps_the_write() {
    let store = InMemoryStore::new();
    let service = ResourceService::new(
        store.clone(),
        TransactionCoordinator::new(InMemoryStagingLog::new(), common::NAMESPACE),
        DocumentGateway::new(EventPublisher::new(UnreachableSink, common::NAMESPACE)),
        PolicyStore::new(policies()),
    );

    let result = service
        .create("orders", doc! { "_id": "o-1" }, &no_rules(), None)
        .await;
    assert!(matches!(result, Err(ResourceError::Publish(_))));
    assert_eq!(store.estimated_count("orders").await.unwrap(), 1);

    let txn = service.begin().await.unwrap();
    service
        .create("orders", doc! { "_id": "o-2" }, &no_rules(), Some(&txn))
        .await
        .unwrap();

    assert!(matches!(service.commit(&txn).await, Err(ResourceError::Publish(_))));
    assert_eq!(store.estimated_count("orders").await.unwrap(), 2);
    assert!(matches!(service.commit(&txn).await, Err(ResourceError::TxnNotFound(_))));
}
