#![allow(dead_code)]

use std::time::Duration;

use async_trait::async_trait;
use reslayer::{
    memory::{InMemoryEventLog, InMemoryStagingLog, InMemoryStore},
    prelude::*,
};

pub const NAMESPACE: &str = "app";

pub type MemoryService = ResourceService<InMemoryStore, InMemoryStagingLog, InMemoryEventLog>;

pub fn policies() -> PolicyTable {
    PolicyTable::new()
        .with("orders", CollectionPolicy::reachable().with_events())
        .with("stock", CollectionPolicy::reachable().with_events())
        .with("notes", CollectionPolicy::reachable())
        .with(
            "users",
            CollectionPolicy::reachable().with_default_keys(["name", "email"]),
        )
}

pub fn service() -> MemoryService {
    service_with_timeout(Duration::from_secs(60))
}

pub fn service_with_timeout(timeout: Duration) -> MemoryService {
    ResourceService::new(
        InMemoryStore::new(),
        TransactionCoordinator::new(InMemoryStagingLog::new(), NAMESPACE).with_timeout(timeout),
        DocumentGateway::new(EventPublisher::new(InMemoryEventLog::new(), NAMESPACE)),
        PolicyStore::new(policies()),
    )
}

pub async fn events(service: &MemoryService, collection: &str) -> Vec<serde_json::Value> {
    let publisher = service.gateway().publisher();

    publisher
        .sink()
        .events(&publisher.channel(collection))
        .await
        .iter()
        .map(|payload| serde_json::from_str(payload).unwrap())
        .collect()
}

/// Event sink that rejects every append.
#[derive(Debug, Default)]
pub struct UnreachableSink;

#[async_trait]
impl EventSink for UnreachableSink {
    async fn append(&self, channel: &str, _payload: String) -> ResourceResult<()> {
        Err(ResourceError::Publish(format!("{channel} is unreachable")))
    }
}
