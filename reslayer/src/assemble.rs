//! Building a [`ResourceService`] from [`Settings`].

use reslayer_core::{
    backend::StoreBackend,
    error::ResourceResult,
    event::{EventPublisher, EventSink},
    gateway::DocumentGateway,
    policy::PolicyStore,
    service::ResourceService,
    settings::Settings,
    staging::StagingLog,
    transaction::TransactionCoordinator,
    transform::Transformer,
};
use reslayer_memory::{InMemoryEventLog, InMemoryStagingLog, InMemoryStore};

/// Wires the given backends together under `settings`.
///
/// The namespace, transaction timeout and TTL, collection policies and cipher key all
/// come from `settings`, which are validated first.
pub fn assemble<B, L, E>(
    settings: &Settings,
    backend: B,
    staging: L,
    events: E,
) -> ResourceResult<ResourceService<B, L, E>>
where
    B: StoreBackend,
    L: StagingLog,
    E: EventSink,
{
    settings.validate()?;

    let coordinator = TransactionCoordinator::new(staging, settings.namespace.clone())
        .with_timeout(settings.transaction.timeout())
        .with_ttl(settings.transaction.ttl());
    let gateway = DocumentGateway::new(EventPublisher::new(events, settings.namespace.clone()));
    let policies = PolicyStore::new(settings.policy_table());

    let transformer = match settings.cipher()? {
        Some(cipher) => Transformer::new().with_cipher(cipher),
        None => Transformer::new(),
    };

    tracing::info!(
        namespace = %settings.namespace,
        collections = settings.collections.len(),
        "resource service assembled"
    );

    Ok(ResourceService::new(backend, coordinator, gateway, policies).with_transformer(transformer))
}

pub type InMemoryService = ResourceService<InMemoryStore, InMemoryStagingLog, InMemoryEventLog>;

/// A service running entirely in process memory.
pub fn in_memory(settings: &Settings) -> ResourceResult<InMemoryService> {
    assemble(
        settings,
        InMemoryStore::new(),
        InMemoryStagingLog::new(),
        InMemoryEventLog::new(),
    )
}

#[cfg(all(feature = "mongodb", feature = "redis"))]
pub type ConnectedService = ResourceService<
    reslayer_mongodb::MongoDbStore,
    reslayer_redis::RedisStagingLog,
    reslayer_redis::RedisEventLog,
>;

/// A service on MongoDB, with its staging log and event streams on Redis.
#[cfg(all(feature = "mongodb", feature = "redis"))]
pub async fn connect(settings: &Settings) -> ResourceResult<ConnectedService> {
    use reslayer_core::backend::StoreBackendBuilder;

    settings.validate()?;

    let store = reslayer_mongodb::MongoDbStore::builder(&settings.mongodb.uri, &settings.mongodb.database)
        .build()
        .await?;
    let staging = reslayer_redis::RedisStagingLog::connect(&settings.redis.url).await?;
    let mut events = reslayer_redis::RedisEventLog::connect(&settings.redis.url).await?;
    if let Some(max_len) = settings.redis.event_stream_max_len {
        events = events.with_max_len(max_len);
    }

    assemble(settings, store, staging, events)
}
