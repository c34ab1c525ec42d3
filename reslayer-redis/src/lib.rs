//! Redis backends for reslayer.
//!
//! - [`RedisStagingLog`] keeps staged transactions in expiring Redis lists, so any
//!   process sharing the Redis instance can stage into or commit a transaction.
//! - [`RedisEventLog`] appends change events to Redis streams.
//!
//! To use these backends, include the `redis` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! reslayer = { version = "x.y.z", features = ["redis"] }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use reslayer::redis::{RedisEventLog, RedisStagingLog};
//!
//! let staging = RedisStagingLog::connect("redis://localhost:6379").await?;
//! let events = RedisEventLog::connect("redis://localhost:6379").await?.with_max_len(10_000);
//! ```

#[allow(unused_extern_crates)]
extern crate self as reslayer_redis;

pub mod events;
pub mod staging;

pub use events::RedisEventLog;
pub use staging::RedisStagingLog;

use redis::aio::ConnectionManager;
use reslayer_core::error::{ResourceError, ResourceResult};

pub(crate) async fn connect(url: &str) -> ResourceResult<ConnectionManager> {
    let client = redis::Client::open(url)
        .map_err(|e| ResourceError::Initialization(format!("invalid redis url: {e}")))?;
    let manager = ConnectionManager::new(client)
        .await
        .map_err(|e| ResourceError::Initialization(format!("failed to connect to redis: {e}")))?;
    tracing::info!("connected to redis");

    Ok(manager)
}
