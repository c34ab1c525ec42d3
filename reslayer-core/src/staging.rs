//! The staging log seam used by the transaction coordinator.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;

use crate::error::ResourceResult;

/// Result of trying to claim a log for commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The log now lives under the claimed key.
    Claimed,
    /// No log exists under the original key.
    Missing,
    /// The claimed key is already held by another committer.
    Taken,
}

/// Ordered, expiring byte-entry lists addressed by key.
///
/// Every operation must be atomic with respect to concurrent callers on the same key.
#[async_trait]
pub trait StagingLog: Send + Sync + Debug {
    /// Creates the list with a first entry, expiring after `ttl`.
    async fn create(&self, key: &str, first: Vec<u8>, ttl: Duration) -> ResourceResult<()>;

    /// Appends to the tail if the list exists. Returns whether it did.
    async fn append(&self, key: &str, entry: Vec<u8>) -> ResourceResult<bool>;

    /// Reads every entry in order without consuming them.
    async fn entries(&self, key: &str) -> ResourceResult<Vec<Vec<u8>>>;

    async fn exists(&self, key: &str) -> ResourceResult<bool>;

    /// Moves the list from `key` to `claimed`, only if `claimed` is free.
    async fn claim(&self, key: &str, claimed: &str) -> ResourceResult<ClaimOutcome>;

    /// Moves a claimed list back to its original key, keeping its expiry.
    async fn restore(&self, claimed: &str, key: &str) -> ResourceResult<()>;

    async fn remove(&self, key: &str) -> ResourceResult<()>;
}
