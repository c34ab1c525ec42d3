//! Staging log on Redis lists.

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, ErrorKind, RedisError, aio::ConnectionManager};

use reslayer_core::{
    error::{ResourceError, ResourceResult},
    staging::{ClaimOutcome, StagingLog},
};

fn staging_error(op: &str, error: RedisError) -> ResourceError {
    ResourceError::Staging(format!("redis {op} failed: {error}"))
}

/// Staged transactions as Redis lists.
///
/// Each transaction is one list; its TTL is set when the list is created and survives
/// the rename used to claim it.
#[derive(Clone)]
pub struct RedisStagingLog {
    conn: ConnectionManager,
}

impl RedisStagingLog {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(url: &str) -> ResourceResult<Self> {
        Ok(Self::new(crate::connect(url).await?))
    }
}

impl std::fmt::Debug for RedisStagingLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStagingLog").finish_non_exhaustive()
    }
}

#[async_trait]
impl StagingLog for RedisStagingLog {
    async fn create(&self, key: &str, first: Vec<u8>, ttl: Duration) -> ResourceResult<()> {
        let mut conn = self.conn.clone();

        // DEL + RPUSH + PEXPIRE in one MULTI block
        let _: () = redis::pipe()
            .atomic()
            .del(key)
            .ignore()
            .rpush(key, first)
            .ignore()
            .pexpire(key, ttl.as_millis() as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| staging_error("create", e))?;

        Ok(())
    }

    async fn append(&self, key: &str, entry: Vec<u8>) -> ResourceResult<bool> {
        let mut conn = self.conn.clone();

        // RPUSHX returns 0 when the list does not exist
        let len: usize = conn
            .rpush_exists(key, entry)
            .await
            .map_err(|e| staging_error("append", e))?;

        Ok(len > 0)
    }

    async fn entries(&self, key: &str) -> ResourceResult<Vec<Vec<u8>>> {
        let mut conn = self.conn.clone();

        conn.lrange(key, 0, -1)
            .await
            .map_err(|e| staging_error("read", e))
    }

    async fn exists(&self, key: &str) -> ResourceResult<bool> {
        let mut conn = self.conn.clone();

        conn.exists(key).await.map_err(|e| staging_error("exists", e))
    }

    async fn claim(&self, key: &str, claimed: &str) -> ResourceResult<ClaimOutcome> {
        let mut conn = self.conn.clone();

        match conn.rename_nx::<_, _, bool>(key, claimed).await {
            Ok(true) => Ok(ClaimOutcome::Claimed),
            Ok(false) => Ok(ClaimOutcome::Taken),
            Err(e) if is_missing_key(&e) => Ok(ClaimOutcome::Missing),
            Err(e) => Err(staging_error("claim", e)),
        }
    }

    async fn restore(&self, claimed: &str, key: &str) -> ResourceResult<()> {
        let mut conn = self.conn.clone();

        let _: () = conn
            .rename(claimed, key)
            .await
            .map_err(|e| staging_error("restore", e))?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> ResourceResult<()> {
        let mut conn = self.conn.clone();

        let _: () = conn.del(key).await.map_err(|e| staging_error("remove", e))?;

        Ok(())
    }
}

/// RENAME and RENAMENX answer `ERR no such key` for a missing source.
fn is_missing_key(error: &RedisError) -> bool {
    error.kind() == ErrorKind::ResponseError && error.to_string().contains("no such key")
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests need a running Redis instance and are skipped unless REDIS_URL is set.

    async fn staging_log() -> Option<RedisStagingLog> {
        let url = std::env::var("REDIS_URL").ok()?;
        Some(RedisStagingLog::connect(&url).await.unwrap())
    }

    fn key() -> String {
        format!("reslayer-test:transaction:{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_append_requires_existing_list() {
        let Some(log) = staging_log().await else {
            eprintln!("Skipping Redis test: REDIS_URL not set");
            return;
        };
        let key = key();

        assert!(!log.append(&key, b"a".to_vec()).await.unwrap());

        log.create(&key, b"begin".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert!(log.append(&key, b"a".to_vec()).await.unwrap());
        assert_eq!(
            log.entries(&key).await.unwrap(),
            vec![b"begin".to_vec(), b"a".to_vec()]
        );

        log.remove(&key).await.unwrap();
        assert!(!log.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_outcomes() {
        let Some(log) = staging_log().await else {
            eprintln!("Skipping Redis test: REDIS_URL not set");
            return;
        };
        let key = key();
        let claimed = format!("{key}:committing");

        assert_eq!(log.claim(&key, &claimed).await.unwrap(), ClaimOutcome::Missing);

        log.create(&key, b"begin".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(log.claim(&key, &claimed).await.unwrap(), ClaimOutcome::Claimed);

        log.create(&key, b"begin".to_vec(), Duration::from_secs(60)).await.unwrap();
        assert_eq!(log.claim(&key, &claimed).await.unwrap(), ClaimOutcome::Taken);

        log.remove(&key).await.unwrap();
        log.restore(&claimed, &key).await.unwrap();
        assert!(log.exists(&key).await.unwrap());
        log.remove(&key).await.unwrap();
    }
}
