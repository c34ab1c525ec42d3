//! In-memory staging log and event log.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use mea::rwlock::RwLock;

use reslayer_core::{
    error::{ResourceError, ResourceResult},
    event::EventSink,
    staging::{ClaimOutcome, StagingLog},
};

#[derive(Debug, Clone)]
struct StagedList {
    entries: Vec<Vec<u8>>,
    expires_at: Instant,
}

impl StagedList {
    fn is_live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Expiring entry lists kept in process memory.
///
/// Expired lists are treated as absent and purged on the next write.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStagingLog {
    lists: Arc<RwLock<HashMap<String, StagedList>>>,
}

impl InMemoryStagingLog {
    pub fn new() -> Self {
        InMemoryStagingLog::default()
    }

    /// Number of live lists.
    pub async fn len(&self) -> usize {
        self.lists.read().await.values().filter(|list| list.is_live()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn purge(lists: &mut HashMap<String, StagedList>) {
    lists.retain(|_, list| list.is_live());
}

#[async_trait]
impl StagingLog for InMemoryStagingLog {
    async fn create(&self, key: &str, first: Vec<u8>, ttl: Duration) -> ResourceResult<()> {
        let mut lists = self.lists.write().await;
        purge(&mut lists);
        lists.insert(
            key.to_string(),
            StagedList {
                entries: vec![first],
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(())
    }

    async fn append(&self, key: &str, entry: Vec<u8>) -> ResourceResult<bool> {
        let mut lists = self.lists.write().await;
        purge(&mut lists);

        Ok(match lists.get_mut(key) {
            Some(list) => {
                list.entries.push(entry);
                true
            }
            None => false,
        })
    }

    async fn entries(&self, key: &str) -> ResourceResult<Vec<Vec<u8>>> {
        Ok(self
            .lists
            .read()
            .await
            .get(key)
            .filter(|list| list.is_live())
            .map(|list| list.entries.clone())
            .unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> ResourceResult<bool> {
        Ok(self
            .lists
            .read()
            .await
            .get(key)
            .is_some_and(StagedList::is_live))
    }

    async fn claim(&self, key: &str, claimed: &str) -> ResourceResult<ClaimOutcome> {
        let mut lists = self.lists.write().await;
        purge(&mut lists);

        if !lists.contains_key(key) {
            return Ok(ClaimOutcome::Missing);
        }
        if lists.contains_key(claimed) {
            return Ok(ClaimOutcome::Taken);
        }

        match lists.remove(key) {
            Some(list) => {
                lists.insert(claimed.to_string(), list);
                Ok(ClaimOutcome::Claimed)
            }
            None => Ok(ClaimOutcome::Missing),
        }
    }

    async fn restore(&self, claimed: &str, key: &str) -> ResourceResult<()> {
        let mut lists = self.lists.write().await;
        let list = lists
            .remove(claimed)
            .ok_or_else(|| ResourceError::Staging(format!("no claimed log under {claimed}")))?;
        lists.insert(key.to_string(), list);

        Ok(())
    }

    async fn remove(&self, key: &str) -> ResourceResult<()> {
        self.lists.write().await.remove(key);
        Ok(())
    }
}

/// Event log that keeps every payload in memory, per channel.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventLog {
    channels: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        InMemoryEventLog::default()
    }

    /// Payloads appended to `channel`, oldest first.
    pub async fn events(&self, channel: &str) -> Vec<String> {
        self.channels
            .read()
            .await
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of payloads across channels.
    pub async fn total(&self) -> usize {
        self.channels.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventSink for InMemoryEventLog {
    async fn append(&self, channel: &str, payload: String) -> ResourceResult<()> {
        self.channels
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_append_only_to_existing_lists() {
        let log = InMemoryStagingLog::new();

        assert!(!log.append("t:1", b"a".to_vec()).await.unwrap());

        log.create("t:1", b"begin".to_vec(), TTL).await.unwrap();
        assert!(log.append("t:1", b"a".to_vec()).await.unwrap());
        assert!(log.append("t:1", b"b".to_vec()).await.unwrap());

        assert_eq!(
            log.entries("t:1").await.unwrap(),
            vec![b"begin".to_vec(), b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_lists_expire() {
        let log = InMemoryStagingLog::new();
        log.create("t:1", b"begin".to_vec(), Duration::from_millis(20)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!log.exists("t:1").await.unwrap());
        assert!(!log.append("t:1", b"a".to_vec()).await.unwrap());
        assert!(log.is_empty().await);
    }

    #[tokio::test]
    async fn test_claim_and_restore() {
        let log = InMemoryStagingLog::new();
        log.create("t:1", b"begin".to_vec(), TTL).await.unwrap();

        assert_eq!(log.claim("t:1", "t:1:c").await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(log.claim("t:1", "t:1:c").await.unwrap(), ClaimOutcome::Missing);
        assert!(!log.append("t:1", b"late".to_vec()).await.unwrap());

        log.restore("t:1:c", "t:1").await.unwrap();
        assert!(log.exists("t:1").await.unwrap());
        assert!(!log.exists("t:1:c").await.unwrap());

        log.create("t:1:c", b"other".to_vec(), TTL).await.unwrap();
        assert_eq!(log.claim("t:1", "t:1:c").await.unwrap(), ClaimOutcome::Taken);
    }

    #[tokio::test]
    async fn test_event_log_records_per_channel() {
        let events = InMemoryEventLog::new();
        events.append("app.events.a", "1".into()).await.unwrap();
        events.append("app.events.a", "2".into()).await.unwrap();
        events.append("app.events.b", "3".into()).await.unwrap();

        assert_eq!(events.events("app.events.a").await, vec!["1", "2"]);
        assert_eq!(events.total().await, 3);
    }
}
