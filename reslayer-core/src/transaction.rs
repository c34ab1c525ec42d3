//! Staged cross-request transactions.
//!
//! A transaction spans several independent calls:
//!
//! 1. [`TransactionCoordinator::begin`] creates a staging log holding a begin marker.
//! 2. [`TransactionCoordinator::stage`] appends a [`PendingOperation`] to the log; nothing
//!    touches the document store yet.
//! 3. [`TransactionCoordinator::commit`] claims the log, checks the deadline, and replays
//!    every operation in staging order inside one store transaction.
//!
//! The claim renames the log to `{key}:committing`, so of two concurrent commits only one
//! proceeds. If replay fails the store transaction is aborted and the log is moved back
//! under its original key with every entry intact. Change events are published only after
//! the store transaction has committed.

use std::{fmt, str::FromStr, time::Duration};

use bson::DateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    backend::{StoreBackend, StoreTransaction},
    error::{ResourceError, ResourceResult},
    event::{ChangeEvent, EventSink},
    gateway::DocumentGateway,
    operation::{PendingOperation, WriteOutcome},
    policy::PolicyTable,
    staging::{ClaimOutcome, StagingLog},
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Identifier of a staged transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxnId(Uuid);

impl TxnId {
    pub fn new() -> Self {
        TxnId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TxnId {
    fn default() -> Self {
        TxnId::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TxnId {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(TxnId)
            .map_err(|e| ResourceError::ValidationFailed(format!("invalid transaction id {s:?}: {e}")))
    }
}

/// One entry of a staging log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntry {
    Begin { started_at: DateTime },
    Operation(PendingOperation),
}

impl LogEntry {
    pub fn encode(&self) -> ResourceResult<Vec<u8>> {
        Ok(bson::serialize_to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ResourceResult<Self> {
        Ok(bson::deserialize_from_slice(bytes)?)
    }
}

#[derive(Debug, Clone)]
pub struct TransactionCoordinator<L> {
    log: L,
    namespace: String,
    timeout: Duration,
    ttl: Duration,
}

impl<L: StagingLog> TransactionCoordinator<L> {
    pub fn new(log: L, namespace: impl Into<String>) -> Self {
        TransactionCoordinator {
            log,
            namespace: namespace.into(),
            timeout: DEFAULT_TIMEOUT,
            ttl: DEFAULT_TTL,
        }
    }

    /// Maximum time between begin and commit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lifetime of an uncommitted staging log.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn key(&self, id: &TxnId) -> String {
        format!("{}:transaction:{}", self.namespace, id)
    }

    pub async fn begin(&self) -> ResourceResult<TxnId> {
        let id = TxnId::new();
        let marker = LogEntry::Begin {
            started_at: DateTime::now(),
        };

        self.log.create(&self.key(&id), marker.encode()?, self.ttl).await?;
        tracing::info!(txn_id = %id, "transaction started");

        Ok(id)
    }

    /// Appends `op` to the transaction's log.
    ///
    /// # Errors
    ///
    /// [`ResourceError::TxnNotFound`] if the log does not exist: never begun, expired,
    /// or already committed.
    pub async fn stage(&self, id: &TxnId, op: PendingOperation) -> ResourceResult<()> {
        let collection = op.collection().to_string();
        let action = op.action();

        if !self.log.append(&self.key(id), LogEntry::Operation(op).encode()?).await? {
            return Err(ResourceError::TxnNotFound(id.to_string()));
        }

        tracing::debug!(txn_id = %id, collection, %action, "operation staged");
        Ok(())
    }

    /// Replays every staged operation inside one store transaction.
    ///
    /// Returns the outcomes in staging order.
    pub async fn commit<B, E>(
        &self,
        id: &TxnId,
        backend: &B,
        gateway: &DocumentGateway<E>,
        policies: &PolicyTable,
    ) -> ResourceResult<Vec<WriteOutcome>>
    where
        B: StoreBackend,
        E: EventSink,
    {
        let key = self.key(id);
        let claimed = format!("{key}:committing");

        match self.log.claim(&key, &claimed).await? {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Taken => return Err(ResourceError::TxnAlreadyCommitting(id.to_string())),
            ClaimOutcome::Missing if self.log.exists(&claimed).await? => {
                return Err(ResourceError::TxnAlreadyCommitting(id.to_string()));
            }
            ClaimOutcome::Missing => return Err(ResourceError::TxnNotFound(id.to_string())),
        }

        let operations = match self.read_claimed(id, &claimed).await {
            Ok(operations) => operations,
            Err(err @ ResourceError::TxnTimedOut(_)) => {
                self.log.remove(&claimed).await?;
                tracing::warn!(txn_id = %id, "transaction timed out before commit");
                return Err(err);
            }
            Err(err) => {
                self.put_back(id, &claimed, &key).await;
                return Err(err);
            }
        };

        let count = operations.len();
        let (outcomes, events) = match self.replay(backend, gateway, policies, operations).await {
            Ok(replayed) => replayed,
            Err(err) => {
                tracing::warn!(txn_id = %id, error = %err, "transaction replay failed, rolled back");
                self.put_back(id, &claimed, &key).await;
                return Err(err);
            }
        };

        if let Err(err) = self.log.remove(&claimed).await {
            tracing::warn!(txn_id = %id, error = %err, "committed transaction log could not be removed");
        }
        tracing::info!(txn_id = %id, operations = count, "transaction committed");

        for event in &events {
            gateway.publisher().publish(policies, event).await?;
        }

        Ok(outcomes)
    }

    async fn read_claimed(&self, id: &TxnId, claimed: &str) -> ResourceResult<Vec<PendingOperation>> {
        let mut entries = self
            .log
            .entries(claimed)
            .await?
            .into_iter()
            .map(|bytes| LogEntry::decode(&bytes));

        let started_at = match entries.next().transpose()? {
            Some(LogEntry::Begin { started_at }) => started_at,
            _ => {
                return Err(ResourceError::Staging(format!(
                    "transaction {id} log has no begin marker"
                )));
            }
        };

        let elapsed = DateTime::now().timestamp_millis() - started_at.timestamp_millis();
        if elapsed > self.timeout.as_millis() as i64 {
            return Err(ResourceError::TxnTimedOut(id.to_string()));
        }

        entries
            .map(|entry| match entry? {
                LogEntry::Operation(op) => Ok(op),
                LogEntry::Begin { .. } => Err(ResourceError::Staging(format!(
                    "transaction {id} log has a second begin marker"
                ))),
            })
            .collect()
    }

    async fn replay<B, E>(
        &self,
        backend: &B,
        gateway: &DocumentGateway<E>,
        policies: &PolicyTable,
        operations: Vec<PendingOperation>,
    ) -> ResourceResult<(Vec<WriteOutcome>, Vec<ChangeEvent>)>
    where
        B: StoreBackend,
        E: EventSink,
    {
        let txn = backend.start_transaction().await?;
        let mut outcomes = Vec::with_capacity(operations.len());
        let mut events = Vec::with_capacity(operations.len());

        for op in operations {
            let applied = if policies.is_forbidden(op.collection()) {
                Err(ResourceError::PolicyForbidden(op.collection().to_string()))
            } else {
                gateway.apply(&txn, op).await
            };

            match applied {
                Ok((outcome, event)) => {
                    outcomes.push(outcome);
                    events.push(event);
                }
                Err(err) => {
                    if let Err(abort_err) = txn.abort().await {
                        tracing::warn!(error = %abort_err, "store transaction abort failed");
                    }
                    return Err(err);
                }
            }
        }

        txn.commit().await?;

        Ok((outcomes, events))
    }

    async fn put_back(&self, id: &TxnId, claimed: &str, key: &str) {
        if let Err(err) = self.log.restore(claimed, key).await {
            tracing::error!(txn_id = %id, error = %err, "transaction log could not be restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn test_txn_id_parsing() {
        let id = TxnId::new();

        assert_eq!(id.to_string().parse::<TxnId>().unwrap(), id);
        assert!(matches!(
            "not-a-uuid".parse::<TxnId>(),
            Err(ResourceError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_log_entries_decode() {
        let begin = LogEntry::Begin {
            started_at: DateTime::from_millis(1_700_000_000_000),
        };
        let op = LogEntry::Operation(PendingOperation::Create {
            collection: "notes".into(),
            document: doc! { "title": "a" },
        });

        assert_eq!(LogEntry::decode(&begin.encode().unwrap()).unwrap(), begin);
        assert_eq!(LogEntry::decode(&op.encode().unwrap()).unwrap(), op);
        assert!(LogEntry::decode(b"garbage").is_err());
    }
}
