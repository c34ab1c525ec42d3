//! Change events and their publication.
//!
//! After a write takes effect, the gateway builds a [`ChangeEvent`] describing it. The
//! [`EventPublisher`] drops the event when the collection's policy disables events, and
//! otherwise appends it as relaxed extended JSON to the channel
//! `{namespace}.events.{collection}` of an [`EventSink`].

use std::fmt::Debug;

use async_trait::async_trait;
use bson::{Bson, DateTime};
use serde::{Deserialize, Serialize};

use crate::{
    error::{ResourceError, ResourceResult},
    operation::Action,
    policy::PolicyTable,
};

/// A record of one completed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: Action,
    pub collection: String,
    /// The written id, or the filter for filter-based writes.
    pub target: Bson,
    /// What was written.
    pub data: Bson,
    /// The write outcome.
    pub result: Bson,
    pub emitted_at: DateTime,
}

impl ChangeEvent {
    /// Renders the event as relaxed extended JSON.
    pub fn to_json(&self) -> ResourceResult<String> {
        let value = bson::serialize_to_bson(self)?.into_relaxed_extjson();
        Ok(serde_json::to_string(&value)?)
    }
}

/// Durable, append-only destination for change events.
#[async_trait]
pub trait EventSink: Send + Sync + Debug {
    /// Appends `payload` to the named channel.
    async fn append(&self, channel: &str, payload: String) -> ResourceResult<()>;
}

#[derive(Debug, Clone)]
pub struct EventPublisher<E> {
    sink: E,
    namespace: String,
}

impl<E: EventSink> EventPublisher<E> {
    pub fn new(sink: E, namespace: impl Into<String>) -> Self {
        EventPublisher {
            sink,
            namespace: namespace.into(),
        }
    }

    pub fn sink(&self) -> &E {
        &self.sink
    }

    pub fn channel(&self, collection: &str) -> String {
        format!("{}.events.{}", self.namespace, collection)
    }

    /// Publishes `event` if the collection's policy enables events.
    ///
    /// # Errors
    ///
    /// Every failure is reported as [`ResourceError::Publish`]; the write the event
    /// describes has already taken effect.
    pub async fn publish(&self, policies: &PolicyTable, event: &ChangeEvent) -> ResourceResult<()> {
        if !policies.events_enabled(&event.collection) {
            return Ok(());
        }

        let channel = self.channel(&event.collection);
        let payload = event
            .to_json()
            .map_err(|e| ResourceError::Publish(e.to_string()))?;

        self.sink
            .append(&channel, payload)
            .await
            .map_err(|e| match e {
                ResourceError::Publish(_) => e,
                other => ResourceError::Publish(other.to_string()),
            })?;

        tracing::debug!(
            collection = %event.collection,
            action = %event.action,
            channel,
            "change event published"
        );

        Ok(())
    }
}
