//! Change events on Redis streams.

use async_trait::async_trait;
use redis::{
    AsyncCommands, RedisError,
    aio::ConnectionManager,
    streams::{StreamMaxlen, StreamReadOptions, StreamReadReply},
};

use reslayer_core::{
    error::{ResourceError, ResourceResult},
    event::EventSink,
};

/// Stream field holding the JSON payload.
pub const EVENT_FIELD: &str = "event";

/// Appends each event to the stream named after its channel.
#[derive(Clone)]
pub struct RedisEventLog {
    conn: ConnectionManager,
    max_len: Option<usize>,
}

impl RedisEventLog {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, max_len: None }
    }

    pub async fn connect(url: &str) -> ResourceResult<Self> {
        Ok(Self::new(crate::connect(url).await?))
    }

    /// Caps every stream at roughly `max_len` entries.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Creates consumer `group` on `channel`, starting after the current last entry.
    ///
    /// Creating a group that already exists is not an error.
    pub async fn ensure_group(&self, channel: &str, group: &str) -> ResourceResult<()> {
        let mut conn = self.conn.clone();

        match conn.xgroup_create_mkstream::<_, _, _, ()>(channel, group, "$").await {
            Ok(()) => Ok(()),
            Err(e) if is_busy_group(&e) => Ok(()),
            Err(e) => Err(ResourceError::Publish(format!(
                "redis XGROUP CREATE on {channel} failed: {e}"
            ))),
        }
    }

    /// Reads up to `count` undelivered events for `consumer` in `group`.
    ///
    /// Returns `(entry id, payload)` pairs; acknowledge them with [`RedisEventLog::ack`].
    pub async fn read_group(
        &self,
        channel: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> ResourceResult<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default().group(group, consumer).count(count);

        let reply: StreamReadReply = conn
            .xread_options(&[channel], &[">"], &options)
            .await
            .map_err(|e| ResourceError::Publish(format!("redis XREADGROUP on {channel} failed: {e}")))?;

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .filter_map(|entry| {
                let payload = entry.get::<String>(EVENT_FIELD)?;
                Some((entry.id, payload))
            })
            .collect())
    }

    pub async fn ack(&self, channel: &str, group: &str, ids: &[String]) -> ResourceResult<()> {
        let mut conn = self.conn.clone();

        let _: usize = conn
            .xack(channel, group, ids)
            .await
            .map_err(|e| ResourceError::Publish(format!("redis XACK on {channel} failed: {e}")))?;

        Ok(())
    }
}

fn is_busy_group(error: &RedisError) -> bool {
    error.code() == Some("BUSYGROUP")
}

impl std::fmt::Debug for RedisEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventLog")
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSink for RedisEventLog {
    async fn append(&self, channel: &str, payload: String) -> ResourceResult<()> {
        let mut conn = self.conn.clone();
        let fields = [(EVENT_FIELD, payload)];

        let id: String = match self.max_len {
            Some(max_len) => {
                conn.xadd_maxlen(channel, StreamMaxlen::Approx(max_len), "*", &fields)
                    .await
            }
            None => conn.xadd(channel, "*", &fields).await,
        }
        .map_err(|e| ResourceError::Publish(format!("redis XADD to {channel} failed: {e}")))?;
        tracing::trace!(channel, id = %id, "event appended");

        Ok(())
    }
}
