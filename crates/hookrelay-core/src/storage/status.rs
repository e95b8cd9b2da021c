//! Per-event status hashes and bounded history lists.

use std::{collections::HashMap, sync::Arc};

use deadpool_redis::{redis, Pool};
use tracing::warn;

use super::{keys, StoreConfig};
use crate::{
    error::Result,
    models::{DeliveryAttemptRecord, EventId, EventStatus},
};

/// Appends the status `HSET` and its `EXPIRE` to `pipe`.
pub(crate) fn queue_update(
    pipe: &mut redis::Pipeline,
    event_id: &EventId,
    status: &EventStatus,
    ttl_secs: u64,
) {
    let key = keys::status(event_id);
    let mut hset = redis::cmd("HSET");
    hset.arg(&key);
    for (field, value) in status.to_fields() {
        hset.arg(field).arg(value);
    }
    pipe.add_command(hset).ignore().cmd("EXPIRE").arg(&key).arg(ttl_secs).ignore();
}

/// Repository for status and history records.
///
/// Both record kinds carry a TTL that is reset on every write, so an event
/// that stops being touched disappears after the retention window without
/// any cleanup job.
pub struct Repository {
    pool: Pool,
    config: Arc<StoreConfig>,
}

impl Repository {
    /// Creates a repository over `pool`.
    pub fn new(pool: Pool, config: Arc<StoreConfig>) -> Self {
        Self { pool, config }
    }

    fn ttl_secs(&self) -> u64 {
        self.config.status_ttl_secs()
    }

    /// Merges `status` into the event's status hash and refreshes its TTL.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or command failure.
    pub async fn update(&self, event_id: &EventId, status: &EventStatus) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        queue_update(&mut pipe, event_id, status, self.ttl_secs());

        let mut conn = self.pool.get().await?;
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Reads the event's status, `None` if absent or expired.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection failure and
    /// `CoreError::InvalidInput` if the hash is malformed.
    pub async fn find(&self, event_id: &EventId) -> Result<Option<EventStatus>> {
        let mut conn = self.pool.get().await?;
        let fields: HashMap<String, Vec<u8>> =
            redis::cmd("HGETALL").arg(keys::status(event_id)).query_async(&mut conn).await?;
        EventStatus::from_fields(&fields)
    }

    /// Prepends `record`, trims the list to the configured bound and
    /// refreshes its TTL.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the record cannot be encoded and
    /// `CoreError::Store` on connection or command failure.
    pub async fn push_history(
        &self,
        event_id: &EventId,
        record: &DeliveryAttemptRecord,
    ) -> Result<()> {
        let key = keys::history(event_id);
        let encoded = serde_json::to_string(record)?;
        let last_index =
            isize::try_from(self.config.history_max_len.max(1)).unwrap_or(isize::MAX) - 1;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(encoded)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(last_index)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.ttl_secs())
            .ignore();

        let mut conn = self.pool.get().await?;
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Reads the event's history, newest first.
    ///
    /// Entries that no longer decode are skipped with a warning rather than
    /// failing the whole query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or command failure.
    pub async fn history(&self, event_id: &EventId) -> Result<Vec<DeliveryAttemptRecord>> {
        let mut conn = self.pool.get().await?;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(keys::history(event_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        Ok(raw
            .iter()
            .filter_map(|entry| match serde_json::from_str(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "skipping undecodable history entry");
                    None
                },
            })
            .collect())
    }
}
