//! Redis-backed job store and status tracker.
//!
//! All reads and writes of job hashes, the ready set, status hashes and
//! history lists go through the repositories in this module. The ready set is
//! only ever mutated by `jobs::Repository::{enqueue, claim_due, reinsert,
//! finalize}`; nothing else may add or remove members.
//!
//! Every multi-command write is sent as a `MULTI`/`EXEC` pipeline so that a
//! partially applied update is never visible to another worker.

use std::{sync::Arc, time::Duration};

use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};

pub mod jobs;
pub mod keys;
pub mod status;

use crate::{
    error::Result,
    models::{EnqueueRequest, EventId, EventStatus, JobId, StatusReport},
};

/// Store-level settings shared by the repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Sorted-set key of the ready set.
    pub queue_key: String,
    /// How long a finalized job hash is kept for inspection.
    pub job_retention: Duration,
    /// TTL of status hashes and history lists, refreshed on every write.
    pub status_retention: Duration,
    /// Maximum history entries kept per event.
    pub history_max_len: usize,
}

impl StoreConfig {
    /// Status and history TTL in whole seconds, never zero.
    pub(crate) fn status_ttl_secs(&self) -> u64 {
        self.status_retention.as_secs().max(1)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            queue_key: keys::DEFAULT_QUEUE_KEY.to_string(),
            job_retention: Duration::from_secs(24 * 60 * 60),
            status_retention: Duration::from_secs(7 * 24 * 60 * 60),
            history_max_len: 100,
        }
    }
}

/// Entry point for all store access, sharing one connection pool between
/// repositories.
#[derive(Clone)]
pub struct Storage {
    pool: Pool,

    /// Job hashes and the ready set.
    pub jobs: Arc<jobs::Repository>,

    /// Per-event status hashes and history lists.
    pub status: Arc<status::Repository>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").field("config", self.jobs.config()).finish_non_exhaustive()
    }
}

impl Storage {
    /// Creates the repositories over `pool`.
    pub fn new(pool: Pool, config: StoreConfig) -> Self {
        let config = Arc::new(config);
        Self {
            jobs: Arc::new(jobs::Repository::new(pool.clone(), config.clone())),
            status: Arc::new(status::Repository::new(pool.clone(), config)),
            pool,
        }
    }

    /// Validates `request`, records a pending status and makes the job
    /// claimable at `now`.
    ///
    /// The pending status and the job are written in one `MULTI`, so a
    /// failed enqueue leaves neither behind and a fast worker can never have
    /// its result overwritten by the pending status.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for a malformed request and
    /// `CoreError::Store` if Redis is unavailable.
    pub async fn enqueue(&self, request: EnqueueRequest, now: f64) -> Result<JobId> {
        let job = request.into_job(JobId::generate())?;
        self.jobs.enqueue(&job, &EventStatus::pending(), now).await?;
        Ok(job.id)
    }

    /// Current status and history of an event, or `None` once the status has
    /// expired or never existed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` if Redis is unavailable.
    pub async fn status_report(&self, event_id: &EventId) -> Result<Option<StatusReport>> {
        let Some(status) = self.status.find(event_id).await? else {
            return Ok(None);
        };
        let history = self.status.history(event_id).await?;
        Ok(Some(StatusReport { status, history }))
    }

    /// Checks connectivity with a `PING`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` if the pool cannot hand out a connection or
    /// the server does not answer.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = deadpool_redis::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_store_config_matches_documented_values() {
        let config = StoreConfig::default();
        assert_eq!(config.queue_key, "webhook:queue");
        assert_eq!(config.history_max_len, 100);
        assert_eq!(config.job_retention, Duration::from_secs(86_400));
        assert_eq!(config.status_retention, Duration::from_secs(604_800));
    }

    #[tokio::test]
    async fn storage_can_be_created_without_connecting() {
        let pool = deadpool_redis::Config::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        let storage = Storage::new(pool, StoreConfig::default());
        assert_eq!(storage.jobs.config().queue_key, "webhook:queue");
    }
}
