//! Job hashes and the ready set.
//!
//! The ready set is a sorted set scored by due-time in fractional unix
//! seconds. A job is either a member of it, or in flight with exactly one
//! worker; claiming is a server-side script so the "is it due" check and the
//! removal cannot interleave with another worker's claim.

use std::{collections::HashMap, sync::Arc};

use deadpool_redis::{
    redis::{self, Script},
    Pool,
};
use tracing::debug;

use super::{keys, status, StoreConfig};
use crate::{
    error::Result,
    models::{EventId, EventStatus, Job, JobId, ATTEMPT_FIELD, EVENT_ID_FIELD},
};

/// Pops the lowest-scored member whose score is at most `ARGV[1]`.
const CLAIM_DUE_LUA: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #due == 0 then
    return false
end
redis.call('ZREM', KEYS[1], due[1])
return due[1]
";

/// Repository for job hashes and the ready set.
pub struct Repository {
    pool: Pool,
    config: Arc<StoreConfig>,
    claim_script: Script,
}

impl Repository {
    /// Creates a repository over `pool`.
    pub fn new(pool: Pool, config: Arc<StoreConfig>) -> Self {
        Self { pool, config, claim_script: Script::new(CLAIM_DUE_LUA) }
    }

    /// Store settings in effect.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Writes `status` for the job's event, the job hash, and adds the job
    /// to the ready set at `due`, all in one transaction.
    ///
    /// Any stale hash under the same ID is replaced, never merged.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or command failure.
    pub async fn enqueue(&self, job: &Job, status: &EventStatus, due: f64) -> Result<()> {
        let key = keys::job(&job.id);
        let mut pipe = redis::pipe();
        pipe.atomic();
        status::queue_update(&mut pipe, &job.event_id, status, self.config.status_ttl_secs());
        pipe.cmd("DEL").arg(&key).ignore();

        let mut hset = redis::cmd("HSET");
        hset.arg(&key);
        for (field, value) in job.to_fields()? {
            hset.arg(field).arg(value);
        }
        pipe.add_command(hset).ignore();
        pipe.cmd("ZADD").arg(&self.config.queue_key).arg(due).arg(job.id.as_str()).ignore();

        let mut conn = self.pool.get().await?;
        pipe.query_async::<()>(&mut conn).await?;

        debug!(job_id = %job.id, event_id = %job.event_id, due, "job enqueued");
        Ok(())
    }

    /// Atomically removes and returns the earliest job due at or before
    /// `now`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or script failure.
    pub async fn claim_due(&self, now: f64) -> Result<Option<JobId>> {
        let mut conn = self.pool.get().await?;
        let claimed: Option<String> = self
            .claim_script
            .key(&self.config.queue_key)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed.map(JobId))
    }

    /// Reads a job hash. `Ok(None)` if the hash does not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection failure and
    /// `CoreError::InvalidInput` if the hash is malformed.
    pub async fn find(&self, id: &JobId) -> Result<Option<Job>> {
        let mut conn = self.pool.get().await?;
        let fields: HashMap<String, Vec<u8>> =
            redis::cmd("HGETALL").arg(keys::job(id)).query_async(&mut conn).await?;
        Job::from_fields(id.clone(), &fields)
    }

    /// Reads only the event ID of a job hash, for records too damaged to
    /// decode in full. `Ok(None)` if the field is absent or not UTF-8.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection failure.
    pub async fn find_event_id(&self, id: &JobId) -> Result<Option<EventId>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(keys::job(id))
            .arg(EVENT_ID_FIELD)
            .query_async(&mut conn)
            .await?;
        Ok(raw.and_then(|raw| String::from_utf8(raw).ok()).map(EventId))
    }

    /// Puts a claimed job back into the ready set at `due`, updating its
    /// attempt counter in the same transaction when `attempt` is given.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or command failure.
    pub async fn reinsert(&self, id: &JobId, due: f64, attempt: Option<u32>) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(attempt) = attempt {
            pipe.cmd("HSET").arg(keys::job(id)).arg(ATTEMPT_FIELD).arg(attempt).ignore();
        }
        pipe.cmd("ZADD").arg(&self.config.queue_key).arg(due).arg(id.as_str()).ignore();

        let mut conn = self.pool.get().await?;
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Schedules the job hash for deletion after the retention period and
    /// makes sure the job is not in the ready set.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or command failure.
    pub async fn finalize(&self, id: &JobId) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("EXPIRE")
            .arg(keys::job(id))
            .arg(self.config.job_retention.as_secs().max(1))
            .ignore()
            .cmd("ZREM")
            .arg(&self.config.queue_key)
            .arg(id.as_str())
            .ignore();

        let mut conn = self.pool.get().await?;
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Due-time of a job in the ready set, `None` if it is not a member.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or command failure.
    pub async fn due_at(&self, id: &JobId) -> Result<Option<f64>> {
        let mut conn = self.pool.get().await?;
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(&self.config.queue_key)
            .arg(id.as_str())
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    /// Number of jobs currently in the ready set.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Store` on connection or command failure.
    pub async fn ready_len(&self) -> Result<usize> {
        let mut conn = self.pool.get().await?;
        let len: usize =
            redis::cmd("ZCARD").arg(&self.config.queue_key).query_async(&mut conn).await?;
        Ok(len)
    }
}
