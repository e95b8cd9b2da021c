//! Storage seam for the delivery engine.
//!
//! Workers talk to the job store only through [`DeliveryStorage`]. Production
//! wires in [`RedisDeliveryStorage`]; tests use
//! [`memory::InMemoryDeliveryStorage`], which keeps the same claim and TTL
//! semantics behind a single lock.

use std::{future::Future, pin::Pin, sync::Arc};

use hookrelay_core::{
    error::Result,
    models::{
        DeliveryAttemptRecord, EnqueueRequest, EventId, EventStatus, Job, JobId, StatusReport,
    },
    storage::Storage,
};

/// Store operations the delivery engine relies on.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Validates and stores a job, records a pending status and makes the
    /// job due at `now`.
    fn enqueue(
        &self,
        request: EnqueueRequest,
        now: f64,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>>;

    /// Atomically removes and returns the earliest job due at or before
    /// `now`. Two concurrent callers never receive the same ID.
    fn claim_due(
        &self,
        now: f64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<JobId>>> + Send + '_>>;

    /// Reads a job's fields; `None` once they have expired.
    fn read_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Job>>> + Send + '_>>;

    /// Reads only the event ID of a job record, for records that fail to
    /// decode in full.
    fn read_event_id(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventId>>> + Send + '_>>;

    /// Makes a claimed job due again at `due`, updating its attempt counter
    /// in the same atomic step when `attempt` is set.
    fn reinsert(
        &self,
        job_id: JobId,
        due: f64,
        attempt: Option<u32>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Starts the retention countdown of a finished job and guarantees it is
    /// no longer claimable.
    fn finalize(&self, job_id: JobId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Writes the event's status and resets its TTL.
    fn update_status(
        &self,
        event_id: EventId,
        status: EventStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Prepends an attempt record, trims history to its bound and resets the
    /// TTL.
    fn push_history(
        &self,
        event_id: EventId,
        record: DeliveryAttemptRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Current status plus history, newest first.
    fn find_status_report(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StatusReport>>> + Send + '_>>;
}

/// Production storage backed by Redis.
#[derive(Debug, Clone)]
pub struct RedisDeliveryStorage {
    storage: Arc<Storage>,
}

impl RedisDeliveryStorage {
    /// Wraps the core Redis storage.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for RedisDeliveryStorage {
    fn enqueue(
        &self,
        request: EnqueueRequest,
        now: f64,
    ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.enqueue(request, now).await })
    }

    fn claim_due(
        &self,
        now: f64,
    ) -> Pin<Box<dyn Future<Output = Result<Option<JobId>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.claim_due(now).await })
    }

    fn read_job(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Job>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.find(&job_id).await })
    }

    fn read_event_id(
        &self,
        job_id: JobId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventId>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.find_event_id(&job_id).await })
    }

    fn reinsert(
        &self,
        job_id: JobId,
        due: f64,
        attempt: Option<u32>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.reinsert(&job_id, due, attempt).await })
    }

    fn finalize(&self, job_id: JobId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.jobs.finalize(&job_id).await })
    }

    fn update_status(
        &self,
        event_id: EventId,
        status: EventStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.status.update(&event_id, &status).await })
    }

    fn push_history(
        &self,
        event_id: EventId,
        record: DeliveryAttemptRecord,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.status.push_history(&event_id, &record).await })
    }

    fn find_status_report(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StatusReport>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.status_report(&event_id).await })
    }
}

pub mod memory {
    //! In-memory store for tests.
    //!
    //! One mutex owns the ready set, job records, statuses and histories, so
    //! every operation is atomic with respect to every other. Expiry is
    //! evaluated lazily against the injected clock.

    use std::{
        collections::{HashMap, VecDeque},
        future::Future,
        pin::Pin,
        sync::Arc,
        time::SystemTime,
    };

    use hookrelay_core::{
        error::{CoreError, Result},
        models::{
            DeliveryAttemptRecord, EnqueueRequest, EventId, EventStatus, Job, JobId, StatusReport,
        },
        storage::StoreConfig,
        Clock,
    };
    use tokio::sync::Mutex;

    use super::DeliveryStorage;

    #[derive(Debug, Default)]
    struct State {
        ready: HashMap<JobId, f64>,
        jobs: HashMap<JobId, (Job, Option<SystemTime>)>,
        statuses: HashMap<EventId, (EventStatus, SystemTime)>,
        histories: HashMap<EventId, (VecDeque<DeliveryAttemptRecord>, SystemTime)>,
        claim_error: Option<String>,
        read_error: Option<String>,
        decode_error: Option<String>,
        write_failures: usize,
        unavailable: bool,
    }

    impl State {
        fn check_available(&self) -> Result<()> {
            if self.unavailable {
                return Err(CoreError::Store("store unavailable".into()));
            }
            Ok(())
        }

        fn check_write(&mut self) -> Result<()> {
            self.check_available()?;
            if self.write_failures > 0 {
                self.write_failures -= 1;
                return Err(CoreError::Store("write rejected".into()));
            }
            Ok(())
        }

        fn purge_expired(&mut self, now: SystemTime) {
            self.jobs.retain(|_, (_, expires)| expires.map_or(true, |at| at > now));
            self.statuses.retain(|_, (_, expires)| *expires > now);
            self.histories.retain(|_, (_, expires)| *expires > now);
        }
    }

    /// In-memory `DeliveryStorage` with failure injection.
    #[derive(Debug, Clone)]
    pub struct InMemoryDeliveryStorage {
        state: Arc<Mutex<State>>,
        config: Arc<StoreConfig>,
        clock: Arc<dyn Clock>,
    }

    impl InMemoryDeliveryStorage {
        /// Creates an empty store.
        pub fn new(config: StoreConfig, clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(Mutex::new(State::default())), config: Arc::new(config), clock }
        }

        /// Store settings in effect.
        pub fn config(&self) -> &StoreConfig {
            &self.config
        }

        /// Fails the next `claim_due` with a store error.
        pub async fn inject_claim_error(&self, message: impl Into<String>) {
            self.state.lock().await.claim_error = Some(message.into());
        }

        /// Fails the next `read_job` with a store error.
        pub async fn inject_read_error(&self, message: impl Into<String>) {
            self.state.lock().await.read_error = Some(message.into());
        }

        /// Fails the next `read_job` as if the stored record were malformed.
        pub async fn inject_decode_error(&self, message: impl Into<String>) {
            self.state.lock().await.decode_error = Some(message.into());
        }

        /// Fails the next `count` writes (status, history, reinsert and
        /// finalize) with a store error.
        pub async fn inject_write_failures(&self, count: usize) {
            self.state.lock().await.write_failures = count;
        }

        /// Makes every operation fail until called again with `false`.
        pub async fn set_unavailable(&self, unavailable: bool) {
            self.state.lock().await.unavailable = unavailable;
        }

        /// Due-time of a job in the ready set.
        pub async fn due_at(&self, job_id: &JobId) -> Option<f64> {
            self.state.lock().await.ready.get(job_id).copied()
        }

        /// Number of jobs in the ready set.
        pub async fn ready_len(&self) -> usize {
            self.state.lock().await.ready.len()
        }

        /// Stored job record, if not expired.
        pub async fn job(&self, job_id: &JobId) -> Option<Job> {
            let now = self.clock.now_system();
            let mut state = self.state.lock().await;
            state.purge_expired(now);
            state.jobs.get(job_id).map(|(job, _)| job.clone())
        }

        /// Whether the job's record has a retention deadline set.
        pub async fn is_finalized(&self, job_id: &JobId) -> bool {
            self.state.lock().await.jobs.get(job_id).is_some_and(|(_, expires)| expires.is_some())
        }

        /// Inserts a job directly, bypassing validation. Used to stage
        /// records that a producer would never write.
        pub async fn insert_job(&self, job: Job, due: Option<f64>) {
            let mut state = self.state.lock().await;
            if let Some(due) = due {
                state.ready.insert(job.id.clone(), due);
            }
            state.jobs.insert(job.id.clone(), (job, None));
        }

        /// Deletes a job record while leaving the ready set untouched.
        pub async fn remove_job_record(&self, job_id: &JobId) {
            self.state.lock().await.jobs.remove(job_id);
        }

        fn status_deadline(&self) -> SystemTime {
            self.clock.now_system() + self.config.status_retention
        }
    }

    impl DeliveryStorage for InMemoryDeliveryStorage {
        fn enqueue(
            &self,
            request: EnqueueRequest,
            now: f64,
        ) -> Pin<Box<dyn Future<Output = Result<JobId>> + Send + '_>> {
            Box::pin(async move {
                let job = request.into_job(JobId::generate())?;
                let deadline = self.status_deadline();

                let mut state = self.state.lock().await;
                state.check_available()?;
                state.statuses.insert(job.event_id.clone(), (EventStatus::pending(), deadline));
                state.ready.insert(job.id.clone(), now);
                let id = job.id.clone();
                state.jobs.insert(id.clone(), (job, None));
                Ok(id)
            })
        }

        fn claim_due(
            &self,
            now: f64,
        ) -> Pin<Box<dyn Future<Output = Result<Option<JobId>>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.check_available()?;
                if let Some(message) = state.claim_error.take() {
                    return Err(CoreError::Store(message));
                }

                let due = state
                    .ready
                    .iter()
                    .filter(|(_, score)| **score <= now)
                    .min_by(|(a_id, a), (b_id, b)| {
                        a.total_cmp(*b).then_with(|| a_id.cmp(b_id))
                    })
                    .map(|(id, _)| id.clone());

                if let Some(id) = &due {
                    state.ready.remove(id);
                }
                Ok(due)
            })
        }

        fn read_job(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Job>>> + Send + '_>> {
            Box::pin(async move {
                let now = self.clock.now_system();
                let mut state = self.state.lock().await;
                state.check_available()?;
                if let Some(message) = state.read_error.take() {
                    return Err(CoreError::Store(message));
                }
                if let Some(message) = state.decode_error.take() {
                    return Err(CoreError::InvalidInput(message));
                }
                state.purge_expired(now);
                Ok(state.jobs.get(&job_id).map(|(job, _)| job.clone()))
            })
        }

        fn read_event_id(
            &self,
            job_id: JobId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<EventId>>> + Send + '_>> {
            Box::pin(async move {
                let now = self.clock.now_system();
                let mut state = self.state.lock().await;
                state.check_available()?;
                state.purge_expired(now);
                Ok(state.jobs.get(&job_id).map(|(job, _)| job.event_id.clone()))
            })
        }

        fn reinsert(
            &self,
            job_id: JobId,
            due: f64,
            attempt: Option<u32>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.check_write()?;
                if let (Some(attempt), Some((job, _))) = (attempt, state.jobs.get_mut(&job_id)) {
                    job.attempt = attempt;
                }
                state.ready.insert(job_id, due);
                Ok(())
            })
        }

        fn finalize(&self, job_id: JobId) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let deadline = self.clock.now_system() + self.config.job_retention;
                let mut state = self.state.lock().await;
                state.check_write()?;
                if let Some((_, expires)) = state.jobs.get_mut(&job_id) {
                    *expires = Some(deadline);
                }
                state.ready.remove(&job_id);
                Ok(())
            })
        }

        fn update_status(
            &self,
            event_id: EventId,
            status: EventStatus,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let deadline = self.status_deadline();
                let mut state = self.state.lock().await;
                state.check_write()?;
                state.statuses.insert(event_id, (status, deadline));
                Ok(())
            })
        }

        fn push_history(
            &self,
            event_id: EventId,
            record: DeliveryAttemptRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let now = self.clock.now_system();
                let deadline = self.status_deadline();
                let max_len = self.config.history_max_len.max(1);

                let mut state = self.state.lock().await;
                state.check_write()?;
                state.purge_expired(now);
                let entry =
                    state.histories.entry(event_id).or_insert_with(|| (VecDeque::new(), deadline));
                entry.0.push_front(record);
                entry.0.truncate(max_len);
                entry.1 = deadline;
                Ok(())
            })
        }

        fn find_status_report(
            &self,
            event_id: EventId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<StatusReport>>> + Send + '_>> {
            Box::pin(async move {
                let now = self.clock.now_system();
                let mut state = self.state.lock().await;
                state.check_available()?;
                state.purge_expired(now);

                let Some((status, _)) = state.statuses.get(&event_id) else {
                    return Ok(None);
                };
                let history = state
                    .histories
                    .get(&event_id)
                    .map(|(records, _)| records.iter().cloned().collect())
                    .unwrap_or_default();
                Ok(Some(StatusReport { status: status.clone(), history }))
            })
        }
    }

}
