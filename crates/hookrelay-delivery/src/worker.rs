//! Delivery engine and the per-worker claim/deliver/decide loop.
//!
//! Workers share nothing authoritative in-process. Every decision is made
//! from the job record just read from the store, and the only hand-off
//! between workers is the store's atomic claim and reinsert.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use hookrelay_core::{
    Clock, CoreError, DeliveryAttemptRecord, DeliveryEvent, DeliveryFailedEvent, DeliveryState,
    DeliverySucceededEvent, EnqueueRequest, EventHandler, EventId, EventStatus, Job, JobId,
    MulticastEventHandler, NoOpEventHandler, RetryScheduledEvent, StatusReport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ClientConfig, DeliveryClient, DeliveryOutcome, DeliveryRequest},
    error::{DeliveryError, Result},
    notifier::FailureNotifier,
    retry::RetryPolicy,
    storage::DeliveryStorage,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers.
    pub worker_count: usize,

    /// How long an idle worker sleeps before polling again.
    pub poll_interval: Duration,

    /// How long a worker backs off after a store error.
    pub error_backoff: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Attempt budget and backoff for jobs without overrides.
    pub retry_policy: RetryPolicy,

    /// Endpoint told about permanently failed events.
    pub failure_notify_url: Option<String>,

    /// Timeout of the failure notification POST.
    pub notify_timeout: Duration,

    /// Maximum time to wait for workers to stop.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
            error_backoff: Duration::from_millis(500),
            client_config: ClientConfig::default(),
            retry_policy: RetryPolicy::default(),
            failure_notify_url: None,
            notify_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Number of running workers.
    pub active_workers: usize,
    /// Jobs that reached the delivery step.
    pub jobs_processed: u64,
    /// Attempts answered with 2xx.
    pub successful_deliveries: u64,
    /// Failed attempts put back for another try.
    pub retries_scheduled: u64,
    /// Jobs that ran out of attempts.
    pub permanent_failures: u64,
    /// Deliveries currently waiting on the endpoint.
    pub in_flight_deliveries: u64,
    /// Store operations that failed.
    pub store_errors: u64,
    /// Claimed IDs whose job record had already expired.
    pub missing_jobs: u64,
    /// Claimed jobs whose record could not be decoded and was discarded.
    pub unreadable_jobs: u64,
}

/// What a single loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing was due.
    Idle,
    /// A job was claimed but its record no longer exists.
    MissingJob,
    /// A job was claimed but its record is malformed; it was marked failed
    /// and finalized without an attempt.
    Unreadable,
    /// The endpoint answered 2xx.
    Delivered,
    /// The attempt failed and the job was rescheduled.
    RetryScheduled,
    /// The attempt failed and no attempts are left.
    Failed,
}

/// Main delivery engine coordinating webhook delivery workers.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
}

impl DeliveryEngine {
    /// Creates an engine publishing to `event_handler` instead of the
    /// configured failure notifier.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery client cannot be initialized.
    pub fn with_event_handler(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        let client = Arc::new(DeliveryClient::new(config.client_config.clone(), clock.clone())?);

        Ok(Self {
            storage,
            config,
            client,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
            event_handler,
        })
    }

    /// Creates an engine that sends terminal failures to
    /// `config.failure_notify_url`, if set.
    ///
    /// # Errors
    ///
    /// Returns error if the delivery or notifier client cannot be
    /// initialized.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let event_handler: Arc<dyn EventHandler> = match &config.failure_notify_url {
            Some(url) => {
                let notifier = FailureNotifier::new(
                    Some(url.clone()),
                    config.notify_timeout,
                    &config.client_config.user_agent,
                )?;
                let mut multicast = MulticastEventHandler::new();
                multicast.add_subscriber(Arc::new(notifier));
                Arc::new(multicast)
            },
            None => Arc::new(NoOpEventHandler::new()),
        };

        Self::with_event_handler(storage, config, clock, event_handler)
    }

    /// Starts the configured number of workers and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if the engine is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.config.worker_count,
            poll_interval_ms = self.config.poll_interval.as_millis(),
            "starting webhook delivery engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.storage.clone(),
            self.config.clone(),
            self.client.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
            self.event_handler.clone(),
        );
        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("delivery engine started");
        Ok(())
    }

    /// Signals workers to stop after their current iteration and waits for
    /// them up to the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if workers do not stop in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        } else {
            info!("delivery engine was not started, nothing to stop");
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Shared statistics, still readable after the engine is shut down.
    pub fn stats_handle(&self) -> Arc<RwLock<EngineStats>> {
        self.stats.clone()
    }

    /// Enqueues a job due immediately.
    ///
    /// # Errors
    ///
    /// Returns `InternalError` for an invalid request and `StoreError` if
    /// the store is unavailable.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId> {
        let job_id = self.storage.enqueue(request, self.clock.unix_seconds()).await?;
        debug!(job_id = %job_id, "job enqueued");
        Ok(job_id)
    }

    /// Current status and history of an event.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store is unavailable.
    pub async fn status_report(&self, event_id: &EventId) -> Result<Option<StatusReport>> {
        Ok(self.storage.find_status_report(event_id.clone()).await?)
    }

    /// Runs exactly one worker iteration on the calling task.
    ///
    /// Does not sleep when idle and does not start background workers.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store failed during the iteration.
    pub async fn process_once(&self) -> Result<ProcessOutcome> {
        let worker = DeliveryWorker::new(
            0,
            self.storage.clone(),
            self.config.clone(),
            self.client.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.event_handler.clone(),
            self.clock.clone(),
        );

        let result = worker.process_next().await;
        if let Err(e) = &result {
            worker.record_store_error("process_once", e).await;
        }
        result
    }
}

/// Individual worker that claims and delivers jobs.
pub struct DeliveryWorker {
    id: usize,
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    event_handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    /// Creates a worker.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        client: Arc<DeliveryClient>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        event_handler: Arc<dyn EventHandler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, config, client, stats, cancellation_token, event_handler, clock }
    }

    /// Claims and processes jobs until cancelled.
    ///
    /// Cancellation is only observed between iterations; a delivery in
    /// progress always runs to completion or its own timeout.
    ///
    /// # Errors
    ///
    /// Never returns an error today. Iteration failures are logged, counted
    /// and retried after `error_backoff`.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "delivery worker starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "delivery worker received shutdown signal");
                break;
            }

            let pause = match self.process_next().await {
                Ok(ProcessOutcome::Idle) => Some(self.config.poll_interval),
                Ok(_) => None,
                Err(error) => {
                    self.record_store_error("worker iteration", &error).await;
                    Some(self.config.error_backoff)
                },
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = self.clock.sleep(pause) => {}
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!(worker_id = self.id, "delivery worker stopped");
        Ok(())
    }

    /// Runs one claim/deliver/decide iteration.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if claiming or reading fails. A claimed job whose
    /// read hit a store error is put back at `now` before the error is
    /// returned. Store errors while finalizing or rescheduling a claimed job
    /// are retried in place and only surface if shutdown interrupts them.
    pub async fn process_next(&self) -> Result<ProcessOutcome> {
        let now = self.clock.unix_seconds();
        let Some(job_id) = self.storage.claim_due(now).await? else {
            return Ok(ProcessOutcome::Idle);
        };

        let job = match self.storage.read_job(job_id.clone()).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(worker_id = self.id, job_id = %job_id, "claimed job has no record, skipping");
                self.stats.write().await.missing_jobs += 1;
                return Ok(ProcessOutcome::MissingJob);
            },
            Err(read_error) if read_error.is_store_unavailable() => {
                self.settle("release claim", &job_id, || {
                    self.storage.reinsert(job_id.clone(), now, None)
                })
                .await?;
                return Err(read_error.into());
            },
            Err(read_error) => return self.discard_unreadable(&job_id, &read_error).await,
        };

        self.process_job(job).await
    }

    async fn process_job(&self, job: Job) -> Result<ProcessOutcome> {
        let attempt_number = job.attempt.saturating_add(1);
        let attempted_at = self.clock.now_utc();

        debug!(
            worker_id = self.id,
            job_id = %job.id,
            event_id = %job.event_id,
            attempt = attempt_number,
            "attempting webhook delivery"
        );

        self.stats.write().await.in_flight_deliveries += 1;
        let outcome = self.client.deliver(DeliveryRequest::from_job(&job)).await;
        {
            let mut stats = self.stats.write().await;
            stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
            stats.jobs_processed += 1;
        }

        let record = DeliveryAttemptRecord {
            ts: attempted_at,
            attempt: attempt_number,
            url: job.target_url.clone(),
            status_code: outcome.status_code,
            error: outcome.error_message(),
            duration_ms: outcome.duration_ms(),
        };
        if let Err(e) = self.storage.push_history(job.event_id.clone(), record).await {
            self.record_store_error("push_history", &e.into()).await;
        }

        if outcome.is_success() {
            self.handle_success(&job, attempt_number, attempted_at, &outcome).await
        } else {
            self.handle_failure(&job, attempt_number, attempted_at, &outcome).await
        }
    }

    async fn handle_success(
        &self,
        job: &Job,
        attempt_number: u32,
        attempted_at: DateTime<Utc>,
        outcome: &DeliveryOutcome,
    ) -> Result<ProcessOutcome> {
        let status = EventStatus {
            state: DeliveryState::Delivered,
            attempt_count: attempt_number,
            last_attempt_at: Some(attempted_at),
            last_response_code: outcome.status_code,
            last_error: None,
        };
        self.write_status(&job.event_id, status).await;
        self.settle("finalize", &job.id, || self.storage.finalize(job.id.clone())).await?;

        self.stats.write().await.successful_deliveries += 1;
        info!(
            worker_id = self.id,
            job_id = %job.id,
            event_id = %job.event_id,
            attempt = attempt_number,
            status_code = outcome.status_code,
            duration_ms = outcome.duration_ms(),
            "webhook delivered"
        );

        self.event_handler
            .handle_event(DeliveryEvent::Succeeded(DeliverySucceededEvent {
                job_id: job.id.clone(),
                event_id: job.event_id.clone(),
                target_url: job.target_url.clone(),
                response_status: outcome.status_code.unwrap_or_default(),
                attempt_number,
                delivered_at: attempted_at,
            }))
            .await;

        Ok(ProcessOutcome::Delivered)
    }

    async fn handle_failure(
        &self,
        job: &Job,
        attempt_number: u32,
        attempted_at: DateTime<Utc>,
        outcome: &DeliveryOutcome,
    ) -> Result<ProcessOutcome> {
        let policy = self.config.retry_policy.for_job(job);
        let last_error = outcome.error_message();

        if policy.is_exhausted(attempt_number) {
            let status = EventStatus {
                state: DeliveryState::Failed,
                attempt_count: attempt_number,
                last_attempt_at: Some(attempted_at),
                last_response_code: outcome.status_code,
                last_error: last_error.clone(),
            };
            self.write_status(&job.event_id, status).await;
            self.settle("finalize", &job.id, || self.storage.finalize(job.id.clone())).await?;

            self.stats.write().await.permanent_failures += 1;
            warn!(
                worker_id = self.id,
                job_id = %job.id,
                event_id = %job.event_id,
                attempts = attempt_number,
                status_code = outcome.status_code,
                error = last_error.as_deref().unwrap_or_default(),
                "webhook permanently failed"
            );

            self.event_handler
                .handle_event(DeliveryEvent::Failed(DeliveryFailedEvent {
                    job_id: job.id.clone(),
                    event_id: job.event_id.clone(),
                    target_url: job.target_url.clone(),
                    attempts: attempt_number,
                    last_response_code: outcome.status_code,
                    last_error,
                    failed_at: attempted_at,
                }))
                .await;

            return Ok(ProcessOutcome::Failed);
        }

        let status = EventStatus {
            state: DeliveryState::Retrying,
            attempt_count: attempt_number,
            last_attempt_at: Some(attempted_at),
            last_response_code: outcome.status_code,
            last_error: last_error.clone(),
        };
        self.write_status(&job.event_id, status).await;

        let delay = policy.next_delay(attempt_number, &mut rand::rng());
        let now = self.clock.now_utc();
        let due = self.clock.unix_seconds() + delay.as_secs_f64();
        self.settle("reinsert", &job.id, || {
            self.storage.reinsert(job.id.clone(), due, Some(attempt_number))
        })
        .await?;

        self.stats.write().await.retries_scheduled += 1;
        debug!(
            worker_id = self.id,
            job_id = %job.id,
            event_id = %job.event_id,
            attempt = attempt_number,
            delay_ms = delay.as_millis(),
            "retry scheduled"
        );

        let next_attempt_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now);
        self.event_handler
            .handle_event(DeliveryEvent::RetryScheduled(RetryScheduledEvent {
                job_id: job.id.clone(),
                event_id: job.event_id.clone(),
                attempt_number,
                response_status: outcome.status_code,
                error_message: last_error.unwrap_or_default(),
                next_attempt_at,
            }))
            .await;

        Ok(ProcessOutcome::RetryScheduled)
    }

    /// Marks an undecodable job failed and takes it out of circulation.
    ///
    /// The record cannot say where it was going, so no attempt is made and
    /// no failure event is published.
    async fn discard_unreadable(
        &self,
        job_id: &JobId,
        read_error: &CoreError,
    ) -> Result<ProcessOutcome> {
        error!(
            worker_id = self.id,
            job_id = %job_id,
            error = %read_error,
            "claimed job record is unreadable, discarding"
        );
        self.stats.write().await.unreadable_jobs += 1;

        match self.storage.read_event_id(job_id.clone()).await {
            Ok(Some(event_id)) => {
                let status = EventStatus {
                    state: DeliveryState::Failed,
                    attempt_count: 0,
                    last_attempt_at: None,
                    last_response_code: None,
                    last_error: Some(format!("unreadable job record: {read_error}")),
                };
                self.write_status(&event_id, status).await;
            },
            Ok(None) => {},
            Err(e) => self.record_store_error("read_event_id", &e.into()).await,
        }

        self.settle("finalize", job_id, || self.storage.finalize(job_id.clone())).await?;
        Ok(ProcessOutcome::Unreadable)
    }

    /// Repeats a store write that must land for a claimed job to stay
    /// accounted for, backing off `error_backoff` between tries.
    ///
    /// Once shutdown is signalled one last try is made; if that fails too
    /// the error is returned and the job is left unsettled.
    async fn settle<F, Fut>(
        &self,
        operation: &'static str,
        job_id: &JobId,
        mut write: F,
    ) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = hookrelay_core::Result<()>>,
    {
        let mut last_try = false;
        loop {
            let error = match write().await {
                Ok(()) => return Ok(()),
                Err(e) => DeliveryError::from(e),
            };

            if last_try {
                error!(
                    worker_id = self.id,
                    job_id = %job_id,
                    operation,
                    error = %error,
                    "store write failed during shutdown, job left unsettled"
                );
                return Err(error);
            }
            self.record_store_error(operation, &error).await;

            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => last_try = true,
                () = self.clock.sleep(self.config.error_backoff) => {}
            }
        }
    }

    /// Status writes are best effort: a failed write must not strand the
    /// job, so it is logged and counted and processing continues.
    async fn write_status(&self, event_id: &EventId, status: EventStatus) {
        if let Err(e) = self.storage.update_status(event_id.clone(), status).await {
            self.record_store_error("update_status", &e.into()).await;
        }
    }

    async fn record_store_error(&self, operation: &str, error: &DeliveryError) {
        self.stats.write().await.store_errors += 1;
        warn!(
            worker_id = self.id,
            operation,
            category = %error.category(),
            error = %error,
            "store operation failed"
        );
    }
}
