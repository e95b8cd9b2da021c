//! Test infrastructure for hookrelay.
//!
//! `TestEnv` wires a delivery engine to the in-memory store, a controllable
//! clock, a wiremock target and an event recorder, so scenario tests can
//! drive the worker one iteration at a time and assert on every side
//! effect.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use hookrelay_core::{storage::StoreConfig, EnqueueRequest, EventId, JobId, StatusReport};
pub use hookrelay_core::{Clock, TestClock};
use hookrelay_delivery::{
    storage::DeliveryStorage, DeliveryConfig, DeliveryEngine, InMemoryDeliveryStorage,
    RetryPolicy,
};

pub mod events;
pub mod fixtures;
pub mod http;

pub use events::RecordingEventHandler;
pub use fixtures::JobBuilder;
pub use http::{MockEndpoint, MockResponse, MockServer};

/// Isolated environment for delivery tests.
pub struct TestEnv {
    /// Deterministic clock shared by store, client and workers.
    pub clock: TestClock,
    /// In-memory job store.
    pub storage: InMemoryDeliveryStorage,
    /// Webhook target.
    pub http_mock: MockServer,
    /// Every event emitted by engines built from this environment.
    pub events: Arc<RecordingEventHandler>,
    config: DeliveryConfig,
}

impl TestEnv {
    /// Creates an environment with immediate retries and no jitter.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for symmetry with engine
    /// construction.
    pub async fn new() -> Result<Self> {
        let config = DeliveryConfig {
            worker_count: 1,
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            retry_policy: RetryPolicy {
                base_delay: Duration::ZERO,
                jitter: Duration::ZERO,
                ..RetryPolicy::default()
            },
            shutdown_timeout: Duration::from_secs(5),
            ..DeliveryConfig::default()
        };
        Self::with_config(config, StoreConfig::default()).await
    }

    /// Creates an environment with explicit engine and store settings.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for symmetry with engine
    /// construction.
    pub async fn with_config(config: DeliveryConfig, store_config: StoreConfig) -> Result<Self> {
        init_test_tracing();

        let clock = TestClock::new();
        let storage = InMemoryDeliveryStorage::new(store_config, Arc::new(clock.clone()));
        let http_mock = MockServer::start().await;

        Ok(Self {
            clock,
            storage,
            http_mock,
            events: Arc::new(RecordingEventHandler::new()),
            config,
        })
    }

    /// Engine settings used by `create_engine`.
    pub fn delivery_config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Engine over this environment's store and clock, publishing to
    /// `self.events`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn create_engine(&self) -> Result<DeliveryEngine> {
        Ok(DeliveryEngine::with_event_handler(
            Arc::new(self.storage.clone()),
            self.config.clone(),
            self.clock_handle(),
            self.events.clone(),
        )?)
    }

    /// Engine wired with the production event handler built from `config`,
    /// such as the failure notifier.
    ///
    /// # Errors
    ///
    /// Returns error if an HTTP client cannot be built.
    pub fn create_production_engine(&self, config: DeliveryConfig) -> Result<DeliveryEngine> {
        Ok(DeliveryEngine::new(Arc::new(self.storage.clone()), config, self.clock_handle())?)
    }

    /// The clock as a trait object.
    pub fn clock_handle(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Enqueues a job due at the current test time.
    ///
    /// # Errors
    ///
    /// Returns error if the request is invalid.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobId> {
        Ok(self.storage.enqueue(request, self.clock.unix_seconds()).await?)
    }

    /// Status report for `event_id`.
    ///
    /// # Errors
    ///
    /// Returns error if the store is set unavailable.
    pub async fn status(&self, event_id: &str) -> Result<Option<StatusReport>> {
        Ok(self.storage.find_status_report(EventId::from(event_id)).await?)
    }

    /// Advances test time.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

/// Installs a test-writer subscriber once per process.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
