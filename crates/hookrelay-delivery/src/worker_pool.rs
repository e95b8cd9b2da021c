//! Supervised set of delivery workers.
//!
//! Workers share one cancellation token. Shutdown cancels it and joins every
//! task under a timeout; dropping a pool that was never shut down cancels the
//! token so no worker outlives it.

use std::{sync::Arc, time::Duration};

use hookrelay_core::{Clock, EventHandler};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::DeliveryClient,
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
    worker::{DeliveryConfig, DeliveryWorker, EngineStats},
};

/// Owns the worker tasks of a running engine.
pub struct WorkerPool {
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    client: Arc<DeliveryClient>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
    event_handler: Arc<dyn EventHandler>,
}

impl WorkerPool {
    /// Creates a pool; no workers run until `spawn_workers`.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        client: Arc<DeliveryClient>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            storage,
            config,
            client,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
            event_handler,
        }
    }

    /// Spawns `worker_count` workers.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError` if `worker_count` is zero.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if self.config.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }

        info!(worker_count = self.config.worker_count, "spawning delivery workers");
        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let worker = DeliveryWorker::new(
                worker_id,
                self.storage.clone(),
                self.config.clone(),
                self.client.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.event_handler.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;
                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "delivery worker terminated with error");
                }
                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Cancels all workers and waits for them to finish their current
    /// iteration.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the workers are not done within
    /// `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let join_all = async move {
            let mut panics = 0usize;
            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "worker finished with error");
                    },
                    Err(join_error) => {
                        let panic = DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        };
                        error!(worker_id, error = %panic, "worker task panicked");
                        panics += 1;
                    },
                }
            }
            stats.write().await.active_workers = 0;
            panics
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(panics) => {
                if panics > 0 {
                    warn!(panics, "some workers panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(timeout_seconds = timeout.as_secs(), "worker shutdown timed out");
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any worker task is still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.iter().filter(|h| !h.is_finished()).count();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(active_workers = active, "worker pool dropped without shutdown, cancelling");
            self.cancellation_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use hookrelay_core::{storage::StoreConfig, NoOpEventHandler, RealClock};

    use super::*;
    use crate::storage::memory::InMemoryDeliveryStorage;

    fn pool(worker_count: usize, stats: Arc<RwLock<EngineStats>>) -> WorkerPool {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let config = DeliveryConfig {
            worker_count,
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let client =
            Arc::new(DeliveryClient::new(config.client_config.clone(), clock.clone()).unwrap());
        let storage = Arc::new(InMemoryDeliveryStorage::new(StoreConfig::default(), clock.clone()));

        WorkerPool::new(
            storage,
            config,
            client,
            stats,
            CancellationToken::new(),
            clock,
            Arc::new(NoOpEventHandler::new()),
        )
    }

    #[tokio::test]
    async fn spawns_configured_workers_and_tracks_stats() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let mut pool = pool(4, stats.clone());

        pool.spawn_workers().await.unwrap();
        assert_eq!(pool.worker_handles.len(), 4);
        assert_eq!(stats.read().await.active_workers, 4);
        assert!(pool.has_active_workers());

        pool.shutdown_graceful(Duration::from_secs(2)).await.unwrap();
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn shutdown_without_workers_succeeds() {
        let pool = pool(2, Arc::new(RwLock::new(EngineStats::default())));
        pool.shutdown_graceful(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn zero_workers_is_rejected() {
        let mut pool = pool(0, Arc::new(RwLock::new(EngineStats::default())));
        assert!(matches!(
            pool.spawn_workers().await,
            Err(DeliveryError::ConfigurationError { .. })
        ));
    }

    #[tokio::test]
    async fn drop_cancels_running_workers() {
        let mut pool = pool(1, Arc::new(RwLock::new(EngineStats::default())));
        pool.spawn_workers().await.unwrap();
        let token = pool.cancellation_token.clone();

        drop(pool);
        assert!(token.is_cancelled());
    }
}
