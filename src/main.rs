//! hookrelay webhook delivery worker.
//!
//! Connects to Redis, starts the delivery workers and runs until CTRL+C or
//! SIGTERM, then drains in-flight deliveries.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use deadpool_redis::{Pool, Runtime};
use hookrelay_core::{storage::Storage, RealClock};
use hookrelay_delivery::{DeliveryEngine, RedisDeliveryStorage};
use tracing::{info, warn};

mod config;

use config::Config;

const MAX_CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_level)?;

    info!(
        redis_url = %config.redis_url_masked(),
        queue_key = %config.queue_key,
        worker_count = config.worker_count,
        failure_notify = config.failure_notify_url.is_some(),
        "Configuration loaded"
    );

    let pool = create_redis_pool(&config)?;
    let storage = Arc::new(Storage::new(pool, config.to_store_config()));
    wait_for_redis(&storage).await?;
    info!("Redis connection established");

    let mut engine = DeliveryEngine::new(
        Arc::new(RedisDeliveryStorage::new(storage)),
        config.to_delivery_config(),
        Arc::new(RealClock::new()),
    )
    .context("Failed to build delivery engine")?;
    engine.start().await.context("Failed to start delivery workers")?;
    info!(worker_count = config.worker_count, "hookrelay is delivering webhooks");

    shutdown_signal().await?;
    info!("Shutdown signal received, draining workers");

    let stats = engine.stats_handle();
    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Workers did not stop cleanly");
    }

    let stats = stats.read().await.clone();
    info!(
        jobs_processed = stats.jobs_processed,
        delivered = stats.successful_deliveries,
        failed = stats.permanent_failures,
        "hookrelay shutdown complete"
    );
    Ok(())
}

/// Installs the global subscriber. `RUST_LOG` wins over the configured
/// level; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing(default_level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .context("Invalid log filter")?;

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(fmt::layer().json().with_target(true).with_current_span(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true).with_thread_ids(true)).init();
    }
    Ok(())
}

fn create_redis_pool(config: &Config) -> Result<Pool> {
    deadpool_redis::Config::from_url(config.redis_url.clone())
        .create_pool(Some(Runtime::Tokio1))
        .context("Failed to create Redis pool")
}

/// Pings Redis until it answers, giving up after a few attempts.
async fn wait_for_redis(storage: &Storage) -> Result<()> {
    let mut retries = 0;

    loop {
        match storage.health_check().await {
            Ok(()) => return Ok(()),
            Err(e) if retries < MAX_CONNECT_RETRIES => {
                retries += 1;
                warn!(
                    error = %e,
                    retry = retries,
                    max_retries = MAX_CONNECT_RETRIES,
                    "Redis not reachable, retrying"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context(format!(
                    "Redis not reachable after {MAX_CONNECT_RETRIES} retries"
                ))
            },
        }
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = ctrl_c => {
                result.context("Failed to listen for CTRL+C")?;
                info!("Received CTRL+C signal");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.context("Failed to listen for CTRL+C")?;
        info!("Received CTRL+C signal");
    }

    Ok(())
}
