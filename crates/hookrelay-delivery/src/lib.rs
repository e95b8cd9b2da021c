//! Reliable webhook delivery on top of a Redis ready set.
//!
//! Producers enqueue jobs; a pool of workers claims due jobs, POSTs them to
//! their target, records every attempt and either finishes the job or puts
//! it back with exponential backoff.
//!
//! # Architecture
//!
//! 1. **Claim** - a worker atomically pops the earliest due job ID
//! 2. **Deliver** - one signed POST with a hard timeout
//! 3. **Record** - attempt history is appended unconditionally
//! 4. **Decide** - delivered, rescheduled with backoff, or failed and
//!    reported to the failure notifier
//!
//! Delivery is at-least-once. A worker that dies between claim and reinsert
//! loses that job's claim; nothing else is lost.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use hookrelay_core::{storage::Storage, RealClock};
//! use hookrelay_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError, RedisDeliveryStorage};
//!
//! # async fn example(storage: Arc<Storage>) -> Result<(), DeliveryError> {
//! let storage = Arc::new(RedisDeliveryStorage::new(storage));
//! let mut engine =
//!     DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! // ...
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

pub mod client;
pub mod error;
pub mod notifier;
pub mod retry;
pub mod signing;
pub mod storage;
pub mod worker;
pub mod worker_pool;

pub use client::{ClientConfig, DeliveryClient, DeliveryOutcome, DeliveryRequest};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use notifier::FailureNotifier;
pub use retry::{next_delay, RetryPolicy};
pub use signing::{sign_payload, verify_signature, SIGNATURE_HEADER};
pub use storage::{memory::InMemoryDeliveryStorage, DeliveryStorage, RedisDeliveryStorage};
pub use worker::{DeliveryConfig, DeliveryEngine, EngineStats, ProcessOutcome};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default sleep of an idle worker.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
