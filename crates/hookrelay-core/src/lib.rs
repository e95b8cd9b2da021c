//! Core domain types for the hookrelay delivery system.
//!
//! Holds the job and status models, the clock abstraction, delivery events,
//! and the Redis-backed job store that every other crate builds on. Workers
//! never keep authoritative state of their own; everything they decide is
//! re-read from the types in this crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryFailedEvent, DeliverySucceededEvent, EventHandler,
    MulticastEventHandler, NoOpEventHandler, RetryScheduledEvent,
};
pub use models::{
    BackoffOverrides, DeliveryAttemptRecord, DeliveryState, EnqueueRequest, EventId, EventStatus,
    Job, JobId, StatusReport,
};
pub use time::{Clock, RealClock, TestClock};
