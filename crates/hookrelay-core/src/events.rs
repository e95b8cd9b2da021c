//! Delivery events and the handler seam used to observe them.
//!
//! Workers publish one event per processed job outcome. Side effects that
//! must never hold up delivery, such as the failure notifier, subscribe
//! through `EventHandler` instead of being called directly.
//!
//! ```text
//!                      Succeeded / RetryScheduled / Failed
//! ┌─────────────────┐                               ┌────────────────────┐
//! │ DeliveryWorker  │ ─────────────────────────────▶│ MulticastHandler   │
//! └─────────────────┘                               └────────────────────┘
//!                                                             │
//!                                                             ▼
//!                                                   ┌────────────────────┐
//!                                                   │ FailureNotifier    │
//!                                                   │ (terminal failures)│
//!                                                   └────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EventId, JobId};

/// Outcome events emitted by delivery workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DeliveryEvent {
    /// A job was delivered with a 2xx response.
    Succeeded(DeliverySucceededEvent),

    /// An attempt failed and the job went back into the ready set.
    RetryScheduled(RetryScheduledEvent),

    /// A job exhausted its attempt budget.
    Failed(DeliveryFailedEvent),
}

/// Emitted when a job is delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverySucceededEvent {
    /// Job that was delivered.
    pub job_id: JobId,
    /// Logical event.
    pub event_id: EventId,
    /// Endpoint that accepted the delivery.
    pub target_url: String,
    /// 2xx status returned.
    pub response_status: u16,
    /// One-based number of the successful attempt.
    pub attempt_number: u32,
    /// When the successful attempt started.
    pub delivered_at: DateTime<Utc>,
}

/// Emitted when a failed attempt is re-armed for later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryScheduledEvent {
    /// Job being retried.
    pub job_id: JobId,
    /// Logical event.
    pub event_id: EventId,
    /// One-based number of the attempt that failed.
    pub attempt_number: u32,
    /// Status of the failed attempt, if a response arrived.
    pub response_status: Option<u16>,
    /// Failure description.
    pub error_message: String,
    /// New due-time in the ready set.
    pub next_attempt_at: DateTime<Utc>,
}

/// Emitted once when a job ends in the failed state.
///
/// Field names match the body posted by the failure notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailedEvent {
    /// Job that failed.
    #[serde(skip_serializing, default)]
    pub job_id: JobId,
    /// Logical event.
    pub event_id: EventId,
    /// Endpoint that never accepted the delivery.
    pub target_url: String,
    /// Total attempts made.
    pub attempts: u32,
    /// Status of the last attempt, absent if it never got a response.
    pub last_response_code: Option<u16>,
    /// Error of the last attempt.
    pub last_error: Option<String>,
    /// When the last attempt started.
    pub failed_at: DateTime<Utc>,
}

/// Subscriber to delivery events.
///
/// Implementations must not propagate errors back into the worker and should
/// return quickly; anything slow belongs in a spawned task.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    /// Handles a delivery event.
    async fn handle_event(&self, event: DeliveryEvent);
}

/// Handler that ignores every event.
#[derive(Debug, Default)]
pub struct NoOpEventHandler;

impl NoOpEventHandler {
    /// Creates a new no-op handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl EventHandler for NoOpEventHandler {
    async fn handle_event(&self, _event: DeliveryEvent) {}
}

/// Fans each event out to every registered subscriber concurrently.
#[derive(Debug, Clone, Default)]
pub struct MulticastEventHandler {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MulticastEventHandler {
    /// Creates a handler with no subscribers.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Registers a subscriber.
    pub fn add_subscriber(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }
}

#[async_trait::async_trait]
impl EventHandler for MulticastEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        let deliveries = self.handlers.iter().map(|handler| {
            let event = event.clone();
            async move { handler.handle_event(event).await }
        });
        futures::future::join_all(deliveries).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct CountingHandler {
        seen: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler for CountingHandler {
        async fn handle_event(&self, _event: DeliveryEvent) {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn failed_event() -> DeliveryEvent {
        DeliveryEvent::Failed(DeliveryFailedEvent {
            job_id: JobId::from("job-1"),
            event_id: EventId::from("evt-1"),
            target_url: "https://example.com/hook".into(),
            attempts: 3,
            last_response_code: Some(503),
            last_error: Some("server error: HTTP 503".into()),
            failed_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn multicast_reaches_every_subscriber() {
        let first = Arc::new(CountingHandler::default());
        let second = Arc::new(CountingHandler::default());
        let mut multicast = MulticastEventHandler::new();
        multicast.add_subscriber(first.clone());
        multicast.add_subscriber(second.clone());

        multicast.handle_event(failed_event()).await;

        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multicast_without_subscribers_is_a_no_op() {
        MulticastEventHandler::new().handle_event(failed_event()).await;
        NoOpEventHandler::new().handle_event(failed_event()).await;
    }

    #[test]
    fn failed_event_body_has_notification_fields() {
        let DeliveryEvent::Failed(event) = failed_event() else {
            unreachable!("constructed as Failed");
        };
        let body = serde_json::to_value(&event).unwrap();

        let keys =
            ["event_id", "target_url", "attempts", "last_response_code", "last_error", "failed_at"];
        for key in keys {
            assert!(body.get(key).is_some(), "missing {key}");
        }
        assert!(body.get("job_id").is_none());
    }
}
