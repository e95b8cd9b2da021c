//! Event recording for deterministic assertions on worker output.

use std::time::Duration;

use hookrelay_core::{DeliveryEvent, DeliveryFailedEvent, EventHandler};
use tokio::sync::{Notify, RwLock};

/// Default timeout when waiting for events.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Event handler that keeps every event it receives.
#[derive(Debug, Default)]
pub struct RecordingEventHandler {
    events: RwLock<Vec<DeliveryEvent>>,
    notify: Notify,
}

impl RecordingEventHandler {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received, in order.
    pub async fn events(&self) -> Vec<DeliveryEvent> {
        self.events.read().await.clone()
    }

    /// Terminal failure events received.
    pub async fn failed_events(&self) -> Vec<DeliveryFailedEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                DeliveryEvent::Failed(failed) => Some(failed.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of success events.
    pub async fn succeeded_count(&self) -> usize {
        self.count(|event| matches!(event, DeliveryEvent::Succeeded(_))).await
    }

    /// Number of retry events.
    pub async fn retry_count(&self) -> usize {
        self.count(|event| matches!(event, DeliveryEvent::RetryScheduled(_))).await
    }

    /// Number of terminal failure events.
    pub async fn failed_count(&self) -> usize {
        self.count(|event| matches!(event, DeliveryEvent::Failed(_))).await
    }

    async fn count(&self, predicate: impl Fn(&DeliveryEvent) -> bool) -> usize {
        self.events.read().await.iter().filter(|event| predicate(event)).count()
    }

    /// Waits until at least `count` events were recorded.
    ///
    /// # Panics
    ///
    /// Panics after `DEFAULT_EVENT_TIMEOUT`.
    pub async fn wait_for_events(&self, count: usize) {
        let result = tokio::time::timeout(DEFAULT_EVENT_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.events.read().await.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await;

        assert!(
            result.is_ok(),
            "expected {count} events within {DEFAULT_EVENT_TIMEOUT:?}, saw {}",
            self.events.read().await.len()
        );
    }
}

#[async_trait::async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: DeliveryEvent) {
        self.events.write().await.push(event);
        self.notify.notify_waiters();
    }
}
