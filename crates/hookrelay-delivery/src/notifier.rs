//! Best-effort notification of permanently failed events.
//!
//! Reacts to `DeliveryEvent::Failed` only. The POST runs on its own task so a
//! slow or dead notify endpoint never holds up a worker; it is sent once and
//! any error is logged and dropped.

use std::time::Duration;

use hookrelay_core::{DeliveryEvent, DeliveryFailedEvent, EventHandler};
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Event handler that POSTs terminal failures to an operator endpoint.
#[derive(Debug, Clone)]
pub struct FailureNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl FailureNotifier {
    /// Creates a notifier. With `url` unset every event is ignored.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(url: Option<String>, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build notifier client: {e}"))
            })?;

        Ok(Self { client, url: url.filter(|url| !url.trim().is_empty()) })
    }

    /// Whether a notify endpoint is configured.
    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Sends one notification and waits for it. Errors are logged, never
    /// returned.
    pub async fn notify(&self, event: &DeliveryFailedEvent) {
        let Some(url) = &self.url else {
            return;
        };

        match self.client.post(url).json(event).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(event_id = %event.event_id, "failure notification sent");
            },
            Ok(response) => {
                warn!(
                    event_id = %event.event_id,
                    status_code = response.status().as_u16(),
                    "failure notification rejected"
                );
            },
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "failure notification failed");
            },
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for FailureNotifier {
    async fn handle_event(&self, event: DeliveryEvent) {
        let DeliveryEvent::Failed(failed) = event else {
            return;
        };
        if !self.is_enabled() {
            return;
        }

        let notifier = self.clone();
        tokio::spawn(async move { notifier.notify(&failed).await });
    }
}
