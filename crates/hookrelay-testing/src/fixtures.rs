//! Builders for enqueue requests.

use std::collections::BTreeMap;

use bytes::Bytes;
use hookrelay_core::{BackoffOverrides, EnqueueRequest};
use serde_json::{json, Value};
use uuid::Uuid;

/// Builder for `EnqueueRequest`s with test-friendly defaults.
#[derive(Debug, Clone)]
pub struct JobBuilder {
    event_id: String,
    target_url: String,
    payload: Bytes,
    payload_is_json: bool,
    headers: BTreeMap<String, String>,
    secret: Option<String>,
    max_attempts: Option<u32>,
    backoff: BackoffOverrides,
}

impl JobBuilder {
    /// JSON job for `target_url` with a random event ID.
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            event_id: format!("evt_{}", Uuid::new_v4().simple()),
            target_url: target_url.into(),
            payload: Bytes::from(json!({"event": "test.webhook"}).to_string()),
            payload_is_json: true,
            headers: BTreeMap::new(),
            secret: None,
            max_attempts: None,
            backoff: BackoffOverrides::default(),
        }
    }

    /// Sets the event ID.
    #[must_use]
    pub fn event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    /// Sets a JSON payload.
    #[must_use]
    pub fn json_payload(mut self, payload: &Value) -> Self {
        self.payload = Bytes::from(payload.to_string());
        self.payload_is_json = true;
        self
    }

    /// Sets a plain-text payload.
    #[must_use]
    pub fn text_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self.payload_is_json = false;
        self
    }

    /// Adds a caller header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the signing secret.
    #[must_use]
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Overrides the attempt budget.
    #[must_use]
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Overrides the backoff parameters.
    #[must_use]
    pub fn backoff(mut self, base: f64, factor: f64, jitter: f64, max: f64) -> Self {
        self.backoff = BackoffOverrides {
            base: Some(base),
            factor: Some(factor),
            jitter: Some(jitter),
            max: Some(max),
        };
        self
    }

    /// Retries become due immediately.
    #[must_use]
    pub fn no_backoff(self) -> Self {
        self.backoff(0.0, 2.0, 0.0, 0.0)
    }

    /// Event ID this builder will use.
    pub fn current_event_id(&self) -> &str {
        &self.event_id
    }

    /// Builds the request.
    pub fn build(self) -> EnqueueRequest {
        EnqueueRequest {
            event_id: self.event_id,
            target_url: self.target_url,
            payload: self.payload,
            payload_is_json: self.payload_is_json,
            headers: self.headers,
            secret: self.secret,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
        }
    }
}
