//! HTTP client for webhook delivery.
//!
//! One `deliver` call is one POST. The client never returns `Err`: transport
//! failures, timeouts and non-2xx answers all come back as a
//! [`DeliveryOutcome`] carrying the error, so the worker can record every
//! attempt the same way.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bytes::Bytes;
use hookrelay_core::{Clock, EventId, Job, JobId};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    error::{DeliveryError, Result},
    signing::{sign_payload, SIGNATURE_HEADER},
};

/// Content type used when the payload is JSON.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Content type used for any other payload.
pub const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Total timeout for one request, connect through body.
    pub timeout: Duration,
    /// `User-Agent` sent when the caller does not supply one.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: "hookrelay/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// Everything needed for one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Job being delivered.
    pub job_id: JobId,
    /// Event the job belongs to.
    pub event_id: EventId,
    /// Destination URL.
    pub url: String,
    /// Caller-supplied headers.
    pub headers: BTreeMap<String, String>,
    /// Raw payload bytes, sent as-is.
    pub body: Bytes,
    /// Selects the default `Content-Type`.
    pub payload_is_json: bool,
    /// Signing secret, if the payload should be signed.
    pub secret: Option<String>,
    /// 1-based number of this attempt.
    pub attempt_number: u32,
}

impl DeliveryRequest {
    /// Builds the request for the next attempt of `job`.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            event_id: job.event_id.clone(),
            url: job.target_url.clone(),
            headers: job.headers.clone(),
            body: job.payload.clone(),
            payload_is_json: job.payload_is_json,
            secret: job.secret.clone(),
            attempt_number: job.attempt.saturating_add(1),
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// HTTP status, absent when no response arrived.
    pub status_code: Option<u16>,
    /// Why the attempt failed, absent on 2xx.
    pub error: Option<DeliveryError>,
    /// Wall time spent on the attempt.
    pub duration: Duration,
}

impl DeliveryOutcome {
    /// Whether the endpoint answered 2xx.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_code.is_some_and(|code| (200..300).contains(&code))
    }

    /// Error message for records and events.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    /// Duration in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }

    fn failed(error: DeliveryError, duration: Duration) -> Self {
        Self { status_code: error.status_code(), error: Some(error), duration }
    }
}

/// HTTP client for webhook delivery.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
    clock: Arc<dyn Clock>,
}

impl DeliveryClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config, clock })
    }

    /// Client configuration in effect.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sends one POST and reports what happened.
    pub async fn deliver(&self, request: DeliveryRequest) -> DeliveryOutcome {
        let span = info_span!(
            "webhook_delivery",
            job_id = %request.job_id,
            event_id = %request.event_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let start = self.clock.now();

            let headers = match build_headers(&request, &self.config.user_agent) {
                Ok(headers) => headers,
                Err(e) => {
                    warn!(error = %e, "request could not be built");
                    return DeliveryOutcome::failed(e, self.clock.now() - start);
                },
            };

            debug!("sending webhook");
            let sent = self
                .client
                .post(&request.url)
                .headers(headers)
                .body(request.body.clone())
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    let error = self.classify_transport_error(&e);
                    let duration = self.clock.now() - start;
                    warn!(
                        duration_ms = duration.as_millis(),
                        category = %error.category(),
                        error = %e,
                        "request failed"
                    );
                    return DeliveryOutcome::failed(error, duration);
                },
            };

            let status_code = response.status().as_u16();
            if let Err(e) = response.bytes().await {
                debug!(error = %e, "failed to drain response body");
            }
            let duration = self.clock.now() - start;

            if (200..300).contains(&status_code) {
                debug!(status_code, duration_ms = duration.as_millis(), "webhook delivered");
                DeliveryOutcome { status_code: Some(status_code), error: None, duration }
            } else {
                warn!(status_code, duration_ms = duration.as_millis(), "non-success response");
                DeliveryOutcome::failed(DeliveryError::from_status(status_code), duration)
            }
        }
        .instrument(span)
        .await
    }

    fn classify_transport_error(&self, error: &reqwest::Error) -> DeliveryError {
        if error.is_timeout() {
            DeliveryError::timeout(self.config.timeout)
        } else if error.is_builder() {
            DeliveryError::invalid_request(error.to_string())
        } else if error.is_connect() {
            DeliveryError::network(format!("connection failed: {error}"))
        } else {
            DeliveryError::network(error.to_string())
        }
    }
}

/// Assembles outgoing headers.
///
/// Caller headers go first. `Content-Type` and `User-Agent` are only filled
/// in when absent; `HeaderMap` lookups are case-insensitive. The signature,
/// when a secret is set, always replaces any caller value.
fn build_headers(request: &DeliveryRequest, user_agent: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(request.headers.len() + 3);

    for (name, value) in &request.headers {
        if is_managed_header(name) {
            continue;
        }
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| DeliveryError::invalid_request(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| DeliveryError::invalid_request(format!("header {name}: {e}")))?;
        headers.insert(name, value);
    }

    if !headers.contains_key(CONTENT_TYPE) {
        let content_type =
            if request.payload_is_json { JSON_CONTENT_TYPE } else { TEXT_CONTENT_TYPE };
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    if !headers.contains_key(USER_AGENT) {
        let value = HeaderValue::from_str(user_agent)
            .map_err(|e| DeliveryError::configuration(format!("user agent: {e}")))?;
        headers.insert(USER_AGENT, value);
    }

    if let Some(secret) = &request.secret {
        let signature = sign_payload(secret.as_bytes(), &request.body)?;
        let value = HeaderValue::from_str(&signature)
            .map_err(|e| DeliveryError::internal(format!("signature header: {e}")))?;
        headers.insert(HeaderName::from_static("x-signature-sha256"), value);
    }

    Ok(headers)
}

/// Headers the transport owns; caller values are dropped.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_ascii_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    ) || lowercase.eq_ignore_ascii_case(SIGNATURE_HEADER)
}

#[cfg(test)]
mod tests {
    use hookrelay_core::RealClock;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client_with_timeout(timeout: Duration) -> DeliveryClient {
        let config = ClientConfig { timeout, ..ClientConfig::default() };
        DeliveryClient::new(config, Arc::new(RealClock::new())).unwrap()
    }

    fn request(url: String) -> DeliveryRequest {
        DeliveryRequest {
            job_id: JobId::from("job_1"),
            event_id: EventId::from("evt_1"),
            url,
            headers: BTreeMap::from([("X-Original-Header".to_string(), "test-value".to_string())]),
            body: Bytes::from_static(b"{\"ok\":true}"),
            payload_is_json: true,
            secret: None,
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/webhook"))
            .and(matchers::header("X-Original-Header", "test-value"))
            .and(matchers::header("content-type", JSON_CONTENT_TYPE))
            .and(matchers::header("user-agent", "hookrelay/1.0"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = client_with_timeout(Duration::from_secs(5));
        let outcome = client.deliver(request(format!("{}/webhook", mock_server.uri()))).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.status_code, Some(204));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn server_error_keeps_status_code() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&mock_server)
            .await;

        let client = client_with_timeout(Duration::from_secs(5));
        let outcome = client.deliver(request(mock_server.uri())).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.status_code, Some(500));
        assert_eq!(outcome.error_message().as_deref(), Some("server error: HTTP 500"));
    }

    #[tokio::test]
    async fn timeout_has_no_status_code() {
        let mock_server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&mock_server)
            .await;

        let client = client_with_timeout(Duration::from_millis(100));
        let outcome = client.deliver(request(mock_server.uri())).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.status_code, None);
        assert!(matches!(outcome.error, Some(DeliveryError::Timeout { timeout_ms: 100 })));
    }

    #[tokio::test]
    async fn invalid_url_is_an_attempt_failure() {
        let client = client_with_timeout(Duration::from_secs(1));
        let outcome = client.deliver(request("not a url".to_string())).await;

        assert_eq!(outcome.status_code, None);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn caller_content_type_wins_regardless_of_case() {
        let mut req = request("http://localhost".into());
        req.headers.insert("content-TYPE".into(), "application/xml".into());
        let headers = build_headers(&req, "hookrelay/1.0").unwrap();

        assert_eq!(headers.get_all(CONTENT_TYPE).iter().count(), 1);
        assert_eq!(headers[CONTENT_TYPE], "application/xml");
    }

    #[test]
    fn text_payload_gets_text_content_type() {
        let mut req = request("http://localhost".into());
        req.payload_is_json = false;
        let headers = build_headers(&req, "hookrelay/1.0").unwrap();
        assert_eq!(headers[CONTENT_TYPE], TEXT_CONTENT_TYPE);
    }

    #[test]
    fn signature_overrides_caller_value() {
        let mut req = request("http://localhost".into());
        req.secret = Some("abc".into());
        req.headers.insert("x-signature-sha256".into(), "forged".into());
        let headers = build_headers(&req, "hookrelay/1.0").unwrap();

        let expected = sign_payload(b"abc", &req.body).unwrap();
        assert_eq!(headers[SIGNATURE_HEADER], expected.as_str());
    }

    #[test]
    fn no_signature_without_secret() {
        let headers = build_headers(&request("http://localhost".into()), "ua").unwrap();
        assert!(!headers.contains_key(SIGNATURE_HEADER));
    }

    #[test]
    fn managed_headers_identified() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("HOST"));
        assert!(is_managed_header("Transfer-Encoding"));
        assert!(!is_managed_header("User-Agent"));
        assert!(!is_managed_header("Authorization"));
    }
}
