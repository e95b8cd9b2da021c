//! HTTP mocking utilities for webhook testing.

use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer as WiremockServer, Request, ResponseTemplate,
};

/// Wiremock server standing in for webhook targets and the notify endpoint.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a new mock server on a random port.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Full URL for `path`.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    /// Mounts a single endpoint.
    pub async fn mock_endpoint(&self, endpoint: MockEndpoint) {
        let mut mock = Mock::given(method("POST")).and(path(endpoint.path.clone()));
        for (key, value) in &endpoint.expected_headers {
            mock = mock.and(header(key.as_str(), value.as_str()));
        }
        mock.respond_with(endpoint.response.template()).mount(&self.server).await;
    }

    /// Answers successive POSTs to `path` with `responses` in order. The last
    /// response repeats once the sequence is used up.
    pub async fn mock_sequence(&self, path_str: &str, responses: Vec<MockResponse>) {
        let last = responses.len().saturating_sub(1);
        for (index, response) in responses.into_iter().enumerate() {
            let priority = u8::try_from(index + 1).unwrap_or(u8::MAX);
            let mock = Mock::given(method("POST"))
                .and(path(path_str))
                .respond_with(response.template())
                .with_priority(priority);
            let mock = if index == last { mock } else { mock.up_to_n_times(1) };
            mock.mount(&self.server).await;
        }
    }

    /// Every POST to any path gets `status`.
    pub async fn mock_endpoint_always_fail(&self, status: u16) {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// Requests received so far, in arrival order.
    pub async fn received_requests(&self) -> Vec<Request> {
        self.server.received_requests().await.unwrap_or_default()
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.received_requests().await.len()
    }

    /// Panics unless exactly `expected` requests were received.
    pub async fn assert_request_count(&self, expected: usize) {
        let actual = self.request_count().await;
        assert_eq!(actual, expected, "expected {expected} requests, received {actual}");
    }

    /// Polls until at least `expected` requests arrived or `timeout`
    /// elapses, and returns the final count.
    pub async fn wait_for_requests(&self, expected: usize, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let count = self.request_count().await;
            if count >= expected || tokio::time::Instant::now() >= deadline {
                return count;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Configuration for a mock endpoint.
pub struct MockEndpoint {
    /// Path to match.
    pub path: String,
    /// Headers the request must carry.
    pub expected_headers: Vec<(String, String)>,
    /// What to answer with.
    pub response: MockResponse,
}

impl MockEndpoint {
    /// Endpoint answering 200.
    pub fn success(path: impl Into<String>) -> Self {
        Self { path: path.into(), expected_headers: Vec::new(), response: MockResponse::ok() }
    }

    /// Endpoint answering `status`.
    pub fn failure(path: impl Into<String>, status: StatusCode) -> Self {
        Self {
            path: path.into(),
            expected_headers: Vec::new(),
            response: MockResponse::Failure { status },
        }
    }

    /// Requires a header on matching requests.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.expected_headers.push((key.into(), value.into()));
        self
    }
}

/// Types of mock responses.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// 2xx with a body.
    Success {
        /// Status code.
        status: StatusCode,
        /// Response body.
        body: Bytes,
    },
    /// Non-2xx without a body.
    Failure {
        /// Status code.
        status: StatusCode,
    },
    /// 200 sent only after `delay`, to trip client timeouts.
    Slow {
        /// How long to hold the response.
        delay: Duration,
    },
}

impl MockResponse {
    /// Plain 200.
    pub fn ok() -> Self {
        Self::Success { status: StatusCode::OK, body: Bytes::new() }
    }

    /// Response with an arbitrary status code.
    pub fn status(code: u16) -> Self {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_success() {
            Self::Success { status, body: Bytes::new() }
        } else {
            Self::Failure { status }
        }
    }

    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Success { status, body } => {
                ResponseTemplate::new(status.as_u16()).set_body_bytes(body.to_vec())
            },
            Self::Failure { status } => ResponseTemplate::new(status.as_u16()),
            Self::Slow { delay } => ResponseTemplate::new(200).set_delay(*delay),
        }
    }
}
