//! Job, status and history models plus their Redis field encodings.
//!
//! A `Job` is persisted as a flat hash of byte-string fields. Optional
//! overrides are omitted rather than written as empty strings, so a job only
//! carries the knobs its producer actually set and the worker falls back to
//! configured defaults for the rest.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    str::FromStr,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Opaque job identifier, the key into the job hash and the ready set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    /// Generates a fresh random job ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Producer-supplied identifier of the logical event a job delivers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Per-job overrides of the global backoff parameters, all in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BackoffOverrides {
    /// Delay before the first retry.
    pub base: Option<f64>,
    /// Multiplier applied per additional retry.
    pub factor: Option<f64>,
    /// Upper bound of the uniform jitter added after capping.
    pub jitter: Option<f64>,
    /// Ceiling applied before jitter.
    pub max: Option<f64>,
}

/// A delivery attempt chain as persisted in the job store.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Primary key.
    pub id: JobId,
    /// Logical event being delivered.
    pub event_id: EventId,
    /// Destination endpoint.
    pub target_url: String,
    /// Exact bytes to POST. Signatures are computed over these bytes.
    pub payload: Bytes,
    /// Whether the payload is JSON, used to default `Content-Type`.
    pub payload_is_json: bool,
    /// Extra request headers supplied by the producer.
    pub headers: BTreeMap<String, String>,
    /// Optional HMAC signing key.
    pub secret: Option<String>,
    /// Attempts already made, zero-based.
    pub attempt: u32,
    /// Attempt budget override.
    pub max_attempts: Option<u32>,
    /// Backoff parameter overrides.
    pub backoff: BackoffOverrides,
}

mod field {
    pub const EVENT_ID: &str = "event_id";
    pub const TARGET_URL: &str = "target_url";
    pub const PAYLOAD: &str = "payload";
    pub const PAYLOAD_IS_JSON: &str = "payload_is_json";
    pub const HEADERS: &str = "headers";
    pub const SECRET: &str = "secret";
    pub const ATTEMPT: &str = "attempt";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
    pub const BACKOFF_BASE: &str = "backoff_base";
    pub const BACKOFF_FACTOR: &str = "backoff_factor";
    pub const BACKOFF_JITTER: &str = "backoff_jitter";
    pub const BACKOFF_MAX: &str = "backoff_max";

    pub const STATE: &str = "state";
    pub const ATTEMPT_COUNT: &str = "attempt_count";
    pub const LAST_ATTEMPT_AT: &str = "last_attempt_at";
    pub const LAST_RESPONSE_CODE: &str = "last_response_code";
    pub const LAST_ERROR: &str = "last_error";
}

/// Name of the hash field holding a job's attempt counter.
pub const ATTEMPT_FIELD: &str = field::ATTEMPT;

/// Name of the hash field holding the event ID a job belongs to.
pub const EVENT_ID_FIELD: &str = field::EVENT_ID;

fn text(fields: &HashMap<String, Vec<u8>>, name: &str) -> Result<Option<String>> {
    fields
        .get(name)
        .map(|raw| {
            String::from_utf8(raw.clone())
                .map_err(|_| CoreError::InvalidInput(format!("field `{name}` is not valid UTF-8")))
        })
        .transpose()
}

fn parsed<T: FromStr>(fields: &HashMap<String, Vec<u8>>, name: &str) -> Result<Option<T>> {
    match text(fields, name)? {
        Some(value) if !value.is_empty() => value.parse().map(Some).map_err(|_| {
            CoreError::InvalidInput(format!("field `{name}` has invalid value {value:?}"))
        }),
        _ => Ok(None),
    }
}

impl Job {
    /// Encodes the job as hash fields.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Serialization` if the headers cannot be encoded.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, Vec<u8>)>> {
        let mut fields = vec![
            (field::EVENT_ID, self.event_id.0.clone().into_bytes()),
            (field::TARGET_URL, self.target_url.clone().into_bytes()),
            (field::PAYLOAD, self.payload.to_vec()),
            (field::PAYLOAD_IS_JSON, vec![if self.payload_is_json { b'1' } else { b'0' }]),
            (field::HEADERS, serde_json::to_vec(&self.headers)?),
            (field::ATTEMPT, self.attempt.to_string().into_bytes()),
        ];

        if let Some(secret) = &self.secret {
            fields.push((field::SECRET, secret.clone().into_bytes()));
        }
        if let Some(max_attempts) = self.max_attempts {
            fields.push((field::MAX_ATTEMPTS, max_attempts.to_string().into_bytes()));
        }

        let overrides = [
            (field::BACKOFF_BASE, self.backoff.base),
            (field::BACKOFF_FACTOR, self.backoff.factor),
            (field::BACKOFF_JITTER, self.backoff.jitter),
            (field::BACKOFF_MAX, self.backoff.max),
        ];
        for (name, value) in overrides {
            if let Some(value) = value {
                fields.push((name, value.to_string().into_bytes()));
            }
        }

        Ok(fields)
    }

    /// Decodes a job from its hash fields.
    ///
    /// Returns `Ok(None)` for an empty hash, which is what the store reports
    /// for a key that never existed or has expired.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when a required field is missing or
    /// a numeric field does not parse.
    pub fn from_fields(id: JobId, fields: &HashMap<String, Vec<u8>>) -> Result<Option<Self>> {
        if fields.is_empty() {
            return Ok(None);
        }

        let event_id = text(fields, field::EVENT_ID)?
            .ok_or_else(|| CoreError::InvalidInput(format!("job {id} has no event_id")))?;
        let target_url = text(fields, field::TARGET_URL)?
            .ok_or_else(|| CoreError::InvalidInput(format!("job {id} has no target_url")))?;

        // Malformed header JSON degrades to no extra headers.
        let headers = fields
            .get(field::HEADERS)
            .and_then(|raw| serde_json::from_slice::<BTreeMap<String, String>>(raw).ok())
            .unwrap_or_default();

        Ok(Some(Self {
            event_id: EventId(event_id),
            target_url,
            payload: fields
                .get(field::PAYLOAD)
                .map(|raw| Bytes::from(raw.clone()))
                .unwrap_or_default(),
            payload_is_json: fields
                .get(field::PAYLOAD_IS_JSON)
                .is_some_and(|raw| raw.as_slice() == b"1"),
            headers,
            secret: text(fields, field::SECRET)?.filter(|s| !s.is_empty()),
            attempt: parsed(fields, field::ATTEMPT)?.unwrap_or(0),
            max_attempts: parsed(fields, field::MAX_ATTEMPTS)?,
            backoff: BackoffOverrides {
                base: parsed(fields, field::BACKOFF_BASE)?,
                factor: parsed(fields, field::BACKOFF_FACTOR)?,
                jitter: parsed(fields, field::BACKOFF_JITTER)?,
                max: parsed(fields, field::BACKOFF_MAX)?,
            },
            id,
        }))
    }
}

/// Producer-facing enqueue request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    /// Logical event being delivered.
    pub event_id: String,
    /// Destination endpoint.
    pub target_url: String,
    /// Exact bytes to deliver.
    #[serde(with = "payload_bytes")]
    pub payload: Bytes,
    /// Whether the payload is JSON.
    #[serde(default)]
    pub payload_is_json: bool,
    /// Extra request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Optional signing key.
    #[serde(default)]
    pub secret: Option<String>,
    /// Attempt budget override.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Backoff overrides.
    #[serde(default)]
    pub backoff: BackoffOverrides,
}

mod payload_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(payload)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(Bytes::from)
    }
}

impl EnqueueRequest {
    /// Validates the request and turns it into a fresh job with zero
    /// attempts.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for an empty event ID or target URL,
    /// a zero attempt budget, or negative backoff overrides.
    pub fn into_job(self, id: JobId) -> Result<Job> {
        if self.event_id.trim().is_empty() {
            return Err(CoreError::InvalidInput("event_id must not be empty".into()));
        }
        if self.target_url.trim().is_empty() {
            return Err(CoreError::InvalidInput("target_url must not be empty".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(CoreError::InvalidInput("max_attempts must be at least 1".into()));
        }
        let overrides =
            [self.backoff.base, self.backoff.factor, self.backoff.jitter, self.backoff.max];
        if overrides.into_iter().flatten().any(|v| !v.is_finite() || v < 0.0) {
            return Err(CoreError::InvalidInput(
                "backoff overrides must be finite and non-negative".into(),
            ));
        }

        Ok(Job {
            id,
            event_id: EventId(self.event_id),
            target_url: self.target_url,
            payload: self.payload,
            payload_is_json: self.payload_is_json,
            headers: self.headers,
            secret: self.secret.filter(|s| !s.is_empty()),
            attempt: 0,
            max_attempts: self.max_attempts,
            backoff: self.backoff,
        })
    }
}

/// Delivery state of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Enqueued, no attempt made yet.
    Pending,
    /// At least one attempt failed and a retry is scheduled.
    Retrying,
    /// Terminal success.
    Delivered,
    /// Terminal failure after exhausting the attempt budget.
    Failed,
}

impl DeliveryState {
    /// Stored string form.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::InvalidInput(format!("unknown delivery state {other:?}"))),
        }
    }
}

/// Current delivery state of one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatus {
    /// Lifecycle state.
    pub state: DeliveryState,
    /// Attempts made so far.
    pub attempt_count: u32,
    /// When the latest attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// HTTP status of the latest attempt, absent on transport failure.
    pub last_response_code: Option<u16>,
    /// Error of the latest attempt.
    pub last_error: Option<String>,
}

impl EventStatus {
    /// Status written at enqueue time.
    pub const fn pending() -> Self {
        Self {
            state: DeliveryState::Pending,
            attempt_count: 0,
            last_attempt_at: None,
            last_response_code: None,
            last_error: None,
        }
    }

    /// Encodes the status as hash fields. Absent values become empty strings
    /// so that a merge overwrites what an earlier attempt left behind.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            (field::STATE, self.state.as_str().to_string()),
            (field::ATTEMPT_COUNT, self.attempt_count.to_string()),
            (
                field::LAST_ATTEMPT_AT,
                self.last_attempt_at.map(|ts| ts.to_rfc3339()).unwrap_or_default(),
            ),
            (
                field::LAST_RESPONSE_CODE,
                self.last_response_code.map(|code| code.to_string()).unwrap_or_default(),
            ),
            (field::LAST_ERROR, self.last_error.clone().unwrap_or_default()),
        ]
    }

    /// Decodes a status hash. Returns `Ok(None)` for an empty hash.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if the state or a numeric field is
    /// malformed.
    pub fn from_fields(fields: &HashMap<String, Vec<u8>>) -> Result<Option<Self>> {
        if fields.is_empty() {
            return Ok(None);
        }

        let state = text(fields, field::STATE)?
            .ok_or_else(|| CoreError::InvalidInput("status has no state".into()))?
            .parse()?;
        let last_attempt_at = match text(fields, field::LAST_ATTEMPT_AT)? {
            Some(ts) if !ts.is_empty() => Some(
                DateTime::parse_from_rfc3339(&ts)
                    .map_err(|e| CoreError::InvalidInput(format!("last_attempt_at: {e}")))?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };

        Ok(Some(Self {
            state,
            attempt_count: parsed(fields, field::ATTEMPT_COUNT)?.unwrap_or(0),
            last_attempt_at,
            last_response_code: parsed(fields, field::LAST_RESPONSE_CODE)?,
            last_error: text(fields, field::LAST_ERROR)?.filter(|e| !e.is_empty()),
        }))
    }
}

/// One entry in an event's attempt history. Never modified once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttemptRecord {
    /// When the attempt started.
    pub ts: DateTime<Utc>,
    /// One-based attempt number.
    pub attempt: u32,
    /// URL the attempt was sent to.
    pub url: String,
    /// Response status, absent when no response arrived.
    pub status_code: Option<u16>,
    /// Failure description, absent on success.
    pub error: Option<String>,
    /// Wall time of the attempt.
    pub duration_ms: u64,
}

/// Answer to a status query: current status plus history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Current status.
    pub status: EventStatus,
    /// Bounded attempt history, newest first.
    pub history: Vec<DeliveryAttemptRecord>,
}
