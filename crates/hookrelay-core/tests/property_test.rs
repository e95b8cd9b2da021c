//! Hash encoding of jobs and statuses survives a store round trip.

#![allow(clippy::unwrap_used)]

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use hookrelay_core::{BackoffOverrides, DeliveryState, EventId, EventStatus, Job, JobId};
use proptest::prelude::*;

fn as_hash<K: ToString>(fields: Vec<(K, Vec<u8>)>) -> HashMap<String, Vec<u8>> {
    fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn backoff_override() -> impl Strategy<Value = Option<f64>> {
    prop::option::of(0.0f64..1_000.0)
}

prop_compose! {
    fn arb_job()(
        event_id in "[a-z0-9_]{1,24}",
        path in "[a-z/]{0,20}",
        payload in prop::collection::vec(any::<u8>(), 0..512),
        payload_is_json in any::<bool>(),
        headers in prop::collection::btree_map("[A-Za-z-]{1,12}", "[ -~]{0,20}", 0..4),
        secret in prop::option::of("[ -~]{1,32}"),
        attempt in 0u32..50,
        max_attempts in prop::option::of(1u32..50),
        base in backoff_override(),
        factor in backoff_override(),
        jitter in backoff_override(),
        max in backoff_override(),
    ) -> Job {
        Job {
            id: JobId::generate(),
            event_id: EventId::from(event_id),
            target_url: format!("https://example.com/{path}"),
            payload: Bytes::from(payload),
            payload_is_json,
            headers: headers.into_iter().collect::<BTreeMap<_, _>>(),
            secret,
            attempt,
            max_attempts,
            backoff: BackoffOverrides { base, factor, jitter, max },
        }
    }
}

fn arb_state() -> impl Strategy<Value = DeliveryState> {
    prop_oneof![
        Just(DeliveryState::Pending),
        Just(DeliveryState::Retrying),
        Just(DeliveryState::Delivered),
        Just(DeliveryState::Failed),
    ]
}

proptest! {
    #[test]
    fn job_fields_decode_to_the_same_job(job in arb_job()) {
        let fields = as_hash(job.to_fields().unwrap());
        let decoded = Job::from_fields(job.id.clone(), &fields).unwrap().unwrap();
        prop_assert_eq!(decoded, job);
    }

    #[test]
    fn status_fields_decode_to_the_same_status(
        state in arb_state(),
        attempt_count in 0u32..100,
        ts in prop::option::of(0i64..4_000_000_000),
        code in prop::option::of(100u16..600),
        error in prop::option::of("[ -~]{1,40}"),
    ) {
        let status = EventStatus {
            state,
            attempt_count,
            last_attempt_at: ts.map(|secs| Utc.timestamp_opt(secs, 0).unwrap()),
            last_response_code: code,
            last_error: error,
        };
        let fields = as_hash(
            status.to_fields().into_iter().map(|(k, v)| (k, v.into_bytes())).collect(),
        );
        prop_assert_eq!(EventStatus::from_fields(&fields).unwrap(), Some(status));
    }
}

#[test]
fn empty_hash_means_no_record() {
    assert_eq!(Job::from_fields(JobId::from("job_gone"), &HashMap::new()).unwrap(), None);
    assert_eq!(EventStatus::from_fields(&HashMap::new()).unwrap(), None);
}

#[test]
fn unknown_state_is_rejected() {
    let mut fields = HashMap::new();
    fields.insert("state".to_string(), b"exploded".to_vec());
    assert!(EventStatus::from_fields(&fields).is_err());
}
