//! Repository behaviour against a live Redis.
//!
//! Set `REDIS_URL` (for example `redis://127.0.0.1:6379`) to run these;
//! without it every test returns early. Each test works on its own ready-set
//! key and event IDs.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::Utc;
use deadpool_redis::{redis, Pool, Runtime};
use hookrelay_core::{
    storage::{keys, Storage, StoreConfig},
    DeliveryAttemptRecord, DeliveryState, EnqueueRequest, EventId, EventStatus, JobId,
};

fn redis_pool() -> Option<Pool> {
    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set, skipping");
        return None;
    };
    Some(deadpool_redis::Config::from_url(url).create_pool(Some(Runtime::Tokio1)).unwrap())
}

fn storage_with(pool: Pool, config: StoreConfig) -> Storage {
    let queue_key = format!("test:queue:{}", uuid::Uuid::new_v4());
    Storage::new(pool, StoreConfig { queue_key, ..config })
}

fn request() -> EnqueueRequest {
    EnqueueRequest {
        event_id: format!("evt_{}", uuid::Uuid::new_v4().simple()),
        target_url: "http://localhost/hook".into(),
        payload: Bytes::from_static(b"{}"),
        payload_is_json: true,
        headers: Default::default(),
        secret: None,
        max_attempts: None,
        backoff: Default::default(),
    }
}

async fn ttl(pool: &Pool, key: &str) -> i64 {
    let mut conn = pool.get().await.unwrap();
    redis::cmd("TTL").arg(key).query_async(&mut conn).await.unwrap()
}

#[tokio::test]
async fn enqueue_writes_pending_status_and_ready_entry() {
    let Some(pool) = redis_pool() else { return };
    let storage = storage_with(pool, StoreConfig::default());
    let request = request();
    let event_id = EventId::from(request.event_id.clone());

    let job_id = storage.enqueue(request, 1_000.0).await.unwrap();

    assert_eq!(storage.jobs.ready_len().await.unwrap(), 1);
    assert_eq!(storage.jobs.due_at(&job_id).await.unwrap(), Some(1_000.0));
    assert_eq!(storage.jobs.find(&job_id).await.unwrap().unwrap().attempt, 0);
    let report = storage.status_report(&event_id).await.unwrap().unwrap();
    assert_eq!(report.status.state, DeliveryState::Pending);
    assert!(report.history.is_empty());
}

#[tokio::test]
async fn invalid_request_writes_nothing() {
    let Some(pool) = redis_pool() else { return };
    let storage = storage_with(pool, StoreConfig::default());
    let request = EnqueueRequest { target_url: " ".into(), ..request() };
    let event_id = EventId::from(request.event_id.clone());

    assert!(storage.enqueue(request, 0.0).await.is_err());
    assert_eq!(storage.jobs.ready_len().await.unwrap(), 0);
    assert!(storage.status_report(&event_id).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_one_winner() {
    let Some(pool) = redis_pool() else { return };
    let storage = Arc::new(storage_with(pool, StoreConfig::default()));
    let job_id = storage.enqueue(request(), 0.0).await.unwrap();

    let claims = (0..16).map(|_| {
        let storage = storage.clone();
        tokio::spawn(async move { storage.jobs.claim_due(10.0).await.unwrap() })
    });
    let winners: Vec<JobId> =
        futures::future::join_all(claims).await.into_iter().filter_map(|r| r.unwrap()).collect();

    assert_eq!(winners, vec![job_id]);
    assert_eq!(storage.jobs.ready_len().await.unwrap(), 0);
}

#[tokio::test]
async fn claims_follow_due_order_and_skip_future_jobs() {
    let Some(pool) = redis_pool() else { return };
    let storage = storage_with(pool, StoreConfig::default());
    let later = storage.enqueue(request(), 200.5).await.unwrap();
    let earlier = storage.enqueue(request(), 100.25).await.unwrap();

    assert_eq!(storage.jobs.claim_due(50.0).await.unwrap(), None);
    assert_eq!(storage.jobs.claim_due(150.0).await.unwrap(), Some(earlier));
    assert_eq!(storage.jobs.claim_due(150.0).await.unwrap(), None);
    assert_eq!(storage.jobs.claim_due(200.5).await.unwrap(), Some(later));
    assert_eq!(storage.jobs.ready_len().await.unwrap(), 0);
}

#[tokio::test]
async fn reinsert_updates_attempt_and_due_time() {
    let Some(pool) = redis_pool() else { return };
    let storage = storage_with(pool, StoreConfig::default());
    let job_id = storage.enqueue(request(), 0.0).await.unwrap();
    storage.jobs.claim_due(0.0).await.unwrap();

    storage.jobs.reinsert(&job_id, 42.5, Some(2)).await.unwrap();
    assert_eq!(storage.jobs.due_at(&job_id).await.unwrap(), Some(42.5));
    assert_eq!(storage.jobs.find(&job_id).await.unwrap().unwrap().attempt, 2);

    storage.jobs.claim_due(50.0).await.unwrap();
    storage.jobs.reinsert(&job_id, 60.0, None).await.unwrap();
    assert_eq!(storage.jobs.find(&job_id).await.unwrap().unwrap().attempt, 2);
}

#[tokio::test]
async fn finalize_sets_retention_and_leaves_ready_set() {
    let Some(pool) = redis_pool() else { return };
    let config = StoreConfig { job_retention: Duration::from_secs(120), ..StoreConfig::default() };
    let storage = storage_with(pool.clone(), config);
    let job_id = storage.enqueue(request(), 0.0).await.unwrap();
    assert_eq!(ttl(&pool, &keys::job(&job_id)).await, -1);

    storage.jobs.finalize(&job_id).await.unwrap();

    let remaining = ttl(&pool, &keys::job(&job_id)).await;
    assert!((1..=120).contains(&remaining), "ttl {remaining}");
    assert_eq!(storage.jobs.due_at(&job_id).await.unwrap(), None);
    assert!(storage.jobs.find(&job_id).await.unwrap().is_some());
}

#[tokio::test]
async fn event_id_is_readable_from_a_damaged_job() {
    let Some(pool) = redis_pool() else { return };
    let storage = storage_with(pool.clone(), StoreConfig::default());
    let request = request();
    let event_id = EventId::from(request.event_id.clone());
    let job_id = storage.enqueue(request, 0.0).await.unwrap();

    let mut conn = pool.get().await.unwrap();
    let _: () = redis::cmd("HSET")
        .arg(keys::job(&job_id))
        .arg("headers")
        .arg("{not json")
        .query_async(&mut conn)
        .await
        .unwrap();

    let err = storage.jobs.find(&job_id).await.unwrap_err();
    assert!(!err.is_store_unavailable());
    assert_eq!(storage.jobs.find_event_id(&job_id).await.unwrap(), Some(event_id));
    assert_eq!(storage.jobs.find_event_id(&JobId::generate()).await.unwrap(), None);
}

#[tokio::test]
async fn history_is_bounded_newest_first() {
    let Some(pool) = redis_pool() else { return };
    let config = StoreConfig { history_max_len: 3, ..StoreConfig::default() };
    let storage = storage_with(pool, config);
    let event_id = EventId::from(format!("evt_{}", uuid::Uuid::new_v4().simple()));

    for attempt in 1..=5 {
        let record = DeliveryAttemptRecord {
            ts: Utc::now(),
            attempt,
            url: "http://localhost/hook".into(),
            status_code: Some(500),
            error: Some("server error: HTTP 500".into()),
            duration_ms: 3,
        };
        storage.status.push_history(&event_id, &record).await.unwrap();
    }

    let attempts: Vec<u32> =
        storage.status.history(&event_id).await.unwrap().iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![5, 4, 3]);
}

#[tokio::test]
async fn status_writes_refresh_ttl() {
    let Some(pool) = redis_pool() else { return };
    let config =
        StoreConfig { status_retention: Duration::from_secs(300), ..StoreConfig::default() };
    let storage = storage_with(pool.clone(), config);
    let event_id = EventId::from(format!("evt_{}", uuid::Uuid::new_v4().simple()));
    let key = keys::status(&event_id);

    storage.status.update(&event_id, &EventStatus::pending()).await.unwrap();
    let mut conn = pool.get().await.unwrap();
    let _: () = redis::cmd("EXPIRE").arg(&key).arg(5).query_async(&mut conn).await.unwrap();
    assert!(ttl(&pool, &key).await <= 5);

    let retrying = EventStatus {
        state: DeliveryState::Retrying,
        attempt_count: 1,
        last_attempt_at: Some(Utc::now()),
        last_response_code: Some(503),
        last_error: Some("server error: HTTP 503".into()),
    };
    storage.status.update(&event_id, &retrying).await.unwrap();

    assert!(ttl(&pool, &key).await > 5);
    assert_eq!(storage.status.find(&event_id).await.unwrap(), Some(retrying));
}
