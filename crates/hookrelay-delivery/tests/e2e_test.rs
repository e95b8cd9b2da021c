//! Full delivery flow: enqueue, fail twice, deliver, inspect what arrived.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::time::Duration;

use anyhow::Result;
use hookrelay_core::DeliveryState;
use hookrelay_delivery::{verify_signature, ProcessOutcome, SIGNATURE_HEADER};
use hookrelay_testing::{JobBuilder, MockResponse, TestEnv};

#[tokio::test]
async fn recovers_after_two_server_errors() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock
        .mock_sequence(
            "/orders",
            vec![MockResponse::status(500), MockResponse::status(500), MockResponse::ok()],
        )
        .await;
    let engine = env.create_engine()?;

    let payload = serde_json::json!({"id": "ord_1", "total": 1250});
    let job = JobBuilder::new(env.http_mock.endpoint_url("/orders"))
        .json_payload(&payload)
        .secret("whsec_test")
        .header("X-Tenant", "acme")
        .no_backoff();
    let event_id = job.current_event_id().to_string();
    env.enqueue(job.build()).await?;

    let outcomes = [
        engine.process_once().await?,
        engine.process_once().await?,
        engine.process_once().await?,
    ];
    assert_eq!(
        outcomes,
        [ProcessOutcome::RetryScheduled, ProcessOutcome::RetryScheduled, ProcessOutcome::Delivered]
    );

    let report = env.status(&event_id).await?.expect("status exists");
    assert_eq!(report.status.state, DeliveryState::Delivered);
    assert_eq!(report.status.attempt_count, 3);
    assert_eq!(report.status.last_response_code, Some(200));
    let codes: Vec<_> = report.history.iter().map(|r| r.status_code).collect();
    assert_eq!(codes, vec![Some(200), Some(500), Some(500)]);

    let requests = env.http_mock.received_requests().await;
    assert_eq!(requests.len(), 3);
    for request in &requests {
        let signature = request.headers.get(SIGNATURE_HEADER).expect("signed").to_str()?;
        assert!(verify_signature(b"whsec_test", &request.body, signature));
        assert_eq!(request.headers.get("x-tenant").unwrap(), "acme");
        assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
    }
    assert_eq!(serde_json::from_slice::<serde_json::Value>(&requests[2].body)?, payload);
    Ok(())
}

#[tokio::test]
async fn text_payload_is_sent_verbatim_by_background_workers() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_sequence("/plain", vec![MockResponse::ok()]).await;
    let mut engine = env.create_engine()?;

    let job = JobBuilder::new(env.http_mock.endpoint_url("/plain")).text_payload("ping 1");
    let event_id = job.current_event_id().to_string();
    env.enqueue(job.build()).await?;

    engine.start().await?;
    assert_eq!(env.http_mock.wait_for_requests(1, Duration::from_secs(2)).await, 1);
    env.events.wait_for_events(1).await;
    engine.shutdown().await?;

    let requests = env.http_mock.received_requests().await;
    assert_eq!(requests[0].body, b"ping 1");
    assert!(requests[0].headers.get(SIGNATURE_HEADER).is_none());
    assert!(requests[0]
        .headers
        .get("content-type")
        .unwrap()
        .to_str()?
        .starts_with("text/plain"));

    let report = env.status(&event_id).await?.unwrap();
    assert_eq!(report.status.state, DeliveryState::Delivered);
    Ok(())
}
