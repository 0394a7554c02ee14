//! End-to-end scenarios through the full client with a scripted transport.

mod support;

use api_relay::{ClientEvent, Error, Method, RequestOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::{client_with, path, test_config, ScriptedConnector, Step};

#[tokio::test]
async fn test_concurrency_ceiling_holds_until_queue_drains() {
    let connector = ScriptedConnector::new().with_delay(Duration::from_millis(80));
    let mut cfg = test_config();
    cfg.request_queue.max_concurrent_requests = 5;
    let client = client_with(&connector, cfg);

    let handles: Vec<_> = (0..20)
        .map(|i| {
            client
                .submit(Method::Get, &format!("/channels/{i}"), None, RequestOptions::new())
                .unwrap()
        })
        .collect();

    let mut peak_observed = 0;
    while connector.calls() < 20 {
        let stats = client.queue_stats();
        assert!(stats.in_flight <= 5);
        peak_observed = peak_observed.max(connector.in_flight());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    for handle in handles {
        let resp = handle.wait().await.unwrap();
        assert!(resp.success());
    }
    assert_eq!(connector.max_in_flight(), 5);
    assert!(peak_observed <= 5);
    assert_eq!(client.get_metrics().successful_requests, 20);
    client.shutdown().await;
}

#[tokio::test]
async fn test_server_retry_after_delays_next_dispatch() {
    let connector = ScriptedConnector::new();
    let endpoint = "/channels/42/messages";
    connector.push(
        &path(endpoint),
        Step::RateLimited {
            retry_after: Duration::from_millis(2000),
            global: false,
        },
    );
    let client = client_with(&connector, test_config());
    let mut events = client.subscribe();

    let resp = client
        .post(endpoint, Some(serde_json::json!({"content": "hi"})), RequestOptions::new())
        .await
        .unwrap();
    assert!(resp.success());
    assert_eq!(resp.attempts, 2);

    let sent = connector.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent[1].at.duration_since(sent[0].at) >= Duration::from_millis(2000));
    // Retries reuse the request's correlation id.
    assert_eq!(sent[0].request_id, sent[1].request_id);

    let mut saw_rate_limited = false;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::RateLimited { wait_ms, global, .. } = event {
            assert!(!global);
            assert!(wait_ms > 1500);
            saw_rate_limited = true;
        }
    }
    assert!(saw_rate_limited);
    client.shutdown().await;
}

#[tokio::test]
async fn test_rate_limited_route_holds_later_requests() {
    let connector = ScriptedConnector::new();
    let endpoint = "/channels/42/messages";
    let retry_after = Duration::from_millis(500);
    connector.push(
        &path(endpoint),
        Step::RateLimited {
            retry_after,
            global: false,
        },
    );
    let mut cfg = test_config();
    cfg.retry.max_retries = 0;
    let client = client_with(&connector, cfg);

    let err = client
        .post(endpoint, Some(serde_json::json!({"content": "first"})), RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { retry_after_ms: Some(500), .. }));

    // Submitted while the route is still blocked.
    let resp = client
        .post(endpoint, Some(serde_json::json!({"content": "second"})), RequestOptions::new())
        .await
        .unwrap();
    assert!(resp.success());
    assert_eq!(resp.attempts, 1);

    let sent = connector.sent();
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].request_id, sent[1].request_id);
    assert!(sent[1].at.duration_since(sent[0].at) >= retry_after);
    client.shutdown().await;
}

#[tokio::test]
async fn test_circuit_opens_and_fails_fast_without_network_call() {
    let connector = ScriptedConnector::new();
    let endpoint = "/guilds/7/members";
    connector.always(&path(endpoint), Step::status(500));

    let mut cfg = test_config();
    cfg.retry.max_retries = 0;
    cfg.circuit_breaker.failure_threshold = 5;
    let client = client_with(&connector, cfg);
    let mut events = client.subscribe();

    for _ in 0..5 {
        let err = client.get(endpoint, RequestOptions::new()).await.unwrap_err();
        assert!(matches!(err, Error::Server { status: 500, .. }));
    }
    assert_eq!(connector.calls_for(&path(endpoint)), 5);

    let err = client.get(endpoint, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen { .. }), "got {err:?}");
    assert_eq!(connector.calls_for(&path(endpoint)), 5);

    let mut opened = false;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::CircuitBreakerOpen(snapshot) = event {
            assert_eq!(snapshot.key, "/guilds/{id}/members");
            opened = true;
        }
    }
    assert!(opened);

    let health = client.health_check().await;
    assert!(!health.is_healthy);
    // Other routes keep flowing.
    assert!(client.get("/users/@me", RequestOptions::new()).await.is_ok());
    client.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_and_refuses_new_work() {
    let connector = ScriptedConnector::new().with_delay(Duration::from_millis(300));
    let client = Arc::new(client_with(&connector, test_config()));

    let handles: Vec<_> = (0..3)
        .map(|i| {
            client
                .submit(Method::Get, &format!("/channels/{i}"), None, RequestOptions::new())
                .unwrap()
        })
        .collect();
    while connector.in_flight() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    let shutdown = {
        let client = client.clone();
        tokio::spawn(async move { client.shutdown_with_timeout(Duration::from_millis(2000)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let late = client.get("/channels/99", RequestOptions::new()).await;
    assert!(matches!(late, Err(Error::ShuttingDown)));

    for handle in handles {
        assert!(handle.wait().await.is_ok());
    }
    shutdown.await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(2000));
    assert!(!client.queue_stats().accepting);
}

#[tokio::test]
async fn test_shutdown_aborts_work_past_the_drain_timeout() {
    let connector = ScriptedConnector::new().with_delay(Duration::from_secs(5));
    let client = client_with(&connector, test_config());

    let handles: Vec<_> = (0..3)
        .map(|i| {
            client
                .submit(Method::Get, &format!("/channels/{i}"), None, RequestOptions::new())
                .unwrap()
        })
        .collect();
    while connector.in_flight() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    client.shutdown_with_timeout(Duration::from_millis(200)).await;
    for handle in handles {
        assert!(matches!(handle.wait().await, Err(Error::ShuttingDown)));
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}
