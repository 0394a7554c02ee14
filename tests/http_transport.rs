//! reqwest transport against a local mock server.

use api_relay::pool::ConnectionPool;
use api_relay::transport::HttpConnector;
use api_relay::{ApiClient, ClientConfig, Error, RequestOptions};
use mockito::{Matcher, Server, ServerGuard};
use std::sync::Arc;
use std::time::Duration;

/// Test fixture that manages a mock server
struct MockServerFixture {
    server: ServerGuard,
    base_url: String,
}

impl MockServerFixture {
    async fn new() -> Self {
        let server = Server::new_async().await;
        let base_url = format!("{}/api/v10", server.url());
        Self { server, base_url }
    }

    fn client(&self, max_retries: u32) -> ApiClient {
        let mut cfg = ClientConfig::new(&self.base_url);
        cfg.auth_token = Some("Bot test-token".into());
        cfg.retry.max_retries = max_retries;
        cfg.retry.base_delay = Duration::from_millis(5);
        cfg.retry.max_delay = Duration::from_millis(20);
        cfg.retry.jitter = false;
        cfg.request_queue.processing_interval = Duration::from_millis(10);
        ApiClient::new(cfg).expect("client builds")
    }
}

#[tokio::test]
async fn test_success_updates_route_bucket_from_headers() {
    let mut fx = MockServerFixture::new().await;
    let mock = fx
        .server
        .mock("GET", "/api/v10/users/@me")
        .match_header("authorization", "Bot test-token")
        .match_header("x-request-id", Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("x-ratelimit-limit", "5")
        .with_header("x-ratelimit-remaining", "4")
        .with_header("x-ratelimit-reset-after", "1.5")
        .with_header("x-ratelimit-bucket", "abcd1234")
        .with_body(r#"{"id": "80351110224678912", "username": "relay"}"#)
        .expect(1)
        .create_async()
        .await;

    let client = fx.client(0);
    let resp = client.get("/users/@me", RequestOptions::new()).await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.data["username"], "relay");
    mock.assert_async().await;

    let status = client.get_detailed_status().await;
    let bucket = status
        .rate_limits
        .routes
        .iter()
        .find(|b| b.route == "/users/@me")
        .expect("route bucket tracked");
    assert_eq!(bucket.limit, 5);
    assert_eq!(bucket.remaining, 4);
    assert_eq!(bucket.bucket_id.as_deref(), Some("abcd1234"));
    assert!(bucket.from_server);
    client.shutdown().await;
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let mut fx = MockServerFixture::new().await;
    let mock = fx
        .server
        .mock("GET", "/api/v10/channels/1")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message": "Unknown Channel", "code": 10003}"#)
        .expect(1)
        .create_async()
        .await;

    let client = fx.client(3);
    let err = client.get("/channels/1", RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Client { status: 404, ref message } if message == "Unknown Channel"));
    mock.assert_async().await;
    client.shutdown().await;
}

#[tokio::test]
async fn test_server_error_retried_up_to_max_retries() {
    let mut fx = MockServerFixture::new().await;
    let mock = fx
        .server
        .mock("POST", "/api/v10/channels/1/messages")
        .match_body(Matcher::Json(serde_json::json!({"content": "hello"})))
        .with_status(502)
        .with_body("Bad Gateway")
        .expect(3)
        .create_async()
        .await;

    let client = fx.client(2);
    let err = client
        .post(
            "/channels/1/messages",
            Some(serde_json::json!({"content": "hello"})),
            RequestOptions::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Server { status: 502, .. }));
    mock.assert_async().await;
    client.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_body_sets_retry_after() {
    let mut fx = MockServerFixture::new().await;
    let mock = fx
        .server
        .mock("PATCH", "/api/v10/guilds/1")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_header("x-ratelimit-scope", "user")
        .with_body(r#"{"message": "You are being rate limited.", "retry_after": 0.05, "global": false}"#)
        .expect(2)
        .create_async()
        .await;

    let client = fx.client(1);
    let err = client
        .patch("/guilds/1", Some(serde_json::json!({"name": "x"})), RequestOptions::new())
        .await
        .unwrap_err();
    match err {
        Error::RateLimited {
            route,
            retry_after_ms,
            global,
        } => {
            assert_eq!(route, "/guilds/{id}");
            assert_eq!(retry_after_ms, Some(50));
            assert!(!global);
        }
        other => panic!("unexpected {other:?}"),
    }
    mock.assert_async().await;
    assert_eq!(client.get_metrics().rate_limited_requests, 2);
    client.shutdown().await;
}

#[tokio::test]
async fn test_health_sweep_probes_idle_connections() {
    let mut fx = MockServerFixture::new().await;
    let probe = fx
        .server
        .mock("HEAD", "/")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    // A port nothing listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_host = listener.local_addr().unwrap().to_string();
    drop(listener);

    let cfg = ClientConfig::new(&fx.base_url);
    let connector = Arc::new(HttpConnector::new(&cfg).unwrap());
    let pool = ConnectionPool::new(cfg.connection_pool.clone(), connector);

    let live_host = fx.server.host_with_port();
    drop(pool.acquire(&live_host).await.unwrap());
    drop(pool.acquire(&dead_host).await.unwrap());
    assert_eq!(pool.stats().idle_connections, 2);

    pool.health_sweep().await;
    probe.assert_async().await;

    let stats = pool.stats();
    assert_eq!(stats.total_evicted, 1);
    assert_eq!(stats.idle_connections, 1);
    let live = stats.hosts.iter().find(|h| h.host == live_host).unwrap();
    assert_eq!(live.idle, 1);
    assert!(live.healthy);
    let dead = stats.hosts.iter().find(|h| h.host == dead_host).unwrap();
    assert_eq!(dead.idle, 0);
    assert!(!dead.healthy);
}
