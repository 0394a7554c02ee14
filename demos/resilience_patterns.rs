//! Resilience Patterns Example
//!
//! Walks through the gates every request passes on its way out:
//! - CircuitBreaker tickets and the half-open trial
//! - RateLimiter buckets fed by response metadata
//! - RetryPolicy backoff
//!
//! Usage:
//!   cargo run --example resilience_patterns

use api_relay::config::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};
use api_relay::logging::init_tracing;
use api_relay::resilience::{
    CircuitBreaker, Outcome, RateLimitHeaders, RateLimiter, RetryDecision, RetryPolicy,
};
use api_relay::{Error, RouteTemplate};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("api_relay=debug");

    println!("=== api-relay Resilience Patterns Demo ===\n");

    demo_circuit_breaker().await;
    demo_rate_limiter().await;
    demo_retry_policy();

    Ok(())
}

async fn demo_circuit_breaker() {
    println!("--- Example 1: Circuit Breaker ---\n");

    let config = CircuitBreakerConfig::new()
        .with_failure_threshold(3)
        .with_success_threshold(1)
        .with_reset_timeout(Duration::from_millis(500));
    let breaker = CircuitBreaker::new(config);
    let route = RouteTemplate::from_endpoint("/guilds/81384788765712384/members");
    let key = breaker.key_for(&route, "discord.com");
    println!("Breaker key: {key}\n");

    for i in 1..=4 {
        match breaker.allow(&key) {
            Ok(ticket) => {
                println!("Request {i}: allowed (simulating failure)");
                if let Some(transition) = ticket.record(Outcome::Failure) {
                    println!("  -> transition: {transition:?}");
                }
            }
            Err(Error::CircuitOpen { retry_in_ms, .. }) => {
                println!("Request {i}: BLOCKED, retry in {retry_in_ms}ms");
            }
            Err(e) => println!("Request {i}: {e}"),
        }
    }

    println!("\nWaiting out the reset timeout...");
    tokio::time::sleep(Duration::from_millis(550)).await;

    if let Ok(ticket) = breaker.allow(&key) {
        println!("Trial admitted (trial = {})", ticket.is_trial());
        ticket.record(Outcome::Success);
    }
    println!("State after trial: {:?}\n", breaker.state(&key));
}

async fn demo_rate_limiter() {
    println!("--- Example 2: Rate Limiter ---\n");

    let limiter = RateLimiter::new(RateLimitConfig {
        requests_per_minute: 600,
        burst_limit: 3,
    });
    let route = RouteTemplate::from_endpoint("/channels/42/messages");

    println!("Static estimate: 600 rpm, burst 3\n");
    for i in 1..=5 {
        let waited = limiter.acquire(&route).await;
        println!("Request {i}: waited {waited:?}");
    }

    // A response reporting an exhausted bucket blocks until its reset.
    let headers = RateLimitHeaders {
        limit: Some(5),
        remaining: Some(0),
        reset_after: Some(Duration::from_millis(300)),
        bucket: Some("abcd1234".into()),
        ..Default::default()
    };
    if let Some(block) = limiter.update(&route, &headers, 200).await {
        println!("\nServer reports bucket exhausted, blocked for {block:?}");
    }
    println!("check() now says: {:?}", limiter.check(&route).await);

    let snapshot = limiter.snapshot().await;
    for bucket in snapshot.routes {
        println!(
            "  {} -> {}/{} (bucket {:?}, server: {})",
            bucket.route, bucket.remaining, bucket.limit, bucket.bucket_id, bucket.from_server
        );
    }
    println!();
}

fn demo_retry_policy() {
    println!("--- Example 3: Retry Policy ---\n");

    let policy = RetryPolicy::new(RetryConfig {
        max_retries: 4,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        jitter: false,
        ..Default::default()
    });

    let err = Error::Server {
        status: 503,
        message: "Service Unavailable".into(),
    };
    for attempt in 0..=4 {
        match policy.decide(&err, attempt) {
            RetryDecision::Retry { delay } => println!("Attempt {attempt}: retry in {delay:?}"),
            RetryDecision::Fail => println!("Attempt {attempt}: give up"),
        }
    }

    let not_found = Error::Client {
        status: 404,
        message: "Unknown Channel".into(),
    };
    println!(
        "\n404 retryable: {}, 429 retryable: {}",
        policy.is_retryable(&not_found),
        policy.is_retryable(&Error::RateLimited {
            route: "/channels/{id}/messages".into(),
            retry_after_ms: Some(2000),
            global: false,
        })
    );
}
