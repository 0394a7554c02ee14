//! Dispatch gates and retry policy.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per route/host CLOSED/OPEN/HALF_OPEN breaker |
//! | [`rate_limiter`] | Route and global buckets fed by response metadata |
//! | [`retry`] | Retry-or-surface decisions with exponential backoff |
//!
//! Every attempt passes the breaker first, so an open circuit never spends
//! rate-limit budget:
//!
//! ```rust
//! use api_relay::config::CircuitBreakerConfig;
//! use api_relay::resilience::circuit_breaker::{CircuitBreaker, Outcome};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_reset_timeout(Duration::from_secs(30)),
//! );
//!
//! if let Ok(ticket) = breaker.allow("/channels/{id}/messages") {
//!     // Make API call...
//!     ticket.record(Outcome::Success);
//! }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, CircuitTicket, Outcome, Transition};
pub use rate_limiter::{BucketSnapshot, RateLimitHeaders, RateLimiter, RateLimiterSnapshot};
pub use retry::{RetryDecision, RetryPolicy};
