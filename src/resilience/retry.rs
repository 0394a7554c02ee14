use crate::config::RetryConfig;
use crate::Error;
use rand::Rng;
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Fail,
}

/// Retry policy engine.
///
/// Deterministic apart from jitter: the same error and attempt number always
/// produce the same decision, and with jitter disabled the same delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    cfg: RetryConfig,
}

impl RetryPolicy {
    pub fn new(cfg: RetryConfig) -> Self {
        Self { cfg }
    }

    pub fn max_retries(&self) -> u32 {
        self.cfg.max_retries
    }

    fn retryable_status(&self, status: u16) -> bool {
        self.cfg.retryable_status_codes.contains(&status)
    }

    pub fn is_retryable(&self, err: &Error) -> bool {
        match err {
            Error::Network(_) | Error::PoolTimeout { .. } | Error::Timeout { .. } => true,
            Error::RateLimited { .. } => self.retryable_status(429),
            Error::Server { status, .. } | Error::Client { status, .. } => {
                self.retryable_status(*status)
            }
            // Circuit-open is already a fast failure; the rest are terminal by nature.
            Error::CircuitOpen { .. }
            | Error::QueueFull { .. }
            | Error::Cancelled
            | Error::ShuttingDown
            | Error::Configuration { .. }
            | Error::Serialization(_) => false,
        }
    }

    /// `min(maxDelay, baseDelay * exponentialBase^attempt)` without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.cfg.base_delay.as_millis() as f64;
        let max_ms = self.cfg.max_delay.as_millis() as f64;
        let exp = self.cfg.exponential_base.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let ms = (base_ms * exp).min(max_ms);
        if ms.is_finite() && ms > 0.0 {
            Duration::from_millis(ms as u64)
        } else if ms.is_finite() {
            Duration::ZERO
        } else {
            self.cfg.max_delay
        }
    }

    /// Delay before retry number `attempt + 1`.
    ///
    /// A server-provided 429 delay is used as-is; otherwise the backoff is
    /// perturbed uniformly within `[delay / 2, delay]` when jitter is on.
    pub fn delay_for(&self, err: &Error, attempt: u32) -> Duration {
        if let Some(ms) = err.retry_after_ms() {
            return Duration::from_millis(ms);
        }
        let delay = self.backoff_delay(attempt);
        if !self.cfg.jitter || delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(factor)
    }

    /// Decide what to do after a failed attempt.
    ///
    /// `attempt` is 0-based (first failure => attempt=0).
    pub fn decide(&self, err: &Error, attempt: u32) -> RetryDecision {
        if attempt >= self.cfg.max_retries || !self.is_retryable(err) {
            return RetryDecision::Fail;
        }
        RetryDecision::Retry {
            delay: self.delay_for(err, attempt),
        }
    }
}
