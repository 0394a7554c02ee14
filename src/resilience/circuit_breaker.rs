use crate::config::{CircuitBreakerConfig, CircuitScope};
use crate::types::RouteTemplate;
use crate::{Error, Result};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How an attempt counts towards breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Neither success nor failure (e.g. a 429); a half-open trial slot is handed back.
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub trials_admitted: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

/// A state change caused by a recorded outcome.
#[derive(Debug, Clone)]
pub enum Transition {
    Opened(CircuitSnapshot),
    Closed(CircuitSnapshot),
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failures: VecDeque<Instant>,
    successes: u32,
    opened_at: Option<Instant>,
    trials_admitted: u32,
}

impl State {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            successes: 0,
            opened_at: None,
            trials_admitted: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(first) = self.failures.front() {
            if now.saturating_duration_since(*first) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open_remaining(&self, now: Instant, reset_timeout: Duration) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => {
                Some(reset_timeout.saturating_sub(now.saturating_duration_since(at)))
            }
            _ => None,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
        self.trials_admitted = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.failures.clear();
        self.successes = 0;
        self.trials_admitted = 0;
    }

    fn snapshot(&self, key: &str, cfg: &CircuitBreakerConfig, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            key: key.to_string(),
            state: self.state,
            failure_count: self.failures.len() as u32,
            success_count: self.successes,
            failure_threshold: cfg.failure_threshold,
            success_threshold: cfg.success_threshold,
            trials_admitted: self.trials_admitted,
            open_remaining_ms: self
                .open_remaining(now, cfg.reset_timeout)
                .map(|d| d.as_millis() as u64),
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    // A panic while holding the lock leaves the counters intact; keep using them.
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-key circuit breaker registry.
///
/// - Keys are route templates or hosts depending on [`CircuitScope`]
/// - Each key has its own lock; unrelated keys never contend
/// - Admission hands out a [`CircuitTicket`] that must carry the attempt's outcome back
pub struct CircuitBreaker {
    cfg: Arc<CircuitBreakerConfig>,
    states: DashMap<String, Arc<Mutex<State>>>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg: Arc::new(cfg),
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    pub fn key_for(&self, route: &RouteTemplate, host: &str) -> String {
        match self.cfg.scope {
            CircuitScope::Route => route.as_str().to_string(),
            CircuitScope::Host => host.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<State>> {
        if let Some(s) = self.states.get(key) {
            return s.clone();
        }
        self.states
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(State::new())))
            .clone()
    }

    /// Admit one attempt on `key` or fail fast with [`Error::CircuitOpen`].
    pub fn allow(&self, key: &str) -> Result<CircuitTicket> {
        if !self.cfg.enable {
            return Ok(CircuitTicket::passthrough(key));
        }
        let state = self.entry(key);
        let now = Instant::now();
        let mut trial = false;
        {
            let mut st = lock(&state);
            if let Some(remaining) = st.open_remaining(now, self.cfg.reset_timeout) {
                if !remaining.is_zero() {
                    return Err(Error::CircuitOpen {
                        key: key.to_string(),
                        retry_in_ms: remaining.as_millis() as u64,
                    });
                }
                st.state = CircuitState::HalfOpen;
                st.successes = 0;
                st.trials_admitted = 0;
                info!(key, "circuit half-open, admitting trial requests");
            }
            if st.state == CircuitState::HalfOpen {
                if st.trials_admitted >= self.cfg.trial_calls() {
                    return Err(Error::CircuitOpen {
                        key: key.to_string(),
                        retry_in_ms: 0,
                    });
                }
                st.trials_admitted += 1;
                trial = true;
            }
        }
        Ok(CircuitTicket {
            key: key.to_string(),
            state: Some(state),
            cfg: self.cfg.clone(),
            trial,
            recorded: false,
        })
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.states
            .get(key)
            .map(|s| {
                let st = lock(&s);
                st.state
            })
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, key: &str) -> CircuitSnapshot {
        let now = Instant::now();
        let Some(s) = self.states.get(key) else {
            return State::new().snapshot(key, &self.cfg, now);
        };
        let st = lock(&s);
        st.snapshot(key, &self.cfg, now)
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let mut out: Vec<CircuitSnapshot> = self
            .states
            .iter()
            .map(|e| {
                let st = lock(e.value());
                st.snapshot(e.key(), &self.cfg, now)
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// True while at least one key is not closed.
    pub fn any_open(&self) -> bool {
        self.states
            .iter()
            .any(|e| {
                let st = lock(e.value());
                st.state != CircuitState::Closed
            })
    }
}

/// Admission for one attempt.
///
/// Dropping a ticket without recording an outcome hands its half-open trial slot back.
pub struct CircuitTicket {
    key: String,
    state: Option<Arc<Mutex<State>>>,
    cfg: Arc<CircuitBreakerConfig>,
    trial: bool,
    recorded: bool,
}

impl CircuitTicket {
    fn passthrough(key: &str) -> Self {
        Self {
            key: key.to_string(),
            state: None,
            cfg: Arc::new(CircuitBreakerConfig::default()),
            trial: false,
            recorded: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record the attempt's outcome; returns the transition it caused, if any.
    pub fn record(mut self, outcome: Outcome) -> Option<Transition> {
        let state = self.state.take()?;
        self.recorded = true;
        let now = Instant::now();
        let mut st = lock(&state);
        match (st.state, outcome) {
            (CircuitState::Closed, Outcome::Failure) => {
                st.failures.push_back(now);
                st.prune(now, self.cfg.monitoring_period);
                if st.failures.len() as u32 >= self.cfg.failure_threshold {
                    st.open(now);
                    warn!(key = %self.key, failures = self.cfg.failure_threshold, "circuit opened");
                    return Some(Transition::Opened(st.snapshot(&self.key, &self.cfg, now)));
                }
                None
            }
            (CircuitState::Closed, Outcome::Success) => {
                st.failures.clear();
                None
            }
            (CircuitState::HalfOpen, Outcome::Failure) if self.trial => {
                st.open(now);
                warn!(key = %self.key, "trial request failed, circuit reopened");
                Some(Transition::Opened(st.snapshot(&self.key, &self.cfg, now)))
            }
            (CircuitState::HalfOpen, Outcome::Success) if self.trial => {
                st.successes += 1;
                if st.successes >= self.cfg.success_threshold {
                    st.close();
                    info!(key = %self.key, "circuit closed");
                    return Some(Transition::Closed(st.snapshot(&self.key, &self.cfg, now)));
                }
                None
            }
            (CircuitState::HalfOpen, Outcome::Neutral) if self.trial => {
                st.trials_admitted = st.trials_admitted.saturating_sub(1);
                None
            }
            _ => None,
        }
    }
}

impl Drop for CircuitTicket {
    fn drop(&mut self) {
        if self.recorded || !self.trial {
            return;
        }
        if let Some(state) = self.state.take() {
            let mut st = lock(&state);
            if st.state == CircuitState::HalfOpen {
                st.trials_admitted = st.trials_admitted.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn breaker(failures: u32, successes: u32, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_reset_timeout(Duration::from_millis(reset_ms)),
        )
    }

    fn fail(cb: &CircuitBreaker, key: &str) -> Option<Transition> {
        cb.allow(key).unwrap().record(Outcome::Failure)
    }

    #[test]
    fn test_opens_at_threshold() {
        let cb = breaker(5, 3, 60_000);
        for _ in 0..4 {
            assert!(fail(&cb, "/r").is_none());
        }
        assert!(matches!(fail(&cb, "/r"), Some(Transition::Opened(_))));
        assert_eq!(cb.state("/r"), CircuitState::Open);

        match cb.allow("/r") {
            Err(Error::CircuitOpen { key, retry_in_ms }) => {
                assert_eq!(key, "/r");
                assert!(retry_in_ms > 59_000);
            }
            other => panic!("expected CircuitOpen, got {:?}", other.map(|_| ())),
        }
        // Other keys are unaffected.
        assert!(cb.allow("/other").is_ok());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = breaker(3, 1, 60_000);
        fail(&cb, "/r");
        fail(&cb, "/r");
        cb.allow("/r").unwrap().record(Outcome::Success);
        fail(&cb, "/r");
        fail(&cb, "/r");
        assert_eq!(cb.state("/r"), CircuitState::Closed);
        assert_eq!(cb.snapshot("/r").failure_count, 2);
    }

    #[test]
    fn test_failures_outside_window_expire() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(2)
                .with_monitoring_period(Duration::from_millis(30)),
        );
        fail(&cb, "/r");
        thread::sleep(Duration::from_millis(50));
        assert!(fail(&cb, "/r").is_none());
        assert_eq!(cb.state("/r"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_limits_trials_and_closes() {
        let cb = breaker(1, 2, 20);
        fail(&cb, "/r");
        thread::sleep(Duration::from_millis(30));

        let t1 = cb.allow("/r").unwrap();
        let t2 = cb.allow("/r").unwrap();
        assert!(t1.is_trial() && t2.is_trial());
        assert_eq!(cb.state("/r"), CircuitState::HalfOpen);
        assert!(matches!(cb.allow("/r"), Err(Error::CircuitOpen { .. })));

        assert!(t1.record(Outcome::Success).is_none());
        assert!(matches!(t2.record(Outcome::Success), Some(Transition::Closed(_))));
        assert_eq!(cb.state("/r"), CircuitState::Closed);
        assert!(!cb.any_open());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 2, 20);
        fail(&cb, "/r");
        thread::sleep(Duration::from_millis(30));
        let t = cb.allow("/r").unwrap();
        assert!(matches!(t.record(Outcome::Failure), Some(Transition::Opened(_))));
        assert!(cb.snapshot("/r").open_remaining_ms.unwrap() > 10);
        assert!(cb.allow("/r").is_err());
    }

    #[test]
    fn test_dropped_trial_ticket_frees_slot() {
        let cb = breaker(1, 1, 10);
        fail(&cb, "/r");
        thread::sleep(Duration::from_millis(20));
        let t = cb.allow("/r").unwrap();
        assert!(cb.allow("/r").is_err());
        drop(t);
        assert!(cb.allow("/r").is_ok());
    }

    #[test]
    fn test_neutral_outcome_leaves_state() {
        let cb = breaker(1, 1, 60_000);
        cb.allow("/r").unwrap().record(Outcome::Neutral);
        assert_eq!(cb.state("/r"), CircuitState::Closed);
        assert_eq!(cb.snapshot("/r").failure_count, 0);
    }

    #[test]
    fn test_disabled_breaker_never_opens() {
        let mut cfg = CircuitBreakerConfig::new().with_failure_threshold(1);
        cfg.enable = false;
        let cb = CircuitBreaker::new(cfg);
        for _ in 0..5 {
            fail(&cb, "/r");
        }
        assert!(cb.allow("/r").is_ok());
    }

    #[test]
    fn test_host_scope_key() {
        let mut cfg = CircuitBreakerConfig::new();
        cfg.scope = CircuitScope::Host;
        let cb = CircuitBreaker::new(cfg);
        let route = RouteTemplate::new("/channels/{id}");
        assert_eq!(cb.key_for(&route, "discord.com"), "discord.com");
        let cb = breaker(1, 1, 1);
        assert_eq!(cb.key_for(&route, "discord.com"), "/channels/{id}");
    }

    #[test]
    fn test_concurrent_half_open_admission_bounded() {
        let cb = Arc::new(breaker(1, 3, 10));
        fail(&cb, "/r");
        thread::sleep(Duration::from_millis(20));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cb = cb.clone();
                thread::spawn(move || cb.allow("/r").ok())
            })
            .collect();
        let tickets: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(tickets.len(), 3);
    }
}
