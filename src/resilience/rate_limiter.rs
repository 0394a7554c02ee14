use crate::config::RateLimitConfig;
use crate::types::RouteTemplate;
use dashmap::DashMap;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Used when the remote signals exhaustion without saying for how long.
const DEFAULT_BLOCK: Duration = Duration::from_secs(1);

/// Responses whose reset instants fall this close together describe the same window.
const SAME_WINDOW_TOLERANCE: Duration = Duration::from_millis(250);

/// Upper bound on any server-supplied delay.
const MAX_SERVER_DELAY: Duration = Duration::from_secs(3600);

/// Rate-limit metadata extracted from one response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub global: bool,
    pub scope: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };

        let reset_after = get("x-ratelimit-reset-after")
            .and_then(parse_seconds)
            .or_else(|| get("x-ratelimit-reset").and_then(parse_reset_instant));

        Self {
            limit: get("x-ratelimit-limit").and_then(|s| s.parse().ok()),
            remaining: get("x-ratelimit-remaining").and_then(|s| s.parse().ok()),
            reset_after,
            bucket: get("x-ratelimit-bucket").map(str::to_string),
            global: get("x-ratelimit-global")
                .map(|s| s.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            scope: get("x-ratelimit-scope").map(str::to_string),
            retry_after: get("retry-after").and_then(parse_seconds),
        }
    }

    /// Fill in `retry_after` / `global` from a 429 JSON body (`{"retry_after": 1.5, "global": false}`).
    pub fn merge_body(&mut self, body: &serde_json::Value) {
        if let Some(secs) = body.get("retry_after").and_then(|v| v.as_f64()) {
            if let Some(delay) = secs_to_duration(secs) {
                self.retry_after = Some(delay);
            }
        }
        if body.get("global").and_then(|v| v.as_bool()) == Some(true) {
            self.global = true;
        }
    }

    pub fn has_bucket_metadata(&self) -> bool {
        self.limit.is_some() || self.remaining.is_some()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_bucket_metadata() && self.retry_after.is_none() && self.reset_after.is_none() && !self.global
    }
}

/// Non-negative finite seconds, clamped to [`MAX_SERVER_DELAY`].
fn secs_to_duration(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_SERVER_DELAY)
            .min(MAX_SERVER_DELAY),
    )
}

fn parse_seconds(s: &str) -> Option<Duration> {
    secs_to_duration(s.parse().ok()?)
}

fn instant_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(MAX_SERVER_DELAY)).unwrap_or(now)
}

/// `x-ratelimit-reset` carries an epoch timestamp in (fractional) seconds.
fn parse_reset_instant(s: &str) -> Option<Duration> {
    let at: f64 = s.parse().ok()?;
    if !at.is_finite() || at < 1_000_000_000.0 {
        return parse_seconds(s);
    }
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs_f64();
    secs_to_duration((at - now).max(0.0))
}

/// Static token bucket used before a route has reported server metadata.
#[derive(Debug, Clone)]
struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn from_config(cfg: &RateLimitConfig) -> Self {
        let burst = f64::from(cfg.burst_limit.max(1));
        Self {
            rate_per_sec: f64::from(cfg.requests_per_minute) / 60.0,
            burst,
            tokens: burst,
            last: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.burst);
            self.last = now;
        }
    }

    fn wait(&mut self, now: Instant) -> Option<Duration> {
        if self.rate_per_sec <= 0.0 {
            return None;
        }
        self.refill(now);
        if self.tokens >= 1.0 {
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - self.tokens) / self.rate_per_sec))
        }
    }

    fn take(&mut self) {
        if self.rate_per_sec > 0.0 {
            self.tokens -= 1.0;
        }
    }
}

/// Rate-limit state for one route template (or for the whole API).
#[derive(Debug, Clone)]
pub struct RouteBucket {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: Option<Instant>,
    pub bucket_id: Option<String>,
    /// Last reset-after the remote reported; used to re-arm the window after a local reset.
    window: Option<Duration>,
    /// Set once the remote has described this bucket; the static estimate is ignored from then on.
    from_server: bool,
    estimate: Option<TokenBucket>,
}

impl RouteBucket {
    fn route(cfg: &RateLimitConfig) -> Self {
        Self {
            limit: 0,
            remaining: 0,
            reset_at: None,
            bucket_id: None,
            window: None,
            from_server: false,
            estimate: Some(TokenBucket::from_config(cfg)),
        }
    }

    fn global() -> Self {
        Self {
            limit: 0,
            remaining: 0,
            reset_at: None,
            bucket_id: None,
            window: None,
            from_server: false,
            estimate: None,
        }
    }

    /// Time until one call may proceed, `None` if it may proceed now.
    fn wait(&mut self, now: Instant) -> Option<Duration> {
        if let Some(reset) = self.reset_at {
            if now < reset {
                if self.remaining == 0 {
                    return Some(reset - now);
                }
            } else {
                self.remaining = self.limit.max(1);
                if self.limit == 0 {
                    // Only a retry-after was ever seen; fall back to the estimate.
                    self.reset_at = None;
                    self.from_server = false;
                } else {
                    // The next window starts now and lasts as long as the last one reported.
                    let window = self
                        .window
                        .filter(|w| !w.is_zero())
                        .unwrap_or(DEFAULT_BLOCK);
                    self.reset_at = Some(instant_after(now, window));
                }
            }
        }
        if self.from_server {
            if self.remaining == 0 && self.reset_at.is_none() {
                self.reset_at = Some(instant_after(now, DEFAULT_BLOCK));
                return Some(DEFAULT_BLOCK);
            }
            return None;
        }
        self.estimate.as_mut().and_then(|e| e.wait(now))
    }

    fn take(&mut self) {
        if self.from_server {
            self.remaining = self.remaining.saturating_sub(1);
        } else if let Some(e) = self.estimate.as_mut() {
            e.take();
        }
    }

    fn block_for(&mut self, now: Instant, delay: Duration) {
        let until = instant_after(now, delay);
        self.from_server = true;
        self.remaining = 0;
        self.reset_at = Some(self.reset_at.map_or(until, |r| r.max(until)));
    }

    fn apply(&mut self, now: Instant, h: &RateLimitHeaders) {
        let new_reset = h.reset_after.map(|d| instant_after(now, d));
        let same_window = match (self.reset_at, new_reset) {
            (Some(old), Some(new)) => {
                let diff = if old > new { old - new } else { new - old };
                diff <= SAME_WINDOW_TOLERANCE
            }
            _ => false,
        };

        self.from_server = true;
        if let Some(limit) = h.limit {
            self.limit = limit;
        }
        if let Some(remaining) = h.remaining {
            // A late response from the same window must not hand budget back.
            self.remaining = if same_window {
                remaining.min(self.remaining)
            } else {
                remaining
            };
        }
        if new_reset.is_some() {
            self.reset_at = new_reset;
            self.window = h.reset_after.map(|d| d.min(MAX_SERVER_DELAY));
        }
        if self.remaining == 0 && self.reset_at.is_none() {
            self.reset_at = Some(instant_after(now, h.retry_after.unwrap_or(DEFAULT_BLOCK)));
        }
    }

    fn snapshot(&self, name: &str, now: Instant) -> BucketSnapshot {
        BucketSnapshot {
            route: name.to_string(),
            limit: self.limit,
            remaining: self.remaining,
            reset_in_ms: self
                .reset_at
                .filter(|r| *r > now)
                .map(|r| (r - now).as_millis() as u64),
            bucket_id: self.bucket_id.clone(),
            from_server: self.from_server,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketSnapshot {
    pub route: String,
    pub limit: u32,
    pub remaining: u32,
    pub reset_in_ms: Option<u64>,
    pub bucket_id: Option<String>,
    pub from_server: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterSnapshot {
    pub global: BucketSnapshot,
    pub routes: Vec<BucketSnapshot>,
}

/// Route and global rate-limit gate.
///
/// - Each route template has its own lock; unrelated routes never contend
/// - Routes reporting the same server bucket id share one state
/// - The global bucket is consulted on every acquisition
pub struct RateLimiter {
    cfg: RateLimitConfig,
    global: Mutex<RouteBucket>,
    routes: DashMap<RouteTemplate, Arc<Mutex<RouteBucket>>>,
    shared: DashMap<String, Arc<Mutex<RouteBucket>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            global: Mutex::new(RouteBucket::global()),
            routes: DashMap::new(),
            shared: DashMap::new(),
        }
    }

    fn bucket(&self, route: &RouteTemplate) -> Arc<Mutex<RouteBucket>> {
        if let Some(b) = self.routes.get(route) {
            return b.clone();
        }
        self.routes
            .entry(route.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RouteBucket::route(&self.cfg))))
            .clone()
    }

    /// Predicted wait for `route` without consuming budget.
    pub async fn check(&self, route: &RouteTemplate) -> Option<Duration> {
        let bucket = self.bucket(route);
        let mut g = self.global.lock().await;
        let mut b = bucket.lock().await;
        let now = Instant::now();
        match (g.wait(now), b.wait(now)) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Reserve one call on `route`, sleeping until the bucket resets if it is exhausted.
    ///
    /// Returns the total time spent waiting.
    pub async fn acquire(&self, route: &RouteTemplate) -> Duration {
        let start = Instant::now();
        loop {
            let bucket = self.bucket(route);
            let wait = {
                // Lock order is always global, then route.
                let mut g = self.global.lock().await;
                let mut b = bucket.lock().await;
                let now = Instant::now();
                match g.wait(now).or_else(|| b.wait(now)) {
                    Some(w) => w,
                    None => {
                        g.take();
                        b.take();
                        return start.elapsed();
                    }
                }
            };
            debug!(route = %route, wait_ms = wait.as_millis() as u64, "rate limit: deferring dispatch");
            tokio::time::sleep(wait).await;
        }
    }

    /// Fold a response's metadata into the bucket state.
    ///
    /// Returns the block duration when the response left the route (or the API) exhausted.
    pub async fn update(
        &self,
        route: &RouteTemplate,
        headers: &RateLimitHeaders,
        status: u16,
    ) -> Option<Duration> {
        let now = Instant::now();

        if status == 429 && headers.global {
            let delay = headers.retry_after.or(headers.reset_after).unwrap_or(DEFAULT_BLOCK);
            self.global.lock().await.block_for(now, delay);
            warn!(route = %route, delay_ms = delay.as_millis() as u64, "global rate limit hit");
            return Some(delay);
        }

        let mut bucket = self.bucket(route);
        if let Some(id) = &headers.bucket {
            bucket = self.link_bucket(route, id, bucket);
        }

        let mut b = bucket.lock().await;
        if headers.bucket.is_some() {
            b.bucket_id = headers.bucket.clone();
        }
        if headers.has_bucket_metadata() {
            b.apply(now, headers);
        }
        if status == 429 {
            let delay = headers
                .retry_after
                .or(headers.reset_after)
                .unwrap_or(DEFAULT_BLOCK);
            b.block_for(now, delay);
            warn!(route = %route, delay_ms = delay.as_millis() as u64, scope = headers.scope.as_deref().unwrap_or("route"), "route rate limit hit");
        }

        if b.remaining == 0 && b.from_server {
            b.reset_at.filter(|r| *r > now).map(|r| r - now)
        } else {
            None
        }
    }

    fn link_bucket(
        &self,
        route: &RouteTemplate,
        id: &str,
        current: Arc<Mutex<RouteBucket>>,
    ) -> Arc<Mutex<RouteBucket>> {
        let shared = self
            .shared
            .entry(id.to_string())
            .or_insert_with(|| current.clone())
            .clone();
        if !Arc::ptr_eq(&shared, &current) {
            debug!(route = %route, bucket = id, "route shares a server bucket");
            self.routes.insert(route.clone(), shared.clone());
        }
        shared
    }

    pub async fn snapshot(&self) -> RateLimiterSnapshot {
        let now = Instant::now();
        let global = self.global.lock().await.snapshot("global", now);
        let entries: Vec<(RouteTemplate, Arc<Mutex<RouteBucket>>)> = self
            .routes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let mut routes = Vec::with_capacity(entries.len());
        for (route, bucket) in entries {
            routes.push(bucket.lock().await.snapshot(route.as_str(), now));
        }
        routes.sort_by(|a, b| a.route.cmp(&b.route));
        RateLimiterSnapshot { global, routes }
    }
}
