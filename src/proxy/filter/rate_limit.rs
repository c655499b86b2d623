use crate::config::{RateLimitMode, RateLimitPolicy};
use crate::error::GatewayError;
use crate::routing::CompiledRoute;
use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::Mutex;

/// Per-route admission control.
///
/// Two modes:
/// - Token bucket: smooth rate limiting with a burst allowance.
/// - Sliding window: at most `count` requests per window, blending the
///   previous window's count so two adjacent windows cannot pass 2x the
///   limit around the boundary.
///
/// State is keyed by the route's table key, so routes sharing a path keep
/// separate budgets, and is created lazily with the policy seen on first use.
#[derive(Default)]
pub struct RateLimiter {
    buckets: DashMap<String, std::sync::Arc<Bucket>>,
    windows: DashMap<String, std::sync::Arc<SlidingWindow>>,
}

/// `tokio::sync::Mutex` so waiting for the lock yields to the runtime.
struct Bucket {
    inner: Mutex<BucketInner>,
}

struct BucketInner {
    tokens: u64,
    last_refill: u64,
    rate_per_us: f64,
    max_tokens: u64,
}

/// estimated = prev_count * (1 - elapsed / window) + current_count
struct SlidingWindow {
    inner: Mutex<SlidingWindowInner>,
}

struct SlidingWindowInner {
    current_count: u64,
    prev_count: u64,
    window_start: u64,
    max_count: u64,
    window_us: u64,
}

/// Fixed-point scale for fractional tokens.
const PRECISION: u64 = 1_000_000;

const DEFAULT_RATE: f64 = 100.0;
const DEFAULT_COUNT: u64 = 1000;
const DEFAULT_WINDOW_SECS: f64 = 1.0;

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if allowed, `false` if rate limited.
    pub async fn check(&self, policy: &RateLimitPolicy, key: &str) -> bool {
        match policy.mode {
            RateLimitMode::TokenBucket => self.check_token_bucket(policy, key).await,
            RateLimitMode::SlidingWindow => self.check_sliding_window(policy, key).await,
        }
    }

    async fn check_token_bucket(&self, policy: &RateLimitPolicy, key: &str) -> bool {
        let bucket = if let Some(entry) = self.buckets.get(key) {
            entry.value().clone()
        } else {
            self.buckets
                .entry(key.to_string())
                .or_insert_with(|| std::sync::Arc::new(Bucket::new(policy)))
                .clone()
        };
        bucket.try_acquire().await
    }

    async fn check_sliding_window(&self, policy: &RateLimitPolicy, key: &str) -> bool {
        let window = if let Some(entry) = self.windows.get(key) {
            entry.value().clone()
        } else {
            self.windows
                .entry(key.to_string())
                .or_insert_with(|| std::sync::Arc::new(SlidingWindow::new(policy)))
                .clone()
        };
        window.try_acquire().await
    }

    /// Number of routes with live limiter state.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len() + self.windows.len()
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}

impl Bucket {
    fn new(policy: &RateLimitPolicy) -> Self {
        let rate = policy.rate.filter(|r| *r > 0.0).unwrap_or(DEFAULT_RATE);
        let burst = policy.burst.unwrap_or(rate.ceil() as u64).max(1);
        let max_tokens = burst * PRECISION;
        Self {
            inner: Mutex::new(BucketInner {
                tokens: max_tokens,
                last_refill: now_us(),
                rate_per_us: rate / 1_000_000.0,
                max_tokens,
            }),
        }
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        let mut b = self.inner.lock().await;

        let elapsed = now.saturating_sub(b.last_refill);
        if elapsed > 0 {
            let refill = (elapsed as f64 * b.rate_per_us * PRECISION as f64) as u64;
            b.tokens = b.tokens.saturating_add(refill).min(b.max_tokens);
            b.last_refill = now;
        }

        if b.tokens >= PRECISION {
            b.tokens -= PRECISION;
            true
        } else {
            false
        }
    }
}

impl SlidingWindow {
    fn new(policy: &RateLimitPolicy) -> Self {
        let window_secs = policy
            .time_window_secs
            .filter(|w| *w > 0.0)
            .unwrap_or(DEFAULT_WINDOW_SECS);
        Self {
            inner: Mutex::new(SlidingWindowInner {
                current_count: 0,
                prev_count: 0,
                window_start: now_us(),
                max_count: policy.count.unwrap_or(DEFAULT_COUNT).max(1),
                window_us: ((window_secs * 1_000_000.0) as u64).max(1),
            }),
        }
    }

    async fn try_acquire(&self) -> bool {
        let now = now_us();
        let mut w = self.inner.lock().await;

        // Idle for two or more windows: nothing from before overlaps.
        let behind = now.saturating_sub(w.window_start);
        if behind >= 2 * w.window_us {
            let skipped = behind / w.window_us;
            w.window_start += skipped * w.window_us;
            w.prev_count = 0;
            w.current_count = 0;
        } else if behind >= w.window_us {
            w.prev_count = w.current_count;
            w.current_count = 0;
            w.window_start += w.window_us;
        }

        let elapsed_in_window = now.saturating_sub(w.window_start);
        let weight = 1.0 - (elapsed_in_window as f64 / w.window_us as f64);
        let estimated = (w.prev_count as f64 * weight.max(0.0)) as u64 + w.current_count;

        if estimated < w.max_count {
            w.current_count += 1;
            true
        } else {
            false
        }
    }
}

/// Admission check for one request on `route`. Routes without a policy
/// always pass.
pub(crate) async fn rate_limit_on_request(
    limiter: &RateLimiter,
    route: &CompiledRoute,
) -> Result<(), GatewayError> {
    let Some(policy) = route.definition.rate_limit.as_ref() else {
        return Ok(());
    };

    if limiter.check(policy, route.key()).await {
        return Ok(());
    }

    tracing::debug!(
        "filter: rate_limit: rejected, route={}, mode={}",
        route.name,
        policy.mode.as_str()
    );
    metrics::counter!(
        "aegis_rate_limit_rejected_total",
        "route" => route.name.to_string(),
        "mode" => policy.mode.as_str(),
    )
    .increment(1);
    Err(GatewayError::RateLimitExceeded(route.name.to_string()))
}
