use crate::config::CircuitBreakerConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

/// Circuit breaker state machine: Closed -> Open -> HalfOpen -> Closed/Open.
///
/// Service granularity: one breaker per logical service name, created lazily
/// on the first tracked call and never removed, only reset.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    defaults: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    fn gauge(&self) -> f64 {
        match self {
            BreakerState::Closed => 0.0,
            BreakerState::Open => 1.0,
            BreakerState::HalfOpen => 2.0,
        }
    }
}

/// Result of asking the breaker for permission before a call.
pub enum BreakerCheck {
    /// Closed: proceed normally.
    Allowed(Permit),
    /// Half-open: this call is the trial.
    Probe(Permit),
    /// Open, or a trial is already in flight.
    Rejected,
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit open for service: {0}")]
    Open(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call failed: {0}")]
    Inner(E),
}

pub struct CircuitBreaker {
    name: String,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    timeouts: AtomicU64,
}

struct BreakerInner {
    state: BreakerState,
    /// Failure timestamps inside the monitoring period (closed state only).
    failures: VecDeque<Instant>,
    half_open_successes: u32,
    trials_in_flight: u32,
    changed_at: Instant,
    changed_at_wall: SystemTime,
    config: CircuitBreakerConfig,
}

/// Outstanding permission for one call. Report the outcome with
/// [`Permit::success`] or [`Permit::failure`]; dropping an unreported trial
/// frees its half-open slot without counting either way.
pub struct Permit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    reported: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub service: String,
    pub state: BreakerState,
    pub failures_in_window: usize,
    pub half_open_successes: u32,
    pub total_calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub timeouts: u64,
    pub last_state_change: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerHealthSummary {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub open_circuits: Vec<String>,
    /// healthy (none open), degraded (some open), unhealthy (all open).
    pub status: &'static str,
}

impl CircuitBreakerManager {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
        }
    }

    /// Run `call` under the named breaker with a deadline. `None` uses the
    /// service's configured call timeout. Errors and timeouts both count as
    /// failures; an open breaker never invokes `call`.
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        call: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.breaker(name);
        let permit = match breaker.check() {
            BreakerCheck::Allowed(p) | BreakerCheck::Probe(p) => p,
            BreakerCheck::Rejected => return Err(BreakerError::Open(name.to_string())),
        };

        let timeout = timeout.unwrap_or_else(|| breaker.config().call_timeout());
        match tokio::time::timeout(timeout, call()).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                breaker.timeouts.fetch_add(1, Ordering::Relaxed);
                permit.failure();
                Err(BreakerError::Timeout(timeout))
            }
        }
    }

    /// Ask for permission without running anything, for callers that drive
    /// the call themselves.
    pub fn check(&self, name: &str) -> BreakerCheck {
        self.breaker(name).check()
    }

    /// Open and still inside the recovery timeout. A breaker whose recovery
    /// has elapsed reports `false` so the next call can become the trial.
    pub fn is_open(&self, name: &str) -> bool {
        self.breakers
            .get(name)
            .map(|b| b.value().is_open())
            .unwrap_or(false)
    }

    pub fn state(&self, name: &str) -> BreakerState {
        self.breakers
            .get(name)
            .map(|b| b.value().state())
            .unwrap_or(BreakerState::Closed)
    }

    /// Replace a service's thresholds. State and counters are kept.
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) {
        let breaker = self.breaker(name);
        breaker.lock().config = config;
    }

    /// Force the breaker closed and clear its counters. Returns `false` if the
    /// service never had a breaker.
    pub fn reset(&self, name: &str) -> bool {
        let Some(breaker) = self.breakers.get(name).map(|b| b.value().clone()) else {
            return false;
        };
        {
            let mut inner = breaker.lock();
            inner.failures.clear();
            inner.half_open_successes = 0;
            inner.trials_in_flight = 0;
            breaker.transition(&mut inner, BreakerState::Closed);
        }
        tracing::info!("circuit_breaker: reset, service={}", name);
        true
    }

    pub fn stats(&self) -> Vec<BreakerStats> {
        let mut out: Vec<BreakerStats> = self.breakers.iter().map(|b| b.value().stats()).collect();
        out.sort_by(|a, b| a.service.cmp(&b.service));
        out
    }

    pub fn health_summary(&self) -> BreakerHealthSummary {
        let mut summary = BreakerHealthSummary {
            total: 0,
            closed: 0,
            open: 0,
            half_open: 0,
            open_circuits: Vec::new(),
            status: "healthy",
        };
        for entry in self.breakers.iter() {
            summary.total += 1;
            match entry.value().state() {
                BreakerState::Closed => summary.closed += 1,
                BreakerState::HalfOpen => summary.half_open += 1,
                BreakerState::Open => {
                    summary.open += 1;
                    summary.open_circuits.push(entry.key().clone());
                }
            }
        }
        summary.open_circuits.sort();
        summary.status = if summary.open == 0 {
            "healthy"
        } else if summary.open < summary.total {
            "degraded"
        } else {
            "unhealthy"
        };
        summary
    }

    fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        // Fast path: key already exists, no allocation.
        if let Some(entry) = self.breakers.get(name) {
            return entry.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.defaults.for_service(name))))
            .clone()
    }
}

impl CircuitBreaker {
    fn new(name: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                half_open_successes: 0,
                trials_in_flight: 0,
                changed_at: Instant::now(),
                changed_at_wall: SystemTime::now(),
                config,
            }),
            total_calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn config(&self) -> CircuitBreakerConfig {
        self.lock().config.clone()
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn is_open(&self) -> bool {
        let inner = self.lock();
        inner.state == BreakerState::Open
            && inner.changed_at.elapsed() < inner.config.recovery_timeout()
    }

    fn check(self: &Arc<Self>) -> BreakerCheck {
        let mut inner = self.lock();
        let state = inner.state;
        let trial = match state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                if inner.changed_at.elapsed() >= inner.config.recovery_timeout()
                    && inner.trials_in_flight < inner.config.half_open_max_calls
                {
                    inner.half_open_successes = 0;
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    true
                } else {
                    drop(inner);
                    return self.reject();
                }
            }
            BreakerState::HalfOpen => {
                if inner.trials_in_flight < inner.config.half_open_max_calls {
                    true
                } else {
                    drop(inner);
                    return self.reject();
                }
            }
        };
        if trial {
            inner.trials_in_flight += 1;
        }
        drop(inner);

        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let permit = Permit {
            breaker: self.clone(),
            trial,
            reported: false,
        };
        if trial {
            BreakerCheck::Probe(permit)
        } else {
            BreakerCheck::Allowed(permit)
        }
    }

    fn reject(&self) -> BreakerCheck {
        self.rejections.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aegis_circuit_breaker_rejected_total", "service" => self.name.clone())
            .increment(1);
        BreakerCheck::Rejected
    }

    fn on_success(&self, trial: bool) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        if !trial {
            // Closed-state successes leave the failure window alone; failures
            // age out of it instead.
            return;
        }
        inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        if inner.state != BreakerState::HalfOpen {
            return;
        }
        inner.half_open_successes += 1;
        if inner.half_open_successes >= inner.config.success_threshold {
            let count = inner.half_open_successes;
            inner.failures.clear();
            inner.half_open_successes = 0;
            self.transition(&mut inner, BreakerState::Closed);
            tracing::info!(
                "circuit_breaker: closed, service={}, recovered_after={} successes",
                self.name,
                count
            );
        }
    }

    fn on_failure(&self, trial: bool) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        let now = Instant::now();

        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
            if inner.state == BreakerState::HalfOpen {
                inner.half_open_successes = 0;
                self.transition(&mut inner, BreakerState::Open);
                tracing::warn!(
                    "circuit_breaker: re-opened, service={}, trial failed in half-open",
                    self.name
                );
            }
            return;
        }

        // Failures that land after the breaker already left Closed belong to
        // calls admitted earlier and do not move the state machine.
        if inner.state != BreakerState::Closed {
            return;
        }
        let period = inner.config.monitoring_period();
        inner.failures.push_back(now);
        while let Some(&oldest) = inner.failures.front() {
            if now.duration_since(oldest) > period {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
        let count = inner.failures.len();
        if count >= inner.config.failure_threshold as usize {
            inner.failures.clear();
            self.transition(&mut inner, BreakerState::Open);
            tracing::warn!(
                "circuit_breaker: opened, service={}, failures={} within {:?}",
                self.name,
                count,
                period
            );
        }
    }

    fn release_trial(&self) {
        let mut inner = self.lock();
        inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        inner.state = to;
        inner.changed_at = Instant::now();
        inner.changed_at_wall = SystemTime::now();
        metrics::gauge!("aegis_circuit_breaker_state", "service" => self.name.clone())
            .set(to.gauge());
    }

    fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            service: self.name.clone(),
            state: inner.state,
            failures_in_window: inner.failures.len(),
            half_open_successes: inner.half_open_successes,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            last_state_change: humantime::format_rfc3339_millis(inner.changed_at_wall).to_string(),
        }
    }
}

impl Permit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.reported && self.trial {
            self.breaker.release_trial();
        }
    }
}
