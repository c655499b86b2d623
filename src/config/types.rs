use serde::{Deserialize, Deserializer, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

/// Deserialize a `T` that implements `Default`, treating `null` the same as
/// a missing field. Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Negative or NaN seconds collapse to zero instead of panicking in `Duration`.
pub(crate) fn secs(v: f64) -> Duration {
    if v.is_finite() && v > 0.0 {
        Duration::from_secs_f64(v)
    } else {
        Duration::ZERO
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub manager: ManagerConfig,

    /// Services registered at boot, in dependency order.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<ServiceDefinition>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Upper bound on draining in-flight requests at shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "127.0.0.1:9090".to_string()
}

fn default_shutdown_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_hc_interval")]
    pub interval_secs: f64,

    #[serde(default = "default_hc_timeout")]
    pub timeout_secs: f64,

    /// Consecutive failures before healthy -> degraded.
    #[serde(default = "default_degrade_threshold")]
    pub degrade_threshold: u32,

    /// Consecutive failures before degraded -> unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive failures before the instance is dropped from the registry.
    /// 0 disables auto-removal.
    #[serde(default = "default_removal_threshold")]
    pub removal_threshold: u32,

    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_hc_interval(),
            timeout_secs: default_hc_timeout(),
            degrade_threshold: default_degrade_threshold(),
            unhealthy_threshold: default_unhealthy_threshold(),
            removal_threshold: default_removal_threshold(),
            ewma_alpha: default_ewma_alpha(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }
}

fn default_hc_interval() -> f64 {
    30.0
}

fn default_hc_timeout() -> f64 {
    5.0
}

fn default_degrade_threshold() -> u32 {
    2
}

fn default_unhealthy_threshold() -> u32 {
    5
}

fn default_removal_threshold() -> u32 {
    10
}

fn default_ewma_alpha() -> f64 {
    0.3
}

/// State machine: Closed -> Open -> HalfOpen -> Closed/Open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_cb_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cb_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_cb_recovery_timeout")]
    pub recovery_timeout_secs: f64,

    /// Failures older than this no longer count toward `failure_threshold`.
    #[serde(default = "default_cb_monitoring_period")]
    pub monitoring_period_secs: f64,

    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,

    /// Timeout applied by `execute` when the caller does not pass one.
    #[serde(default = "default_cb_call_timeout")]
    pub call_timeout_secs: f64,

    /// Per-service overrides keyed by service name.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub overrides: HashMap<String, BreakerOverride>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_cb_failure_threshold(),
            success_threshold: default_cb_success_threshold(),
            recovery_timeout_secs: default_cb_recovery_timeout(),
            monitoring_period_secs: default_cb_monitoring_period(),
            half_open_max_calls: default_half_open_max_calls(),
            call_timeout_secs: default_cb_call_timeout(),
            overrides: HashMap::new(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Global defaults with the named service's override applied on top.
    pub fn for_service(&self, name: &str) -> CircuitBreakerConfig {
        let mut out = CircuitBreakerConfig {
            overrides: HashMap::new(),
            ..self.clone()
        };
        if let Some(o) = self.overrides.get(name) {
            if let Some(v) = o.failure_threshold {
                out.failure_threshold = v;
            }
            if let Some(v) = o.success_threshold {
                out.success_threshold = v;
            }
            if let Some(v) = o.recovery_timeout_secs {
                out.recovery_timeout_secs = v;
            }
            if let Some(v) = o.monitoring_period_secs {
                out.monitoring_period_secs = v;
            }
            if let Some(v) = o.half_open_max_calls {
                out.half_open_max_calls = v;
            }
            if let Some(v) = o.call_timeout_secs {
                out.call_timeout_secs = v;
            }
        }
        out
    }

    pub fn recovery_timeout(&self) -> Duration {
        secs(self.recovery_timeout_secs)
    }

    pub fn monitoring_period(&self) -> Duration {
        secs(self.monitoring_period_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerOverride {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub success_threshold: Option<u32>,
    #[serde(default)]
    pub recovery_timeout_secs: Option<f64>,
    #[serde(default)]
    pub monitoring_period_secs: Option<f64>,
    #[serde(default)]
    pub half_open_max_calls: Option<u32>,
    #[serde(default)]
    pub call_timeout_secs: Option<f64>,
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_success_threshold() -> u32 {
    3
}

fn default_cb_recovery_timeout() -> f64 {
    60.0
}

fn default_cb_monitoring_period() -> f64 {
    60.0
}

fn default_half_open_max_calls() -> u32 {
    1
}

fn default_cb_call_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    /// "round_robin", "least_connections", "weighted_round_robin", "random", "health_based".
    #[serde(default = "default_strategy")]
    pub strategy: String,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
        }
    }
}

fn default_strategy() -> String {
    "health_based".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Deregistered instances stay visible (but draining) for this long.
    #[serde(default)]
    pub decommission_grace_secs: f64,
}

impl RegistryConfig {
    pub fn decommission_grace(&self) -> Duration {
        secs(self.decommission_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How often `start_service` re-checks a dependency that is not yet healthy.
    #[serde(default = "default_dependency_poll")]
    pub dependency_poll_interval_secs: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dependency_poll_interval_secs: default_dependency_poll(),
        }
    }
}

impl ManagerConfig {
    pub fn dependency_poll_interval(&self) -> Duration {
        secs(self.dependency_poll_interval_secs).max(Duration::from_millis(10))
    }
}

fn default_dependency_poll() -> f64 {
    0.25
}

/// Static description of a logical service, registered once per instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub host: String,

    pub port: u16,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tags: BTreeSet<String>,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub dependencies: BTreeSet<String>,

    /// Routes the service declares for itself; registered with the gateway
    /// when the service starts.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteDefinition>,

    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: f64,

    #[serde(default = "default_service_shutdown_timeout")]
    pub shutdown_timeout_secs: f64,

    /// Overrides `health.timeout_secs` for this service.
    #[serde(default)]
    pub probe_timeout_secs: Option<f64>,

    /// Overrides `health.interval_secs` for this service.
    #[serde(default)]
    pub health_interval_secs: Option<f64>,

    /// Free-form; `weight` feeds weighted round robin.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub metadata: HashMap<String, String>,
}

impl ServiceDefinition {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            host: host.into(),
            port,
            protocol: default_protocol(),
            health_path: default_health_path(),
            tags: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            routes: Vec::new(),
            startup_timeout_secs: default_startup_timeout(),
            shutdown_timeout_secs: default_service_shutdown_timeout(),
            probe_timeout_secs: None,
            health_interval_secs: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// `metadata["weight"]` parsed as an integer; missing or invalid means 1.
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|w| w.trim().parse::<u32>().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }

    pub fn startup_timeout(&self) -> Duration {
        secs(self.startup_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        secs(self.shutdown_timeout_secs)
    }

    pub fn health_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.health_path
        )
    }

    pub fn endpoint_key(&self) -> String {
        format!("{}@{}:{}", self.name, self.host, self.port)
    }
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_startup_timeout() -> f64 {
    60.0
}

fn default_service_shutdown_timeout() -> f64 {
    30.0
}

/// Path pattern + method -> service, with optional rewrite and rate limit.
///
/// Patterns: exact (`/api/x`), prefix (`/api/x/*`) and catch-all (`/*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    #[serde(default)]
    pub name: String,

    pub path: String,

    /// `*` or empty matches every method.
    #[serde(default = "default_method")]
    pub method: String,

    pub service: String,

    /// Replaces the matched prefix when forwarding.
    #[serde(default)]
    pub target_path: Option<String>,

    #[serde(default = "default_route_timeout")]
    pub timeout_secs: f64,

    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
}

impl RouteDefinition {
    pub fn new(path: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: String::new(),
            path: path.into(),
            method: default_method(),
            service: service.into(),
            target_path: None,
            timeout_secs: default_route_timeout(),
            rate_limit: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    /// Name used for stats and metric labels. Unnamed routes fall back to
    /// the path, prefixed by the method when the route is method-specific.
    pub fn display_name(&self) -> Cow<'_, str> {
        if !self.name.is_empty() {
            return Cow::Borrowed(&self.name);
        }
        match self.method.trim() {
            "" | "*" => Cow::Borrowed(&self.path),
            m => Cow::Owned(format!("{} {}", m.to_ascii_uppercase(), self.path)),
        }
    }
}

fn default_method() -> String {
    "*".to_string()
}

fn default_route_timeout() -> f64 {
    30.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Smooth rate with burst.
    #[serde(alias = "req")]
    TokenBucket,
    /// Count per window with previous-window blending.
    #[serde(alias = "count")]
    SlidingWindow,
}

impl RateLimitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitMode::TokenBucket => "token_bucket",
            RateLimitMode::SlidingWindow => "sliding_window",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    #[serde(default = "default_limit_mode")]
    pub mode: RateLimitMode,

    /// Tokens per second (token bucket).
    #[serde(default)]
    pub rate: Option<f64>,

    #[serde(default)]
    pub burst: Option<u64>,

    /// Requests per window (sliding window).
    #[serde(default)]
    pub count: Option<u64>,

    #[serde(default)]
    pub time_window_secs: Option<f64>,
}

impl RateLimitPolicy {
    pub fn token_bucket(rate: f64, burst: u64) -> Self {
        Self {
            mode: RateLimitMode::TokenBucket,
            rate: Some(rate),
            burst: Some(burst),
            count: None,
            time_window_secs: None,
        }
    }

    pub fn sliding_window(count: u64, window_secs: f64) -> Self {
        Self {
            mode: RateLimitMode::SlidingWindow,
            rate: None,
            burst: None,
            count: Some(count),
            time_window_secs: Some(window_secs),
        }
    }
}

fn default_limit_mode() -> RateLimitMode {
    RateLimitMode::TokenBucket
}
