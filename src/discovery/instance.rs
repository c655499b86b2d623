use crate::config::ServiceDefinition;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum HealthStatus {
    Healthy = 0,
    Degraded = 1,
    Unhealthy = 2,
}

impl HealthStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Healthy and degraded instances still take traffic.
    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthStatus::Unhealthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One running copy of a `ServiceDefinition`.
///
/// Identity fields are immutable. Health fields are written by the health
/// monitor, `active_connections` by the load balancer and its callers.
#[derive(Debug)]
pub struct ServiceInstance {
    id: String,
    seq: u64,
    definition: Arc<ServiceDefinition>,
    registered_at: SystemTime,
    /// Pre-computed "host:port".
    endpoint: Arc<str>,
    weight: u32,

    status: AtomicU8,
    consecutive_failures: AtomicU32,
    /// f64 seconds stored as bits.
    response_time: AtomicU64,
    /// f64 in [0, 1] stored as bits.
    failure_rate: AtomicU64,
    latency_samples: AtomicU64,
    active_connections: AtomicUsize,
    draining: AtomicBool,
    /// Set once a health check has succeeded against this instance.
    checked: AtomicBool,
}

impl ServiceInstance {
    pub(crate) fn new(id: String, seq: u64, definition: Arc<ServiceDefinition>) -> Self {
        let endpoint: Arc<str> = format!("{}:{}", definition.host, definition.port).into();
        let weight = definition.weight();
        Self {
            id,
            seq,
            definition,
            registered_at: SystemTime::now(),
            endpoint,
            weight,
            status: AtomicU8::new(HealthStatus::Healthy as u8),
            consecutive_failures: AtomicU32::new(0),
            response_time: AtomicU64::new(0f64.to_bits()),
            failure_rate: AtomicU64::new(0f64.to_bits()),
            latency_samples: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            checked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Registration order, used to order candidates deterministically.
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &Arc<ServiceDefinition> {
        &self.definition
    }

    #[inline]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn host(&self) -> &str {
        &self.definition.host
    }

    pub fn port(&self) -> u16 {
        self.definition.port
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    pub fn has_tags(&self, tags: &[&str]) -> bool {
        tags.iter().all(|t| self.definition.tags.contains(*t))
    }

    // ---- Health state ----

    pub fn status(&self) -> HealthStatus {
        HealthStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Returns the previous status.
    pub(crate) fn set_status(&self, status: HealthStatus) -> HealthStatus {
        HealthStatus::from_u8(self.status.swap(status as u8, Ordering::AcqRel))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// EWMA of probe latency in seconds; 0 until the first successful probe.
    pub fn response_time(&self) -> f64 {
        f64::from_bits(self.response_time.load(Ordering::Relaxed))
    }

    /// EWMA of probe outcomes (1.0 = failure).
    pub fn failure_rate(&self) -> f64 {
        f64::from_bits(self.failure_rate.load(Ordering::Relaxed))
    }

    /// First sample seeds the average.
    pub(crate) fn observe_latency(&self, sample_secs: f64, alpha: f64) {
        let first = self.latency_samples.fetch_add(1, Ordering::AcqRel) == 0;
        let _ = self
            .response_time
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = if first {
                    sample_secs
                } else {
                    alpha * sample_secs + (1.0 - alpha) * f64::from_bits(bits)
                };
                Some(next.to_bits())
            });
    }

    pub(crate) fn observe_outcome(&self, failed: bool, alpha: f64) {
        let sample = if failed { 1.0 } else { 0.0 };
        let _ = self
            .failure_rate
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let next = alpha * sample + (1.0 - alpha) * f64::from_bits(bits);
                Some(next.to_bits())
            });
    }

    // ---- Connections ----

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_active(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero so a double release cannot wrap.
    pub(crate) fn dec_active(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    // ---- Lifecycle ----

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn mark_draining(&self) -> bool {
        !self.draining.swap(true, Ordering::AcqRel)
    }

    /// New instances are routable at once, but only count as a satisfied
    /// dependency after a real health check has passed.
    pub fn has_passed_check(&self) -> bool {
        self.checked.load(Ordering::Acquire)
    }

    pub(crate) fn mark_checked(&self) {
        self.checked.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let def = &self.definition;
        InstanceSnapshot {
            id: self.id.clone(),
            service: def.name.clone(),
            version: def.version.clone(),
            host: def.host.clone(),
            port: def.port,
            protocol: def.protocol.clone(),
            tags: def.tags.iter().cloned().collect(),
            dependencies: def.dependencies.iter().cloned().collect(),
            status: self.status(),
            consecutive_failures: self.consecutive_failures(),
            response_time_ms: self.response_time() * 1000.0,
            failure_rate: self.failure_rate(),
            active_connections: self.active_connections(),
            weight: self.weight,
            registered_at: humantime::format_rfc3339_seconds(self.registered_at).to_string(),
            draining: self.is_draining(),
            checked: self.has_passed_check(),
        }
    }
}

/// Read-only view served by the introspection endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub service: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub tags: Vec<String>,
    pub dependencies: Vec<String>,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub response_time_ms: f64,
    pub failure_rate: f64,
    pub active_connections: usize,
    pub weight: u32,
    pub registered_at: String,
    pub draining: bool,
    pub checked: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> ServiceInstance {
        let def = ServiceDefinition::new("auth", "10.0.0.1", 8001)
            .with_tag("critical")
            .with_metadata("weight", "4");
        ServiceInstance::new("auth-0000000000000001".into(), 1, Arc::new(def))
    }

    #[test]
    fn test_new_instance_starts_healthy() {
        let inst = instance();
        assert_eq!(inst.status(), HealthStatus::Healthy);
        assert_eq!(inst.consecutive_failures(), 0);
        assert_eq!(inst.endpoint(), "10.0.0.1:8001");
        assert_eq!(inst.weight(), 4);
        assert!(!inst.is_draining());
    }

    #[test]
    fn test_latency_ewma_seeds_then_smooths() {
        let inst = instance();
        inst.observe_latency(0.100, 0.5);
        assert!((inst.response_time() - 0.100).abs() < 1e-9);
        inst.observe_latency(0.300, 0.5);
        assert!((inst.response_time() - 0.200).abs() < 1e-9);
    }

    #[test]
    fn test_failure_rate_ewma() {
        let inst = instance();
        inst.observe_outcome(true, 0.5);
        assert!((inst.failure_rate() - 0.5).abs() < 1e-9);
        inst.observe_outcome(false, 0.5);
        assert!((inst.failure_rate() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_active_connections_saturate() {
        let inst = instance();
        inst.inc_active();
        inst.dec_active();
        inst.dec_active();
        assert_eq!(inst.active_connections(), 0);
    }

    #[test]
    fn test_tag_match_is_all_of() {
        let inst = instance();
        assert!(inst.has_tags(&[]));
        assert!(inst.has_tags(&["critical"]));
        assert!(!inst.has_tags(&["critical", "edge"]));
    }

    #[test]
    fn test_snapshot_serializes_status_lowercase() {
        let inst = instance();
        inst.set_status(HealthStatus::Degraded);
        let json = serde_json::to_value(inst.snapshot()).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["service"], "auth");
        assert_eq!(json["tags"][0], "critical");
        assert!(json["registered_at"].as_str().unwrap().ends_with('Z'));
    }
}
