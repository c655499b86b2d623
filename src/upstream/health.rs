use crate::config::types::secs;
use crate::config::HealthConfig;
use crate::discovery::{HealthStatus, ServiceInstance, ServiceRegistry};
use crate::error::GatewayError;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tag that marks a service as critical for the system rollup.
pub const CRITICAL_TAG: &str = "critical";

/// Caps fan-out of an on-demand `check_all` round.
const CHECK_ALL_CONCURRENCY: usize = 64;

/// Periodic active probing of every registered instance.
///
/// Each monitored instance gets its own timer task holding a child of one
/// root `CancellationToken`, so `shutdown` stops every probe in one pass.
pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    config: HealthConfig,
    client: reqwest::Client,
    timers: DashMap<String, MonitorTask>,
    root: CancellationToken,
    total_probes: AtomicU64,
    failed_probes: AtomicU64,
    auto_removals: AtomicU64,
}

struct MonitorTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub enum ProbeOutcome {
    Success { latency: Duration },
    /// `ProbeTimeout`, `UpstreamConnect` or `Upstream(status)`.
    Failure(GatewayError),
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStats {
    pub total_probes: u64,
    pub failed_probes: u64,
    pub success_rate: f64,
    pub instances_monitored: usize,
    pub auto_removals: u64,
    pub interval_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub critical: bool,
    pub instances: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

/// Derived on demand from current instance statuses; never stored.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthSnapshot {
    pub status: HealthStatus,
    pub services: BTreeMap<String, ServiceHealth>,
    pub checked_at: String,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServiceRegistry>, config: HealthConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .no_proxy()
            .build()
            .map_err(|e| GatewayError::Config(format!("health check client: {e}")))?;
        Ok(Self {
            registry,
            config,
            client,
            timers: DashMap::new(),
            root: CancellationToken::new(),
            total_probes: AtomicU64::new(0),
            failed_probes: AtomicU64::new(0),
            auto_removals: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Start (or restart) the timer for one instance. The first probe runs
    /// immediately. No-op once the monitor has been shut down.
    pub fn start_monitoring(self: &Arc<Self>, instance: Arc<ServiceInstance>) {
        if self.root.is_cancelled() {
            return;
        }
        self.timers.retain(|_, t| !t.handle.is_finished());

        let interval = instance
            .definition()
            .health_interval_secs
            .map(secs)
            .unwrap_or_else(|| self.config.interval())
            .max(Duration::from_millis(1));
        let token = self.root.child_token();
        let id = instance.id().to_string();

        let handle = {
            let monitor = self.clone();
            let token = token.clone();
            tokio::spawn(async move { monitor.run_timer(instance, interval, token).await })
        };

        if let Some(old) = self.timers.insert(id.clone(), MonitorTask { token, handle }) {
            old.token.cancel();
        }
        debug!("health: monitoring started, instance={}, interval={:?}", id, interval);
    }

    /// Cancel one instance's timer and wait for any in-flight probe to finish,
    /// so no observation lands after this returns.
    pub async fn stop_monitoring(&self, instance_id: &str) -> bool {
        let Some((_, task)) = self.timers.remove(instance_id) else {
            return false;
        };
        task.token.cancel();
        let _ = task.handle.await;
        debug!("health: monitoring stopped, instance={}", instance_id);
        true
    }

    /// Stop every timer. Observations are frozen once this returns.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0usize;
        for id in ids {
            if let Some((_, task)) = self.timers.remove(&id) {
                let _ = task.handle.await;
                stopped += 1;
            }
        }
        info!("health: monitor stopped, tasks={}", stopped);
    }

    pub fn is_shut_down(&self) -> bool {
        self.root.is_cancelled()
    }

    async fn run_timer(
        self: Arc<Self>,
        instance: Arc<ServiceInstance>,
        interval: Duration,
        token: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if instance.is_draining() || self.registry.get(instance.id()).is_none() {
                break;
            }
            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                outcome = self.probe_instance(&instance) => outcome,
            };
            if token.is_cancelled() {
                break;
            }
            self.record_probe(&instance, outcome);
        }
    }

    /// One bounded-timeout GET against the instance's health endpoint.
    /// 2xx is success; anything else, including timeouts, is a failure.
    pub async fn probe_instance(&self, instance: &ServiceInstance) -> ProbeOutcome {
        let def = instance.definition();
        let timeout = def
            .probe_timeout_secs
            .map(secs)
            .unwrap_or_else(|| self.config.timeout());
        let started = Instant::now();

        let request = self.client.get(def.health_url()).timeout(timeout).send();
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(resp)) if resp.status().is_success() => ProbeOutcome::Success {
                latency: started.elapsed(),
            },
            Ok(Ok(resp)) => ProbeOutcome::Failure(GatewayError::Upstream(resp.status().as_u16())),
            Ok(Err(e)) if e.is_timeout() => ProbeOutcome::Failure(GatewayError::ProbeTimeout(timeout)),
            Ok(Err(e)) => ProbeOutcome::Failure(GatewayError::UpstreamConnect(e.to_string())),
            Err(_) => ProbeOutcome::Failure(GatewayError::ProbeTimeout(timeout)),
        }
    }

    /// Apply one probe result to the instance's health state machine and
    /// return the resulting status.
    ///
    /// Consecutive failures move healthy -> degraded at `degrade_threshold`
    /// and degraded -> unhealthy at `unhealthy_threshold`; any success returns
    /// the instance to healthy. At `removal_threshold` the instance is
    /// deregistered.
    pub fn record_probe(&self, instance: &ServiceInstance, outcome: ProbeOutcome) -> HealthStatus {
        self.total_probes.fetch_add(1, Ordering::Relaxed);
        let alpha = self.config.ewma_alpha;
        let service = instance.name().to_string();

        match outcome {
            ProbeOutcome::Success { latency } => {
                instance.reset_failures();
                instance.observe_latency(latency.as_secs_f64(), alpha);
                instance.observe_outcome(false, alpha);
                instance.mark_checked();
                let prev = instance.set_status(HealthStatus::Healthy);
                if prev != HealthStatus::Healthy {
                    info!(
                        "health: instance recovered, service={}, instance={}, previous={}",
                        service,
                        instance.id(),
                        prev
                    );
                }
                metrics::counter!("aegis_health_check_total", "service" => service.clone(), "result" => "success")
                    .increment(1);
                metrics::histogram!("aegis_service_response_time_seconds", "service" => service.clone())
                    .record(latency.as_secs_f64());
                metrics::gauge!("aegis_service_health", "service" => service, "instance" => instance.id().to_string())
                    .set(1.0);
                HealthStatus::Healthy
            }
            ProbeOutcome::Failure(err) => {
                self.failed_probes.fetch_add(1, Ordering::Relaxed);
                let failures = instance.record_failure();
                instance.observe_outcome(true, alpha);

                let next = if failures >= self.config.unhealthy_threshold {
                    HealthStatus::Unhealthy
                } else if failures >= self.config.degrade_threshold {
                    HealthStatus::Degraded
                } else {
                    instance.status()
                };
                let prev = instance.set_status(next);
                if prev != next {
                    warn!(
                        "health: instance {}, service={}, instance={}, consecutive_failures={}, error={}",
                        next,
                        service,
                        instance.id(),
                        failures,
                        err
                    );
                } else {
                    debug!(
                        "health: probe failed, service={}, instance={}, consecutive_failures={}, error={}",
                        service,
                        instance.id(),
                        failures,
                        err
                    );
                }
                metrics::counter!("aegis_health_check_total", "service" => service.clone(), "result" => "failure")
                    .increment(1);
                metrics::gauge!("aegis_service_health", "service" => service.clone(), "instance" => instance.id().to_string())
                    .set(0.0);

                let removal = self.config.removal_threshold;
                if removal > 0 && failures >= removal && self.registry.deregister(instance.id()).is_ok() {
                    self.auto_removals.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "health: instance removed, service={}, instance={}, consecutive_failures={}",
                        service,
                        instance.id(),
                        failures
                    );
                }
                next
            }
        }
    }

    /// Probe every registered, non-draining instance once, right now.
    pub async fn check_all(&self) {
        let instances: Vec<_> = self
            .registry
            .all_instances()
            .into_iter()
            .filter(|i| !i.is_draining())
            .collect();
        stream::iter(instances)
            .map(|inst| async move {
                let outcome = self.probe_instance(&inst).await;
                self.record_probe(&inst, outcome);
            })
            .buffer_unordered(CHECK_ALL_CONCURRENCY)
            .collect::<()>()
            .await;
    }

    /// Per-service rollup plus an overall status: unhealthy if any critical
    /// service is impaired, degraded if only non-critical ones are.
    pub fn system_health(&self) -> SystemHealthSnapshot {
        let mut services: BTreeMap<String, ServiceHealth> = BTreeMap::new();
        for inst in self.registry.all_instances() {
            if inst.is_draining() {
                continue;
            }
            let entry = services
                .entry(inst.name().to_string())
                .or_insert(ServiceHealth {
                    status: HealthStatus::Unhealthy,
                    critical: false,
                    instances: 0,
                    healthy: 0,
                    degraded: 0,
                    unhealthy: 0,
                });
            entry.instances += 1;
            entry.critical |= inst.definition().tags.contains(CRITICAL_TAG);
            match inst.status() {
                HealthStatus::Healthy => entry.healthy += 1,
                HealthStatus::Degraded => entry.degraded += 1,
                HealthStatus::Unhealthy => entry.unhealthy += 1,
            }
        }

        let mut overall = HealthStatus::Healthy;
        for svc in services.values_mut() {
            svc.status = if svc.healthy > 0 {
                HealthStatus::Healthy
            } else if svc.degraded > 0 {
                HealthStatus::Degraded
            } else {
                HealthStatus::Unhealthy
            };
            if svc.status != HealthStatus::Healthy {
                let impact = if svc.critical {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
                overall = overall.max(impact);
            }
        }

        SystemHealthSnapshot {
            status: overall,
            services,
            checked_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
        }
    }

    pub fn stats(&self) -> MonitorStats {
        let total = self.total_probes.load(Ordering::Relaxed);
        let failed = self.failed_probes.load(Ordering::Relaxed);
        MonitorStats {
            total_probes: total,
            failed_probes: failed,
            success_rate: if total == 0 {
                1.0
            } else {
                (total - failed) as f64 / total as f64
            },
            instances_monitored: self
                .timers
                .iter()
                .filter(|t| !t.value().handle.is_finished())
                .count(),
            auto_removals: self.auto_removals.load(Ordering::Relaxed),
            interval_secs: self.config.interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceDefinition;

    fn monitor(removal: u32) -> (Arc<ServiceRegistry>, Arc<HealthMonitor>) {
        let registry = Arc::new(ServiceRegistry::default());
        let config = HealthConfig {
            degrade_threshold: 2,
            unhealthy_threshold: 4,
            removal_threshold: removal,
            ewma_alpha: 0.5,
            ..Default::default()
        };
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), config).unwrap());
        (registry, monitor)
    }

    fn fail() -> ProbeOutcome {
        ProbeOutcome::Failure(GatewayError::UpstreamConnect("refused".into()))
    }

    fn ok(ms: u64) -> ProbeOutcome {
        ProbeOutcome::Success {
            latency: Duration::from_millis(ms),
        }
    }

    #[test]
    fn test_transitions_pass_through_degraded() {
        let (registry, monitor) = monitor(0);
        let id = registry
            .register(ServiceDefinition::new("x", "127.0.0.1", 1))
            .unwrap();
        let inst = registry.get(&id).unwrap();

        let seen: Vec<HealthStatus> = (0..6).map(|_| monitor.record_probe(&inst, fail())).collect();
        assert_eq!(
            seen,
            vec![
                HealthStatus::Healthy,
                HealthStatus::Degraded,
                HealthStatus::Degraded,
                HealthStatus::Unhealthy,
                HealthStatus::Unhealthy,
                HealthStatus::Unhealthy,
            ]
        );
        assert_eq!(inst.consecutive_failures(), 6);
    }

    #[test]
    fn test_single_success_resets_to_healthy() {
        let (registry, monitor) = monitor(0);
        let id = registry
            .register(ServiceDefinition::new("x", "127.0.0.1", 1))
            .unwrap();
        let inst = registry.get(&id).unwrap();
        for _ in 0..5 {
            monitor.record_probe(&inst, fail());
        }
        assert_eq!(inst.status(), HealthStatus::Unhealthy);

        assert_eq!(monitor.record_probe(&inst, ok(10)), HealthStatus::Healthy);
        assert_eq!(inst.consecutive_failures(), 0);
        // Next failure run starts from scratch.
        assert_eq!(monitor.record_probe(&inst, fail()), HealthStatus::Healthy);
    }

    #[test]
    fn test_only_success_marks_instance_checked() {
        let (registry, monitor) = monitor(0);
        let id = registry
            .register(ServiceDefinition::new("x", "127.0.0.1", 1))
            .unwrap();
        let inst = registry.get(&id).unwrap();
        assert_eq!(inst.status(), HealthStatus::Healthy);
        assert!(!inst.has_passed_check());

        monitor.record_probe(&inst, fail());
        assert!(!inst.has_passed_check());

        monitor.record_probe(&inst, ok(5));
        assert!(inst.has_passed_check());
        // A later failure does not clear it; status carries the current view.
        monitor.record_probe(&inst, fail());
        assert!(inst.has_passed_check());
    }

    #[test]
    fn test_latency_ewma_from_probes() {
        let (registry, monitor) = monitor(0);
        let id = registry
            .register(ServiceDefinition::new("x", "127.0.0.1", 1))
            .unwrap();
        let inst = registry.get(&id).unwrap();
        monitor.record_probe(&inst, ok(100));
        monitor.record_probe(&inst, ok(200));
        assert!((inst.response_time() - 0.150).abs() < 1e-6);
        monitor.record_probe(&inst, fail());
        assert!((inst.response_time() - 0.150).abs() < 1e-6);
        assert!(inst.failure_rate() > 0.0);
    }

    #[test]
    fn test_auto_removal_after_threshold() {
        let (registry, monitor) = monitor(6);
        let id = registry
            .register(ServiceDefinition::new("x", "127.0.0.1", 1))
            .unwrap();
        let inst = registry.get(&id).unwrap();
        for _ in 0..5 {
            monitor.record_probe(&inst, fail());
        }
        assert!(registry.get(&id).is_some());
        monitor.record_probe(&inst, fail());
        assert!(registry.get(&id).is_none());
        assert_eq!(monitor.stats().auto_removals, 1);
        assert_eq!(monitor.stats().failed_probes, 6);
    }

    #[test]
    fn test_system_health_rollup() {
        let (registry, monitor) = monitor(0);
        let auth = registry
            .register(ServiceDefinition::new("auth", "127.0.0.1", 1).with_tag(CRITICAL_TAG))
            .unwrap();
        let search = registry
            .register(ServiceDefinition::new("search", "127.0.0.1", 2))
            .unwrap();
        registry
            .register(ServiceDefinition::new("search", "127.0.0.1", 3))
            .unwrap();

        assert_eq!(monitor.system_health().status, HealthStatus::Healthy);

        // One of two search instances down: service still healthy.
        registry.get(&search).unwrap().set_status(HealthStatus::Unhealthy);
        let snap = monitor.system_health();
        assert_eq!(snap.services["search"].status, HealthStatus::Healthy);
        assert_eq!(snap.status, HealthStatus::Healthy);

        for inst in registry.instances_of("search") {
            inst.set_status(HealthStatus::Unhealthy);
        }
        assert_eq!(monitor.system_health().status, HealthStatus::Degraded);

        registry.get(&auth).unwrap().set_status(HealthStatus::Degraded);
        let snap = monitor.system_health();
        assert_eq!(snap.services["auth"].status, HealthStatus::Degraded);
        assert!(snap.services["auth"].critical);
        assert_eq!(snap.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_probe_unreachable_is_failure() {
        let (registry, monitor) = monitor(0);
        // Port 9 on localhost: nothing listens.
        let mut def = ServiceDefinition::new("x", "127.0.0.1", 9);
        def.probe_timeout_secs = Some(0.5);
        let id = registry.register(def).unwrap();
        let inst = registry.get(&id).unwrap();
        assert!(matches!(
            monitor.probe_instance(&inst).await,
            ProbeOutcome::Failure(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_and_shutdown_cancel_timers() {
        let (registry, monitor) = monitor(0);
        let mut def = ServiceDefinition::new("x", "127.0.0.1", 9);
        def.health_interval_secs = Some(3600.0);
        def.probe_timeout_secs = Some(0.2);
        let a = registry.register(def.clone()).unwrap();
        def.port = 10;
        let b = registry.register(def).unwrap();

        monitor.start_monitoring(registry.get(&a).unwrap());
        monitor.start_monitoring(registry.get(&b).unwrap());
        assert_eq!(monitor.stats().instances_monitored, 2);

        assert!(monitor.stop_monitoring(&a).await);
        assert!(!monitor.stop_monitoring(&a).await);

        monitor.shutdown().await;
        assert!(monitor.is_shut_down());
        assert_eq!(monitor.stats().instances_monitored, 0);

        // Further starts are ignored after shutdown.
        monitor.start_monitoring(registry.get(&b).unwrap());
        assert_eq!(monitor.stats().instances_monitored, 0);
    }
}
