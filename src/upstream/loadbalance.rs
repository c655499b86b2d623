pub mod health_based;
pub mod least_conn;
pub mod random;
pub mod round_robin;
pub mod weighted_round_robin;

use crate::discovery::{ServiceInstance, ServiceRegistry};
use crate::error::GatewayError;
use crate::upstream::circuit_breaker::CircuitBreakerManager;
use dashmap::DashMap;
use health_based::HealthBasedBalancer;
use least_conn::LeastConnBalancer;
use random::RandomBalancer;
use round_robin::RoundRobinBalancer;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use weighted_round_robin::WeightedRoundRobinBalancer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
    HealthBased,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::RoundRobin,
        Strategy::LeastConnections,
        Strategy::WeightedRoundRobin,
        Strategy::Random,
        Strategy::HealthBased,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::RoundRobin => "round_robin",
            Strategy::LeastConnections => "least_connections",
            Strategy::WeightedRoundRobin => "weighted_round_robin",
            Strategy::Random => "random",
            Strategy::HealthBased => "health_based",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::HealthBased
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(Strategy::RoundRobin),
            "least_connections" | "least_conn" => Ok(Strategy::LeastConnections),
            "weighted_round_robin" | "wrr" => Ok(Strategy::WeightedRoundRobin),
            "random" => Ok(Strategy::Random),
            "health_based" | "health" => Ok(Strategy::HealthBased),
            other => Err(format!("unknown load balancing strategy: {other}")),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-service rotation state shared by the cyclic strategies. The counter
/// restarts whenever the eligible instance set changes.
#[derive(Default)]
pub(crate) struct SelectionCursor {
    cursors: DashMap<String, Cursor>,
}

struct Cursor {
    fingerprint: u64,
    next: u64,
}

impl SelectionCursor {
    /// Returns the rotation position for this call and advances it.
    pub(crate) fn advance(&self, service: &str, candidates: &[Arc<ServiceInstance>]) -> u64 {
        let fingerprint = fingerprint(candidates);
        let mut entry = self.cursors.entry(service.to_string()).or_insert(Cursor {
            fingerprint,
            next: 0,
        });
        if entry.fingerprint != fingerprint {
            entry.fingerprint = fingerprint;
            entry.next = 0;
        }
        let pos = entry.next;
        entry.next = entry.next.wrapping_add(1);
        pos
    }
}

fn fingerprint(candidates: &[Arc<ServiceInstance>]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for inst in candidates {
        inst.id().hash(&mut hasher);
        inst.weight().hash(&mut hasher);
    }
    hasher.finish()
}

/// Picks one eligible instance per call.
///
/// Candidates come from the registry (healthy and degraded, in registration
/// order); a service whose breaker is open yields no candidates at all.
pub struct LoadBalancer {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerManager>,
    default_strategy: Strategy,
    round_robin: RoundRobinBalancer,
    weighted: WeightedRoundRobinBalancer,
    least_conn: LeastConnBalancer,
    random: RandomBalancer,
    health_based: HealthBasedBalancer,
    stats: DashMap<String, Arc<ServiceCounters>>,
}

#[derive(Default)]
struct ServiceCounters {
    selections: [AtomicU64; 5],
    no_instance: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceLbStats {
    pub selections: BTreeMap<&'static str, u64>,
    pub no_instance: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LbStats {
    pub default_strategy: Strategy,
    pub services: BTreeMap<String, ServiceLbStats>,
}

impl LoadBalancer {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerManager>,
        default_strategy: Strategy,
    ) -> Self {
        Self {
            registry,
            breakers,
            default_strategy,
            round_robin: RoundRobinBalancer::new(),
            weighted: WeightedRoundRobinBalancer::new(),
            least_conn: LeastConnBalancer,
            random: RandomBalancer,
            health_based: HealthBasedBalancer,
            stats: DashMap::new(),
        }
    }

    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    /// Select with the default strategy. Increments the instance's active
    /// connections; the caller must hand it back via `release_instance`.
    pub fn get_instance(
        &self,
        service: &str,
        tags: &[&str],
    ) -> Result<Arc<ServiceInstance>, GatewayError> {
        self.get_instance_with(service, tags, self.default_strategy)
    }

    pub fn get_instance_with(
        &self,
        service: &str,
        tags: &[&str],
        strategy: Strategy,
    ) -> Result<Arc<ServiceInstance>, GatewayError> {
        let counters = self.counters(service);
        let candidates = self.candidates(service, tags);

        let chosen = match strategy {
            Strategy::RoundRobin => self.round_robin.select(service, &candidates),
            Strategy::WeightedRoundRobin => self.weighted.select(service, &candidates),
            Strategy::LeastConnections => self.least_conn.select(&candidates),
            Strategy::Random => self.random.select(&candidates),
            Strategy::HealthBased => self.health_based.select(&candidates),
        };

        let Some(idx) = chosen else {
            counters.no_instance.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                "lb: no available instance, service={}, strategy={}",
                service,
                strategy
            );
            return Err(GatewayError::NoAvailableInstance(service.to_string()));
        };

        let instance = candidates[idx].clone();
        instance.inc_active();
        counters.selections[strategy.index()].fetch_add(1, Ordering::Relaxed);
        metrics::counter!("aegis_lb_selections_total", "service" => service.to_string(), "strategy" => strategy.as_str())
            .increment(1);
        metrics::gauge!("aegis_connections_active").increment(1.0);
        Ok(instance)
    }

    /// Decrement the connection counter taken at selection. Saturates at zero.
    pub fn release_instance(&self, instance: &ServiceInstance) {
        instance.dec_active();
        metrics::gauge!("aegis_connections_active").decrement(1.0);
    }

    /// Select and wrap in a guard that releases on drop.
    pub fn acquire(
        self: &Arc<Self>,
        service: &str,
        tags: &[&str],
        strategy: Option<Strategy>,
    ) -> Result<ConnectionGuard, GatewayError> {
        let instance =
            self.get_instance_with(service, tags, strategy.unwrap_or(self.default_strategy))?;
        Ok(ConnectionGuard {
            instance,
            balancer: self.clone(),
        })
    }

    pub fn stats(&self) -> LbStats {
        let services = self
            .stats
            .iter()
            .map(|e| {
                let c = e.value();
                let selections = Strategy::ALL
                    .iter()
                    .map(|s| (s.as_str(), c.selections[s.index()].load(Ordering::Relaxed)))
                    .filter(|(_, n)| *n > 0)
                    .collect();
                (
                    e.key().clone(),
                    ServiceLbStats {
                        selections,
                        no_instance: c.no_instance.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();
        LbStats {
            default_strategy: self.default_strategy,
            services,
        }
    }

    fn candidates(&self, service: &str, tags: &[&str]) -> Vec<Arc<ServiceInstance>> {
        if self.breakers.is_open(service) {
            return Vec::new();
        }
        self.registry.find(service, tags)
    }

    fn counters(&self, service: &str) -> Arc<ServiceCounters> {
        if let Some(c) = self.stats.get(service) {
            return c.value().clone();
        }
        self.stats
            .entry(service.to_string())
            .or_default()
            .clone()
    }
}

/// RAII wrapper over a selected instance: releases its connection slot on drop.
pub struct ConnectionGuard {
    instance: Arc<ServiceInstance>,
    balancer: Arc<LoadBalancer>,
}

impl ConnectionGuard {
    pub fn instance(&self) -> &Arc<ServiceInstance> {
        &self.instance
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.balancer.release_instance(&self.instance);
    }
}
