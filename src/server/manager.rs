use crate::config::{ManagerConfig, ServiceDefinition};
use crate::discovery::{HealthStatus, RegistryCounts, ServiceInstance, ServiceRegistry};
use crate::error::GatewayError;
use crate::upstream::health::MonitorStats;
use crate::upstream::HealthMonitor;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

/// Owns service lifecycle: declared definitions, dependency-ordered startup
/// and reverse-order shutdown. Registration and monitoring go through here
/// so every started instance is also being probed.
pub struct ServiceManager {
    registry: Arc<ServiceRegistry>,
    monitor: Arc<HealthMonitor>,
    config: ManagerConfig,
    declared: RwLock<BTreeMap<String, Vec<Arc<ServiceDefinition>>>>,
    /// Held while checking for and registering a service's instances.
    starting: Mutex<()>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceStatusCounts {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub declared_services: usize,
    pub registered_services: usize,
    pub services: ServiceStatusCounts,
    pub instances: RegistryCounts,
    pub monitor: MonitorStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownFailure {
    pub service: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
    pub failed: Vec<ShutdownFailure>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

impl ServiceManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        monitor: Arc<HealthMonitor>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            registry,
            monitor,
            config,
            declared: RwLock::new(BTreeMap::new()),
            starting: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Remember a definition without starting it. Re-declaring the same
    /// name+host+port replaces the earlier definition.
    pub fn declare(&self, definition: ServiceDefinition) -> Result<(), GatewayError> {
        self.declare_shared(Arc::new(definition))
    }

    fn declare_shared(&self, definition: Arc<ServiceDefinition>) -> Result<(), GatewayError> {
        if definition.name.is_empty() {
            return Err(GatewayError::Config("service name must not be empty".into()));
        }
        let mut declared = self.declared.write().unwrap_or_else(|e| e.into_inner());
        let defs = declared.entry(definition.name.clone()).or_default();
        let key = definition.endpoint_key();
        match defs.iter_mut().find(|d| d.endpoint_key() == key) {
            Some(existing) => *existing = definition,
            None => defs.push(definition),
        }
        Ok(())
    }

    /// Declare, register one instance and start probing it.
    pub fn register(&self, definition: ServiceDefinition) -> Result<String, GatewayError> {
        let definition = Arc::new(definition);
        self.declare_shared(definition.clone())?;
        let instance = self.registry.register_shared(definition)?;
        self.monitor.start_monitoring(instance.clone());
        Ok(instance.id().to_string())
    }

    /// Stop probing and remove one instance.
    pub async fn deregister(&self, instance_id: &str) -> Result<Arc<ServiceInstance>, GatewayError> {
        self.monitor.stop_monitoring(instance_id).await;
        self.registry.deregister(instance_id)
    }

    /// Topological order over the dependency graph; ties are broken by name
    /// so the result is deterministic. Dependencies outside `definitions`
    /// are external and impose no ordering.
    pub fn compute_startup_order(
        definitions: &[ServiceDefinition],
    ) -> Result<Vec<String>, GatewayError> {
        let mut deps: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for def in definitions {
            deps.entry(def.name.as_str()).or_default();
        }
        for def in definitions {
            for dep in &def.dependencies {
                if deps.contains_key(dep.as_str()) {
                    deps.entry(def.name.as_str()).or_default().insert(dep.as_str());
                }
            }
        }

        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        for (name, ds) in &deps {
            pending.insert(*name, ds.len());
            for dep in ds {
                dependents.entry(*dep).or_default().push(*name);
            }
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(deps.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            pending.remove(name);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(n) = pending.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*dependent);
                    }
                }
            }
        }

        if pending.is_empty() {
            return Ok(order);
        }
        Err(GatewayError::CircularDependency(find_cycle(&deps, &pending)))
    }

    /// Start `name` once everything it depends on is healthy. Declared but
    /// not yet started dependencies are started first; undeclared ones are
    /// waited for until the service's startup timeout.
    pub async fn start_service(&self, name: &str) -> Result<Vec<String>, GatewayError> {
        let closure = self.dependency_closure(name)?;
        let order = Self::compute_startup_order(&closure)?;

        let mut started = Vec::new();
        for svc in &order {
            let ids = self.start_one(svc).await?;
            if svc == name {
                started = ids;
            }
        }
        Ok(started)
    }

    /// Start every declared service in dependency order. A cycle fails
    /// before anything is registered.
    pub async fn start_all_services(&self) -> Result<Vec<String>, GatewayError> {
        let all = self.declared_definitions();
        let order = Self::compute_startup_order(&all)?;
        let mut ids = Vec::new();
        for svc in &order {
            ids.extend(self.start_one(svc).await?);
        }
        Ok(ids)
    }

    async fn start_one(&self, name: &str) -> Result<Vec<String>, GatewayError> {
        let defs = self.declared_for(name);
        if defs.is_empty() {
            return Err(GatewayError::UnknownService(name.to_string()));
        }

        let timeout = defs
            .iter()
            .map(|d| d.startup_timeout())
            .max()
            .unwrap_or_default();
        let deadline = Instant::now() + timeout;
        let dependencies: BTreeSet<&String> = defs.iter().flat_map(|d| &d.dependencies).collect();
        for dep in dependencies {
            self.wait_for_healthy(name, dep, deadline).await?;
        }

        let ids = self.ensure_registered(name, &defs)?;
        info!("manager: service started, service={}, instances={}", name, ids.len());
        Ok(ids)
    }

    fn ensure_registered(
        &self,
        name: &str,
        defs: &[Arc<ServiceDefinition>],
    ) -> Result<Vec<String>, GatewayError> {
        let _guard = self.starting.lock().unwrap_or_else(|e| e.into_inner());

        let active = self.active_instances(name);
        let running: HashSet<String> = active
            .iter()
            .map(|i| i.definition().endpoint_key())
            .collect();
        let mut ids: Vec<String> = active.iter().map(|i| i.id().to_string()).collect();

        for def in defs {
            if running.contains(&def.endpoint_key()) {
                continue;
            }
            let instance = self.registry.register_shared(def.clone())?;
            self.monitor.start_monitoring(instance.clone());
            ids.push(instance.id().to_string());
        }
        Ok(ids)
    }

    async fn wait_for_healthy(
        &self,
        service: &str,
        dependency: &str,
        deadline: Instant,
    ) -> Result<(), GatewayError> {
        let poll = self.config.dependency_poll_interval();
        let mut logged = false;
        loop {
            let ready = self
                .active_instances(dependency)
                .iter()
                .any(|i| i.status() == HealthStatus::Healthy && i.has_passed_check());
            if ready {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "manager: dependency unavailable, service={}, dependency={}",
                    service, dependency
                );
                return Err(GatewayError::DependencyUnavailable {
                    service: service.to_string(),
                    dependency: dependency.to_string(),
                });
            }
            if !logged {
                info!(
                    "manager: waiting for dependency, service={}, dependency={}",
                    service, dependency
                );
                logged = true;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Stop probing, deregister every instance of `name`, then wait for
    /// their active connections to reach zero.
    pub async fn stop_service(&self, name: &str) -> Result<(), GatewayError> {
        let instances = self.active_instances(name);
        if instances.is_empty() {
            if self.declared_for(name).is_empty() {
                return Err(GatewayError::UnknownService(name.to_string()));
            }
            return Ok(());
        }

        let timeout = instances
            .iter()
            .map(|i| i.definition().shutdown_timeout())
            .max()
            .unwrap_or_default();

        for inst in &instances {
            self.monitor.stop_monitoring(inst.id()).await;
            match self.registry.deregister(inst.id()) {
                Ok(_) | Err(GatewayError::InstanceNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let deadline = Instant::now() + timeout;
        let poll = self.config.dependency_poll_interval();
        loop {
            let active: usize = instances.iter().map(|i| i.active_connections()).sum();
            if active == 0 {
                info!("manager: service stopped, service={}", name);
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(GatewayError::ShutdownTimeout {
                    service: name.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// Reverse dependency order, best effort: one failure is recorded and
    /// the rest still stop.
    pub async fn stop_all_services(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        for name in self.shutdown_order() {
            if self.active_instances(&name).is_empty() {
                continue;
            }
            match self.stop_service(&name).await {
                Ok(()) => report.stopped.push(name),
                Err(e) => {
                    warn!("manager: service stop failed, service={}, error={}", name, e);
                    report.failed.push(ShutdownFailure {
                        service: name,
                        error: e.to_string(),
                    });
                }
            }
        }
        info!(
            "manager: all services stopped, stopped={}, failed={}",
            report.stopped.len(),
            report.failed.len()
        );
        report
    }

    /// Freeze health observations first, then stop everything.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.monitor.shutdown().await;
        self.stop_all_services().await
    }

    pub fn stats(&self) -> ManagerStats {
        let health = self.monitor.system_health();
        let mut services = ServiceStatusCounts::default();
        for svc in health.services.values() {
            match svc.status {
                HealthStatus::Healthy => services.healthy += 1,
                HealthStatus::Degraded => services.degraded += 1,
                HealthStatus::Unhealthy => services.unhealthy += 1,
            }
        }
        ManagerStats {
            declared_services: self.declared.read().unwrap_or_else(|e| e.into_inner()).len(),
            registered_services: health.services.len(),
            services,
            instances: self.registry.counts(),
            monitor: self.monitor.stats(),
        }
    }

    fn active_instances(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        self.registry
            .instances_of(name)
            .into_iter()
            .filter(|i| !i.is_draining())
            .collect()
    }

    fn declared_for(&self, name: &str) -> Vec<Arc<ServiceDefinition>> {
        self.declared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn declared_definitions(&self) -> Vec<ServiceDefinition> {
        self.declared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .map(|d| (**d).clone())
            .collect()
    }

    /// `name` plus every declared service reachable through its dependencies.
    fn dependency_closure(&self, name: &str) -> Result<Vec<ServiceDefinition>, GatewayError> {
        let declared = self.declared.read().unwrap_or_else(|e| e.into_inner());
        if !declared.contains_key(name) {
            return Err(GatewayError::UnknownService(name.to_string()));
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([name]);
        let mut out = Vec::new();
        while let Some(svc) = queue.pop_front() {
            if !seen.insert(svc) {
                continue;
            }
            let Some(defs) = declared.get(svc) else {
                continue;
            };
            for def in defs {
                queue.extend(def.dependencies.iter().map(String::as_str));
                out.push((**def).clone());
            }
        }
        Ok(out)
    }

    /// Names with live instances or declarations, in reverse startup order.
    fn shutdown_order(&self) -> Vec<String> {
        let mut defs = self.declared_definitions();
        let declared: HashSet<String> = defs.iter().map(|d| d.name.clone()).collect();
        for inst in self.registry.all_instances() {
            if !declared.contains(inst.name()) {
                defs.push((**inst.definition()).clone());
            }
        }
        let mut order = Self::compute_startup_order(&defs).unwrap_or_else(|_| {
            let names: BTreeSet<String> = defs.iter().map(|d| d.name.clone()).collect();
            names.into_iter().collect()
        });
        order.reverse();
        order
    }
}

/// Walk dependency edges among the unresolved nodes until one repeats.
/// Every unresolved node still has an unresolved dependency, so the walk
/// always closes a loop.
fn find_cycle(deps: &BTreeMap<&str, BTreeSet<&str>>, pending: &BTreeMap<&str, usize>) -> Vec<String> {
    let Some(start) = pending.keys().next().copied() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|n| *n == current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(current.to_string());
            return cycle;
        }
        path.push(current);
        let next = deps
            .get(current)
            .and_then(|ds| ds.iter().find(|d| pending.contains_key(*d)))
            .copied();
        match next {
            Some(n) => current = n,
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}
