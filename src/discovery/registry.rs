use super::instance::{HealthStatus, InstanceSnapshot, ServiceInstance};
use crate::config::ServiceDefinition;
use crate::error::GatewayError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-memory store of registered instances.
///
/// Per-service candidate lists are copy-on-write `Arc<Vec<_>>` snapshots:
/// writers rebuild the list under one shard lock, readers clone the `Arc`
/// and filter outside any lock.
pub struct ServiceRegistry {
    instances: DashMap<String, Arc<ServiceInstance>>,
    by_service: DashMap<String, Arc<Vec<Arc<ServiceInstance>>>>,
    /// "name@host:port" -> instance id, for active instances only.
    endpoints: DashMap<String, String>,
    /// Deregistered instances waiting out the decommission window.
    draining: DashMap<String, Instant>,
    next_seq: AtomicU64,
    grace: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryCounts {
    pub services: usize,
    pub instances: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub draining: usize,
    pub by_tag: BTreeMap<String, usize>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ServiceRegistry {
    pub fn new(decommission_grace: Duration) -> Self {
        Self {
            instances: DashMap::new(),
            by_service: DashMap::new(),
            endpoints: DashMap::new(),
            draining: DashMap::new(),
            next_seq: AtomicU64::new(0),
            grace: decommission_grace,
        }
    }

    /// Fails with `DuplicateRegistration` if the same name+host+port is active.
    pub fn register(&self, definition: ServiceDefinition) -> Result<String, GatewayError> {
        self.register_shared(Arc::new(definition))
            .map(|inst| inst.id().to_string())
    }

    pub fn register_shared(
        &self,
        definition: Arc<ServiceDefinition>,
    ) -> Result<Arc<ServiceInstance>, GatewayError> {
        self.purge_expired();

        let instance = match self.endpoints.entry(definition.endpoint_key()) {
            Entry::Occupied(_) => {
                return Err(GatewayError::DuplicateRegistration {
                    name: definition.name.clone(),
                    host: definition.host.clone(),
                    port: definition.port,
                });
            }
            Entry::Vacant(slot) => {
                let id = self.allocate_id(&definition.name);
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                let instance = Arc::new(ServiceInstance::new(id.clone(), seq, definition));
                self.instances.insert(id.clone(), instance.clone());
                self.link(&instance);
                slot.insert(id);
                instance
            }
        };
        metrics::gauge!("aegis_registry_instances").set(self.instances.len() as f64);

        tracing::info!(
            "registry: instance registered, service={}, instance={}, endpoint={}",
            instance.name(),
            instance.id(),
            instance.endpoint()
        );
        Ok(instance)
    }

    /// Deregistering an id that is unknown or already deregistered returns
    /// `InstanceNotFound` and leaves the registry untouched.
    pub fn deregister(&self, instance_id: &str) -> Result<Arc<ServiceInstance>, GatewayError> {
        self.purge_expired();

        let instance = self
            .instances
            .get(instance_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| GatewayError::InstanceNotFound(instance_id.to_string()))?;

        // Losing this race means a concurrent deregister already won.
        if !instance.mark_draining() {
            return Err(GatewayError::InstanceNotFound(instance_id.to_string()));
        }

        self.endpoints
            .remove_if(&instance.definition().endpoint_key(), |_, id| {
                id == instance_id
            });

        if self.grace.is_zero() {
            self.remove_now(&instance);
        } else {
            self.draining
                .insert(instance_id.to_string(), Instant::now() + self.grace);
        }

        tracing::info!(
            "registry: instance deregistered, service={}, instance={}, grace={:?}",
            instance.name(),
            instance.id(),
            self.grace
        );
        Ok(instance)
    }

    /// Healthy and degraded, non-draining instances of `name` carrying every
    /// tag in `tags`, in registration order.
    pub fn find(&self, name: &str, tags: &[&str]) -> Vec<Arc<ServiceInstance>> {
        self.purge_expired();
        let Some(list) = self.by_service.get(name).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        list.iter()
            .filter(|i| !i.is_draining() && i.status().is_routable() && i.has_tags(tags))
            .cloned()
            .collect()
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<ServiceInstance>> {
        self.instances.get(instance_id).map(|e| e.value().clone())
    }

    /// Every instance of `name` regardless of status.
    pub fn instances_of(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        self.by_service
            .get(name)
            .map(|e| e.value().as_ref().clone())
            .unwrap_or_default()
    }

    pub fn all_instances(&self) -> Vec<Arc<ServiceInstance>> {
        let mut all: Vec<_> = self.instances.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|i| i.seq());
        all
    }

    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_service.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Snapshot for introspection, ordered by service then registration.
    pub fn list_all(&self) -> Vec<InstanceSnapshot> {
        self.purge_expired();
        let mut all = self.all_instances();
        all.sort_by(|a, b| a.name().cmp(b.name()).then(a.seq().cmp(&b.seq())));
        all.iter().map(|i| i.snapshot()).collect()
    }

    pub fn counts(&self) -> RegistryCounts {
        self.purge_expired();
        let mut counts = RegistryCounts {
            services: self.by_service.len(),
            ..Default::default()
        };
        for entry in self.instances.iter() {
            let inst = entry.value();
            counts.instances += 1;
            if inst.is_draining() {
                counts.draining += 1;
            }
            match inst.status() {
                HealthStatus::Healthy => counts.healthy += 1,
                HealthStatus::Degraded => counts.degraded += 1,
                HealthStatus::Unhealthy => counts.unhealthy += 1,
            }
            for tag in &inst.definition().tags {
                *counts.by_tag.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Drop instances whose decommission window has elapsed.
    pub fn purge_expired(&self) {
        if self.draining.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut expired = Vec::new();
        self.draining.retain(|id, deadline| {
            if *deadline <= now {
                expired.push(id.clone());
                false
            } else {
                true
            }
        });
        for id in expired {
            if let Some(inst) = self.get(&id) {
                self.remove_now(&inst);
            }
        }
    }

    fn remove_now(&self, instance: &Arc<ServiceInstance>) {
        self.instances.remove(instance.id());
        self.unlink(instance);
        metrics::gauge!("aegis_registry_instances").set(self.instances.len() as f64);
    }

    fn link(&self, instance: &Arc<ServiceInstance>) {
        self.by_service
            .entry(instance.name().to_string())
            .and_modify(|list| {
                let mut next = Vec::with_capacity(list.len() + 1);
                next.extend(list.iter().cloned());
                next.push(instance.clone());
                *list = Arc::new(next);
            })
            .or_insert_with(|| Arc::new(vec![instance.clone()]));
    }

    fn unlink(&self, instance: &Arc<ServiceInstance>) {
        if let Some(mut list) = self.by_service.get_mut(instance.name()) {
            let next: Vec<_> = list
                .iter()
                .filter(|i| i.id() != instance.id())
                .cloned()
                .collect();
            *list = Arc::new(next);
        }
        self.by_service
            .remove_if(instance.name(), |_, list| list.is_empty());
    }

    fn allocate_id(&self, name: &str) -> String {
        loop {
            let id = format!("{}-{:016x}", name, rand::random::<u64>());
            if !self.instances.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, port: u16) -> ServiceDefinition {
        ServiceDefinition::new(name, "127.0.0.1", port)
    }

    #[test]
    fn test_register_returns_unique_ids() {
        let reg = ServiceRegistry::default();
        let a = reg.register(def("auth", 8001)).unwrap();
        let b = reg.register(def("auth", 8002)).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("auth-"));
        assert_eq!(a.len(), "auth-".len() + 16);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let reg = ServiceRegistry::default();
        reg.register(def("auth", 8001)).unwrap();
        let err = reg.register(def("auth", 8001)).unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateRegistration { port: 8001, .. }));
        assert_eq!(reg.len(), 1);

        // Same endpoint under another name is a different service.
        assert!(reg.register(def("billing", 8001)).is_ok());
    }

    #[test]
    fn test_reregister_after_deregister() {
        let reg = ServiceRegistry::default();
        let id = reg.register(def("auth", 8001)).unwrap();
        reg.deregister(&id).unwrap();
        assert!(reg.register(def("auth", 8001)).is_ok());
    }

    #[test]
    fn test_deregister_unknown_is_not_found() {
        let reg = ServiceRegistry::default();
        let id = reg.register(def("auth", 8001)).unwrap();
        reg.deregister(&id).unwrap();

        let err = reg.deregister(&id).unwrap_err();
        assert_eq!(err, GatewayError::InstanceNotFound(id));
        assert!(reg.is_empty());
        assert!(reg.service_names().is_empty());

        assert!(reg.deregister("never-existed").is_err());
    }

    #[test]
    fn test_find_excludes_unhealthy() {
        let reg = ServiceRegistry::default();
        let a = reg.register(def("x", 1)).unwrap();
        let b = reg.register(def("x", 2)).unwrap();
        let c = reg.register(def("x", 3)).unwrap();
        reg.get(&b).unwrap().set_status(HealthStatus::Degraded);
        reg.get(&c).unwrap().set_status(HealthStatus::Unhealthy);

        let found: Vec<String> = reg.find("x", &[]).iter().map(|i| i.id().to_string()).collect();
        assert_eq!(found, vec![a, b]);
        assert_eq!(reg.instances_of("x").len(), 3);
    }

    #[test]
    fn test_find_filters_by_all_tags() {
        let reg = ServiceRegistry::default();
        reg.register(def("x", 1).with_tag("gpu")).unwrap();
        let both = reg
            .register(def("x", 2).with_tag("gpu").with_tag("eu"))
            .unwrap();

        let found = reg.find("x", &["gpu", "eu"]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), both);
        assert_eq!(reg.find("x", &["gpu"]).len(), 2);
        assert!(reg.find("y", &[]).is_empty());
    }

    #[test]
    fn test_find_orders_by_registration() {
        let reg = ServiceRegistry::default();
        let ids: Vec<String> = (0..5).map(|p| reg.register(def("x", 100 + p)).unwrap()).collect();
        let found: Vec<String> = reg.find("x", &[]).iter().map(|i| i.id().to_string()).collect();
        assert_eq!(found, ids);
    }

    #[test]
    fn test_grace_window_keeps_instance_draining() {
        let reg = ServiceRegistry::new(Duration::from_millis(50));
        let id = reg.register(def("x", 1)).unwrap();
        reg.deregister(&id).unwrap();

        assert!(reg.find("x", &[]).is_empty());
        let listed = reg.list_all();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].draining);
        assert!(reg.deregister(&id).is_err());
        // Endpoint freed immediately.
        assert!(reg.register(def("x", 1)).is_ok());

        std::thread::sleep(Duration::from_millis(80));
        reg.purge_expired();
        assert!(reg.get(&id).is_none());
        assert_eq!(reg.instances_of("x").len(), 1);
    }

    #[test]
    fn test_counts() {
        let reg = ServiceRegistry::default();
        reg.register(def("a", 1).with_tag("critical")).unwrap();
        let b = reg.register(def("b", 2).with_tag("critical")).unwrap();
        reg.register(def("b", 3)).unwrap();
        reg.get(&b).unwrap().set_status(HealthStatus::Unhealthy);

        let counts = reg.counts();
        assert_eq!(counts.services, 2);
        assert_eq!(counts.instances, 3);
        assert_eq!(counts.healthy, 2);
        assert_eq!(counts.unhealthy, 1);
        assert_eq!(counts.by_tag["critical"], 2);
    }

    #[test]
    fn test_concurrent_duplicate_registration_admits_one() {
        let reg = Arc::new(ServiceRegistry::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.register(def("race", 9000)).is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert_eq!(reg.len(), 1);
    }
}
