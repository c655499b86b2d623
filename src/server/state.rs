use crate::config::{GatewayConfig, RouteDefinition, ServiceDefinition};
use crate::discovery::ServiceRegistry;
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::proxy::{ApiGateway, HyperUpstreamClient, UpstreamClient};
use crate::server::manager::ServiceManager;
use crate::upstream::{CircuitBreakerManager, HealthMonitor, LoadBalancer, Strategy};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Shared gateway state, cheaply cloneable.
///
/// Every component is built once here and handed out by `Arc`; the proxy
/// and admin listeners see the same registry, breakers and routes.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Metrics,
    pub registry: Arc<ServiceRegistry>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub lb: Arc<LoadBalancer>,
    pub monitor: Arc<HealthMonitor>,
    pub manager: Arc<ServiceManager>,
    pub gateway: Arc<ApiGateway>,
    started: Instant,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Result<Self> {
        Self::with_client(config, metrics, Arc::new(HyperUpstreamClient::new()))
    }

    pub fn with_client(
        config: GatewayConfig,
        metrics: Metrics,
        client: Arc<dyn UpstreamClient>,
    ) -> Result<Self> {
        let strategy: Strategy = config
            .load_balancer
            .strategy
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;

        let registry = Arc::new(ServiceRegistry::new(config.registry.decommission_grace()));
        let breakers = Arc::new(CircuitBreakerManager::new(config.circuit_breaker.clone()));
        let lb = Arc::new(LoadBalancer::new(registry.clone(), breakers.clone(), strategy));
        let monitor = Arc::new(HealthMonitor::new(registry.clone(), config.health.clone())?);
        let manager = Arc::new(ServiceManager::new(
            registry.clone(),
            monitor.clone(),
            config.manager.clone(),
        ));
        let gateway = Arc::new(ApiGateway::with_client(lb.clone(), breakers.clone(), client));

        info!(
            "state: components ready, strategy={}, grace={:?}",
            strategy,
            config.registry.decommission_grace()
        );

        Ok(Self {
            config: Arc::new(config),
            metrics,
            registry,
            breakers,
            lb,
            monitor,
            manager,
            gateway,
            started: Instant::now(),
        })
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Register one instance and the routes it declares. Routes are added
    /// first; an identical route from a second instance is a no-op.
    pub fn register_service(&self, definition: ServiceDefinition) -> Result<String, GatewayError> {
        self.add_service_routes(&definition)?;
        self.manager.register(definition)
    }

    /// Declare every configured service and route, then start services in
    /// dependency order.
    pub async fn start_configured_services(&self) -> Result<Vec<String>, GatewayError> {
        for svc in &self.config.services {
            self.add_service_routes(svc)?;
            self.manager.declare(svc.clone())?;
        }
        for route in &self.config.routes {
            self.gateway.register_route(route.clone())?;
        }
        self.manager.start_all_services().await
    }

    fn add_service_routes(&self, definition: &ServiceDefinition) -> Result<(), GatewayError> {
        for route in &definition.routes {
            let route = if route.service.is_empty() {
                RouteDefinition {
                    service: definition.name.clone(),
                    ..route.clone()
                }
            } else {
                route.clone()
            };
            self.gateway.register_route(route)?;
        }
        Ok(())
    }
}
