pub mod types;


pub use types::*;

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. A missing file falls
    /// back to built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            services = config.services.len(),
            routes = config.total_route_count(),
            strategy = %config.load_balancer.strategy,
            "loaded gateway configuration"
        );
        Ok(config)
    }

    /// Environment overrides cover infrastructure knobs only. Services and
    /// routes come from the config file or the registration API.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("AEGIS_LISTEN") {
            self.server.listen = v;
        }
        if let Ok(v) = std::env::var("AEGIS_ADMIN_LISTEN") {
            self.server.admin_listen = v;
        }
        if let Some(v) = env_parse::<f64>("AEGIS_SHUTDOWN_TIMEOUT_SECS") {
            self.server.shutdown_timeout_secs = v;
        }

        if let Some(v) = env_parse::<f64>("AEGIS_HEALTH_INTERVAL_SECS") {
            self.health.interval_secs = v;
        }
        if let Some(v) = env_parse::<f64>("AEGIS_HEALTH_TIMEOUT_SECS") {
            self.health.timeout_secs = v;
        }

        if let Some(v) = env_parse::<u32>("AEGIS_CB_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = env_parse::<f64>("AEGIS_CB_RECOVERY_TIMEOUT_SECS") {
            self.circuit_breaker.recovery_timeout_secs = v;
        }

        if let Ok(v) = std::env::var("AEGIS_LB_STRATEGY") {
            self.load_balancer.strategy = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let h = &self.health;
        if h.degrade_threshold == 0 {
            anyhow::bail!("health.degrade_threshold must be >= 1");
        }
        if h.unhealthy_threshold <= h.degrade_threshold {
            anyhow::bail!(
                "health.unhealthy_threshold ({}) must be greater than degrade_threshold ({})",
                h.unhealthy_threshold,
                h.degrade_threshold
            );
        }
        if h.removal_threshold != 0 && h.removal_threshold < h.unhealthy_threshold {
            anyhow::bail!(
                "health.removal_threshold ({}) must be 0 or >= unhealthy_threshold ({})",
                h.removal_threshold,
                h.unhealthy_threshold
            );
        }
        if !(h.ewma_alpha > 0.0 && h.ewma_alpha <= 1.0) {
            anyhow::bail!("health.ewma_alpha must be in (0, 1], got {}", h.ewma_alpha);
        }

        self.validate_breaker("circuit_breaker", &self.circuit_breaker)?;
        for name in self.circuit_breaker.overrides.keys() {
            let merged = self.circuit_breaker.for_service(name);
            self.validate_breaker(&format!("circuit_breaker.overrides.{name}"), &merged)?;
        }

        if let Err(e) = self
            .load_balancer
            .strategy
            .parse::<crate::upstream::loadbalance::Strategy>()
        {
            anyhow::bail!("load_balancer.strategy: {e}");
        }

        let mut seen = HashSet::new();
        for svc in &self.services {
            if svc.name.is_empty() {
                anyhow::bail!("service with host '{}' has an empty name", svc.host);
            }
            if !seen.insert(svc.endpoint_key()) {
                anyhow::bail!(
                    "service '{}' at {}:{} is declared twice",
                    svc.name,
                    svc.host,
                    svc.port
                );
            }
            for route in &svc.routes {
                validate_route(route)?;
            }
        }

        for route in &self.routes {
            validate_route(route)?;
        }

        // Explicit names label metrics and rate-limit state, so two different
        // routes must not share one. Instances of one service repeat routes.
        let mut named: HashMap<&str, &RouteDefinition> = HashMap::new();
        let declared = self.services.iter().flat_map(|s| &s.routes);
        for route in self.routes.iter().chain(declared) {
            if route.name.is_empty() {
                continue;
            }
            match named.get(route.name.as_str()) {
                Some(prev) if *prev != route => {
                    anyhow::bail!("route name '{}' is used by two different routes", route.name)
                }
                Some(_) => {}
                None => {
                    named.insert(&route.name, route);
                }
            }
        }
        Ok(())
    }

    fn validate_breaker(&self, section: &str, cb: &CircuitBreakerConfig) -> Result<()> {
        if cb.failure_threshold == 0 {
            anyhow::bail!("{section}.failure_threshold must be >= 1");
        }
        if cb.success_threshold == 0 {
            anyhow::bail!("{section}.success_threshold must be >= 1");
        }
        if cb.half_open_max_calls == 0 {
            anyhow::bail!("{section}.half_open_max_calls must be >= 1");
        }
        Ok(())
    }

    /// Static routes plus routes declared by static services.
    pub fn total_route_count(&self) -> usize {
        self.routes.len() + self.services.iter().map(|s| s.routes.len()).sum::<usize>()
    }
}

fn validate_route(route: &RouteDefinition) -> Result<()> {
    if route.path.is_empty() || !route.path.starts_with('/') {
        anyhow::bail!(
            "route '{}' must have a path starting with '/'",
            route.display_name()
        );
    }
    if route.service.is_empty() {
        anyhow::bail!("route '{}' has no target service", route.display_name());
    }
    if let Some(ref rl) = route.rate_limit {
        match rl.mode {
            RateLimitMode::SlidingWindow => {
                if rl.count.is_none() || rl.time_window_secs.is_none() {
                    anyhow::bail!(
                        "route '{}': rate_limit mode 'sliding_window' requires 'count' and 'time_window_secs'",
                        route.display_name()
                    );
                }
            }
            RateLimitMode::TokenBucket => {
                if !rl.rate.is_some_and(|r| r > 0.0) {
                    anyhow::bail!(
                        "route '{}': rate_limit mode 'token_bucket' requires a positive 'rate'",
                        route.display_name()
                    );
                }
            }
        }
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}
