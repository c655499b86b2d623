use crate::config::RouteDefinition;
use crate::error::GatewayError;
use arc_swap::ArcSwap;
use http::Method;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    /// `/api/x`: only that path.
    Exact(String),
    /// `/api/x/*`: `/api/x` itself and anything below it. Holds `/api/x`.
    Prefix(String),
    /// `/*`
    CatchAll,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, GatewayError> {
        if !pattern.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "route path must start with '/': {pattern}"
            )));
        }
        if pattern == "/*" {
            return Ok(PathPattern::CatchAll);
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Ok(PathPattern::Prefix(prefix.to_string()));
        }
        Ok(PathPattern::Exact(pattern.to_string()))
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathPattern::CatchAll => true,
            PathPattern::Exact(p) => path == p,
            PathPattern::Prefix(p) => match path.strip_prefix(p.as_str()) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            },
        }
    }

    /// The part of `path` below the matched prefix (empty for exact matches).
    fn remainder<'a>(&self, path: &'a str) -> &'a str {
        match self {
            PathPattern::CatchAll => path,
            PathPattern::Exact(_) => "",
            PathPattern::Prefix(p) => &path[p.len().min(path.len())..],
        }
    }
}

/// A registered route, ready for matching, plus its live counters.
pub struct CompiledRoute {
    pub definition: RouteDefinition,
    pub name: Arc<str>,
    /// Unique per table; keys per-route state such as rate limits.
    key: Arc<str>,
    pattern: PathPattern,
    /// `None` matches every method.
    method: Option<Method>,
    requests: AtomicU64,
    errors: AtomicU64,
    latency_us_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStatsSnapshot {
    pub route: String,
    pub path: String,
    pub method: String,
    pub service: String,
    pub requests: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

impl CompiledRoute {
    pub fn compile(definition: RouteDefinition) -> Result<Self, GatewayError> {
        let pattern = PathPattern::parse(&definition.path)?;
        let method = match definition.method.trim() {
            "" | "*" => None,
            m => Some(Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                GatewayError::Config(format!(
                    "route '{}' has invalid method '{}'",
                    definition.display_name(),
                    m
                ))
            })?),
        };
        if definition.service.is_empty() {
            return Err(GatewayError::Config(format!(
                "route '{}' has no target service",
                definition.display_name()
            )));
        }
        let name: Arc<str> = definition.display_name().into();
        Ok(Self {
            definition,
            key: name.clone(),
            name,
            pattern,
            method,
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latency_us_total: AtomicU64::new(0),
        })
    }

    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.as_ref().map_or(true, |m| m == method) && self.pattern.matches(path)
    }

    pub fn service(&self) -> &str {
        &self.definition.service
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    /// Path to send upstream. Without a `target_path` the request path is
    /// forwarded unchanged; with one, the matched prefix is replaced by it.
    pub fn rewrite(&self, path: &str) -> String {
        let Some(target) = self.definition.target_path.as_deref() else {
            return path.to_string();
        };
        let rest = self.pattern.remainder(path);
        let mut out = String::with_capacity(target.len() + rest.len());
        out.push_str(target.trim_end_matches('/'));
        if rest.is_empty() {
            if out.is_empty() {
                out.push('/');
            }
        } else {
            if !rest.starts_with('/') {
                out.push('/');
            }
            out.push_str(rest);
        }
        if !out.starts_with('/') {
            out.insert(0, '/');
        }
        out
    }

    pub fn record(&self, status: u16, latency: std::time::Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if status >= 400 {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_us_total
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> RouteStatsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let total_us = self.latency_us_total.load(Ordering::Relaxed);
        RouteStatsSnapshot {
            route: self.name.to_string(),
            path: self.definition.path.clone(),
            method: self
                .method
                .as_ref()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "*".to_string()),
            service: self.definition.service.clone(),
            requests,
            errors: self.errors.load(Ordering::Relaxed),
            avg_latency_ms: if requests == 0 {
                0.0
            } else {
                total_us as f64 / requests as f64 / 1000.0
            },
        }
    }
}

/// Routes in registration order; the first match wins.
///
/// Readers load the current list without locking; registration copies the
/// list under a writer mutex and swaps it in.
pub struct RouteTable {
    routes: ArcSwap<Vec<Arc<CompiledRoute>>>,
    write: Mutex<()>,
    next_id: AtomicU64,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            routes: ArcSwap::from_pointee(Vec::new()),
            write: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering an identical definition twice returns the existing route.
    /// A different definition reusing an explicit route name is rejected.
    pub fn add(&self, definition: RouteDefinition) -> Result<Arc<CompiledRoute>, GatewayError> {
        let mut compiled = CompiledRoute::compile(definition)?;
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());

        let current = self.routes.load();
        if let Some(existing) = current
            .iter()
            .find(|r| r.definition == compiled.definition)
        {
            return Ok(existing.clone());
        }
        let named = !compiled.definition.name.is_empty();
        if let Some(clash) = current
            .iter()
            .find(|r| r.name == compiled.name && (named || !r.definition.name.is_empty()))
        {
            return Err(GatewayError::Config(format!(
                "route name '{}' is already used by {} {} -> {}",
                compiled.name,
                clash.definition.method,
                clash.definition.path,
                clash.definition.service
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        compiled.key = format!("{}#{}", compiled.name, id).into();
        let compiled = Arc::new(compiled);

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(compiled.clone());
        self.routes.store(Arc::new(next));

        tracing::info!(
            "routing: route registered, name={}, path={}, method={}, service={}",
            compiled.name,
            compiled.definition.path,
            compiled.definition.method,
            compiled.definition.service
        );
        Ok(compiled)
    }

    pub fn match_route(&self, method: &Method, path: &str) -> Option<Arc<CompiledRoute>> {
        self.routes
            .load()
            .iter()
            .find(|r| r.matches(method, path))
            .cloned()
    }

    pub fn all_routes(&self) -> Vec<Arc<CompiledRoute>> {
        self.routes.load().as_ref().clone()
    }

    pub fn route_count(&self) -> usize {
        self.routes.load().len()
    }
}
