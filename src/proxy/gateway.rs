use crate::config::RouteDefinition;
use crate::discovery::ServiceInstance;
use crate::error::GatewayError;
use crate::proxy::client::{HyperUpstreamClient, UpstreamClient};
use crate::proxy::context::{error_response, GatewayRequest, GatewayResponse, RequestContext};
use crate::proxy::filter::{self, RateLimiter};
use crate::routing::{CompiledRoute, RouteStatsSnapshot, RouteTable};
use crate::upstream::{BreakerError, CircuitBreakerManager, LoadBalancer};
use http::header::{CONNECTION, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Ingress core: route match, admission, instance selection and a
/// breaker-wrapped upstream call, in that order.
///
/// Every failure is turned into a structured error body here; callers of
/// [`ApiGateway::handle`] always get a response.
pub struct ApiGateway {
    routes: RouteTable,
    limiter: RateLimiter,
    lb: Arc<LoadBalancer>,
    breakers: Arc<CircuitBreakerManager>,
    client: Arc<dyn UpstreamClient>,
    in_flight: AtomicUsize,
    idle: Notify,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    unmatched: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub total_errors: u64,
    pub unmatched_requests: u64,
    pub in_flight: usize,
    pub routes: Vec<RouteStatsSnapshot>,
}

/// Why a breaker-wrapped call failed. A 5xx still reaches the client
/// verbatim; it only counts against the breaker.
enum CallFailure {
    Status(GatewayResponse),
    Transport(GatewayError),
}

impl ApiGateway {
    pub fn new(lb: Arc<LoadBalancer>, breakers: Arc<CircuitBreakerManager>) -> Self {
        Self::with_client(lb, breakers, Arc::new(HyperUpstreamClient::new()))
    }

    pub fn with_client(
        lb: Arc<LoadBalancer>,
        breakers: Arc<CircuitBreakerManager>,
        client: Arc<dyn UpstreamClient>,
    ) -> Self {
        Self {
            routes: RouteTable::new(),
            limiter: RateLimiter::new(),
            lb,
            breakers,
            client,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
        }
    }

    /// Static for the life of the process; later registrations never shadow
    /// earlier ones.
    pub fn register_route(
        &self,
        definition: RouteDefinition,
    ) -> Result<Arc<CompiledRoute>, GatewayError> {
        self.routes.add(definition)
    }

    pub fn routes(&self) -> Vec<Arc<CompiledRoute>> {
        self.routes.all_routes()
    }

    pub async fn handle(&self, req: GatewayRequest, client_ip: Option<IpAddr>) -> GatewayResponse {
        let _flight = InFlight::enter(self);
        let mut ctx = RequestContext::new(&req, client_ip);

        let resp = match self.dispatch(req, &mut ctx).await {
            Ok(resp) => resp,
            Err(err) => {
                match &err {
                    GatewayError::RouteNotFound { .. } | GatewayError::RateLimitExceeded(_) => {
                        debug!("proxy: request rejected, path={}, error={}", ctx.uri_path, err)
                    }
                    _ => warn!(
                        "proxy: request failed, route={}, upstream={}, error={}",
                        ctx.route.as_ref().map(|r| &*r.name).unwrap_or(""),
                        ctx.upstream_addr.as_deref().unwrap_or(""),
                        err
                    ),
                }
                error_response(&err)
            }
        };

        let status = resp.status();
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if status.as_u16() >= 400 {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        match &ctx.route {
            Some(route) => route.record(status.as_u16(), ctx.start.elapsed()),
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
            }
        }
        ctx.finalize(status);
        resp
    }

    async fn dispatch(
        &self,
        req: GatewayRequest,
        ctx: &mut RequestContext,
    ) -> Result<GatewayResponse, GatewayError> {
        let route = self
            .routes
            .match_route(&ctx.method, &ctx.uri_path)
            .ok_or_else(|| GatewayError::RouteNotFound {
                method: ctx.method.to_string(),
                path: ctx.uri_path.clone(),
            })?;
        ctx.route = Some(route.clone());
        ctx.service = Some(route.service().to_string());

        filter::on_request(&self.limiter, &route).await?;

        let guard = self.lb.acquire(route.service(), &[], None)?;
        let instance = guard.instance().clone();
        ctx.upstream_addr = Some(instance.endpoint().to_string());

        let upstream_req = build_upstream_request(req, &route, &instance, ctx.client_ip)?;
        let client = self.client.clone();
        let result = self
            .breakers
            .execute(route.service(), Some(route.definition.timeout()), || async move {
                match client.send(upstream_req).await {
                    Ok(resp) if resp.status().is_server_error() => Err(CallFailure::Status(resp)),
                    Ok(resp) => Ok(resp),
                    Err(e) => Err(CallFailure::Transport(e)),
                }
            })
            .await;
        drop(guard);

        match result {
            Ok(resp) | Err(BreakerError::Inner(CallFailure::Status(resp))) => {
                Ok(downstream_response(resp))
            }
            Err(BreakerError::Inner(CallFailure::Transport(e))) => Err(e),
            Err(BreakerError::Open(service)) => Err(GatewayError::CircuitOpen(service)),
            Err(BreakerError::Timeout(d)) => Err(GatewayError::UpstreamTimeout(d)),
        }
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            unmatched_requests: self.unmatched.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            routes: self.routes.all_routes().iter().map(|r| r.stats()).collect(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait for in-flight requests to finish. Returns `false` if some were
    /// still running when `timeout` elapsed.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.drain_until(tokio::time::Instant::now() + timeout).await
    }

    /// Like `drain`, against a deadline shared with other shutdown steps.
    /// A deadline already in the past only reports the current state.
    pub async fn drain_until(&self, deadline: tokio::time::Instant) -> bool {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }
}

struct InFlight<'a> {
    gateway: &'a ApiGateway,
}

impl<'a> InFlight<'a> {
    fn enter(gateway: &'a ApiGateway) -> Self {
        gateway.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { gateway }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.gateway.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gateway.idle.notify_waiters();
        }
    }
}

fn build_upstream_request(
    req: GatewayRequest,
    route: &CompiledRoute,
    instance: &ServiceInstance,
    client_ip: Option<IpAddr>,
) -> Result<GatewayRequest, GatewayError> {
    let (mut parts, body) = req.into_parts();

    let path = route.rewrite(parts.uri.path());
    let mut uri = String::with_capacity(16 + instance.endpoint().len() + path.len());
    uri.push_str(&instance.definition().protocol);
    uri.push_str("://");
    uri.push_str(instance.endpoint());
    uri.push_str(&path);
    if let Some(query) = parts.uri.query() {
        uri.push('?');
        uri.push_str(query);
    }
    parts.uri = uri
        .parse::<Uri>()
        .map_err(|e| GatewayError::UpstreamConnect(format!("invalid upstream uri: {e}")))?;

    remove_hop_headers(&mut parts.headers);
    if let Some(ip) = client_ip {
        append_forwarded_for(&mut parts.headers, ip);
    }
    Ok(http::Request::from_parts(parts, body))
}

fn downstream_response(resp: GatewayResponse) -> GatewayResponse {
    let (mut parts, body) = resp.into_parts();
    remove_hop_headers(&mut parts.headers);
    http::Response::from_parts(parts, body)
}

/// Removes RFC 7230 hop-by-hop headers plus any header the `Connection`
/// header names.
fn remove_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    const HOP_HEADERS: [&str; 7] = [
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailer",
        "upgrade",
    ];
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    for h in HOP_HEADERS {
        headers.remove(h);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    let peer = ip.to_string();
    let combined = match headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {peer}"),
        _ => peer,
    };
    if let Ok(v) = HeaderValue::from_str(&combined) {
        headers.insert(XFF.clone(), v);
    }
}
