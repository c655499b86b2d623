use crate::error::GatewayError;
use crate::routing::CompiledRoute;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Requests and responses seen by the gateway core are fully buffered; the
/// route timeout covers the upstream body as well as its headers.
pub type GatewayRequest = http::Request<Bytes>;
pub type GatewayResponse = http::Response<Bytes>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> GatewayResponse {
    let mut resp = http::Response::new(body.into());
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

/// Structured, non-leaking error body for `err`.
pub fn error_response(err: &GatewayError) -> GatewayResponse {
    json_response(err.status_code(), err.to_json_body())
}

/// Per-request bookkeeping for logging and metrics.
pub struct RequestContext {
    pub host: String,
    pub uri_path: String,
    pub method: Method,
    pub route: Option<Arc<CompiledRoute>>,
    pub service: Option<String>,
    pub upstream_addr: Option<String>,
    pub client_ip: Option<IpAddr>,
    pub start: Instant,
}

impl RequestContext {
    pub fn new(req: &GatewayRequest, client_ip: Option<IpAddr>) -> Self {
        let host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Self {
            host,
            uri_path: req.uri().path().to_string(),
            method: req.method().clone(),
            route: None,
            service: None,
            upstream_addr: None,
            client_ip,
            start: Instant::now(),
        }
    }

    pub fn finalize(&self, status: StatusCode) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16()).to_owned();
        let route = self
            .route
            .as_ref()
            .map(|r| r.name.to_string())
            .unwrap_or_else(|| "_no_route".to_string());
        let elapsed = self.start.elapsed();

        metrics::counter!(
            "aegis_http_requests_total",
            "route" => route.clone(),
            "method" => self.method.to_string(),
            "status_code" => status_str,
        )
        .increment(1);
        metrics::histogram!("aegis_http_request_duration_seconds", "route" => route)
            .record(elapsed.as_secs_f64());

        tracing::info!(
            client_ip = ?self.client_ip,
            method = %self.method,
            host = %self.host,
            path = %self.uri_path,
            status = status.as_u16(),
            route = self.route.as_ref().map(|r| &*r.name).unwrap_or(""),
            service = self.service.as_deref().unwrap_or(""),
            upstream = self.upstream_addr.as_deref().unwrap_or(""),
            latency_ms = elapsed.as_millis() as u64,
            "access"
        );
    }
}
