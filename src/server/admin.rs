use super::GatewayState;
use crate::config::ServiceDefinition;
use crate::error::GatewayError;
use crate::proxy::context::{error_response, full_body, json_response};
use crate::proxy::{BoxBody, GatewayResponse};
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Serialize;
use tracing::{info, warn};

/// Read-only introspection plus the HTTP registration contract.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = match (&method, path.as_str()) {
        (&Method::GET, "/health" | "/healthz") => gateway_health(&state),
        (&Method::GET, "/health/system") => json_ok(&state.monitor.system_health()),
        (&Method::GET, "/services") => json_ok(&state.registry.list_all()),
        (&Method::GET, "/routes") => {
            let routes: Vec<_> = state.gateway.routes().iter().map(|r| r.stats()).collect();
            json_ok(&routes)
        }
        (&Method::GET, "/stats") => json_ok(&serde_json::json!({
            "registry": state.registry.counts(),
            "load_balancer": state.lb.stats(),
            "health": state.monitor.stats(),
            "circuit_breakers": {
                "summary": state.breakers.health_summary(),
                "breakers": state.breakers.stats(),
            },
            "gateway": state.gateway.stats(),
            "manager": state.manager.stats(),
        })),
        (&Method::GET, "/metrics") => {
            let mut resp = http::Response::new(state.metrics.render().into());
            resp.headers_mut().insert(
                http::header::CONTENT_TYPE,
                http::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            resp
        }
        (&Method::POST, "/services") => register_service(req, &state).await?,
        (&Method::DELETE, p) if p.starts_with("/services/") => {
            let id = &p["/services/".len()..];
            deregister_service(id, &state).await
        }
        _ => not_found(),
    };

    Ok(resp.map(full_body))
}

fn gateway_health(state: &GatewayState) -> GatewayResponse {
    let system = state.monitor.system_health();
    let breakers = state.breakers.health_summary();
    let dependencies: serde_json::Map<String, serde_json::Value> = system
        .services
        .iter()
        .map(|(name, svc)| {
            (
                name.clone(),
                serde_json::json!({
                    "status": svc.status,
                    "critical": svc.critical,
                    "healthy_instances": svc.healthy,
                    "instances": svc.instances,
                }),
            )
        })
        .collect();

    let instance = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();

    json_ok(&serde_json::json!({
        "status": system.status,
        "instance": instance,
        "uptime": humantime::format_duration(std::time::Duration::from_secs(state.uptime().as_secs())).to_string(),
        "uptime_secs": state.uptime().as_secs_f64(),
        "dependencies": dependencies,
        "circuit_breakers": breakers.status,
        "checked_at": system.checked_at,
    }))
}

async fn register_service(
    req: Request<Incoming>,
    state: &GatewayState,
) -> Result<GatewayResponse, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    let definition: ServiceDefinition = match serde_json::from_slice(&body) {
        Ok(d) => d,
        Err(e) => return Ok(bad_request(&format!("invalid service definition: {e}"))),
    };

    let name = definition.name.clone();
    Ok(match state.register_service(definition) {
        Ok(id) => {
            info!("admin: service registered, service={}, instance={}", name, id);
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "id": id }).to_string(),
            )
        }
        Err(e) => {
            warn!("admin: registration rejected, service={}, error={}", name, e);
            registration_error(&e)
        }
    })
}

async fn deregister_service(id: &str, state: &GatewayState) -> GatewayResponse {
    match state.manager.deregister(id).await {
        Ok(inst) => {
            info!(
                "admin: service deregistered, service={}, instance={}",
                inst.name(),
                id
            );
            json_ok(&serde_json::json!({ "id": id, "draining": inst.is_draining() }))
        }
        Err(e) => registration_error(&e),
    }
}

/// Admin callers are operators, so registration errors carry their full
/// text; gateway clients never see this body.
fn registration_error(err: &GatewayError) -> GatewayResponse {
    match err {
        GatewayError::Config(msg) => bad_request(msg),
        GatewayError::DuplicateRegistration { .. } | GatewayError::InstanceNotFound(_) => {
            json_response(
                err.status_code(),
                serde_json::json!({
                    "error": { "code": err.code(), "message": err.to_string() }
                })
                .to_string(),
            )
        }
        _ => error_response(err),
    }
}

fn json_ok<T: Serialize>(value: &T) -> GatewayResponse {
    match serde_json::to_string_pretty(value) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error_response(&GatewayError::Config(e.to_string())),
    }
}

fn bad_request(message: &str) -> GatewayResponse {
    json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({
            "error": { "code": "BAD_REQUEST", "message": message }
        })
        .to_string(),
    )
}

fn not_found() -> GatewayResponse {
    json_response(
        StatusCode::NOT_FOUND,
        serde_json::json!({
            "error": { "code": "NOT_FOUND", "message": "not found" }
        })
        .to_string(),
    )
}
