use crate::proxy::context::{full_body, json_response, BoxBody};
use crate::server::GatewayState;
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::debug;

/// Proxy-port entry point: buffer the request body, run it through the
/// gateway and send the buffered answer back.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("proxy: request body read failed, peer={}, error={}", peer_addr, e);
            let body = serde_json::json!({
                "error": { "code": "BAD_REQUEST", "message": "bad request" }
            });
            return Ok(json_response(StatusCode::BAD_REQUEST, body.to_string()).map(full_body));
        }
    };

    let resp = state
        .gateway
        .handle(Request::from_parts(parts, body), Some(peer_addr.ip()))
        .await;
    Ok(resp.map(full_body))
}
