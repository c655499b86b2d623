use crate::error::GatewayError;
use crate::proxy::context::{GatewayRequest, GatewayResponse};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;

/// Transport used by the gateway to reach a selected instance.
///
/// The request URI is absolute (`http://host:port/path?query`). Errors are
/// transport failures only; any HTTP status is a successful response.
pub trait UpstreamClient: Send + Sync + 'static {
    fn send(&self, req: GatewayRequest) -> BoxFuture<'static, Result<GatewayResponse, GatewayError>>;
}

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 32;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pooled hyper client. Plain HTTP and HTTPS upstreams share one pool;
/// HTTP/2 is negotiated through ALPN for TLS connections.
#[derive(Clone)]
pub struct HyperUpstreamClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl Default for HyperUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperUpstreamClient {
    pub fn new() -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
        http.set_connect_timeout(Some(CONNECT_TIMEOUT));
        http.enforce_http(false);

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build(https);
        Self { client }
    }
}

impl UpstreamClient for HyperUpstreamClient {
    fn send(&self, req: GatewayRequest) -> BoxFuture<'static, Result<GatewayResponse, GatewayError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let resp = client
                .request(req.map(Full::new))
                .await
                .map_err(|e| GatewayError::UpstreamConnect(e.to_string()))?;
            let (parts, body) = resp.into_parts();
            let bytes = body
                .collect()
                .await
                .map_err(|e| GatewayError::UpstreamConnect(e.to_string()))?
                .to_bytes();
            Ok(http::Response::from_parts(parts, bytes))
        })
    }
}
