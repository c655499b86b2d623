mod admin;
pub mod bootstrap;
pub mod manager;
mod state;

pub use manager::{ManagerStats, ServiceManager, ShutdownReport};
pub use state::GatewayState;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bind `listen` and serve the proxy until `shutdown` is cancelled.
pub async fn run_proxy_server(
    listen: &str,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_proxy(listener, state, shutdown).await
}

/// Accept loop for the proxy port.
///
/// Once `shutdown` is cancelled no new connection is accepted; open
/// connections get up to `server.shutdown_timeout_secs`, counted from the
/// cancellation, to finish before this returns. A token cancelled before the
/// loop starts stops it at once.
pub async fn serve_proxy(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("server: proxy listening, addr={}", listener.local_addr()?);
    let drain_timeout = state.config.server.shutdown_timeout();
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("server: proxy: stop accepting new connections");
                break;
            }
            result = listener.accept() => result,
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!("aegis_downstream_connections_total", "status" => "accepted")
                    .increment(1);
                v
            }
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                metrics::counter!("aegis_downstream_connections_total", "status" => "error")
                    .increment(1);
                continue;
            }
        };

        metrics::gauge!("aegis_downstream_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { proxy::handle_request(req, state, peer_addr).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(Duration::from_secs(20)))
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("aegis_downstream_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    let deadline = Instant::now() + drain_timeout;
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: proxy: draining connections, active={}", active);
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        match tokio::time::timeout_at(deadline, drain).await {
            Ok(()) => info!("server: proxy: all connections drained"),
            Err(_) => info!(
                "server: proxy: drain timeout, timeout={:?}, remaining={}",
                drain_timeout,
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// Bind `listen` and serve the admin API.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_admin(listener, state).await
}

pub async fn serve_admin(listener: TcpListener, state: GatewayState) -> Result<()> {
    info!("server: admin listening, addr={}", listener.local_addr()?);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
