use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::server::{self, GatewayState};
use anyhow::Result;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: Option<String>,
}

/// Gateway lifecycle: init -> start services -> serve -> shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = GatewayConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(admin_listen) = args.admin_listen {
        config.server.admin_listen = admin_listen;
    }

    let metrics = Metrics::install()?;
    let state = GatewayState::new(config, metrics)?;

    // Static services come up in dependency order before any traffic.
    let ids = state.start_configured_services().await?;
    tracing::info!(
        "server: static services started, instances={}, routes={}",
        ids.len(),
        state.gateway.routes().len()
    );

    let shutdown = CancellationToken::new();
    start_purge_loop(&state, &shutdown);
    let admin_handle = start_admin_server(&state);

    tracing::info!("server: starting gateway, listen={}", state.config.server.listen);
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move {
            let listen = state.config.server.listen.clone();
            server::run_proxy_server(&listen, state, shutdown).await
        }
    });

    wait_for_shutdown(&shutdown).await?;
    // One budget covers connection drain and in-flight requests together.
    let deadline = Instant::now() + state.config.server.shutdown_timeout();

    // Health observations freeze first so nothing flips while draining.
    state.monitor.shutdown().await;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error, error={}", e),
    }

    if !state.gateway.drain_until(deadline).await {
        tracing::warn!(
            "server: in-flight requests still running after drain, remaining={}",
            state.gateway.in_flight()
        );
    }

    let report = state.manager.stop_all_services().await;
    if !report.is_clean() {
        for failure in &report.failed {
            tracing::warn!(
                "server: service did not stop cleanly, service={}, error={}",
                failure.service,
                failure.error
            );
        }
    }

    admin_handle.abort();
    tracing::info!("server: shutdown complete, stopped={}", report.stopped.len());
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // The writer must outlive every log call, including those during shutdown.
    std::mem::forget(guard);
}

/// Sleep for `duration`, returning `true` early if shutdown is signalled.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}

/// Expired decommission windows are otherwise only purged on registry writes.
fn start_purge_loop(state: &GatewayState, shutdown: &CancellationToken) {
    let grace = state.config.registry.decommission_grace();
    if grace.is_zero() {
        return;
    }
    let registry = state.registry.clone();
    let shutdown = shutdown.clone();
    let interval = grace.max(Duration::from_secs(1));

    tokio::spawn(async move {
        loop {
            if sleep_or_shutdown(interval, &shutdown).await {
                return;
            }
            registry.purge_expired();
        }
    });
}

fn start_admin_server(state: &GatewayState) -> tokio::task::JoinHandle<()> {
    let s = state.clone();
    tokio::spawn(async move {
        let admin_addr = s.config.server.admin_listen.clone();
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    })
}

async fn wait_for_shutdown(shutdown: &CancellationToken) -> Result<()> {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
            _ = term.recv() => tracing::info!("server: received SIGTERM, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await?;
        tracing::info!("server: received SIGINT, shutting down");
    }

    shutdown.cancel();
    Ok(())
}
