use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Latency buckets in seconds, shared by request and probe timings.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Handle to the process-wide Prometheus recorder.
///
/// After `install` the `counter!`/`gauge!`/`histogram!` macros used across
/// the crate feed this recorder; the handle only renders `/metrics`.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global recorder. Fails if one is already installed.
    pub fn install() -> Result<Self> {
        let handle = Self::builder()?
            .install_recorder()
            .context("failed to install metrics recorder")?;
        describe_all();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally. Macro calls elsewhere do
    /// not reach it; useful where a process-wide recorder already exists.
    pub fn detached() -> Result<Self> {
        let recorder = Self::builder()?.build_recorder();
        Ok(Self {
            handle: recorder.handle(),
        })
    }

    fn builder() -> Result<PrometheusBuilder> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .context("invalid latency buckets")?
            .set_buckets_for_metric(
                Matcher::Full("aegis_service_response_time_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .context("invalid probe latency buckets")?;
        Ok(builder)
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_all() {
    // request path
    describe_counter!(
        "aegis_http_requests_total",
        Unit::Count,
        "Requests handled by the gateway, by route, method and status"
    );
    describe_histogram!(
        "aegis_http_request_duration_seconds",
        Unit::Seconds,
        "End-to-end request duration seen by the client"
    );
    describe_counter!(
        "aegis_rate_limit_rejected_total",
        Unit::Count,
        "Requests rejected by a route rate limit"
    );

    // instance selection
    describe_counter!(
        "aegis_lb_selections_total",
        Unit::Count,
        "Instance selections by service and strategy"
    );
    describe_gauge!(
        "aegis_connections_active",
        Unit::Count,
        "Requests currently held against upstream instances"
    );

    // health
    describe_counter!(
        "aegis_health_check_total",
        Unit::Count,
        "Health probes by service and result"
    );
    describe_gauge!(
        "aegis_service_health",
        Unit::Count,
        "Last probe outcome per instance: 1=success 0=failure"
    );
    describe_histogram!(
        "aegis_service_response_time_seconds",
        Unit::Seconds,
        "Latency of successful health probes"
    );

    // circuit breaker
    describe_gauge!(
        "aegis_circuit_breaker_state",
        Unit::Count,
        "Breaker state: 0=closed 1=open 2=half_open"
    );
    describe_counter!(
        "aegis_circuit_breaker_rejected_total",
        Unit::Count,
        "Calls rejected without reaching the upstream"
    );

    // downstream connections
    describe_gauge!(
        "aegis_downstream_connections_active",
        Unit::Count,
        "Open client connections on the proxy listener"
    );
    describe_counter!(
        "aegis_downstream_connections_total",
        Unit::Count,
        "Client connections accepted or failed"
    );

    // registry
    describe_gauge!(
        "aegis_registry_instances",
        Unit::Count,
        "Registered instances, draining included"
    );
}
