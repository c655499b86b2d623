//! End-to-end tests: real proxy and admin listeners in front of in-process
//! hyper upstreams, all bound to 127.0.0.1:0.
//!
//! Run with: `cargo test --test gateway_integration`

use aegis_gateway::config::{GatewayConfig, RateLimitPolicy, RouteDefinition, ServiceDefinition};
use aegis_gateway::discovery::HealthStatus;
use aegis_gateway::metrics::Metrics;
use aegis_gateway::server::{self, GatewayState};
use aegis_gateway::GatewayError;
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_test::{assert_err, assert_ok};

/// A tiny upstream service: `/health` answers 200 or 500 depending on
/// `healthy`, `/slow` answers after two seconds, everything else answers
/// `status` with its name in `x-served-by`.
struct Upstream {
    addr: SocketAddr,
    healthy: Arc<AtomicBool>,
    status: Arc<AtomicU16>,
    hits: Arc<AtomicUsize>,
}

async fn spawn_upstream(name: &'static str) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let healthy = Arc::new(AtomicBool::new(true));
    let status = Arc::new(AtomicU16::new(200));
    let hits = Arc::new(AtomicUsize::new(0));

    {
        let healthy = healthy.clone();
        let status = status.clone();
        let hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let healthy = healthy.clone();
                let status = status.clone();
                let hits = hits.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let healthy = healthy.clone();
                        let status = status.clone();
                        let hits = hits.clone();
                        async move {
                            let path = req.uri().path().to_string();
                            let resp = if path == "/health" {
                                let code = if healthy.load(Ordering::SeqCst) { 200 } else { 500 };
                                Response::builder()
                                    .status(code)
                                    .body(Full::new(Bytes::from_static(b"{}")))
                                    .unwrap()
                            } else {
                                if path == "/slow" {
                                    tokio::time::sleep(Duration::from_secs(2)).await;
                                }
                                hits.fetch_add(1, Ordering::SeqCst);
                                Response::builder()
                                    .status(status.load(Ordering::SeqCst))
                                    .header("x-served-by", name)
                                    .body(Full::new(Bytes::from(format!("{name} {path}"))))
                                    .unwrap()
                            };
                            Ok::<_, Infallible>(resp)
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), svc)
                        .await;
                });
            }
        });
    }

    Upstream {
        addr,
        healthy,
        status,
        hits,
    }
}

fn service(name: &str, upstream: &Upstream) -> ServiceDefinition {
    ServiceDefinition::new(name, "127.0.0.1", upstream.addr.port())
}

fn quiet_config(strategy: &str) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.load_balancer.strategy = strategy.to_string();
    config.health.interval_secs = 60.0;
    config.health.timeout_secs = 1.0;
    config.manager.dependency_poll_interval_secs = 0.02;
    config
}

struct Gateway {
    state: GatewayState,
    addr: SocketAddr,
    shutdown: CancellationToken,
    proxy: JoinHandle<anyhow::Result<()>>,
}

async fn start_gateway(config: GatewayConfig) -> Gateway {
    let state = GatewayState::new(config, Metrics::detached().unwrap()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let proxy = tokio::spawn(server::serve_proxy(listener, state.clone(), shutdown.clone()));
    Gateway {
        state,
        addr,
        shutdown,
        proxy,
    }
}

fn http() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn round_robin_splits_traffic_evenly() {
    let a = spawn_upstream("users-a").await;
    let b = spawn_upstream("users-b").await;
    let gw = start_gateway(quiet_config("round_robin")).await;

    let mut users_a = service("users", &a);
    users_a.routes.push(RouteDefinition::new("/api/users/*", "users"));
    let mut users_b = service("users", &b);
    users_b.routes.push(RouteDefinition::new("/api/users/*", "users"));
    assert_ok!(gw.state.register_service(users_a));
    assert_ok!(gw.state.register_service(users_b));
    assert_eq!(gw.state.gateway.routes().len(), 1);

    let client = http();
    let mut served: HashMap<String, usize> = HashMap::new();
    for i in 0..100 {
        let resp = client
            .get(format!("http://{}/api/users/{}", gw.addr, i))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let by = resp.headers()["x-served-by"].to_str().unwrap().to_string();
        *served.entry(by).or_default() += 1;
    }

    assert_eq!(served.get("users-a"), Some(&50));
    assert_eq!(served.get("users-b"), Some(&50));
    assert_eq!(a.hits.load(Ordering::SeqCst) + b.hits.load(Ordering::SeqCst), 100);

    let stats = gw.state.gateway.stats();
    assert_eq!(stats.total_requests, 100);
    assert_eq!(stats.total_errors, 0);
    gw.shutdown.cancel();
}

#[tokio::test]
async fn failing_instance_is_excluded_after_probe_failures() {
    let a = spawn_upstream("inv-a").await;
    let b = spawn_upstream("inv-b").await;
    b.healthy.store(false, Ordering::SeqCst);

    let mut config = quiet_config("round_robin");
    config.health.interval_secs = 0.02;
    config.health.removal_threshold = 0;
    let gw = start_gateway(config).await;

    let mut inv_a = service("inventory", &a);
    inv_a.routes.push(RouteDefinition::new("/inventory/*", "inventory"));
    let id_a = assert_ok!(gw.state.register_service(inv_a));
    let id_b = assert_ok!(gw.state.register_service(service("inventory", &b)));

    let registry = gw.state.registry.clone();
    assert!(
        wait_for(|| registry
            .get(&id_b)
            .is_some_and(|i| i.status() == HealthStatus::Unhealthy))
        .await
    );
    assert_eq!(registry.get(&id_a).unwrap().status(), HealthStatus::Healthy);

    let found = registry.find("inventory", &[]);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), id_a);

    let client = http();
    for _ in 0..10 {
        let resp = client
            .get(format!("http://{}/inventory/sku-1", gw.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.headers()["x-served-by"], "inv-a");
    }
    assert_eq!(b.hits.load(Ordering::SeqCst), 0);

    let health = gw.state.monitor.system_health();
    assert_eq!(health.services["inventory"].status, HealthStatus::Healthy);
    assert_eq!(health.services["inventory"].unhealthy, 1);

    gw.state.monitor.shutdown().await;
    gw.shutdown.cancel();
}

#[tokio::test]
async fn breaker_opens_after_upstream_errors() {
    let up = spawn_upstream("billing").await;
    up.status.store(500, Ordering::SeqCst);

    let mut config = quiet_config("round_robin");
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout_secs = 60.0;
    let gw = start_gateway(config).await;

    let mut billing = service("billing", &up);
    billing.routes.push(RouteDefinition::new("/billing/*", "billing"));
    assert_ok!(gw.state.register_service(billing));

    let client = http();
    for _ in 0..3 {
        let resp = client
            .get(format!("http://{}/billing/invoices", gw.addr))
            .send()
            .await
            .unwrap();
        // 5xx is passed through verbatim while the breaker counts it.
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), "billing /billing/invoices");
    }

    let resp = client
        .get(format!("http://{}/billing/invoices", gw.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
    assert!(!body.to_string().contains("127.0.0.1"));

    assert_eq!(up.hits.load(Ordering::SeqCst), 3);
    assert!(gw.state.breakers.is_open("billing"));
    gw.shutdown.cancel();
}

#[tokio::test]
async fn dependent_service_waits_for_healthy_dependency() {
    let auth = spawn_upstream("auth").await;
    let pricing = spawn_upstream("pricing").await;
    let gw = start_gateway(quiet_config("round_robin")).await;
    let manager = gw.state.manager.clone();

    let mut hasty = service("pricing", &pricing).with_dependency("auth");
    hasty.startup_timeout_secs = 0.1;
    assert_ok!(manager.declare(hasty));
    match manager.start_service("pricing").await {
        Err(GatewayError::DependencyUnavailable { service, dependency }) => {
            assert_eq!(service, "pricing");
            assert_eq!(dependency, "auth");
        }
        other => panic!("expected DependencyUnavailable, got {other:?}"),
    }
    assert!(gw.state.registry.find("pricing", &[]).is_empty());

    let mut patient = service("pricing", &pricing).with_dependency("auth");
    patient.startup_timeout_secs = 5.0;
    assert_ok!(manager.declare(patient));
    let starting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start_service("pricing").await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(gw.state.registry.find("pricing", &[]).is_empty());

    assert_ok!(gw.state.register_service(service("auth", &auth)));
    let ids = assert_ok!(starting.await.unwrap());
    assert_eq!(ids.len(), 1);
    assert_eq!(gw.state.registry.find("pricing", &[]).len(), 1);

    let report = gw.state.manager.shutdown().await;
    assert!(report.is_clean());
    // Dependents stop before what they depend on.
    assert_eq!(report.stopped, vec!["pricing", "auth"]);
    gw.shutdown.cancel();
}

#[tokio::test]
async fn circular_static_services_fail_before_registration() {
    let mut config = quiet_config("round_robin");
    config.services = vec![
        ServiceDefinition::new("a", "127.0.0.1", 1).with_dependency("b"),
        ServiceDefinition::new("b", "127.0.0.1", 2).with_dependency("c"),
        ServiceDefinition::new("c", "127.0.0.1", 3).with_dependency("a"),
    ];
    let state = GatewayState::new(config, Metrics::detached().unwrap()).unwrap();

    let err = assert_err!(state.start_configured_services().await);
    match err {
        GatewayError::CircularDependency(cycle) => {
            assert_eq!(cycle.first(), cycle.last());
            assert_eq!(cycle.len(), 4);
        }
        other => panic!("expected CircularDependency, got {other:?}"),
    }
    assert!(state.registry.is_empty());
}

#[tokio::test]
async fn admin_registration_contract() {
    let orders = spawn_upstream("orders").await;
    let gw = start_gateway(quiet_config("round_robin")).await;

    let admin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_addr = admin.local_addr().unwrap();
    tokio::spawn(server::serve_admin(admin, gw.state.clone()));

    let client = http();
    let definition = serde_json::json!({
        "name": "orders",
        "host": "127.0.0.1",
        "port": orders.addr.port(),
        "tags": ["critical"],
        "routes": [{ "path": "/orders/*", "service": "orders", "target_path": "/v1" }],
    });

    let resp = client
        .post(format!("http://{admin_addr}/services"))
        .json(&definition)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: serde_json::Value = resp.json().await.unwrap();
    let id = body["id"].as_str().unwrap().to_string();
    assert!(id.starts_with("orders-"));

    let resp = client
        .post(format!("http://{admin_addr}/services"))
        .json(&definition)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    let resp = client
        .post(format!("http://{admin_addr}/services"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let listed: serde_json::Value = client
        .get(format!("http://{admin_addr}/services"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());

    let resp = client
        .get(format!("http://{}/orders/42", gw.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "orders /v1/42");

    let health: serde_json::Value = client
        .get(format!("http://{admin_addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["dependencies"]["orders"]["critical"], true);

    let stats: serde_json::Value = client
        .get(format!("http://{admin_addr}/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["registry"]["instances"], 1);
    assert_eq!(stats["gateway"]["total_requests"], 1);

    let routes: serde_json::Value = client
        .get(format!("http://{admin_addr}/routes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(routes[0]["path"], "/orders/*");
    assert_eq!(routes[0]["requests"], 1);

    let resp = client
        .delete(format!("http://{admin_addr}/services/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .delete(format!("http://{admin_addr}/services/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(format!("http://{}/orders/42", gw.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);

    let resp = client
        .get(format!("http://{admin_addr}/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    gw.shutdown.cancel();
}

#[tokio::test]
async fn same_path_routes_keep_separate_rate_limits() {
    let up = spawn_upstream("orders").await;
    let gw = start_gateway(quiet_config("round_robin")).await;

    let mut orders = service("orders", &up);
    let mut create = RouteDefinition::new("/orders", "orders");
    create.method = "POST".into();
    create.rate_limit = Some(RateLimitPolicy::sliding_window(1, 60.0));
    let mut list = RouteDefinition::new("/orders", "orders");
    list.method = "GET".into();
    list.rate_limit = Some(RateLimitPolicy::sliding_window(100, 60.0));
    orders.routes.push(create);
    orders.routes.push(list);
    assert_ok!(gw.state.register_service(orders));

    let client = http();
    let url = format!("http://{}/orders", gw.addr);
    assert_eq!(client.post(&url).send().await.unwrap().status(), 200);
    assert_eq!(client.post(&url).send().await.unwrap().status(), 429);
    for _ in 0..5 {
        assert_eq!(client.get(&url).send().await.unwrap().status(), 200);
    }

    let routes: Vec<String> = gw
        .state
        .gateway
        .stats()
        .routes
        .into_iter()
        .map(|r| r.route)
        .collect();
    assert_eq!(routes, vec!["POST /orders", "GET /orders"]);
    gw.shutdown.cancel();
}

#[tokio::test]
async fn proxy_stops_when_cancelled_before_serving() {
    let state = GatewayState::new(quiet_config("round_robin"), Metrics::detached().unwrap()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let proxy = tokio::spawn(server::serve_proxy(listener, state, shutdown));
    let result = tokio::time::timeout(Duration::from_secs(2), proxy).await;
    assert_ok!(assert_ok!(assert_ok!(result)));
}

#[tokio::test]
async fn shutdown_drain_shares_one_deadline() {
    let up = spawn_upstream("reports").await;
    let mut config = quiet_config("round_robin");
    config.server.shutdown_timeout_secs = 0.4;
    let gw = start_gateway(config).await;

    let mut reports = service("reports", &up);
    reports.routes.push(RouteDefinition::new("/slow", "reports"));
    assert_ok!(gw.state.register_service(reports));

    let url = format!("http://{}/slow", gw.addr);
    tokio::spawn(async move { http().get(url).send().await });
    let gateway = gw.state.gateway.clone();
    assert!(wait_for(|| gateway.in_flight() == 1).await);

    let started = std::time::Instant::now();
    let deadline = tokio::time::Instant::now() + gw.state.config.server.shutdown_timeout();
    gw.shutdown.cancel();
    assert_ok!(assert_ok!(gw.proxy.await));
    assert!(!gw.state.gateway.drain_until(deadline).await);

    // Connection drain and request drain together stay within one timeout.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(350), "stopped early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
}
