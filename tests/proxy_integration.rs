//! End-to-end tests for the proxy and admin listeners.
//!
//! Each test starts an in-process hyper backend and a gateway bound to
//! ephemeral ports, then drives them over TCP with reqwest.
//!
//! Run with: `cargo test --test proxy_integration`

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use resilience_gateway::config::{CircuitBreakerConfig, GatewayConfig, ServiceConfig};
use resilience_gateway::metrics::Metrics;
use resilience_gateway::server::{self, GatewayState};
use resilience_gateway::upstream::CircuitState;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// A backend whose status code and latency can be changed mid-test.
struct Backend {
    addr: SocketAddr,
    status: Arc<AtomicU16>,
    delay_ms: Arc<AtomicU64>,
    hits: Arc<AtomicUsize>,
}

impl Backend {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn set_status(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Echo backend: answers with the configured status and a JSON body that
/// describes the request it received.
async fn start_backend() -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let status = Arc::new(AtomicU16::new(200));
    let delay_ms = Arc::new(AtomicU64::new(0));
    let hits = Arc::new(AtomicUsize::new(0));

    let (s, d, h) = (status.clone(), delay_ms.clone(), hits.clone());
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (s, d, h) = (s.clone(), d.clone(), h.clone());
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let (s, d, h) = (s.clone(), d.clone(), h.clone());
                    async move {
                        h.fetch_add(1, Ordering::SeqCst);
                        let delay = d.load(Ordering::SeqCst);
                        if delay > 0 {
                            tokio::time::sleep(Duration::from_millis(delay)).await;
                        }
                        let method = req.method().to_string();
                        let path = req.uri().path().to_string();
                        let query = req.uri().query().unwrap_or("").to_string();
                        let host = req
                            .headers()
                            .get("host")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let xff = req
                            .headers()
                            .get("x-forwarded-for")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = req.into_body().collect().await.unwrap().to_bytes();
                        let payload = serde_json::json!({
                            "method": method,
                            "path": path,
                            "query": query,
                            "host": host,
                            "x_forwarded_for": xff,
                            "body": String::from_utf8_lossy(&body),
                        });
                        let mut resp = Response::new(Full::new(Bytes::from(payload.to_string())));
                        *resp.status_mut() =
                            hyper::StatusCode::from_u16(s.load(Ordering::SeqCst)).unwrap();
                        resp.headers_mut()
                            .insert("x-backend", "echo".parse().unwrap());
                        resp.headers_mut()
                            .insert("proxy-authenticate", "Basic".parse().unwrap());
                        resp.headers_mut()
                            .insert("keep-alive", "timeout=5".parse().unwrap());
                        Ok::<_, Infallible>(resp)
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    Backend {
        addr,
        status,
        delay_ms,
        hits,
    }
}

struct Gateway {
    proxy: SocketAddr,
    admin: SocketAddr,
    state: GatewayState,
    shutdown: Arc<Notify>,
    http: reqwest::Client,
}

impl Gateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.proxy, path)
    }

    fn admin_url(&self, path: &str) -> String {
        format!("http://{}{}", self.admin, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.http.get(self.url(path)).send().await.unwrap()
    }

    fn get_owned(&self, path: String) -> impl std::future::Future<Output = reqwest::Response> {
        let request = self.http.get(self.url(&path));
        async move { request.send().await.unwrap() }
    }

    fn breaker_state(&self, service: &str) -> CircuitState {
        self.state.breakers.get(service).current_state()
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

fn breaker_config(wait: Duration) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_rate_threshold: 50.0,
        sliding_window_size: 10,
        minimum_calls: 5,
        wait_duration_in_open: wait,
        permitted_calls_in_half_open: 3,
    }
}

async fn start_gateway(services: &[(&str, String, u64)], breaker: CircuitBreakerConfig) -> Gateway {
    let mut config = GatewayConfig {
        circuit_breaker: breaker,
        ..Default::default()
    };
    for (id, url, timeout) in services {
        config
            .services
            .insert(id.to_string(), ServiceConfig::new(url.clone(), *timeout));
    }

    let state = GatewayState::new(config, Metrics::detached().unwrap());
    let shutdown = Arc::new(Notify::new());

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy = proxy_listener.local_addr().unwrap();
    let admin = admin_listener.local_addr().unwrap();

    tokio::spawn(server::serve_proxy(
        proxy_listener,
        state.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(server::serve_admin(
        admin_listener,
        state.clone(),
        shutdown.clone(),
    ));

    Gateway {
        proxy,
        admin,
        state,
        shutdown,
        http: reqwest::Client::builder().no_proxy().build().unwrap(),
    }
}

async fn single_service_gateway(backend: &Backend, wait: Duration) -> Gateway {
    start_gateway(
        &[("user-service", backend.url(), 2000)],
        breaker_config(wait),
    )
    .await
}

#[tokio::test]
async fn test_healthy_backend_passes_through() {
    let backend = start_backend().await;
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;

    for _ in 0..10 {
        let resp = gw.get("/proxy/user-service/api/users/1").await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.headers().get("x-backend").unwrap(), "echo");
        assert!(resp.headers().get("proxy-authenticate").is_none());
        assert!(resp.headers().get("keep-alive").is_none());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["path"], "/api/users/1");
        assert_eq!(body["method"], "GET");
    }

    assert_eq!(gw.breaker_state("user-service"), CircuitState::Closed);
    let m = gw.state.breakers.get("user-service").metrics();
    assert_eq!(m.buffered_calls, 10);
    assert_eq!(m.failed_calls, 0);
}

#[tokio::test]
async fn test_failing_backend_trips_breaker() {
    let backend = start_backend().await;
    backend.set_status(500);
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;

    for _ in 0..5 {
        let resp = gw.get("/proxy/user-service/api/users/1").await;
        assert_eq!(resp.status(), 500);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["path"], "/api/users/1");
    }
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Open);

    for _ in 0..5 {
        let resp = gw.get("/proxy/user-service/api/users/1").await;
        assert_eq!(resp.status(), 503);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Service unavailable");
        assert_eq!(body["service"], "user-service");
        assert_eq!(body["fallback"], true);
    }
    assert_eq!(backend.hits(), 5);
}

#[tokio::test]
async fn test_breaker_recovers_after_wait() {
    let backend = start_backend().await;
    backend.set_status(503);
    let gw = single_service_gateway(&backend, Duration::from_millis(200)).await;

    for _ in 0..5 {
        gw.get("/proxy/user-service/health").await;
    }
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Open);

    backend.set_status(200);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(gw.breaker_state("user-service"), CircuitState::HalfOpen);

    for _ in 0..3 {
        assert_eq!(gw.get("/proxy/user-service/health").await.status(), 200);
    }
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Closed);
    assert_eq!(gw.state.breakers.get("user-service").metrics().buffered_calls, 0);
}

#[tokio::test]
async fn test_half_open_failure_reopens() {
    let backend = start_backend().await;
    backend.set_status(500);
    let gw = single_service_gateway(&backend, Duration::from_millis(200)).await;

    for _ in 0..5 {
        gw.get("/proxy/user-service/x").await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(gw.get("/proxy/user-service/x").await.status(), 500);
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Open);
    assert_eq!(gw.get("/proxy/user-service/x").await.status(), 503);
    assert_eq!(backend.hits(), 6);
}

#[tokio::test]
async fn test_unknown_service_is_rejected() {
    let backend = start_backend().await;
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;

    for _ in 0..3 {
        let resp = gw.get("/proxy/billing-service/api/invoices").await;
        assert_eq!(resp.status(), 400);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Unknown service: billing-service");
    }
    assert!(!gw.state.breakers.contains("billing-service"));
    assert_eq!(backend.hits(), 0);

    let breakers: serde_json::Value = gw
        .http
        .get(gw.admin_url("/breakers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(breakers.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_services_are_isolated() {
    let failing = start_backend().await;
    failing.set_status(500);
    let healthy = start_backend().await;
    let gw = start_gateway(
        &[
            ("user-service", failing.url(), 2000),
            ("notification-service", healthy.url(), 2000),
        ],
        breaker_config(Duration::from_secs(30)),
    )
    .await;

    for _ in 0..5 {
        gw.get("/proxy/user-service/x").await;
    }
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Open);

    let resp = gw.get("/proxy/notification-service/api/notify").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(gw.breaker_state("notification-service"), CircuitState::Closed);
}

#[tokio::test]
async fn test_post_body_query_and_headers_forwarded() {
    let backend = start_backend().await;
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;

    let resp = gw
        .http
        .post(gw.url("/proxy/user-service/api/users?q=test&page=2"))
        .header("content-type", "application/json")
        .body(r#"{"name":"Ada"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["method"], "POST");
    assert_eq!(body["path"], "/api/users");
    assert_eq!(body["query"], "q=test&page=2");
    assert_eq!(body["body"], r#"{"name":"Ada"}"#);
    assert_eq!(body["host"], backend.addr.to_string());
    assert_eq!(body["x_forwarded_for"], "127.0.0.1");
}

#[tokio::test]
async fn test_client_errors_do_not_trip() {
    let backend = start_backend().await;
    backend.set_status(404);
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;

    for _ in 0..10 {
        assert_eq!(gw.get("/proxy/user-service/missing").await.status(), 404);
    }
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Closed);
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = start_backend().await;
    backend.delay_ms.store(1000, Ordering::SeqCst);
    let gw = start_gateway(
        &[("user-service", backend.url(), 100)],
        breaker_config(Duration::from_secs(30)),
    )
    .await;

    let resp = gw.get("/proxy/user-service/slow").await;
    assert_eq!(resp.status(), 504);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Gateway timeout");
    assert_eq!(
        gw.state.breakers.get("user-service").metrics().failed_calls,
        1
    );
}

#[tokio::test]
async fn test_connection_refused_is_bad_gateway() {
    // Bind then drop to get a port nothing listens on.
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_url = format!("http://{}", dead.local_addr().unwrap());
    drop(dead);

    let gw = start_gateway(
        &[("user-service", dead_url, 2000)],
        breaker_config(Duration::from_secs(30)),
    )
    .await;

    for _ in 0..5 {
        let resp = gw.get("/proxy/user-service/x").await;
        assert_eq!(resp.status(), 502);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Bad gateway");
    }
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Open);
    assert_eq!(gw.get("/proxy/user-service/x").await.status(), 503);
}

#[tokio::test]
async fn test_admin_overrides() {
    let backend = start_backend().await;
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;

    let resp = gw
        .http
        .post(gw.admin_url("/breakers/user-service/force-open"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(gw.get("/proxy/user-service/x").await.status(), 503);
    assert_eq!(backend.hits(), 0);

    gw.http
        .post(gw.admin_url("/breakers/user-service/disable"))
        .send()
        .await
        .unwrap();
    backend.set_status(500);
    for _ in 0..10 {
        assert_eq!(gw.get("/proxy/user-service/x").await.status(), 500);
    }
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Disabled);

    backend.set_status(200);
    gw.http
        .post(gw.admin_url("/breakers/user-service/reset"))
        .send()
        .await
        .unwrap();
    assert_eq!(gw.breaker_state("user-service"), CircuitState::Closed);
    assert_eq!(gw.get("/proxy/user-service/x").await.status(), 200);

    let resp = gw
        .http
        .post(gw.admin_url("/breakers/billing/force-open"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    assert!(!gw.state.breakers.contains("billing"));
}

#[tokio::test]
async fn test_non_proxy_path_is_not_found() {
    let backend = start_backend().await;
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;
    assert_eq!(gw.get("/api/users").await.status(), 404);
    assert_eq!(backend.hits(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_breaker() {
    let backend = start_backend().await;
    let gw = single_service_gateway(&backend, Duration::from_secs(30)).await;

    let requests = (0..20).map(|i| gw.get_owned(format!("/proxy/user-service/api/users/{}", i)));
    let statuses: Vec<u16> = futures_util::future::join_all(requests)
        .await
        .into_iter()
        .map(|r| r.status().as_u16())
        .collect();

    assert!(statuses.iter().all(|s| *s == 200));
    assert_eq!(backend.hits(), 20);
    assert_eq!(gw.state.breakers.len(), 1);
    // Window holds the most recent `sliding_window_size` outcomes.
    assert_eq!(gw.state.breakers.get("user-service").metrics().buffered_calls, 10);
}
