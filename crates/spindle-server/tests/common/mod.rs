//! Shared helpers for the balancer integration tests: disposable upstream
//! servers with scripted health behaviour, and a balancer instance bound
//! to an ephemeral port.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::Router;
use spindle_core::SelectionPolicy;
use spindle_server::config::{self, Config, ConfigFormat};
use spindle_server::Server;

/// How often test balancers probe their backends.
pub const PROBE_PERIOD: Duration = Duration::from_millis(50);

/// Scripted liveness behaviour of a test upstream.
#[derive(Clone, Copy, PartialEq)]
pub enum HealthMode {
    AlwaysAlive,
    NeverAlive,
    /// Healthy until the first proxied request lands, dead afterwards.
    AliveThenDead,
}

pub struct TestBackend {
    pub url: String,
    pub requests: Arc<AtomicU32>,
    pub healths: Arc<AtomicU32>,
}

impl TestBackend {
    pub fn requests_received(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }
}

struct BackendState {
    mode: HealthMode,
    requests: Arc<AtomicU32>,
    healths: Arc<AtomicU32>,
}

async fn handle_healthz(State(state): State<Arc<BackendState>>) -> (StatusCode, &'static str) {
    state.healths.fetch_add(1, Ordering::SeqCst);
    let alive = match state.mode {
        HealthMode::AlwaysAlive => true,
        HealthMode::NeverAlive => false,
        HealthMode::AliveThenDead => state.requests.load(Ordering::SeqCst) == 0,
    };
    if alive {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "I died!")
    }
}

async fn handle_echo(headers: HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn handle_any(State(state): State<Arc<BackendState>>) -> (StatusCode, &'static str) {
    state.requests.fetch_add(1, Ordering::SeqCst);
    (StatusCode::OK, "OK")
}

/// Spawns an upstream on an ephemeral port.
pub async fn spawn_backend(mode: HealthMode) -> TestBackend {
    let requests = Arc::new(AtomicU32::new(0));
    let healths = Arc::new(AtomicU32::new(0));
    let state = Arc::new(BackendState {
        mode,
        requests: Arc::clone(&requests),
        healths: Arc::clone(&healths),
    });

    let app = Router::new()
        .route("/healthz", get(handle_healthz))
        .route("/echo", get(handle_echo))
        .fallback(handle_any)
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestBackend {
        url: format!("http://{addr}"),
        requests,
        healths,
    }
}

/// A static round-robin config probing `/healthz` every [`PROBE_PERIOD`].
pub fn static_config(urls: &[String], disconnect_threshold: Option<u32>) -> Config {
    let mut health = serde_json::json!({
        "probe": {"http_get": {"path": "/healthz"}},
        "period": format!("{}ms", PROBE_PERIOD.as_millis()),
    });
    if let Some(threshold) = disconnect_threshold {
        health["disconnect_threshold"] = serde_json::json!(threshold);
    }
    let doc = serde_json::json!({
        "name": "test-lb",
        "port": 0,
        "backend": {"static": {"urls": urls}},
        "health_check": health,
    });
    config::parse(&doc.to_string(), ConfigFormat::Json).unwrap()
}

/// A dynamic-discovery config without health checking.
pub fn dynamic_config() -> Config {
    let doc = serde_json::json!({
        "name": "test-lb",
        "port": 0,
        "backend": {"dynamic": {
            "register_path": "/register",
            "deregister_path": "/deregister",
        }},
    });
    config::parse(&doc.to_string(), ConfigFormat::Json).unwrap()
}

/// Starts a balancer on an ephemeral port, returning its base URL and a
/// handle on its policy for pool assertions.
pub async fn spawn_balancer(cfg: Config) -> (String, Arc<SelectionPolicy>) {
    let server = Server::new(cfg).expect("balancer config should be valid");
    let policy = Arc::clone(server.policy());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server.serve_with(listener).await.unwrap();
    });
    (format!("http://{addr}"), policy)
}

/// Waits long enough for at least two probe rounds to land.
pub async fn wait_for_health_checks() {
    tokio::time::sleep(3 * PROBE_PERIOD).await;
}
