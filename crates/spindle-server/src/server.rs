//! The dispatcher: the front-end HTTP(S) server.
//!
//! Routes are few: `/healthz` answers liveness probes for the balancer
//! itself, the dynamic registration paths (when configured) let backends
//! join and leave the pool, and everything else is forwarded to the
//! backend picked by the selection policy.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HeaderValue;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use prost::Message;
use spindle_core::{proxy, SelectionPolicy};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Config, Policy, Protocol};
use crate::health::HealthMonitor;
use crate::registration::{backend_url, DeregisterRequest, RegisterRequest};
use crate::tls;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Pool(#[from] spindle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tls error: {0}")]
    Tls(String),
}

struct AppState {
    policy: Arc<SelectionPolicy>,
    /// Without a health checker nothing would ever mark a backend alive,
    /// so in that configuration backends are promoted at registration.
    health_enabled: bool,
}

/// The load balancer server: owns the configuration, the selection policy
/// and the shutdown channel its background tasks listen on.
pub struct Server {
    cfg: Config,
    policy: Arc<SelectionPolicy>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Validates the configuration and builds the policy and its static
    /// backend pool.
    pub fn new(cfg: Config) -> Result<Self, ServerError> {
        cfg.validate()?;

        let static_urls: Vec<String> = cfg
            .backend
            .as_ref()
            .and_then(|b| b.static_backends.as_ref())
            .map(|s| s.urls.clone())
            .unwrap_or_default();
        let policy = match cfg.policy {
            Policy::RoundRobin => SelectionPolicy::round_robin(&static_urls)?,
            Policy::LeastConnections => SelectionPolicy::least_connections(&static_urls)?,
        };
        let policy = Arc::new(policy);

        if cfg.health_check.is_none() {
            for backend in policy.backends() {
                backend.set_alive(true);
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            cfg,
            policy,
            shutdown_tx,
        })
    }

    pub fn policy(&self) -> &Arc<SelectionPolicy> {
        &self.policy
    }

    /// The axum application serving the four logical endpoints.
    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            policy: Arc::clone(&self.policy),
            health_enabled: self.cfg.health_check.is_some(),
        });

        let mut router = Router::new().route("/healthz", get(healthz));
        if let Some(dynamic) = self.cfg.backend.as_ref().and_then(|b| b.dynamic.as_ref()) {
            let register_path = dynamic.register_path.as_deref().unwrap_or("/register");
            let deregister_path = dynamic.deregister_path.as_deref().unwrap_or("/deregister");
            router = router
                .route(register_path, post(register_backend))
                .route(deregister_path, post(deregister_backend));
        }
        router.fallback(dispatch).with_state(state)
    }

    /// Binds the configured port and serves until the process stops.
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.cfg.port.unwrap_or_default()));
        info!(
            "{} balancer will start listening on port {}",
            self.cfg.name.as_deref().unwrap_or("spindle"),
            addr.port()
        );

        match self.cfg.protocol {
            Protocol::Http => {
                let listener = TcpListener::bind(addr).await?;
                self.serve_with(listener).await
            }
            Protocol::Https => {
                let app = self.router();
                self.spawn_health_monitor();
                let cert = self
                    .cfg
                    .cert
                    .as_ref()
                    .ok_or_else(|| ServerError::Tls("HTTPS requires a cert section".into()))?;
                tls::serve(cert, addr, app).await
            }
        }
    }

    /// Serves plain HTTP on an already-bound listener. Useful when the
    /// caller wants an ephemeral port.
    pub async fn serve_with(self, listener: TcpListener) -> Result<(), ServerError> {
        let app = self.router();
        self.spawn_health_monitor();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }

    fn spawn_health_monitor(&self) {
        if let Some(health) = &self.cfg.health_check {
            let monitor = HealthMonitor::new(Arc::clone(&self.policy), health);
            monitor.start(self.shutdown_tx.subscribe());
        }
    }
}

async fn healthz() -> &'static str {
    debug!("got /healthz request");
    "I am alive"
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    mut req: Request,
) -> Response {
    debug!("received request for {}", req.uri());
    append_forwarded_for(&mut req, client);
    match state.policy.select().await {
        Ok(selected) => selected.serve(req).await,
        Err(err) => {
            debug!("no backend for {}: {err}", req.uri());
            proxy::unavailable_response()
        }
    }
}

fn append_forwarded_for(req: &mut Request, client: SocketAddr) {
    let ip = client.ip().to_string();
    let headers = req.headers_mut();
    let value = match headers.get("x-forwarded-for") {
        Some(existing) => match existing.to_str() {
            Ok(existing) => format!("{existing}, {ip}"),
            Err(_) => ip,
        },
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

async fn register_backend(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    info!("received register request");
    let request = match RegisterRequest::decode(body) {
        Ok(request) => request,
        Err(err) => {
            warn!("failed to parse register request: {err}");
            return (StatusCode::BAD_REQUEST, "Error reading request").into_response();
        }
    };
    let Some(host) = request.host.as_deref().filter(|h| !h.is_empty()) else {
        warn!("received register request without host");
        return (StatusCode::BAD_REQUEST, "Request must have host set").into_response();
    };

    let url = backend_url(host, request.port);
    match state.policy.register(&url) {
        Ok(()) => {
            if !state.health_enabled {
                if let Some(backend) = state.policy.backends().iter().find(|b| b.url() == url) {
                    backend.set_alive(true);
                }
            }
            info!("registered backend {url}");
            (StatusCode::OK, "Registered").into_response()
        }
        Err(err) => {
            warn!("error handling register for {url}: {err}");
            (StatusCode::BAD_REQUEST, "Error handling register").into_response()
        }
    }
}

async fn deregister_backend(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    info!("received deregister request");
    let request = match DeregisterRequest::decode(body) {
        Ok(request) => request,
        Err(err) => {
            warn!("failed to parse deregister request: {err}");
            return (StatusCode::BAD_REQUEST, "Error reading request").into_response();
        }
    };
    let Some(host) = request.host.as_deref().filter(|h| !h.is_empty()) else {
        warn!("received deregister request without host");
        return (StatusCode::BAD_REQUEST, "Request must have host set").into_response();
    };

    let url = backend_url(host, request.port);
    match state.policy.deregister(&url) {
        Ok(()) => {
            info!("deregistered backend {url}");
            (StatusCode::OK, "Deregistered").into_response()
        }
        Err(err) => {
            warn!("error handling deregister for {url}: {err}");
            (StatusCode::BAD_REQUEST, "Error handling deregister").into_response()
        }
    }
}
