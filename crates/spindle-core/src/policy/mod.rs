//! Backend selection policies.
//!
//! [`SelectionPolicy`] is the capability set the dispatcher and the health
//! monitor program against: register, deregister, select and
//! register-check. It is a tagged union of the two algorithms rather than
//! a trait object so the async selection path needs no boxing.

mod least_connections;
mod round_robin;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use futures::StreamExt;
use http_body_util::BodyExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backend::Backend;
use crate::checker::Checker;
use crate::error::Result;
use crate::proxy::ReverseProxy;

pub use least_connections::LeastConnections;
pub(crate) use least_connections::InFlightGuard;
pub use round_robin::RoundRobin;

/// One of the two balancing algorithms, behind a single front.
pub enum SelectionPolicy {
    RoundRobin(RoundRobin),
    LeastConnections(LeastConnections),
}

impl SelectionPolicy {
    pub fn round_robin(raw_urls: &[String]) -> Result<Self> {
        Ok(Self::RoundRobin(RoundRobin::new(raw_urls)?))
    }

    pub fn least_connections(raw_urls: &[String]) -> Result<Self> {
        Ok(Self::LeastConnections(LeastConnections::new(raw_urls)?))
    }

    /// Adds a backend to the pool; registering a known URL is a no-op.
    pub fn register(&self, raw_url: &str) -> Result<()> {
        match self {
            Self::RoundRobin(rr) => rr.register(raw_url),
            Self::LeastConnections(lc) => lc.register(raw_url),
        }
    }

    /// Removes a backend from the pool.
    pub fn deregister(&self, raw_url: &str) -> Result<()> {
        match self {
            Self::RoundRobin(rr) => rr.deregister(raw_url),
            Self::LeastConnections(lc) => lc.deregister(raw_url),
        }
    }

    /// Picks the backend for the next request.
    pub async fn select(&self) -> Result<Selected> {
        match self {
            Self::RoundRobin(rr) => rr.select().await,
            Self::LeastConnections(lc) => lc.select(),
        }
    }

    /// A snapshot of the current pool, for the health monitor.
    pub fn backends(&self) -> Vec<Arc<Backend>> {
        match self {
            Self::RoundRobin(rr) => rr.backends(),
            Self::LeastConnections(lc) => lc.backends(),
        }
    }

    /// Wires a [`Checker`] to this policy's backend snapshot and starts
    /// it. The checker follows registrations and deregistrations because
    /// the snapshot is taken fresh on every tick.
    pub fn register_check(
        self: &Arc<Self>,
        checker: Checker,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let policy = Arc::clone(self);
        checker.run_in_background(move || policy.backends(), shutdown)
    }
}

/// The outcome of a selection: the chosen backend, its forwarding handle
/// and, under least-connections, the in-flight guard for this request.
pub struct Selected {
    backend: Arc<Backend>,
    proxy: Arc<ReverseProxy>,
    guard: Option<InFlightGuard>,
}

impl Selected {
    pub(crate) fn plain(backend: Arc<Backend>, proxy: Arc<ReverseProxy>) -> Self {
        Self {
            backend,
            proxy,
            guard: None,
        }
    }

    pub(crate) fn counted(
        backend: Arc<Backend>,
        proxy: Arc<ReverseProxy>,
        guard: InFlightGuard,
    ) -> Self {
        Self {
            backend,
            proxy,
            guard: Some(guard),
        }
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    /// Forwards the request and strips hop-by-hop response headers, which
    /// describe the upstream connection rather than the client one.
    async fn forward(&self, req: Request<Body>) -> crate::error::Result<Response<hyper::body::Incoming>> {
        let mut response = self.proxy.forward(req).await?;
        crate::proxy::strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }

    /// Forwards the request to the selected backend and returns the
    /// response with its body streaming through.
    ///
    /// The in-flight guard (when present) is moved into the response body
    /// stream, so the connection count drops only once the body has been
    /// fully written out or the response is abandoned.
    pub async fn serve(self, req: Request<Body>) -> Response<Body> {
        match self.forward(req).await {
            Ok(upstream) => {
                let (parts, body) = upstream.into_parts();
                let guard = self.guard;
                let stream = body
                    .into_data_stream()
                    .inspect(move |_| {
                        let _held_until_drained = &guard;
                    });
                Response::from_parts(parts, Body::from_stream(stream))
            }
            Err(err) => {
                warn!("forwarding to {} failed: {err}", self.backend.url());
                let mut resp = Response::new(Body::from(format!("upstream request failed: {err}\n")));
                *resp.status_mut() = StatusCode::BAD_GATEWAY;
                resp
            }
        }
    }
}

impl std::fmt::Debug for Selected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selected")
            .field("backend", &self.backend.url())
            .field("counted", &self.guard.is_some())
            .finish()
    }
}
