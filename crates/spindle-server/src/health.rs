//! Active health checking.
//!
//! The monitor drives a [`Checker`] over the policy's backend snapshot:
//! every period, each backend gets an HTTP GET on the configured probe
//! path. A 200 marks the backend alive; anything else (including a
//! transport error or timeout) marks it dead. With a disconnect threshold
//! configured, a [`DeadCounter`] tracks consecutive failures per URL and
//! deregisters the backend from the policy once the threshold is hit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, Request, StatusCode, Uri};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use spindle_core::{Backend, Checker, SelectionPolicy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HealthCheck;

/// Client-side timeout for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Consecutive-failure counter per backend URL.
pub struct DeadCounter {
    failed_checks: Mutex<HashMap<String, u32>>,
    max_fails: u32,
}

impl DeadCounter {
    pub fn new(max_fails: u32) -> Self {
        Self {
            failed_checks: Mutex::new(HashMap::new()),
            max_fails,
        }
    }

    /// Records a failed probe. Returns true when the backend has now
    /// failed `max_fails` consecutive probes and must be deregistered;
    /// the entry is cleared so a manual re-registration starts fresh.
    pub fn record_failure(&self, url: &str) -> bool {
        let mut failed = self.failed_checks.lock();
        let count = failed.get(url).copied().unwrap_or(0);
        if count == self.max_fails.saturating_sub(1) {
            failed.remove(url);
            true
        } else {
            failed.insert(url.to_string(), count + 1);
            false
        }
    }

    /// A successful probe resets the streak.
    pub fn reset(&self, url: &str) {
        self.failed_checks.lock().remove(url);
    }

    #[cfg(test)]
    fn count(&self, url: &str) -> u32 {
        self.failed_checks.lock().get(url).copied().unwrap_or(0)
    }
}

/// The background prober for one balancer instance.
pub struct HealthMonitor {
    policy: Arc<SelectionPolicy>,
    client: Client<HttpConnector, Empty<Bytes>>,
    probe_path: String,
    initial_delay: Duration,
    period: Duration,
    dead_counter: Option<DeadCounter>,
}

impl HealthMonitor {
    /// Builds a monitor from a validated `health_check` config section.
    pub fn new(policy: Arc<SelectionPolicy>, cfg: &HealthCheck) -> Self {
        let probe_path = cfg
            .probe
            .as_ref()
            .and_then(|p| p.http_get.as_ref())
            .and_then(|g| g.path.clone())
            .unwrap_or_else(|| "/healthz".to_string());
        let dead_counter = cfg.disconnect_threshold.map(DeadCounter::new);
        Self {
            policy,
            client: Client::builder(TokioExecutor::new()).build_http(),
            probe_path,
            initial_delay: cfg.initial_delay.unwrap_or_default(),
            period: cfg.period.unwrap_or(Duration::from_secs(5)),
            dead_counter,
        }
    }

    /// Spawns the monitor. It waits the initial delay so freshly started
    /// backends are not evicted before they finish booting, then probes
    /// every period until the shutdown channel fires.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "waiting an initial delay of {:?} for backends to wake up",
                self.initial_delay
            );
            tokio::time::sleep(self.initial_delay).await;

            info!("starting to check the health of backends");
            let period = self.period;
            let policy = Arc::clone(&self.policy);
            let monitor = Arc::new(self);
            let checker = Checker::new(
                move |backend| -> spindle_core::checker::ProbeFuture {
                    let monitor = Arc::clone(&monitor);
                    Box::pin(async move { monitor.check(backend).await })
                },
                period,
            );
            if let Err(err) = policy.register_check(checker, shutdown).await {
                warn!("health check loop ended abnormally: {err}");
            }
        })
    }

    /// Probes one backend and applies the result to its liveness bit and
    /// the dead counter.
    pub async fn check(&self, backend: Arc<Backend>) {
        let alive = self.probe(&backend).await;
        let was_alive = backend.is_alive();
        backend.set_alive(alive);
        if alive != was_alive {
            info!(
                "{} became {} by healthcheck",
                backend.url(),
                if alive { "alive" } else { "dead" }
            );
        } else {
            debug!(
                "{} checked {} by healthcheck",
                backend.url(),
                if alive { "alive" } else { "dead" }
            );
        }

        let Some(counter) = &self.dead_counter else {
            return;
        };
        if alive {
            counter.reset(backend.url());
        } else if counter.record_failure(backend.url()) {
            warn!(
                "{} failed {} consecutive health checks, deregistering",
                backend.url(),
                counter.max_fails
            );
            if let Err(err) = self.policy.deregister(backend.url()) {
                warn!("failed to deregister {}: {err}", backend.url());
            }
        }
    }

    async fn probe(&self, backend: &Backend) -> bool {
        let target = format!("{}{}", backend.url(), self.probe_path);
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(err) => {
                warn!("invalid probe target {target}: {err}, considering the backend down");
                return false;
            }
        };
        let request = match Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Empty::new())
        {
            Ok(request) => request,
            Err(err) => {
                warn!("error building probe request for {target}: {err}");
                return false;
            }
        };

        match tokio::time::timeout(PROBE_TIMEOUT, self.client.request(request)).await {
            Err(_) => {
                warn!("{target} probe timed out after {PROBE_TIMEOUT:?}");
                false
            }
            Ok(Err(err)) => {
                warn!("{target} is unreachable, error: {err}");
                false
            }
            Ok(Ok(response)) if response.status() == StatusCode::OK => true,
            Ok(Ok(response)) => {
                warn!("received non-OK status from {target}: {}", response.status());
                false
            }
        }
    }
}
