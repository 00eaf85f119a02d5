use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::backend::Backend;

/// The boxed future a probe callback returns.
pub type ProbeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A periodic background task that runs a callback against every backend.
///
/// The backend supplier is consulted on every tick, so backends registered
/// after the checker started are picked up on the next tick and
/// deregistered ones stop being probed. Each tick probes all backends
/// concurrently in their own tasks.
///
/// Shutdown is signalled through a [`watch`] channel: the loop (and every
/// in-flight probe) stops as soon as the channel fires or its sender is
/// dropped.
pub struct Checker {
    probe: Arc<dyn Fn(Arc<Backend>) -> ProbeFuture + Send + Sync>,
    period: Duration,
}

impl Checker {
    pub fn new<F>(probe: F, period: Duration) -> Self
    where
        F: Fn(Arc<Backend>) -> ProbeFuture + Send + Sync + 'static,
    {
        Self {
            probe: Arc::new(probe),
            period,
        }
    }

    /// Spawns the check loop. The first round runs one period after the
    /// call, not immediately.
    pub fn run_in_background<S>(
        self,
        supplier: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        S: Fn() -> Vec<Arc<Backend>> + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.period;
            let mut ticker = tokio::time::interval_at(start, self.period);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("checker stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        for backend in supplier() {
                            let probe = Arc::clone(&self.probe);
                            let mut shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = shutdown.changed() => {}
                                    _ = probe(backend) => {}
                                }
                            });
                        }
                    }
                }
            }
        })
    }
}
