use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::Backend;
use crate::backoff::Backoff;
use crate::error::{Error, Result};
use crate::policy::Selected;

/// How many full backoff cycles a single selection attempts before giving
/// up with `NoBackendAvailable`.
pub(crate) const MAX_BACKOFFS: u32 = 5;

struct Pool {
    backends: Vec<Arc<Backend>>,
    indices: HashMap<String, usize>,
}

/// Round-robin selection over an ordered backend vector.
///
/// The cursor is an atomic i64 starting at -1; selection is a fetch-add
/// followed by a modulo over the current pool size, so concurrent
/// dispatch tasks each get a distinct slot without writing to the pool.
/// Registration and deregistration adjust the cursor so no backend is
/// starved across membership changes.
pub struct RoundRobin {
    pool: RwLock<Pool>,
    idx: AtomicI64,
    backoff: Backoff,
}

impl RoundRobin {
    pub fn new(raw_urls: &[String]) -> Result<Self> {
        let mut backends = Vec::with_capacity(raw_urls.len());
        let mut indices = HashMap::new();
        for (index, raw_url) in raw_urls.iter().enumerate() {
            indices.insert(raw_url.clone(), index);
            backends.push(Arc::new(Backend::new(raw_url)?));
        }
        Ok(Self {
            pool: RwLock::new(Pool { backends, indices }),
            idx: AtomicI64::new(-1),
            backoff: Backoff::with_defaults(),
        })
    }

    /// Adds a backend to the pool. Registering a URL that is already
    /// present is a no-op.
    ///
    /// The cursor is first folded back into range, and when it sits at 0
    /// it is moved to the old pool size so the rotation continues through
    /// the fresh backend instead of restarting from the front.
    pub fn register(&self, raw_url: &str) -> Result<()> {
        let backend = Backend::new(raw_url)?;
        let mut pool = self.pool.write();
        if pool.indices.contains_key(raw_url) {
            debug!("{raw_url} already registered");
            return Ok(());
        }

        let old_count = pool.backends.len() as i64;
        let mut idx = self.idx.load(Ordering::SeqCst);
        if idx >= 0 {
            idx %= old_count;
        }
        if idx == 0 {
            idx = old_count;
        }
        self.idx.store(idx, Ordering::SeqCst);

        pool.indices.insert(raw_url.to_string(), old_count as usize);
        pool.backends.push(Arc::new(backend));
        Ok(())
    }

    /// Removes a backend from the pool, shifting the cursor so the
    /// rotation stays fair: removing the tail restarts the cycle, and
    /// removing a slot before the cursor pulls the cursor back by one.
    pub fn deregister(&self, raw_url: &str) -> Result<()> {
        let mut pool = self.pool.write();
        let Some(&position) = pool.indices.get(raw_url) else {
            return Err(Error::UnknownBackend(raw_url.to_string()));
        };

        let count = pool.backends.len() as i64;
        let removed = position as i64;
        let current = self.idx.load(Ordering::SeqCst) % count;
        let next = if removed == count - 1 {
            -1
        } else if current <= removed {
            current
        } else {
            current - 1
        };
        self.idx.store(next, Ordering::SeqCst);

        pool.backends.remove(position);
        pool.indices.remove(raw_url);
        for index in pool.indices.values_mut() {
            if *index > position {
                *index -= 1;
            }
        }
        Ok(())
    }

    /// Picks the next alive-and-ready backend.
    ///
    /// One full pass is made over the pool; if nothing is ready the read
    /// lock is released, the backoff sleeps, and the pass is retried, up
    /// to [`MAX_BACKOFFS`] times.
    pub async fn select(&self) -> Result<Selected> {
        for attempt in 0..=MAX_BACKOFFS {
            if attempt > 0 {
                self.backoff.wait_a_bit().await;
            }
            {
                let pool = self.pool.read();
                let count = pool.backends.len() as i64;
                if count == 0 {
                    return Err(Error::NoBackendAvailable);
                }
                for _ in 0..count {
                    let current = (self.idx.fetch_add(1, Ordering::SeqCst) + 1).rem_euclid(count);
                    let backend = &pool.backends[current as usize];
                    if let Some(proxy) = backend.open_connection() {
                        return Ok(Selected::plain(Arc::clone(backend), proxy));
                    }
                }
            }
        }
        Err(Error::NoBackendAvailable)
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.pool.read().backends.clone()
    }

    #[cfg(test)]
    fn set_cursor(&self, idx: i64) {
        self.idx.store(idx, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn cursor(&self) -> i64 {
        self.idx.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn mark_all_alive(rr: &RoundRobin) {
        for backend in rr.backends() {
            backend.set_alive(true);
        }
    }

    #[tokio::test]
    async fn healthy_backend_is_chosen() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081"])).unwrap();
        mark_all_alive(&rr);
        let selected = rr.select().await.unwrap();
        assert_eq!(selected.backend().url(), "http://localhost:8081");
    }

    #[tokio::test]
    async fn unready_backends_are_skipped() {
        let rr = RoundRobin::new(&urls(&[
            "http://localhost:8081",
            "http://localhost:8082",
            "http://localhost:8083",
        ]))
        .unwrap();
        mark_all_alive(&rr);
        rr.backends()[0].set_ready(false);
        rr.backends()[1].set_ready(false);
        let selected = rr.select().await.unwrap();
        assert_eq!(selected.backend().url(), "http://localhost:8083");
    }

    #[tokio::test]
    async fn wraps_back_to_the_first_backend() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081", "http://localhost:8082"]))
            .unwrap();
        mark_all_alive(&rr);
        rr.set_cursor(1);
        let selected = rr.select().await.unwrap();
        assert_eq!(selected.backend().url(), "http://localhost:8081");
        assert_eq!(rr.cursor(), 2);
    }

    #[tokio::test]
    async fn distributes_requests_evenly() {
        let rr = RoundRobin::new(&urls(&[
            "http://localhost:8081",
            "http://localhost:8082",
            "http://localhost:8083",
        ]))
        .unwrap();
        mark_all_alive(&rr);

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..300 {
            let selected = rr.select().await.unwrap();
            *counts.entry(selected.backend().url().to_string()).or_insert(0) += 1;
        }
        assert_eq!(counts["http://localhost:8081"], 100);
        assert_eq!(counts["http://localhost:8082"], 100);
        assert_eq!(counts["http://localhost:8083"], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_reports_no_backend() {
        let rr = RoundRobin::new(&[]).unwrap();
        assert!(matches!(
            rr.select().await.unwrap_err(),
            Error::NoBackendAvailable
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_backoff_cap() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081"])).unwrap();
        // never marked alive, so every cycle comes up empty
        assert!(matches!(
            rr.select().await.unwrap_err(),
            Error::NoBackendAvailable
        ));
    }

    #[test]
    fn register_at_index() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081", "http://localhost:8082"]))
            .unwrap();
        rr.set_cursor(2);
        rr.register("http://localhost:8083").unwrap();
        assert_eq!(rr.cursor(), 2);
    }

    #[test]
    fn register_after_index() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081", "http://localhost:8082"]))
            .unwrap();
        rr.set_cursor(1);
        rr.register("http://localhost:8083").unwrap();
        assert_eq!(rr.cursor(), 1);
    }

    #[test]
    fn register_folds_a_wrapped_cursor() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081", "http://localhost:8082"]))
            .unwrap();
        rr.set_cursor(5);
        rr.register("http://localhost:8083").unwrap();
        assert_eq!(rr.cursor(), 1);
    }

    #[test]
    fn register_with_cursor_at_cycle_end_points_at_the_new_backend() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081", "http://localhost:8082"]))
            .unwrap();
        rr.set_cursor(4);
        rr.register("http://localhost:8083").unwrap();
        assert_eq!(rr.cursor(), 2);
    }

    #[test]
    fn register_existing_url_is_a_noop() {
        let rr = RoundRobin::new(&urls(&["http://localhost:8081"])).unwrap();
        rr.register("http://localhost:8081").unwrap();
        assert_eq!(rr.backends().len(), 1);
    }

    #[test]
    fn register_invalid_url_fails() {
        let rr = RoundRobin::new(&[]).unwrap();
        assert!(matches!(
            rr.register("definitely not a url").unwrap_err(),
            Error::BackendResolve { .. }
        ));
    }

    fn three_backends() -> RoundRobin {
        RoundRobin::new(&urls(&[
            "http://localhost:8081",
            "http://localhost:8082",
            "http://localhost:8083",
        ]))
        .unwrap()
    }

    fn pool_urls(rr: &RoundRobin) -> Vec<String> {
        rr.backends().iter().map(|b| b.url().to_string()).collect()
    }

    #[test]
    fn deregister_at_index_restarts_the_cycle() {
        let rr = three_backends();
        rr.set_cursor(2);
        rr.deregister("http://localhost:8083").unwrap();
        assert_eq!(rr.cursor(), -1);
        assert_eq!(
            pool_urls(&rr),
            urls(&["http://localhost:8081", "http://localhost:8082"])
        );
    }

    #[test]
    fn deregister_after_index() {
        let rr = three_backends();
        rr.set_cursor(1);
        rr.deregister("http://localhost:8081").unwrap();
        assert_eq!(rr.cursor(), 0);
        assert_eq!(
            pool_urls(&rr),
            urls(&["http://localhost:8082", "http://localhost:8083"])
        );
    }

    #[test]
    fn deregister_before_index() {
        let rr = three_backends();
        rr.set_cursor(2);
        rr.deregister("http://localhost:8082").unwrap();
        assert_eq!(rr.cursor(), 1);
        assert_eq!(
            pool_urls(&rr),
            urls(&["http://localhost:8081", "http://localhost:8083"])
        );
    }

    #[test]
    fn deregister_with_wrapped_cursor_after() {
        let rr = three_backends();
        rr.set_cursor(4);
        rr.deregister("http://localhost:8081").unwrap();
        assert_eq!(rr.cursor(), 0);
    }

    #[test]
    fn deregister_with_wrapped_cursor_before() {
        let rr = three_backends();
        rr.set_cursor(5);
        rr.deregister("http://localhost:8082").unwrap();
        assert_eq!(rr.cursor(), 1);
    }

    #[test]
    fn deregister_with_wrapped_cursor_at_tail() {
        let rr = three_backends();
        rr.set_cursor(5);
        rr.deregister("http://localhost:8083").unwrap();
        assert_eq!(rr.cursor(), -1);
    }

    #[test]
    fn deregister_unknown_url_fails() {
        let rr = three_backends();
        assert!(matches!(
            rr.deregister("http://localhost:9999").unwrap_err(),
            Error::UnknownBackend(_)
        ));
    }

    #[test]
    fn deregister_keeps_the_index_mapping_consistent() {
        let rr = three_backends();
        rr.deregister("http://localhost:8081").unwrap();
        let pool = rr.pool.read();
        for (url, &index) in &pool.indices {
            assert_eq!(pool.backends[index].url(), url);
        }
    }
}
