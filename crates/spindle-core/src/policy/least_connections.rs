use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::policy::Selected;
use crate::pqueue::AddressablePq;

type BackendCmp = fn(&Arc<Backend>, &Arc<Backend>) -> bool;
type BackendHeap = AddressablePq<String, Arc<Backend>, BackendCmp>;

/// Reversed comparator: the queue is a max-heap, so inverting the order
/// keeps the backend with the fewest in-flight requests on top.
fn fewest_in_flight(a: &Arc<Backend>, b: &Arc<Backend>) -> bool {
    b.connections_count() < a.connections_count()
}

/// Least-connections selection over an addressable min-heap keyed by
/// backend URL.
///
/// Selection reads the top of the heap; the in-flight counter is bumped
/// and the entry re-emplaced before the request is forwarded, and again
/// (from the drop guard) once the forwarded response has fully streamed
/// out. The heap lock is never held while any I/O is in progress.
pub struct LeastConnections {
    heap: Arc<RwLock<BackendHeap>>,
}

impl LeastConnections {
    pub fn new(raw_urls: &[String]) -> Result<Self> {
        let mut heap = AddressablePq::with_comparator(fewest_in_flight as BackendCmp);
        for raw_url in raw_urls {
            // Fresh backends all carry zero connections, so each one keeps
            // its slot and this loop stays O(n).
            heap.push(raw_url.clone(), Arc::new(Backend::new(raw_url)?));
        }
        Ok(Self {
            heap: Arc::new(RwLock::new(heap)),
        })
    }

    /// Adds a backend. Registering a URL that is already present is a
    /// no-op.
    pub fn register(&self, raw_url: &str) -> Result<()> {
        let backend = Arc::new(Backend::new(raw_url)?);
        if !self.heap.write().push(raw_url.to_string(), backend) {
            debug!("{raw_url} already registered");
        }
        Ok(())
    }

    pub fn deregister(&self, raw_url: &str) -> Result<()> {
        if !self.heap.write().remove(raw_url) {
            return Err(Error::UnknownBackend(raw_url.to_string()));
        }
        Ok(())
    }

    /// Picks the alive-and-ready backend with the fewest in-flight
    /// requests and registers the new request against it.
    pub fn select(&self) -> Result<Selected> {
        let backend = self.next_backend().ok_or(Error::NoBackendAvailable)?;
        let proxy = backend
            .open_connection()
            .ok_or(Error::NoBackendAvailable)?;

        backend.inc_in_flight();
        self.reweigh(&backend);
        let guard = InFlightGuard {
            backend: Arc::clone(&backend),
            heap: Arc::downgrade(&self.heap),
        };
        Ok(Selected::counted(backend, proxy, guard))
    }

    /// Optimistic fast path under the read lock: the top of the heap, if
    /// it is servable. Falls back to popping through the heap otherwise.
    fn next_backend(&self) -> Option<Arc<Backend>> {
        {
            let heap = self.heap.read();
            match heap.top() {
                None => return None,
                Some(top) if top.is_alive_and_ready() => return Some(Arc::clone(top)),
                Some(_) => {}
            }
        }
        self.best_alive()
    }

    /// Pops until an alive-and-ready backend surfaces, then pushes every
    /// popped entry back.
    fn best_alive(&self) -> Option<Arc<Backend>> {
        let mut heap = self.heap.write();
        let mut popped = Vec::new();
        let mut found = None;
        while let Some(backend) = heap.pop() {
            let servable = backend.is_alive_and_ready();
            popped.push(Arc::clone(&backend));
            if servable {
                found = Some(backend);
                break;
            }
        }
        for backend in popped {
            heap.push(backend.url().to_string(), backend);
        }
        found
    }

    fn reweigh(&self, backend: &Arc<Backend>) {
        self.heap
            .write()
            .emplace(backend.url(), Arc::clone(backend));
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.heap.read().values()
    }
}

/// Scoped registration of one in-flight request.
///
/// Dropped when the forwarded response (body included) has been written
/// out or the forward failed; decrements the backend's counter and
/// re-heaps its entry so the next selection sees the updated weight.
pub(crate) struct InFlightGuard {
    backend: Arc<Backend>,
    heap: Weak<RwLock<BackendHeap>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.dec_in_flight();
        if let Some(heap) = self.heap.upgrade() {
            heap.write()
                .emplace(self.backend.url(), Arc::clone(&self.backend));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn with_backends(specs: &[(&str, bool, usize)]) -> LeastConnections {
        let lc = LeastConnections::new(&[]).unwrap();
        for &(url, servable, in_flight) in specs {
            lc.register(url).unwrap();
            let backend = lc
                .backends()
                .into_iter()
                .find(|b| b.url() == url)
                .unwrap();
            if servable {
                backend.set_alive(true);
            }
            for _ in 0..in_flight {
                backend.inc_in_flight();
            }
            lc.reweigh(&backend);
        }
        lc
    }

    #[test]
    fn ready_backend_is_chosen() {
        let lc = with_backends(&[("http://a", true, 0), ("http://b", false, 0)]);
        assert_eq!(lc.next_backend().unwrap().url(), "http://a");
    }

    #[test]
    fn fewest_connections_wins() {
        let lc = with_backends(&[("http://busy", true, 3), ("http://idle", true, 0)]);
        assert_eq!(lc.next_backend().unwrap().url(), "http://idle");
    }

    #[test]
    fn all_unready_yields_none() {
        let lc = with_backends(&[
            ("http://a", false, 0),
            ("http://b", false, 0),
            ("http://c", false, 3),
        ]);
        assert!(lc.next_backend().is_none());
    }

    #[test]
    fn unready_backends_are_skipped() {
        let lc = with_backends(&[
            ("http://a", false, 0),
            ("http://b", false, 0),
            ("http://busy", true, 3),
        ]);
        assert_eq!(lc.next_backend().unwrap().url(), "http://busy");
    }

    #[test]
    fn empty_pool_yields_none() {
        let lc = LeastConnections::new(&[]).unwrap();
        assert!(lc.next_backend().is_none());
        assert!(matches!(
            lc.select().unwrap_err(),
            Error::NoBackendAvailable
        ));
    }

    #[test]
    fn skipped_backends_are_pushed_back() {
        let lc = with_backends(&[("http://dead", false, 0), ("http://live", true, 1)]);
        assert_eq!(lc.next_backend().unwrap().url(), "http://live");
        assert_eq!(lc.backends().len(), 2);
    }

    #[test]
    fn select_counts_the_request_until_the_guard_drops() {
        let lc = with_backends(&[("http://a", true, 0), ("http://b", true, 0)]);

        let first = lc.select().unwrap();
        assert_eq!(first.backend().connections_count(), 1);

        // With one request in flight on the first backend, the other one
        // must be on top now.
        let second = lc.select().unwrap();
        assert_ne!(first.backend().url(), second.backend().url());

        let first_url = first.backend().url().to_string();
        drop(first);
        let released = lc
            .backends()
            .into_iter()
            .find(|b| b.url() == first_url)
            .unwrap();
        assert_eq!(released.connections_count(), 0);
    }

    #[test]
    fn register_duplicate_is_a_noop() {
        let lc = LeastConnections::new(&urls(&["http://a"])).unwrap();
        lc.register("http://a").unwrap();
        assert_eq!(lc.backends().len(), 1);
    }

    #[test]
    fn deregister_unknown_fails() {
        let lc = LeastConnections::new(&urls(&["http://a"])).unwrap();
        assert!(matches!(
            lc.deregister("http://b").unwrap_err(),
            Error::UnknownBackend(_)
        ));
        lc.deregister("http://a").unwrap();
        assert!(lc.backends().is_empty());
    }

    #[test]
    fn guard_outliving_the_policy_is_harmless() {
        let lc = with_backends(&[("http://a", true, 0)]);
        let selected = lc.select().unwrap();
        drop(lc);
        drop(selected);
    }
}
