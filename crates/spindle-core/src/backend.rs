use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;
use url::Url;

use crate::error::{Error, Result};
use crate::proxy::ReverseProxy;

const ALIVE_MASK: u32 = 0x0001;
const READY_MASK: u32 = 0x0002;
const ALIVE_AND_READY: u32 = ALIVE_MASK | READY_MASK;

/// A single upstream server.
///
/// The status word packs the `ALIVE` bit (driven by health checks) and the
/// `READY` bit (declared readiness, initialised true) into one atomic, so
/// writers on either bit never race and readers never observe a torn
/// value. A backend is eligible for selection iff both bits are set.
///
/// The reverse-proxy handle is built lazily on the first successful
/// [`Backend::open_connection`] and cached for the lifetime of the
/// backend; every dispatch task shares the same handle.
pub struct Backend {
    raw_url: String,
    url: Url,
    status: AtomicU32,
    in_flight: AtomicUsize,
    proxy: RwLock<Option<Arc<ReverseProxy>>>,
}

impl Backend {
    /// Parses `raw_url` and creates a backend that is ready but not yet
    /// alive. Liveness is granted by the health monitor (or by the server
    /// at registration time when health checking is disabled).
    pub fn new(raw_url: &str) -> Result<Self> {
        let url = Url::parse(raw_url).map_err(|source| Error::BackendResolve {
            url: raw_url.to_string(),
            source,
        })?;
        Ok(Self {
            raw_url: raw_url.to_string(),
            url,
            status: AtomicU32::new(READY_MASK),
            in_flight: AtomicUsize::new(0),
            proxy: RwLock::new(None),
        })
    }

    /// The URL string the backend was registered under.
    pub fn url(&self) -> &str {
        &self.raw_url
    }

    pub fn set_alive(&self, alive: bool) {
        if alive {
            self.status.fetch_or(ALIVE_MASK, Ordering::AcqRel);
        } else {
            self.status.fetch_and(!ALIVE_MASK, Ordering::AcqRel);
        }
    }

    pub fn set_ready(&self, ready: bool) {
        if ready {
            self.status.fetch_or(READY_MASK, Ordering::AcqRel);
        } else {
            self.status.fetch_and(!READY_MASK, Ordering::AcqRel);
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status.load(Ordering::Acquire) & ALIVE_MASK != 0
    }

    pub fn is_ready(&self) -> bool {
        self.status.load(Ordering::Acquire) & READY_MASK != 0
    }

    pub fn is_alive_and_ready(&self) -> bool {
        self.status.load(Ordering::Acquire) & ALIVE_AND_READY == ALIVE_AND_READY
    }

    /// Number of requests currently being forwarded to this backend.
    /// Only the least-connections policy maintains it.
    pub fn connections_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn inc_in_flight(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_in_flight(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// Returns the reverse-proxy handle for this backend, or `None` if the
    /// backend is not alive-and-ready at the moment of the call.
    pub fn open_connection(&self) -> Option<Arc<ReverseProxy>> {
        if !self.is_alive_and_ready() {
            return None;
        }
        Some(self.handle())
    }

    /// Double-checked handle construction: the read-lock fast path returns
    /// the cached handle; on miss, the write lock re-checks and populates,
    /// so two concurrent callers always observe the same handle.
    fn handle(&self) -> Arc<ReverseProxy> {
        if let Some(proxy) = self.proxy.read().as_ref() {
            return Arc::clone(proxy);
        }
        let mut slot = self.proxy.write();
        match slot.as_ref() {
            Some(proxy) => Arc::clone(proxy),
            None => {
                let proxy = Arc::new(ReverseProxy::new(self.url.clone()));
                *slot = Some(Arc::clone(&proxy));
                proxy
            }
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("url", &self.raw_url)
            .field("alive", &self.is_alive())
            .field("ready", &self.is_ready())
            .field("in_flight", &self.connections_count())
            .finish()
    }
}
