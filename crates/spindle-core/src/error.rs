use thiserror::Error;

/// Errors produced by the balancing core.
///
/// Startup paths (static registration) treat these as fatal; request paths
/// convert them into HTTP responses at the dispatcher.
#[derive(Error, Debug)]
pub enum Error {
    /// The backend URL could not be parsed. Returned by `register`; the
    /// dynamic registration endpoint maps it to a 400.
    #[error("invalid backend url {url}: {source}")]
    BackendResolve {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Deregistration of a URL that is not in the pool.
    #[error("tried to remove unknown backend {0}")]
    UnknownBackend(String),

    /// The pool is empty or every backend is unhealthy. The dispatcher
    /// maps this to a 503.
    #[error("no backend available")]
    NoBackendAvailable,

    /// Forwarding to the selected upstream failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// The rewritten upstream URI was not valid. Indicates a malformed
    /// backend URL that slipped past registration.
    #[error("invalid upstream uri {uri}: {source}")]
    UpstreamUri {
        uri: String,
        #[source]
        source: axum::http::uri::InvalidUri,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
