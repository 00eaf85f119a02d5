use axum::body::Body;
use axum::http::uri::Uri;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use url::Url;

use crate::error::{Error, Result};

/// Headers that are meaningful only for a single transport-level
/// connection and must not be forwarded upstream.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A cached forwarding handle for one backend.
///
/// Rewrites the request URI onto the backend origin (keeping the original
/// path and query, prefixed by the backend's path if it has one) and sends
/// it through a hyper client. The response body is returned as-is so the
/// dispatcher can stream it back to the client.
pub struct ReverseProxy {
    origin: Url,
    client: Client<HttpConnector, Body>,
}

impl ReverseProxy {
    pub(crate) fn new(origin: Url) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { origin, client }
    }

    /// Forwards `req` to the backend origin.
    pub async fn forward(&self, mut req: Request<Body>) -> Result<Response<Incoming>> {
        *req.uri_mut() = self.rewrite_uri(req.uri())?;
        strip_hop_by_hop(req.headers_mut());
        Ok(self.client.request(req).await?)
    }

    fn rewrite_uri(&self, original: &Uri) -> Result<Uri> {
        let host = self.origin.host_str().unwrap_or_default();
        let authority = match self.origin.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = join_paths(self.origin.path(), original.path());
        let target = match original.query() {
            Some(query) => format!("{}://{}{}?{}", self.origin.scheme(), authority, path, query),
            None => format!("{}://{}{}", self.origin.scheme(), authority, path),
        };
        target.parse().map_err(|source| Error::UpstreamUri {
            uri: target,
            source,
        })
    }
}

/// Joins the backend path prefix with the request path without doubling or
/// dropping the slash between them.
fn join_paths(prefix: &str, path: &str) -> String {
    match (prefix.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", prefix.trim_end_matches('/'), path),
        (false, false) => format!("{prefix}/{path}"),
        _ => format!("{prefix}{path}"),
    }
}

pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// The response served when no backend is available.
pub fn unavailable_response() -> Response<Body> {
    let mut resp = Response::new(Body::from("No available service\n"));
    *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    resp
}
