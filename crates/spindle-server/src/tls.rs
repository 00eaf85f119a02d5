//! TLS termination for the HTTPS protocol.
//!
//! Two mutually-exclusive modes, chosen by the `cert` config section:
//! local PEM certificate and key files, or automatic certificate
//! management against an ACME directory with an optional on-disk cache of
//! issued certificates.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use futures::StreamExt;
use rustls_acme::caches::DirCache;
use rustls_acme::AcmeConfig;
use tracing::{error, info};

use crate::config::{AcmeCert, CertConfig, LocalCert};
use crate::server::ServerError;

/// Serves `app` over TLS according to the cert configuration.
pub async fn serve(cert: &CertConfig, addr: SocketAddr, app: Router) -> Result<(), ServerError> {
    // A second install_default is rejected, which is fine: any installed
    // provider works for both TLS modes.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    match (&cert.local, &cert.acme) {
        (_, Some(acme)) => serve_acme(acme, addr, app).await,
        (Some(local), None) => serve_local(local, addr, app).await,
        (None, None) => Err(ServerError::Tls(
            "cert config carries neither local files nor an acme directory".into(),
        )),
    }
}

/// TLS from local PEM files.
async fn serve_local(local: &LocalCert, addr: SocketAddr, app: Router) -> Result<(), ServerError> {
    let cert_path = local.cert_path.clone().unwrap_or_default();
    let key_path = local.private_key_path.clone().unwrap_or_default();
    let rustls_config = RustlsConfig::from_pem_file(&cert_path, &key_path)
        .await
        .map_err(|err| {
            ServerError::Tls(format!(
                "error loading certs from {cert_path} / {key_path}: {err}"
            ))
        })?;

    info!("serving HTTPS on {addr} with local certificates");
    axum_server::bind_rustls(addr, rustls_config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|err| ServerError::Tls(err.to_string()))
}

/// Automatic certificate management against an ACME directory. The
/// certificate state machine runs in a background task; handshakes are
/// answered from its resolver.
async fn serve_acme(acme: &AcmeCert, addr: SocketAddr, app: Router) -> Result<(), ServerError> {
    let domain = acme.domain.clone().unwrap_or_default();
    let server_dir = acme.server_dir.clone().unwrap_or_default();

    let mut state = AcmeConfig::new([domain.clone()])
        .directory(&server_dir)
        .cache_option(acme.cache_directory.clone().map(DirCache::new))
        .state();

    let mut rustls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(state.resolver());
    rustls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = state.axum_acceptor(Arc::new(rustls_config));

    tokio::spawn(async move {
        loop {
            match state.next().await {
                Some(Ok(event)) => info!("acme event: {event:?}"),
                Some(Err(err)) => error!("acme error: {err}"),
                None => break,
            }
        }
    });

    info!("serving HTTPS on {addr} with automatic certificates for {domain}");
    axum_server::bind(addr)
        .acceptor(acceptor)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|err| ServerError::Tls(err.to_string()))
}
