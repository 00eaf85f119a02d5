//! A small upstream service for trying the balancer by hand.
//!
//! Serves `/`, `/hello` and `/healthz`. When `--register_url` is given,
//! it announces itself to the balancer on startup and deregisters on
//! ctrl-c.
//!
//! ```bash
//! cargo run -p spindle-server --example demo_backend -- \
//!     --port 8081 --name alpha --register_url http://localhost:8080/register \
//!     --deregister_url http://localhost:8080/deregister
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use prost::Message;
use spindle_server::registration::{DeregisterRequest, RegisterRequest};
use tracing::info;

#[derive(Parser)]
#[command(name = "demo_backend")]
#[command(about = "A demo upstream server that can register itself with the balancer")]
struct Args {
    /// Host to announce instead of localhost
    #[arg(long = "host_override")]
    host_override: Option<String>,

    /// Port to listen on
    #[arg(long, default_value_t = 8081)]
    port: u16,

    /// Name of the service
    #[arg(long, default_value = "Server")]
    name: String,

    /// URL for registering to the load balancer
    #[arg(long = "register_url")]
    register_url: Option<String>,

    /// URL for deregistering from the load balancer
    #[arg(long = "deregister_url")]
    deregister_url: Option<String>,
}

impl Args {
    fn announce_host(&self) -> String {
        self.host_override
            .clone()
            .unwrap_or_else(|| "localhost".to_string())
    }
}

async fn root() -> &'static str {
    info!("got / request");
    "This is my website!\n"
}

async fn hello(State(name): State<Arc<String>>) -> String {
    info!("got /hello request");
    format!("Hello from {name}\n")
}

async fn healthz() -> &'static str {
    info!("got /healthz request");
    "OK"
}

async fn register(args: &Args, client: &reqwest::Client) -> Result<()> {
    let Some(register_url) = &args.register_url else {
        return Ok(());
    };
    let body = RegisterRequest {
        host: Some(args.announce_host()),
        port: Some(args.port.into()),
    }
    .encode_to_vec();

    info!("registering to {register_url}");
    let response = client
        .post(register_url)
        .body(body)
        .send()
        .await
        .context("error registering")?;
    if !response.status().is_success() {
        bail!("register got non OK status {}", response.status());
    }
    Ok(())
}

async fn deregister(args: &Args, client: &reqwest::Client) -> Result<()> {
    let Some(deregister_url) = &args.deregister_url else {
        return Ok(());
    };
    let body = DeregisterRequest {
        host: Some(args.announce_host()),
        port: Some(args.port.into()),
    }
    .encode_to_vec();

    info!("deregistering from {deregister_url}");
    let response = client
        .post(deregister_url)
        .body(body)
        .send()
        .await
        .context("error deregistering")?;
    if !response.status().is_success() {
        bail!("deregister got non OK status {}", response.status());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();
    let client = reqwest::Client::new();

    let app = Router::new()
        .route("/", get(root))
        .route("/hello", get(hello))
        .route("/healthz", get(healthz))
        .with_state(Arc::new(args.name.clone()));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", args.port))
        .await
        .context("could not bind the listen port")?;
    info!("{} will start listening on {}", args.name, args.port);

    register(&args, &client).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    deregister(&args, &client).await?;
    Ok(())
}
