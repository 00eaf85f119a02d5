//! # Spindle CLI entry point
//!
//! Starts the load balancer from a configuration document. Exactly one of
//! `--config` (inline string) or `--config_file` (path) must be given.
//!
//! ```bash
//! # From a config file; the format follows the extension
//! spindle --config_file lb.yaml
//!
//! # Inline, defaulting to the text-proto format
//! spindle --config 'port: 8080 backend { static { urls: "http://localhost:8081" } }'
//!
//! # Inline JSON, listening port overridden
//! spindle --config '{"port": 80, "backend": {...}}' --config_format JSON --port 8080
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use spindle_server::config::{self, Config, ConfigFormat};
use spindle_server::Server;

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "An HTTP(S) reverse-proxy load balancer", long_about = None)]
struct Args {
    /// Config string to use for the load balancer
    #[arg(long)]
    config: Option<String>,

    /// Config format to use for the load balancer: TEXT_PROTO, JSON,
    /// YAML or XML (ignored with --config_file)
    #[arg(long = "config_format", default_value = "TEXT_PROTO")]
    config_format: String,

    /// Config file to use for the load balancer; the format follows the
    /// file extension
    #[arg(long = "config_file")]
    config_file: Option<String>,

    /// Override the port listening on
    #[arg(long)]
    port: Option<u16>,
}

fn read_config(args: &Args) -> Result<Config> {
    let mut cfg = match (&args.config, &args.config_file) {
        (Some(_), Some(_)) | (None, None) => {
            bail!("exactly one of --config or --config_file must be specified")
        }
        (Some(inline), None) => {
            let format: ConfigFormat = args.config_format.parse()?;
            config::parse(inline, format).context("error while parsing the config")?
        }
        (None, Some(path)) => {
            config::parse_file(path).context("error while parsing the config file")?
        }
    };

    if let Some(port) = args.port {
        cfg.port = Some(port);
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cfg = read_config(&args)?;
    tracing::info!(
        "starting {} load balancer",
        cfg.name.as_deref().unwrap_or("spindle")
    );

    let server = Server::new(cfg).context("error creating the load balancer")?;
    server.run().await.context("error running the load balancer")?;
    Ok(())
}
