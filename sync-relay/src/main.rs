//! sync-relay binary entry point.
//!
//! Usage:
//! ```bash
//! clipmesh-relay --config relay.toml
//! clipmesh-relay --bind 127.0.0.1:8787
//! ```

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use sync_relay::config::Config;
use tracing_subscriber::EnvFilter;

/// Clipmesh signaling relay.
#[derive(Debug, Parser)]
#[command(name = "clipmesh-relay", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Override the bind address from the configuration file.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .with_context(|| format!("loading {}", args.config.display()))?
    } else {
        tracing::info!("No config at {}, using defaults", args.config.display());
        Config::default()
    };
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    tracing::info!("clipmesh-relay v{}", env!("CARGO_PKG_VERSION"));
    sync_relay::server::serve(config)
        .await
        .context("relay server failed")
}
