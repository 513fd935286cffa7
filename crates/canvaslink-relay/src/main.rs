use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use canvaslink_relay::{RelayConfig, run};

#[derive(Debug, Parser)]
#[command(name = "canvaslink-relay")]
#[command(about = "Relay server pairing plugin and automation clients over WebSocket channels")]
struct Args {
    /// Port to listen on (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "canvaslink_relay=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = RelayConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.port = port;
    }

    run(config).await
}
