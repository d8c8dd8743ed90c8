use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use xmpp_smsd::bootstrap::Server;
use xmpp_smsd::config::Config;
use xmpp_smsd::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "xmpp-smsd")]
#[command(author, version, about = "XMPP component gateway between chat users and SMS carriers")]
struct Args {
    /// Path to a YAML config file or a configuration directory
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Same as --config
    #[arg(value_name = "PATH", conflicts_with = "config")]
    path: Option<PathBuf>,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let path = args
        .config
        .or(args.path)
        .context("a configuration path is required (--config PATH)")?;

    // Load configuration first (to get log settings)
    let config = Config::load(&path)?;

    init_tracing(&TracingConfig::from(&config.telemetry).with_component(&config.xmpp.domain))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        users = config.users.len(),
        providers = config.providers.len(),
        "configuration loaded"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    Server::new(config).run().await
}
