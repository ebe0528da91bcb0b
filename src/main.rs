use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use gpugate::bootstrap;
use gpugate::settings::AppConfig;

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Application CLI arguments
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    gpugate::trace::init(cfg.logging.format)?;
    if args.verbose {
        info!(?cfg, "loaded configuration");
    }

    let metrics = gpugate::metrics::init()?;
    let node = bootstrap::start(cfg, metrics).await?;
    info!(addr = %node.addr, "gpugate started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    node.shutdown().await;
    gpugate::trace::shutdown();
    Ok(())
}
