use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use kr_core::task::install_panic_hook;
use kr_daemon::config::KrdConfig;
use kr_daemon::{logging, Daemon};

#[derive(Parser)]
#[command(name = "krd")]
#[command(about = "Kryptonite daemon - SSH agent and phone request broker")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (CRITICAL, ERROR, WARNING, NOTICE, INFO, DEBUG)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => KrdConfig::load_from_file(path)?,
        None => KrdConfig::load_from_env()?,
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let _log_guard = logging::init(&config.log_level, &config.run_dir, config.no_stderr, config.log_syslog);
    install_panic_hook();
    info!(version = env!("CARGO_PKG_VERSION"), "starting krd");

    let daemon = Daemon::new(config)?;
    daemon.run().await
}
