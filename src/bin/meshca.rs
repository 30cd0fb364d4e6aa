use std::process;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use meshca::config::Config;
use meshca::constants::{MESHCA_DEFAULT_CONFIG_FILE, MESHCA_SERVER_APP};
use meshca::daemon::start::start_meshca_daemon;

/// Workload certificate authority for zero-trust service meshes.
#[derive(Debug, Parser)]
#[command(name = MESHCA_SERVER_APP, version, about)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "PATH", default_value = MESHCA_DEFAULT_CONFIG_FILE)]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match Config::create(&args.config) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            token.cancel();
        }
    });

    if let Err(e) = start_meshca_daemon(config, shutdown).await {
        error!("{} failed to start: {}", MESHCA_SERVER_APP, e);
        eprintln!("{} failed to start: {}", MESHCA_SERVER_APP, e);
        process::exit(1);
    }
}
