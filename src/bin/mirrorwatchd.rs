//! mirrorwatch daemon
//!
//! Runs the monitoring core of one peer: cluster membership, the monitor
//! scheduler, and the stats pipeline.

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mirrorwatch::config::{Config, ConfigHandle};
use mirrorwatch::monitor::Monitor;
use mirrorwatch::scan::NullScanner;
use mirrorwatch::stats::Stats;
use mirrorwatch::store::MemoryStore;

/// Mirror monitoring daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .init();

    info!("starting mirrorwatch daemon");

    let config = ConfigHandle::new(Config::from_env()?);

    // The in-memory store backs development and single-node setups; a
    // production deployment plugs its own store client into Monitor::new.
    let store = Arc::new(MemoryStore::new());
    info!("using in-memory store (development mode)");

    let scanner = Arc::new(NullScanner);
    let monitor = Monitor::new(store.clone(), scanner, config)?;
    monitor.start();

    let stats = Stats::new(store);

    info!(node = %monitor.cluster().node_id(), "monitor ready");

    shutdown_signal().await;

    info!("shutting down");
    monitor.stop();
    stats.terminate().await;
    monitor.wait().await;
    info!("stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
