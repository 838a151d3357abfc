//! `hostguard-watchdog` entry point. Configuration comes from
//! `$HOSTGUARD_CONFIG` or `/etc/hostguard/config.toml`.

use std::sync::Arc;

use anyhow::Context;
use hostguard_core::config::ConfigLoader;
use hostguard_core::surface::SystemdSurface;
use hostguard_core::GuardContext;
use hostguard_watchdog::Watchdog;
use tokio::signal::unix::{SignalKind, signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let verbose = std::env::args().any(|arg| arg == "-v" || arg == "--verbose");
    hostguard_core::logging::init(verbose);

    let loader = ConfigLoader::new();
    let config = loader.load().context("loading configuration")?;
    tracing::info!(
        "hostguard-watchdog v{} guarding {}",
        env!("CARGO_PKG_VERSION"),
        config.resource.path.display()
    );

    let surface = Arc::new(SystemdSurface::new(config.clone(), loader.target_path()));
    let watchdog = Arc::new(Watchdog::new(GuardContext::system(config), surface));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
        }
        let _ = shutdown_tx.send(true);
    });

    watchdog.run(shutdown_rx).await;
    tracing::info!("hostguard-watchdog exiting cleanly");
    Ok(())
}
