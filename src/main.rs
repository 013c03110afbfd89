//! Daemon entrypoint: wires the stores and launcher into a lifecycle
//! manager, runs the idle sweeper, and drains every VM on SIGINT/SIGTERM.

use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use burrow::{FirecrackerLauncher, ImageStore, LifecycleManager, ManagerConfig, SnapshotStore};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,burrow=debug"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ManagerConfig::from_env();
    info!(
        kernel = %config.kernel_path.display(),
        rootfs = %config.base_rootfs_path.display(),
        max_vms = config.max_vms,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "starting"
    );

    let images = ImageStore::open(config.kernel_path.clone(), config.base_rootfs_path.clone())?;
    let snapshots = SnapshotStore::open(config.snapshot_dir.clone())?;
    let launcher = FirecrackerLauncher::new(config.clone());
    let manager = LifecycleManager::new(launcher, config, images, snapshots);

    let sweeper = manager.spawn_idle_sweeper();

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    sweeper.abort();

    // Bounded so a wedged snapshot upload cannot hold the process hostage.
    let drain = manager.drain();
    if tokio::time::timeout(Duration::from_secs(120), drain)
        .await
        .is_err()
    {
        error!("drain did not finish in time, exiting anyway");
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!(error = %e, "sigterm handler install failed");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
