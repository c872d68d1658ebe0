//! Standalone mode: the stack worker and the reconciler loop in one
//! process, until Ctrl-C.

use std::sync::Arc;

use thecloud_core::CloudConfig;
use tokio::sync::watch;
use tracing::info;

use crate::platform::Platform;

pub async fn run(config: CloudConfig) -> anyhow::Result<()> {
    info!("TheCloud daemon starting in standalone mode");

    let (platform, worker) = Platform::open(&config)?;
    let interval = config.reconciler.tick_interval()?;
    info!(
        max_jobs = config.provisioner.max_concurrent_jobs,
        queue_capacity = config.provisioner.queue_capacity,
        "stack worker initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_shutdown = shutdown_rx.clone();
    let reconcile_shutdown = shutdown_rx;

    // ── Background tasks ───────────────────────────────────────

    let worker_handle = tokio::spawn(worker.run(worker_shutdown));

    let reconciler = Arc::new(platform.reconciler);
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run(interval, reconcile_shutdown).await;
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = worker_handle.await;
    let _ = reconcile_handle.await;

    info!("TheCloud daemon stopped");
    Ok(())
}
