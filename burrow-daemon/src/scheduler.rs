//! The periodic snapshot scheduler task.

use burrow_core::ops::OpContext;
use burrow_core::snapshots::scheduler;
use burrow_core::SnapshotService;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Spawn the once-per-minute scheduler loop. Send on the returned channel
/// to stop it.
pub fn spawn(snapshots: SnapshotService) -> watch::Sender<bool> {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        // The first tick fires immediately; skip it so a restarting daemon
        // doesn't double-run the current minute.
        interval.tick().await;

        info!("Snapshot scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.changed() => {
                    info!("Snapshot scheduler stopping");
                    return;
                }
            }

            let mut ctx = OpContext::background();
            match scheduler::tick(&snapshots, Utc::now(), &mut ctx).await {
                Ok(report) if report.pruned > 0 || report.created > 0 => {
                    info!(pruned = report.pruned, created = report.created, "Scheduler tick done");
                }
                Ok(_) => debug!("Scheduler tick: nothing to do"),
                Err(e) => error!(error = %e, "Scheduler tick failed"),
            }
        }
    });

    shutdown_tx
}
