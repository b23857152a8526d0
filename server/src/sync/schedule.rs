//! Periodic reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::sync::engine::Reconciler;

/// Spawn a task that re-runs reconciliation every `interval` until `shutdown`
/// is cancelled. The first run happens one interval after spawning.
///
/// A failed run is already reported to the fault governor by
/// [`Reconciler::run`]; the loop just carries on.
pub fn spawn_periodic(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Periodic reconciliation stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            // Finish the current run even if shutdown arrives mid-way.
            match reconciler.run().await {
                Ok(report) => {
                    if report.total() > 0 {
                        tracing::info!(
                            succeeded = report.succeeded,
                            "Periodic reconciliation fetched files"
                        );
                    } else {
                        tracing::debug!("Periodic reconciliation: nothing to fetch");
                    }
                }
                Err(e) => {
                    tracing::error!("Periodic reconciliation failed: {}", e);
                }
            }
        }
    })
}
