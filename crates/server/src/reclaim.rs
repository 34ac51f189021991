//! Periodic space reclamation.

use crate::error::ServerResult;
use crate::metrics::RECLAIM_RUNS;
use quarry_distributed::{DistributedContentStore, ReclaimStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Run one reclaim pass, recording its outcome.
pub async fn run_reclaim<P: Send + Sync + 'static>(
    store: &DistributedContentStore<P>,
    max_size_bytes: u64,
) -> ServerResult<ReclaimStats> {
    match store.reclaim(max_size_bytes).await {
        Ok(stats) => {
            let outcome = if stats.evicted > 0 { "evicted" } else { "idle" };
            RECLAIM_RUNS.with_label_values(&[outcome]).inc();
            Ok(stats)
        }
        Err(e) => {
            RECLAIM_RUNS.with_label_values(&["failed"]).inc();
            Err(e.into())
        }
    }
}

/// Reclaim space every `interval` until `cancel` fires. Each pass first
/// retries location events the stream rejected earlier.
pub fn spawn_reclaim_loop<P: Send + Sync + 'static>(
    store: Arc<DistributedContentStore<P>>,
    max_size_bytes: u64,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            max_size_bytes, "reclaim loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match store.location_store().republish_pending().await {
                Ok(0) => {}
                Ok(published) => info!(published, "republished queued events"),
                Err(e) => warn!(error = %e, "queued events still unpublished"),
            }
            if let Err(e) = run_reclaim(&store, max_size_bytes).await {
                error!(error = %e, "reclaim pass failed");
            }
        }
        info!("reclaim loop stopped");
    })
}
