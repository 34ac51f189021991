//! Daemon metrics and the Prometheus textfile exporter.
//!
//! Daemon metrics join the registry of `quarry_distributed::metrics`, so one
//! exposition covers the whole process.

use crate::error::ServerResult;
use prometheus::{IntCounter, IntCounterVec, Opts};
use quarry_distributed::metrics::{REGISTRY, encode_text};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub static RECLAIM_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("quarry_reclaim_runs_total", "Total reclaim passes by outcome"),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static MACHINE_REGISTRATIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "quarry_machine_registrations_total",
        "Total machine registrations performed at startup",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register daemon and library metrics. Safe to call repeatedly.
pub fn register_metrics() {
    quarry_distributed::metrics::register_metrics();
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(RECLAIM_RUNS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MACHINE_REGISTRATIONS.clone()))
            .expect("metric registration failed");
    });
}

/// Write the current exposition to `path`, replacing it atomically.
pub async fn write_textfile(path: &Path) -> ServerResult<()> {
    let text = encode_text()?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "metrics".to_string());
    let temp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&temp, text).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

/// Periodically write the exposition to `path` until `cancel` fires.
pub fn spawn_textfile_exporter(
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match write_textfile(&path).await {
                Ok(()) => debug!(path = %path.display(), "metrics exported"),
                Err(e) => warn!(path = %path.display(), error = %e, "metrics export failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    })
}
