//! Test fixtures for daemon tests.

use quarry_core::config::{AppConfig, StorageConfig};
use std::future::Future;
use std::path::Path;
use std::time::Duration;

/// Configuration for a node rooted at `root` with in-memory location storage.
pub fn node_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.machine.cache_root = root.join("cache");
    config.storage = StorageConfig::Memory;
    config.copier.retry_intervals_ms = vec![0, 10];
    config
}

/// Poll `check` until it returns true or two seconds pass.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
