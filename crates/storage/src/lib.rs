//! Persistence abstractions and backends for Quarry.
//!
//! This crate provides:
//! - An ordered key-value store with per-key compare-exchange, used by the
//!   content location database and the cluster state
//! - A replicated shared store (Redis-like) used for inline blobs and
//!   capacity counters
//! - Backends: in-memory and local filesystem

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{
    filesystem::FilesystemKeyValueStore,
    memory::{MemoryKeyValueStore, MemorySharedStore},
};
pub use error::{StorageError, StorageResult};
pub use traits::{EntryStream, KeyValueStore, KeyValueStoreScanExt, ScanPage, SharedStore};

use quarry_core::config::StorageConfig;
use std::sync::Arc;

/// Create a key-value store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn KeyValueStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Memory => Ok(Arc::new(MemoryKeyValueStore::new())),
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemKeyValueStore::open(path).await?;
            Ok(Arc::new(backend))
        }
    }
}
