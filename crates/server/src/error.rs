//! Daemon error types.

use quarry_distributed::ContentStoreError;
use quarry_metadata::MetadataError;
use quarry_storage::StorageError;

/// Errors raised while building or running the daemon.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("content store error: {0}")]
    ContentStore(#[from] ContentStoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type for daemon operations.
pub type ServerResult<T> = std::result::Result<T, ServerError>;
