//! Error types for copy, blob and content store operations.

use quarry_core::ShortHash;
use quarry_metadata::MetadataError;
use thiserror::Error;

/// Format failures for display, capping at MAX_DISPLAYED to prevent log bloat.
fn format_failures(failures: &[String]) -> String {
    const MAX_DISPLAYED: usize = 5;
    if failures.len() <= MAX_DISPLAYED {
        format!("{:?}", failures)
    } else {
        let sample: Vec<_> = failures.iter().take(MAX_DISPLAYED).collect();
        format!("{:?} (and {} more)", sample, failures.len() - MAX_DISPLAYED)
    }
}

/// Failure of a single transport attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileCopyError {
    /// The remote file is missing or unreadable.
    #[error("source path error: {0}")]
    SourcePath(String),

    /// The local destination could not be written.
    #[error("destination path error: {0}")]
    DestinationPath(String),

    /// Any other transport failure (timeouts, broken reads).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("copy cancelled")]
    Cancelled,
}

impl FileCopyError {
    /// Label used in metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            FileCopyError::SourcePath(_) => "source_path",
            FileCopyError::DestinationPath(_) => "destination_path",
            FileCopyError::Transport(_) => "transport",
            FileCopyError::Cancelled => "cancelled",
        }
    }
}

/// Terminal outcome of a failed copy request.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("size mismatch for {hash}: expected {expected} bytes, copied {actual}")]
    SizeMismatch {
        hash: ShortHash,
        expected: u64,
        actual: u64,
    },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ShortHash,
        actual: ShortHash,
    },

    #[error("copy of {hash} exhausted after {attempts} attempt(s): {}", format_failures(.failures))]
    Exhausted {
        hash: ShortHash,
        attempts: usize,
        failures: Vec<String>,
    },

    #[error("copy of {hash} cancelled")]
    Cancelled { hash: ShortHash },
}

impl CopyError {
    /// Whether the copied bytes failed verification.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CopyError::SizeMismatch { .. } | CopyError::HashMismatch { .. }
        )
    }
}

/// Typed failure of a blob operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlobError {
    /// The capacity window is full.
    #[error("blob capacity exhausted for window {key}")]
    Capacity { key: String },

    #[error("blob of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    /// The shared store failed.
    #[error("blob storage error: {0}")]
    Storage(String),
}

/// Local content store and facade errors.
#[derive(Debug, Error)]
pub enum ContentStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        expected: ShortHash,
        actual: ShortHash,
    },

    #[error("content not found: {0}")]
    NotFound(ShortHash),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("copy failed: {0}")]
    Copy(#[from] CopyError),
}

/// Result type for content store operations.
pub type ContentStoreResult<T> = std::result::Result<T, ContentStoreError>;
