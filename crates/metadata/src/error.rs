//! Metadata error types.

use quarry_storage::StorageError;
use thiserror::Error;

/// Format failures for display, capping at MAX_DISPLAYED to prevent log bloat.
fn format_failures(errors: &[String]) -> String {
    const MAX_DISPLAYED: usize = 5;
    if errors.len() <= MAX_DISPLAYED {
        format!("{:?}", errors)
    } else {
        let sample: Vec<_> = errors.iter().take(MAX_DISPLAYED).collect();
        format!("{:?} (and {} more)", sample, errors.len() - MAX_DISPLAYED)
    }
}

/// Metadata operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("corrupt value in {column} at {key}: {message}")]
    Corrupt {
        column: String,
        key: String,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("compare-exchange on {key} did not settle after {attempts} attempts")]
    Contention { key: String, attempts: usize },

    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    #[error("event stream error: {0}")]
    EventStream(String),

    #[error(transparent)]
    Core(#[from] quarry_core::Error),

    #[error("{operation} failed for {} sub-store(s): {}", .errors.len(), format_failures(.errors))]
    Aggregate {
        operation: &'static str,
        errors: Vec<String>,
    },
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_format_small() {
        let err = MetadataError::Aggregate {
            operation: "shutdown",
            errors: vec!["local: boom".to_string(), "shared: bang".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("shutdown failed for 2 sub-store(s)"));
        assert!(msg.contains("local: boom"));
        assert!(msg.contains("shared: bang"));
    }

    #[test]
    fn test_aggregate_format_large() {
        let err = MetadataError::Aggregate {
            operation: "startup",
            errors: (0..7).map(|i| format!("e{i}")).collect(),
        };
        let msg = err.to_string();
        assert!(msg.contains("startup failed for 7 sub-store(s)"));
        assert!(msg.contains("and 2 more"));
    }
}
