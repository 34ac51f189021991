//! Content movement for the Quarry distributed content cache.
//!
//! This crate provides:
//! - Path transformers between machine locations and transport paths
//! - File copiers and the hash-verified local content store
//! - The distributed content copier with retries and machine reputation
//! - The blob adapter storing small content in the shared store
//! - The distributed content store facade (lookup, pin, copy, reclaim)
//! - Prometheus metrics

pub mod blob;
pub mod content;
pub mod copier;
pub mod error;
pub mod file_copier;
pub mod metrics;
pub mod path;
pub mod reputation;
pub mod store;

pub use blob::{BlobAdapter, GetBlobResult, PutBlobResult};
pub use content::LocalContentStore;
pub use copier::{CopiedContent, CopierSettings, DistributedContentCopier};
pub use error::{BlobError, ContentStoreError, ContentStoreResult, CopyError, FileCopyError};
pub use file_copier::{CopiedFile, CopyOptions, FileCopier, FilesystemFileCopier};
pub use path::{FilesystemPathTransformer, HandlePathTransformer, PathTransformer};
pub use reputation::{MachineReputation, MachineReputationTracker};
pub use store::{DistributedContentStore, Pinned, ReclaimStats};
