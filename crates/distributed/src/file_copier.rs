//! Transport of a single file from a peer path to a local destination.

use crate::error::FileCopyError;
use async_trait::async_trait;
use quarry_core::{ContentHash, ContentHasher, HashType};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Default buffer size for streaming copies (64 KiB).
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Per-attempt copy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOptions {
    /// Size declared by the location records, when known. A source that
    /// grows past it is read only until the excess is detected.
    pub expected_size: Option<u64>,
    /// Hash the bytes while they stream, with this hash type.
    pub hash_type: Option<HashType>,
    pub buffer_size: usize,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            expected_size: None,
            hash_type: None,
            buffer_size: DEFAULT_COPY_BUFFER_SIZE,
        }
    }
}

/// A structurally successful copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopiedFile {
    pub bytes_copied: u64,
    /// Streamed hash, present when `CopyOptions::hash_type` was set.
    pub hash: Option<ContentHash>,
}

/// Copies a file addressed by a transport path of type `P`.
#[async_trait]
pub trait FileCopier<P>: Send + Sync {
    /// Copy `source` to the local file `destination`, replacing it.
    ///
    /// Implementations must stop promptly once `cancel` fires and report
    /// [`FileCopyError::Cancelled`].
    async fn copy_to(
        &self,
        source: &P,
        destination: &Path,
        options: CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<CopiedFile, FileCopyError>;
}

/// Copies between filesystem paths with tokio file I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilesystemFileCopier;

impl FilesystemFileCopier {
    fn source_error(source: &Path, e: std::io::Error) -> FileCopyError {
        match e.kind() {
            ErrorKind::NotFound | ErrorKind::PermissionDenied => {
                FileCopyError::SourcePath(format!("{}: {e}", source.display()))
            }
            _ => FileCopyError::Transport(format!("{}: {e}", source.display())),
        }
    }

    fn destination_error(destination: &Path, e: std::io::Error) -> FileCopyError {
        FileCopyError::DestinationPath(format!("{}: {e}", destination.display()))
    }
}

#[async_trait]
impl FileCopier<PathBuf> for FilesystemFileCopier {
    #[instrument(skip(self, source, options, cancel), fields(source = %source.display()))]
    async fn copy_to(
        &self,
        source: &PathBuf,
        destination: &Path,
        options: CopyOptions,
        cancel: &CancellationToken,
    ) -> Result<CopiedFile, FileCopyError> {
        let mut reader = fs::File::open(source)
            .await
            .map_err(|e| Self::source_error(source, e))?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::destination_error(destination, e))?;
        }
        let mut writer = fs::File::create(destination)
            .await
            .map_err(|e| Self::destination_error(destination, e))?;

        let mut hasher = options.hash_type.map(ContentHasher::new);
        let mut buffer = vec![0u8; options.buffer_size.max(1)];
        let mut bytes_copied = 0u64;

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(FileCopyError::Cancelled),
                read = reader.read(&mut buffer) => read,
            };
            let n = read.map_err(|e| FileCopyError::Transport(format!("{}: {e}", source.display())))?;
            if n == 0 {
                break;
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer[..n]);
            }
            writer
                .write_all(&buffer[..n])
                .await
                .map_err(|e| Self::destination_error(destination, e))?;
            bytes_copied += n as u64;
            if let Some(expected) = options.expected_size
                && bytes_copied > expected
            {
                debug!(bytes_copied, expected, "source exceeds declared size, stopping");
                break;
            }
        }

        writer
            .flush()
            .await
            .map_err(|e| Self::destination_error(destination, e))?;
        writer
            .sync_all()
            .await
            .map_err(|e| Self::destination_error(destination, e))?;

        debug!(bytes_copied, "copied file");
        Ok(CopiedFile {
            bytes_copied,
            hash: hasher.map(ContentHasher::finalize),
        })
    }
}
