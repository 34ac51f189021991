//! Storage trait definitions.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::time::Duration;

/// Page size constraints for scan operations.
pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 10000;

/// Maximum key length accepted by every backend.
///
/// The filesystem backend hex-encodes keys into file names, so this keeps
/// encoded names well below common 255-byte name limits.
pub const MAX_KEY_LENGTH: usize = 120;

/// A boxed stream of key/value entries.
pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = StorageResult<(String, Bytes)>> + Send + 'a>>;

/// A single page of scan results.
#[derive(Clone, Debug, Default)]
pub struct ScanPage {
    /// Entries in this page, in strictly increasing key order.
    pub entries: Vec<(String, Bytes)>,

    /// Key to resume after, if there may be more results.
    /// If None, this is the last page.
    pub next_start_after: Option<String>,
}

/// Validate a key for use with any backend.
pub fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() {
        return Err(StorageError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StorageError::InvalidKey(format!(
            "key too long: {} bytes (max: {})",
            key.len(),
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

/// Validate a column name. Columns map to directory names on disk.
pub fn validate_column(column: &str) -> StorageResult<()> {
    if column.is_empty() || column.len() > 64 {
        return Err(StorageError::InvalidColumn(format!(
            "column name must be 1-64 characters: {column:?}"
        )));
    }
    if !column
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b'.'))
        || column.starts_with('.')
    {
        return Err(StorageError::InvalidColumn(format!(
            "column name contains unsupported characters: {column:?}"
        )));
    }
    Ok(())
}

/// Ordered key-value persistence with per-key compare-exchange.
///
/// Keys are grouped in named columns. Within a column, keys are ordered
/// lexicographically by their bytes; scans never yield the same key twice.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Point lookup. Absence is `Ok(None)`.
    async fn get(&self, column: &str, key: &str) -> StorageResult<Option<Bytes>>;

    /// Atomically replace the value of `key` if it currently equals `expected`.
    ///
    /// `expected = None` means the key must be absent; `new = None` deletes the
    /// key. Returns `false` without writing when the stored value differs.
    async fn compare_exchange(
        &self,
        column: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Bytes>,
    ) -> StorageResult<bool>;

    /// Return up to `limit` entries whose key starts with `prefix` and sorts
    /// strictly after `start_after`.
    async fn scan(
        &self,
        column: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<ScanPage>;

    /// Get the name of this storage backend.
    ///
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify the backend is reachable and usable.
    ///
    /// The default implementation returns Ok(()).
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Extension trait providing `scan_stream()` by paging through `scan()`.
///
/// Automatically implemented for all `KeyValueStore` types.
pub trait KeyValueStoreScanExt: KeyValueStore {
    /// Lazily scan a column prefix as a flat stream of entries.
    ///
    /// Each page resumes strictly after the last key of the previous page, so
    /// concurrent inserts behind the cursor are skipped rather than repeated.
    fn scan_stream<'a>(&'a self, column: &str, prefix: &str, page_size: usize) -> EntryStream<'a> {
        let column = column.to_string();
        let prefix = prefix.to_string();
        let page_size = page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE);

        let stream = async_stream::try_stream! {
            let mut start_after: Option<String> = None;
            loop {
                let page = self
                    .scan(&column, &prefix, start_after.as_deref(), page_size)
                    .await?;
                for entry in page.entries {
                    yield entry;
                }
                match page.next_start_after {
                    Some(next) => start_after = Some(next),
                    None => break,
                }
            }
        };

        Box::pin(stream)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStoreScanExt for T {}

/// Replicated, Redis-like store shared by every machine in the cluster.
///
/// Values expire individually. Counters are created on first increment.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Whether `key` holds a live value.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Get the bytes stored under `key`.
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Store `value` under `key` with a time-to-live unless the key already
    /// exists. Returns whether the value was written.
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: Bytes,
        expiry: Duration,
    ) -> StorageResult<bool>;

    /// Atomically add `delta` to the counter at `key` and return the new value.
    ///
    /// A missing counter is created at zero with the given time-to-live; an
    /// existing counter keeps its original expiry.
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        expiry: Duration,
    ) -> StorageResult<i64>;

    /// Get the name of this shared store backend.
    fn backend_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_limits() {
        assert!(validate_key("SHA2:00112233445566778899").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key(&"a".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_column() {
        assert!(validate_column("local.content").is_ok());
        assert!(validate_column("machines").is_ok());
        assert!(validate_column("").is_err());
        assert!(validate_column("../escape").is_err());
        assert!(validate_column(".hidden").is_err());
        assert!(validate_column("Upper").is_err());
    }
}
