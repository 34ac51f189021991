//! Blob adapter: small content stored inline in the shared store.
//!
//! Total inline bytes are bounded by a rolling capacity budget. Time is cut
//! into boxes as wide as the blob expiry; each box has a shared counter of
//! reserved bytes, and a box may reserve up to half the capacity since at
//! most two boxes hold live blobs at any time.

use crate::error::BlobError;
use crate::metrics::{
    BLOB_BYTES_DOWNLOADED, BLOB_BYTES_UPLOADED, BLOB_CAPACITY_REJECTIONS, BLOB_GETS, BLOB_PUTS,
};
use bytes::Bytes;
use quarry_core::config::BlobConfig;
use quarry_core::{Clock, ContentHash};
use quarry_storage::SharedStore;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, instrument, warn};

/// Outcome of [`BlobAdapter::put_blob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutBlobResult {
    Success {
        size: u64,
        /// The blob was already stored; nothing was written.
        already_present: bool,
        /// Time-box the bytes were reserved against.
        capacity_key: Option<String>,
    },
    Failure(BlobError),
}

impl PutBlobResult {
    pub fn is_success(&self) -> bool {
        matches!(self, PutBlobResult::Success { .. })
    }
}

/// Outcome of [`BlobAdapter::get_blob`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetBlobResult {
    Found(Bytes),
    NotFound,
    Failure(BlobError),
}

/// Stores and retrieves blobs in a [`SharedStore`].
pub struct BlobAdapter {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    expiry: Duration,
    max_capacity: u64,
    max_blob_size: u64,
    /// Most recent time-box whose reservation failed.
    last_failed_key: Mutex<Option<String>>,
}

impl BlobAdapter {
    pub fn new(store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>, config: &BlobConfig) -> Self {
        Self {
            store,
            clock,
            expiry: config.expiry(),
            max_capacity: config.max_capacity_bytes,
            max_blob_size: config.max_blob_size,
            last_failed_key: Mutex::new(None),
        }
    }

    /// Largest blob this adapter accepts.
    pub fn max_blob_size(&self) -> u64 {
        self.max_blob_size
    }

    /// Shared-store key of a blob.
    pub fn blob_key(hash: &ContentHash) -> String {
        format!("Blob-{hash}")
    }

    /// Capacity counter key of the time-box containing `now`.
    pub fn capacity_key(&self, now: OffsetDateTime) -> Result<String, BlobError> {
        let width = self.expiry.as_nanos().max(1) as i128;
        let nanos = now.unix_timestamp_nanos();
        let start = OffsetDateTime::from_unix_timestamp_nanos(nanos.div_euclid(width) * width)
            .unwrap_or(now);
        let window = start
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
            ))
            .map_err(|e| BlobError::Storage(format!("capacity key: {e}")))?;
        Ok(format!("BlobCapacity@{window}"))
    }

    /// Store `data` under `hash` unless it is already present.
    #[instrument(skip(self, hash, data), fields(hash = %hash.to_short_hash(), size = data.len()))]
    pub async fn put_blob(&self, hash: &ContentHash, data: Bytes) -> PutBlobResult {
        let size = data.len() as u64;
        if size > self.max_blob_size {
            BLOB_PUTS.with_label_values(&["too_large"]).inc();
            return PutBlobResult::Failure(BlobError::TooLarge {
                size,
                max: self.max_blob_size,
            });
        }

        let key = Self::blob_key(hash);
        match self.store.exists(&key).await {
            Ok(true) => {
                debug!("blob already present");
                BLOB_PUTS.with_label_values(&["already_present"]).inc();
                return PutBlobResult::Success {
                    size,
                    already_present: true,
                    capacity_key: None,
                };
            }
            Ok(false) => {}
            Err(e) => return self.put_failure(BlobError::Storage(e.to_string())),
        }

        let capacity_key = match self.reserve(size).await {
            Ok(capacity_key) => capacity_key,
            Err(e) => return self.put_failure(e),
        };

        // A reservation not followed by a write stays reserved until its
        // counter expires.
        match self
            .store
            .set_if_absent_with_expiry(&key, data, self.expiry)
            .await
        {
            Ok(written) => {
                if written {
                    BLOB_PUTS.with_label_values(&["stored"]).inc();
                    BLOB_BYTES_UPLOADED.inc_by(size);
                } else {
                    BLOB_PUTS.with_label_values(&["already_present"]).inc();
                }
                PutBlobResult::Success {
                    size,
                    already_present: !written,
                    capacity_key: Some(capacity_key),
                }
            }
            Err(e) => self.put_failure(BlobError::Storage(e.to_string())),
        }
    }

    /// Fetch the blob stored under `hash`.
    #[instrument(skip(self, hash), fields(hash = %hash.to_short_hash()))]
    pub async fn get_blob(&self, hash: &ContentHash) -> GetBlobResult {
        match self.store.get(&Self::blob_key(hash)).await {
            Ok(Some(data)) => {
                BLOB_GETS.with_label_values(&["found"]).inc();
                BLOB_BYTES_DOWNLOADED.inc_by(data.len() as u64);
                GetBlobResult::Found(data)
            }
            Ok(None) => {
                BLOB_GETS.with_label_values(&["not_found"]).inc();
                GetBlobResult::NotFound
            }
            Err(e) => {
                warn!(error = %e, "blob get failed");
                BLOB_GETS.with_label_values(&["failure"]).inc();
                GetBlobResult::Failure(BlobError::Storage(e.to_string()))
            }
        }
    }

    /// Reserve `size` bytes in the current time-box.
    async fn reserve(&self, size: u64) -> Result<String, BlobError> {
        let key = self.capacity_key(self.clock.utc_now())?;

        if self.last_failed_key().as_deref() == Some(key.as_str()) {
            debug!(capacity_key = %key, "time-box already full");
            BLOB_CAPACITY_REJECTIONS.with_label_values(&["cached"]).inc();
            return Err(BlobError::Capacity { key });
        }

        let delta = i64::try_from(size).unwrap_or(i64::MAX);
        let reserved = self
            .store
            .increment_with_expiry(&key, delta, self.expiry)
            .await
            .map_err(|e| BlobError::Storage(e.to_string()))?;

        if u64::try_from(reserved).unwrap_or(0) > self.max_capacity / 2 {
            warn!(capacity_key = %key, reserved, "blob capacity exhausted");
            BLOB_CAPACITY_REJECTIONS.with_label_values(&["remote"]).inc();
            *self
                .last_failed_key
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(key.clone());
            return Err(BlobError::Capacity { key });
        }

        Ok(key)
    }

    fn last_failed_key(&self) -> Option<String> {
        self.last_failed_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn put_failure(&self, error: BlobError) -> PutBlobResult {
        warn!(error = %error, "blob put failed");
        let outcome = match error {
            BlobError::Capacity { .. } => "capacity",
            BlobError::TooLarge { .. } => "too_large",
            BlobError::Storage(_) => "failure",
        };
        BLOB_PUTS.with_label_values(&[outcome]).inc();
        PutBlobResult::Failure(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{HashType, MemoryClock};
    use quarry_storage::MemorySharedStore;

    fn config(max_capacity_bytes: u64) -> BlobConfig {
        BlobConfig {
            max_capacity_bytes,
            ..BlobConfig::default()
        }
    }

    fn adapter(max_capacity_bytes: u64) -> (Arc<MemoryClock>, BlobAdapter) {
        let clock = Arc::new(MemoryClock::default());
        let store = Arc::new(MemorySharedStore::new(clock.clone()));
        let adapter = BlobAdapter::new(store, clock.clone(), &config(max_capacity_bytes));
        (clock, adapter)
    }

    #[test]
    fn test_capacity_key_format() {
        let (_, adapter) = adapter(1024);
        let now = OffsetDateTime::from_unix_timestamp(1_699_999_260).unwrap();
        // Default expiry is 30 minutes; windows start on the half hour.
        assert_eq!(
            adapter.capacity_key(now).unwrap(),
            "BlobCapacity@2023-11-14T22:00:00.000Z"
        );
        assert_eq!(
            adapter.capacity_key(now + time::Duration::minutes(28)).unwrap(),
            adapter.capacity_key(now).unwrap()
        );
        assert_ne!(
            adapter.capacity_key(now + time::Duration::minutes(31)).unwrap(),
            adapter.capacity_key(now).unwrap()
        );
    }

    #[test]
    fn test_blob_key_format() {
        let hash = ContentHash::compute(HashType::Sha256, b"x");
        assert_eq!(BlobAdapter::blob_key(&hash), format!("Blob-{hash}"));
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let (_, adapter) = adapter(1024);
        let hash = ContentHash::compute(HashType::Sha256, b"inline");

        assert_eq!(adapter.get_blob(&hash).await, GetBlobResult::NotFound);
        let put = adapter.put_blob(&hash, Bytes::from_static(b"inline")).await;
        assert!(matches!(
            put,
            PutBlobResult::Success {
                size: 6,
                already_present: false,
                capacity_key: Some(_)
            }
        ));
        assert_eq!(
            adapter.get_blob(&hash).await,
            GetBlobResult::Found(Bytes::from_static(b"inline"))
        );
    }

    #[tokio::test]
    async fn test_too_large_is_rejected() {
        let (_, adapter) = adapter(1024);
        let data = Bytes::from(vec![0u8; adapter.max_blob_size() as usize + 1]);
        let hash = ContentHash::compute(HashType::Sha256, &data);

        assert!(matches!(
            adapter.put_blob(&hash, data).await,
            PutBlobResult::Failure(BlobError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_new_window_clears_short_circuit() {
        let (clock, adapter) = adapter(10);
        let first = ContentHash::compute(HashType::Sha256, b"first");
        let second = ContentHash::compute(HashType::Sha256, b"second");

        let put = adapter.put_blob(&first, Bytes::from_static(b"123456")).await;
        assert!(matches!(put, PutBlobResult::Failure(BlobError::Capacity { .. })));

        clock.advance(time::Duration::minutes(30));
        let put = adapter.put_blob(&second, Bytes::from_static(b"1234")).await;
        assert!(put.is_success());
    }
}
