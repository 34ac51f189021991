//! Content location database.
//!
//! A durable index from [`ShortHash`] to [`ContentLocationEntry`] plus the
//! memoization table, both stored as JSON values in a [`KeyValueStore`].
//! Every mutation is a compare-exchange, so concurrent writers (local
//! operations and inbound replication) never clobber each other.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{ContentLocationEntry, Fingerprint, MetadataEntry};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use quarry_core::{Clock, MachineId, ShortHash};
use quarry_storage::{KeyValueStore, KeyValueStoreScanExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, instrument};

/// Maximum compare-exchange attempts before giving up on a contended key.
const MAX_UPDATE_ATTEMPTS: usize = 64;

/// Default page size for enumeration.
const DEFAULT_SCAN_PAGE_SIZE: usize = 1000;

/// A lazily produced sequence of database records.
pub type RecordStream<'a, K, V> = Pin<Box<dyn Stream<Item = MetadataResult<(K, V)>> + Send + 'a>>;

/// Outcome of an update closure.
enum Update<T> {
    Unchanged,
    Replace(Option<T>),
}

/// Content location and memoization database.
pub struct ContentLocationDatabase {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    content_column: String,
    metadata_column: String,
    page_size: usize,
}

impl ContentLocationDatabase {
    /// Open the database in `namespace`. Distinct namespaces can share one store.
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, namespace: &str) -> Self {
        Self {
            store,
            clock,
            content_column: format!("{namespace}.content"),
            metadata_column: format!("{namespace}.metadata"),
            page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    /// Set the page size used by enumeration.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The clock used to stamp new entries.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Verify the backing store is usable.
    pub async fn health_check(&self) -> MetadataResult<()> {
        self.store.health_check().await?;
        Ok(())
    }

    // ===== Content locations =====

    /// Look up the entry for `hash`. Absence means unknown locally.
    pub async fn get(&self, hash: &ShortHash) -> MetadataResult<Option<ContentLocationEntry>> {
        get_json(&*self.store, &self.content_column, &hash.to_string()).await
    }

    /// Replace the entry for `hash` if it currently equals `expected`.
    ///
    /// `new = None` deletes the entry. Returns `false` when the stored entry
    /// differs from `expected`; callers re-read and retry.
    #[instrument(skip(self, hash, expected, new), fields(hash = %hash))]
    pub async fn compare_exchange(
        &self,
        hash: &ShortHash,
        expected: Option<&ContentLocationEntry>,
        new: Option<&ContentLocationEntry>,
    ) -> MetadataResult<bool> {
        compare_exchange_json(
            &*self.store,
            &self.content_column,
            &hash.to_string(),
            expected,
            new,
        )
        .await
    }

    /// Enumerate all entries in key order.
    ///
    /// Pages resume strictly after the last key seen, so one scan never
    /// produces the same hash twice.
    pub fn enumerate(&self) -> RecordStream<'_, ShortHash, ContentLocationEntry> {
        let column = self.content_column.clone();
        let stream = self
            .store
            .scan_stream(&self.content_column, "", self.page_size)
            .map(move |item| -> MetadataResult<(ShortHash, ContentLocationEntry)> {
                let (key, value) = item?;
                let hash = ShortHash::from_str(&key).map_err(|e| MetadataError::Corrupt {
                    column: column.clone(),
                    key: key.clone(),
                    message: e.to_string(),
                })?;
                let entry = decode(&column, &key, &value)?;
                Ok((hash, entry))
            });
        Box::pin(stream)
    }

    /// Record that `machine` holds the content. Returns whether the entry changed.
    pub async fn add_location(
        &self,
        hash: &ShortHash,
        machine: MachineId,
        size: u64,
    ) -> MetadataResult<bool> {
        let now = self.clock.utc_now();
        self.update(hash, |current| match current {
            Some(entry) if entry.contains(machine) => Update::Unchanged,
            Some(entry) => {
                let mut entry = entry.clone();
                entry.machines.insert(machine);
                Update::Replace(Some(entry))
            }
            None => {
                let mut entry = ContentLocationEntry::new(size, now);
                entry.machines.insert(machine);
                Update::Replace(Some(entry))
            }
        })
        .await
    }

    /// Record that `machine` no longer holds the content. The entry is deleted
    /// once no machine holds it. Returns whether the entry changed.
    pub async fn remove_location(&self, hash: &ShortHash, machine: MachineId) -> MetadataResult<bool> {
        self.update(hash, |current| match current {
            Some(entry) if entry.contains(machine) => {
                let mut entry = entry.clone();
                entry.machines.remove(&machine);
                if entry.machines.is_empty() {
                    Update::Replace(None)
                } else {
                    Update::Replace(Some(entry))
                }
            }
            _ => Update::Unchanged,
        })
        .await
    }

    /// Advance the last access time. Older timestamps are ignored, so replays
    /// and reordered deliveries converge. Returns whether the entry changed.
    pub async fn touch(&self, hash: &ShortHash, access_time: OffsetDateTime) -> MetadataResult<bool> {
        self.update(hash, |current| match current {
            Some(entry) if entry.last_access < access_time => {
                let mut entry = entry.clone();
                entry.last_access = access_time;
                Update::Replace(Some(entry))
            }
            _ => Update::Unchanged,
        })
        .await
    }

    async fn update<F>(&self, hash: &ShortHash, mut f: F) -> MetadataResult<bool>
    where
        F: FnMut(Option<&ContentLocationEntry>) -> Update<ContentLocationEntry>,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self.get(hash).await?;
            let new = match f(current.as_ref()) {
                Update::Unchanged => return Ok(false),
                Update::Replace(new) => new,
            };
            if self
                .compare_exchange(hash, current.as_ref(), new.as_ref())
                .await?
            {
                return Ok(true);
            }
            debug!(hash = %hash, attempt, "compare-exchange raced, retrying");
        }
        Err(MetadataError::Contention {
            key: hash.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    // ===== Memoization =====

    /// Look up the memoization entry for `fingerprint`.
    pub async fn get_metadata(&self, fingerprint: &Fingerprint) -> MetadataResult<Option<MetadataEntry>> {
        get_json(&*self.store, &self.metadata_column, fingerprint.as_str()).await
    }

    /// Replace the memoization entry if it currently equals `expected`.
    #[instrument(skip(self, fingerprint, expected, new), fields(fingerprint = %fingerprint))]
    pub async fn compare_exchange_metadata(
        &self,
        fingerprint: &Fingerprint,
        expected: Option<&MetadataEntry>,
        new: Option<&MetadataEntry>,
    ) -> MetadataResult<bool> {
        compare_exchange_json(
            &*self.store,
            &self.metadata_column,
            fingerprint.as_str(),
            expected,
            new,
        )
        .await
    }

    /// Store `entry` unless an equal or newer entry is already present.
    /// Returns whether the stored entry changed.
    pub async fn apply_metadata(
        &self,
        fingerprint: &Fingerprint,
        entry: &MetadataEntry,
    ) -> MetadataResult<bool> {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let current = self.get_metadata(fingerprint).await?;
            if let Some(current) = &current
                && !entry.supersedes(current)
            {
                return Ok(false);
            }
            if self
                .compare_exchange_metadata(fingerprint, current.as_ref(), Some(entry))
                .await?
            {
                return Ok(true);
            }
            debug!(fingerprint = %fingerprint, attempt, "compare-exchange raced, retrying");
        }
        Err(MetadataError::Contention {
            key: fingerprint.to_string(),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Enumerate all memoization entries in key order.
    pub fn enumerate_metadata(&self) -> RecordStream<'_, Fingerprint, MetadataEntry> {
        let column = self.metadata_column.clone();
        let stream = self
            .store
            .scan_stream(&self.metadata_column, "", self.page_size)
            .map(move |item| -> MetadataResult<(Fingerprint, MetadataEntry)> {
                let (key, value) = item?;
                let entry = decode(&column, &key, &value)?;
                Ok((Fingerprint::new(key), entry))
            });
        Box::pin(stream)
    }
}

fn decode<T: DeserializeOwned>(column: &str, key: &str, value: &[u8]) -> MetadataResult<T> {
    serde_json::from_slice(value).map_err(|e| MetadataError::Corrupt {
        column: column.to_string(),
        key: key.to_string(),
        message: e.to_string(),
    })
}

async fn get_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    column: &str,
    key: &str,
) -> MetadataResult<Option<T>> {
    match store.get(column, key).await? {
        Some(value) => Ok(Some(decode(column, key, &value)?)),
        None => Ok(None),
    }
}

async fn compare_exchange_json<T: Serialize>(
    store: &dyn KeyValueStore,
    column: &str,
    key: &str,
    expected: Option<&T>,
    new: Option<&T>,
) -> MetadataResult<bool> {
    // Serialization is deterministic, so the expected value re-encodes to the
    // stored bytes exactly.
    let expected = expected.map(serde_json::to_vec).transpose()?;
    let new = new
        .map(|value| serde_json::to_vec(value).map(Bytes::from))
        .transpose()?;
    Ok(store
        .compare_exchange(column, key, expected.as_deref(), new)
        .await?)
}
