//! In-memory backends.
//!
//! [`MemoryKeyValueStore`] backs single-process deployments and tests;
//! [`MemorySharedStore`] stands in for the replicated shared store when every
//! participant lives in one process.

use crate::error::{StorageError, StorageResult};
use crate::traits::{KeyValueStore, ScanPage, SharedStore, validate_column, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use quarry_core::Clock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::instrument;

/// In-memory ordered key-value store.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    columns: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
}

impl MemoryKeyValueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, column: &str, key: &str) -> StorageResult<Option<Bytes>> {
        validate_column(column)?;
        validate_key(key)?;
        let columns = self.columns.read().await;
        Ok(columns.get(column).and_then(|c| c.get(key)).cloned())
    }

    #[instrument(skip(self, expected, new), fields(backend = "memory"))]
    async fn compare_exchange(
        &self,
        column: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Bytes>,
    ) -> StorageResult<bool> {
        validate_column(column)?;
        validate_key(key)?;
        let mut columns = self.columns.write().await;
        let entries = columns.entry(column.to_string()).or_default();

        let current = entries.get(key).map(|v| v.as_ref());
        if current != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                entries.insert(key.to_string(), value);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    async fn scan(
        &self,
        column: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        validate_column(column)?;
        let limit = limit.max(1);
        let columns = self.columns.read().await;
        let Some(entries) = columns.get(column) else {
            return Ok(ScanPage::default());
        };

        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_string()),
            _ => Bound::Included(prefix.to_string()),
        };

        let mut page = ScanPage::default();
        for (key, value) in entries.range((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if page.entries.len() == limit {
                page.next_start_after = page.entries.last().map(|(k, _)| k.clone());
                break;
            }
            page.entries.push((key.clone(), value.clone()));
        }
        Ok(page)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

enum SharedValue {
    Bytes(Bytes),
    Counter(i64),
}

struct SharedEntry {
    value: SharedValue,
    expires_at: OffsetDateTime,
}

/// In-process shared store with per-key expiry driven by a [`Clock`].
pub struct MemorySharedStore {
    entries: DashMap<String, SharedEntry>,
    clock: Arc<dyn Clock>,
}

impl MemorySharedStore {
    /// Create an empty shared store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of keys currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expiry_from_now(&self, expiry: Duration) -> OffsetDateTime {
        let now = self.clock.utc_now();
        time::Duration::try_from(expiry)
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .unwrap_or(now)
    }

    fn is_live(&self, entry: &SharedEntry) -> bool {
        entry.expires_at > self.clock.utc_now()
    }
}

#[async_trait]
impl SharedStore for MemorySharedStore {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self
            .entries
            .get(key)
            .is_some_and(|entry| self.is_live(&entry)))
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if !self.is_live(&entry) {
            return Ok(None);
        }
        match &entry.value {
            SharedValue::Bytes(bytes) => Ok(Some(bytes.clone())),
            SharedValue::Counter(value) => Ok(Some(Bytes::from(value.to_string()))),
        }
    }

    #[instrument(skip(self, value), fields(backend = "memory", size = value.len()))]
    async fn set_if_absent_with_expiry(
        &self,
        key: &str,
        value: Bytes,
        expiry: Duration,
    ) -> StorageResult<bool> {
        let expires_at = self.expiry_from_now(expiry);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if self.is_live(occupied.get()) {
                    return Ok(false);
                }
                occupied.insert(SharedEntry {
                    value: SharedValue::Bytes(value),
                    expires_at,
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SharedEntry {
                    value: SharedValue::Bytes(value),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        expiry: Duration,
    ) -> StorageResult<i64> {
        let expires_at = self.expiry_from_now(expiry);
        let now = self.clock.utc_now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| SharedEntry {
                value: SharedValue::Counter(0),
                expires_at,
            });

        if entry.expires_at <= now {
            *entry = SharedEntry {
                value: SharedValue::Counter(0),
                expires_at,
            };
        }

        match &mut entry.value {
            SharedValue::Counter(value) => {
                *value = value.saturating_add(delta);
                Ok(*value)
            }
            SharedValue::Bytes(_) => Err(StorageError::TypeMismatch {
                key: key.to_string(),
            }),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
