//! Local filesystem key-value backend.
//!
//! Layout: one directory per column under the root, one file per key. File
//! names are the lowercase hex encoding of the key bytes, which keeps names
//! portable and preserves byte ordering. A `FORMAT` marker at the root guards
//! against opening a directory written by an incompatible version.
//!
//! Scans page through a sorted key listing cached per column. Every write
//! through this store invalidates the column's listing, so one process must
//! own the root.

use crate::error::{StorageError, StorageResult};
use crate::traits::{KeyValueStore, ScanPage, validate_column, validate_key};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Name of the on-disk format marker file.
const FORMAT_FILE: &str = "FORMAT";

/// Current on-disk format marker.
pub const FORMAT_MARKER: &str = "quarry-kv/1";

/// Prefix of in-flight temp files; skipped by scans.
const TEMP_PREFIX: &str = ".tmp-";

/// Number of lock stripes serializing compare-exchange per key.
const LOCK_STRIPES: usize = 64;

/// Durable key-value store on the local filesystem.
pub struct FilesystemKeyValueStore {
    root: PathBuf,
    stripes: Vec<Mutex<()>>,
    // Write generation per column; bumped by every successful write.
    generations: DashMap<String, u64>,
    // Sorted keys per column, tagged with the generation they were listed at.
    listings: DashMap<String, (u64, Arc<Vec<String>>)>,
}

impl FilesystemKeyValueStore {
    /// Open (or create) a store rooted at `root`.
    ///
    /// Fails with [`StorageError::Corrupt`] when the root carries a format
    /// marker this version does not understand.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let marker_path = root.join(FORMAT_FILE);
        match fs::read_to_string(&marker_path).await {
            Ok(marker) => {
                if marker.trim() != FORMAT_MARKER {
                    return Err(StorageError::Corrupt(format!(
                        "unsupported store format {:?} at {:?} (expected {FORMAT_MARKER})",
                        marker.trim(),
                        root
                    )));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                write_atomic(&marker_path, FORMAT_MARKER.as_bytes()).await?;
                debug!(root = ?root, "initialized key-value store");
            }
            Err(e) => return Err(StorageError::Io(e)),
        }

        let stripes = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Ok(Self {
            root,
            stripes,
            generations: DashMap::new(),
            listings: DashMap::new(),
        })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn column_path(&self, column: &str) -> StorageResult<PathBuf> {
        validate_column(column)?;
        Ok(self.root.join(column))
    }

    fn key_path(&self, column: &str, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.column_path(column)?.join(encode_key(key)))
    }

    fn generation(&self, column: &str) -> u64 {
        self.generations.get(column).map_or(0, |generation| *generation)
    }

    fn invalidate(&self, column: &str) {
        *self.generations.entry(column.to_string()).or_insert(0) += 1;
    }

    /// Sorted keys of `column`, listed from disk only after a write.
    async fn sorted_keys(&self, column: &str, dir: &Path) -> StorageResult<Arc<Vec<String>>> {
        let generation = self.generation(column);
        let cached = self
            .listings
            .get(column)
            .filter(|listing| listing.0 == generation)
            .map(|listing| listing.1.clone());
        if let Some(keys) = cached {
            return Ok(keys);
        }

        let keys = Arc::new(list_keys(column, dir).await?);
        self.listings
            .insert(column.to_string(), (generation, keys.clone()));
        Ok(keys)
    }

    fn stripe(&self, column: &str, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        column.hash(&mut hasher);
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[index]
    }
}

#[async_trait]
impl KeyValueStore for FilesystemKeyValueStore {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn get(&self, column: &str, key: &str) -> StorageResult<Option<Bytes>> {
        let path = self.key_path(column, key)?;
        read_optional(&path).await
    }

    #[instrument(skip(self, expected, new), fields(backend = "filesystem"))]
    async fn compare_exchange(
        &self,
        column: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<Bytes>,
    ) -> StorageResult<bool> {
        let path = self.key_path(column, key)?;
        let _guard = self.stripe(column, key).lock().await;

        let current = read_optional(&path).await?;
        if current.as_deref() != expected {
            return Ok(false);
        }

        match new {
            Some(value) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                write_atomic(&path, &value).await?;
            }
            None => match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            },
        }
        self.invalidate(column);
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn scan(
        &self,
        column: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<ScanPage> {
        let dir = self.column_path(column)?;
        let limit = limit.max(1);
        let keys = self.sorted_keys(column, &dir).await?;

        // Keys sharing a prefix are contiguous in sorted order.
        let mut start = keys.partition_point(|key| key.as_str() < prefix);
        if let Some(after) = start_after {
            start = start.max(keys.partition_point(|key| key.as_str() <= after));
        }
        let mut matching = keys[start..]
            .iter()
            .take_while(|key| key.starts_with(prefix));

        let mut page = ScanPage::default();
        for key in matching.by_ref().take(limit) {
            // Deleted between listing and reading: skip it.
            if let Some(value) = read_optional(&dir.join(encode_key(key))).await? {
                page.entries.push((key.clone(), value));
            }
        }
        if matching.next().is_some() {
            page.next_start_after = page.entries.last().map(|(k, _)| k.clone());
        }
        Ok(page)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("store root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("store root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

async fn list_keys(column: &str, dir: &Path) -> StorageResult<Vec<String>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::Io(e)),
    };

    let mut keys = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        // Use file_type() so symlinks are never followed.
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(TEMP_PREFIX) {
            continue;
        }
        let key = decode_key(name).ok_or_else(|| {
            StorageError::Corrupt(format!("unrecognized file {name:?} in column {column}"))
        })?;
        keys.push(key);
    }
    keys.sort_unstable();
    Ok(keys)
}

async fn read_optional(path: &Path) -> StorageResult<Option<Bytes>> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Write to a uniquely named temp file, fsync, then rename over the target.
async fn write_atomic(path: &Path, data: &[u8]) -> StorageResult<()> {
    let temp_path = path.with_file_name(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
    let result = async {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&temp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::Io(e));
    }
    Ok(())
}

fn encode_key(key: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(key.len() * 2);
    for byte in key.bytes() {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn decode_key(name: &str) -> Option<String> {
    if name.is_empty() || name.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}
