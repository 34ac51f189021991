//! Local content store: hash-verified files under the cache root.
//!
//! Content lives in the shared layout produced by
//! [`FilesystemPathTransformer`](crate::path::FilesystemPathTransformer), so
//! peers reading this machine's cache root find it where they expect. Writes
//! land in a staging directory first and are renamed into place.

use crate::error::{ContentStoreError, ContentStoreResult};
use crate::path::{BLOB_EXTENSION, FilesystemPathTransformer, SHARED_DIR};
use bytes::Bytes;
use quarry_core::{ContentHash, ContentHashWithSize, ContentHasher, HashType, ShortHash};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Directory under the cache root holding in-flight writes.
pub const STAGING_DIR: &str = "staging";

const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Content-addressed files under a cache root.
pub struct LocalContentStore {
    root: PathBuf,
}

impl LocalContentStore {
    /// Open the store, creating its directories.
    pub async fn open(root: impl AsRef<Path>) -> ContentStoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(SHARED_DIR)).await?;
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of `hash`.
    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        FilesystemPathTransformer::content_path(&self.root, hash)
    }

    /// A fresh, unique staging path.
    pub fn staging_path(&self) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(format!("{}.tmp", Uuid::new_v4()))
    }

    /// Hash a file by streaming it.
    pub async fn hash_file(path: &Path, hash_type: HashType) -> ContentStoreResult<ContentHashWithSize> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = ContentHasher::new(hash_type);
        let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
        let mut size = 0u64;
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as u64;
        }
        Ok(ContentHashWithSize::new(hasher.finalize(), size))
    }

    /// Verify a staged file against `expected` and move it into place.
    ///
    /// On a mismatch the staged file is discarded.
    #[instrument(skip(self, staged, expected), fields(hash = %expected.to_short_hash()))]
    pub async fn put_file(
        &self,
        staged: &Path,
        expected: &ContentHash,
    ) -> ContentStoreResult<ContentHashWithSize> {
        let actual = match Self::hash_file(staged, expected.hash_type()).await {
            Ok(actual) => actual,
            Err(e) => {
                self.discard(staged).await;
                return Err(e);
            }
        };
        if actual.hash != *expected {
            self.discard(staged).await;
            return Err(ContentStoreError::HashMismatch {
                expected: expected.to_short_hash(),
                actual: actual.hash.to_short_hash(),
            });
        }
        self.commit(staged, &actual.hash).await?;
        Ok(actual)
    }

    /// Move a staged file whose hash is already known into place.
    pub async fn put_trusted_file(
        &self,
        staged: &Path,
        hash: &ContentHash,
    ) -> ContentStoreResult<ContentHashWithSize> {
        let size = fs::metadata(staged).await?.len();
        self.commit(staged, hash).await?;
        Ok(ContentHashWithSize::new(*hash, size))
    }

    /// Store in-memory bytes.
    pub async fn put_bytes(
        &self,
        hash_type: HashType,
        data: &[u8],
    ) -> ContentStoreResult<ContentHashWithSize> {
        let hash = ContentHash::compute(hash_type, data);
        let staged = self.staging_path();
        let mut file = fs::File::create(&staged).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        self.commit(&staged, &hash).await?;
        Ok(ContentHashWithSize::new(hash, data.len() as u64))
    }

    /// Copy an external file into the store, hashing it on the way.
    pub async fn put_external(
        &self,
        source: &Path,
        hash_type: HashType,
    ) -> ContentStoreResult<ContentHashWithSize> {
        let staged = self.staging_path();
        if let Err(e) = fs::copy(source, &staged).await {
            self.discard(&staged).await;
            return Err(e.into());
        }
        let result = match Self::hash_file(&staged, hash_type).await {
            Ok(result) => result,
            Err(e) => {
                self.discard(&staged).await;
                return Err(e);
            }
        };
        self.commit(&staged, &result.hash).await?;
        Ok(result)
    }

    pub async fn contains(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.path_for(hash)).await.unwrap_or(false)
    }

    /// Size of stored content.
    pub async fn size(&self, hash: &ContentHash) -> ContentStoreResult<Option<u64>> {
        match fs::metadata(self.path_for(hash)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read stored content fully.
    pub async fn read(&self, hash: &ContentHash) -> ContentStoreResult<Bytes> {
        match fs::read(self.path_for(hash)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ContentStoreError::NotFound(hash.to_short_hash()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete stored content. Returns whether it existed.
    pub async fn delete(&self, hash: &ContentHash) -> ContentStoreResult<bool> {
        match fs::remove_file(self.path_for(hash)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the full hash of stored content from its short hash.
    pub async fn find(&self, short: &ShortHash) -> ContentStoreResult<Option<ContentHash>> {
        let prefix = short.to_hex();
        let dir = self
            .root
            .join(SHARED_DIR)
            .join(short.hash_type().tag())
            .join(&prefix[..3]);

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name
                .to_str()
                .and_then(|n| n.strip_suffix(BLOB_EXTENSION))
                .and_then(|n| n.strip_suffix('.'))
            else {
                continue;
            };
            if !stem.starts_with(&prefix) {
                continue;
            }
            let candidate = format!("{}:{stem}", short.hash_type().tag());
            match candidate.parse::<ContentHash>() {
                Ok(hash) if short.matches(&hash) => return Ok(Some(hash)),
                Ok(_) => {}
                Err(e) => warn!(file = %entry.path().display(), error = %e, "skipping unparseable content file"),
            }
        }
        Ok(None)
    }

    /// Remove a staged file, ignoring errors.
    pub async fn discard(&self, staged: &Path) {
        if let Err(e) = fs::remove_file(staged).await
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %staged.display(), error = %e, "failed to discard staged file");
        }
    }

    async fn commit(&self, staged: &Path, hash: &ContentHash) -> ContentStoreResult<()> {
        let target = self.path_for(hash);
        if fs::try_exists(&target).await.unwrap_or(false) {
            debug!(hash = %hash.to_short_hash(), "content already present");
            self.discard(staged).await;
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(e) = fs::rename(staged, &target).await {
            self.discard(staged).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LocalContentStore) {
        let dir = TempDir::new().unwrap();
        let store = LocalContentStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_file_verifies_hash() {
        let (_dir, store) = store().await;
        let expected = ContentHash::compute(HashType::Sha256, b"right");

        let staged = store.staging_path();
        fs::write(&staged, b"wrong").await.unwrap();
        let err = store.put_file(&staged, &expected).await.unwrap_err();
        assert!(matches!(err, ContentStoreError::HashMismatch { .. }));
        assert!(!staged.exists(), "corrupt bytes must be discarded");
        assert!(!store.contains(&expected).await);

        let staged = store.staging_path();
        fs::write(&staged, b"right").await.unwrap();
        let put = store.put_file(&staged, &expected).await.unwrap();
        assert_eq!(put.size, 5);
        assert_eq!(store.read(&expected).await.unwrap(), Bytes::from_static(b"right"));
    }

    #[tokio::test]
    async fn test_put_bytes_and_delete() {
        let (_dir, store) = store().await;
        let put = store.put_bytes(HashType::Blake3, b"payload").await.unwrap();

        assert!(store.contains(&put.hash).await);
        assert_eq!(store.size(&put.hash).await.unwrap(), Some(7));
        assert!(store.delete(&put.hash).await.unwrap());
        assert!(!store.delete(&put.hash).await.unwrap());
        assert_eq!(store.size(&put.hash).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_find_by_short_hash() {
        let (_dir, store) = store().await;
        let put = store.put_bytes(HashType::Sha256, b"findable").await.unwrap();

        let found = store.find(&put.hash.to_short_hash()).await.unwrap();
        assert_eq!(found, Some(put.hash));

        let other = ContentHash::compute(HashType::Sha256, b"absent").to_short_hash();
        assert_eq!(store.find(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_external() {
        let (dir, store) = store().await;
        let source = dir.path().join("artifact");
        fs::write(&source, b"built output").await.unwrap();

        let put = store.put_external(&source, HashType::Sha256).await.unwrap();
        assert_eq!(put.hash, ContentHash::compute(HashType::Sha256, b"built output"));
        assert!(source.exists(), "source is copied, not moved");
        assert!(store.contains(&put.hash).await);
    }
}
