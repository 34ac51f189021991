//! Distributed content store: lookup, pin, copy and space reclamation over
//! the local content store and the global location store.

use crate::blob::{BlobAdapter, GetBlobResult, PutBlobResult};
use crate::content::LocalContentStore;
use crate::copier::DistributedContentCopier;
use crate::error::ContentStoreResult;
use crate::metrics::{EVICTED_BYTES, EVICTED_CONTENT};
use bytes::Bytes;
use futures::StreamExt;
use quarry_core::config::PinConfig;
use quarry_core::{
    ContentHash, ContentHashWithSize, ContentHashWithSizeAndLocations, HashType, MachineLocation,
};
use quarry_metadata::{
    ContentEvictionInfo, ContentLocationDatabase, EvictionRanker, GlobalLocationStore,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Result of [`DistributedContentStore::pin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pinned {
    /// The content is on this machine.
    Local,
    /// The content is only on other machines.
    Remote { replicas: usize },
    NotFound,
}

/// Counters of one reclamation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub scanned: usize,
    pub total_bytes: u64,
    pub evicted: usize,
    pub evicted_bytes: u64,
}

/// Facade tying local content to cluster-wide location knowledge.
pub struct DistributedContentStore<P> {
    local_location: MachineLocation,
    location_store: Arc<GlobalLocationStore>,
    content: Arc<LocalContentStore>,
    copier: Arc<DistributedContentCopier<P>>,
    blobs: Option<Arc<BlobAdapter>>,
    global_database: Option<Arc<ContentLocationDatabase>>,
    ranker: EvictionRanker,
    prefer_shared: bool,
    pin: PinConfig,
}

impl<P: Send + Sync + 'static> DistributedContentStore<P> {
    pub fn new(
        local_location: MachineLocation,
        location_store: Arc<GlobalLocationStore>,
        content: Arc<LocalContentStore>,
        copier: Arc<DistributedContentCopier<P>>,
        ranker: EvictionRanker,
    ) -> Self {
        Self {
            local_location,
            location_store,
            content,
            copier,
            blobs: None,
            global_database: None,
            ranker,
            prefer_shared: true,
            pin: PinConfig::default(),
        }
    }

    /// Serve and publish small content through the shared blob store.
    pub fn with_blob_adapter(mut self, blobs: Arc<BlobAdapter>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    /// Use cluster-wide access times and replica counts when reclaiming.
    pub fn with_global_database(mut self, database: Arc<ContentLocationDatabase>) -> Self {
        self.global_database = Some(database);
        self
    }

    pub fn with_prefer_shared(mut self, prefer_shared: bool) -> Self {
        self.prefer_shared = prefer_shared;
        self
    }

    pub fn with_pin_config(mut self, pin: PinConfig) -> Self {
        self.pin = pin;
        self
    }

    pub fn location_store(&self) -> &Arc<GlobalLocationStore> {
        &self.location_store
    }

    pub fn content(&self) -> &Arc<LocalContentStore> {
        &self.content
    }

    /// Known locations of `hash`.
    pub async fn get_locations(
        &self,
        hash: &ContentHash,
    ) -> ContentStoreResult<ContentHashWithSizeAndLocations> {
        Ok(self
            .location_store
            .get_content_locations(hash, self.prefer_shared)
            .await?)
    }

    /// Ensure `hash` is available to a build, locally or on enough peers.
    #[instrument(skip(self, hash, cancel), fields(hash = %hash.to_short_hash()))]
    pub async fn pin(&self, hash: &ContentHash, cancel: &CancellationToken) -> ContentStoreResult<Pinned> {
        if self.content.contains(hash).await {
            self.location_store.touch(&[*hash]).await?;
            return Ok(Pinned::Local);
        }

        let remote = self.remote_locations(hash).await?;
        if remote.is_empty() {
            return Ok(Pinned::NotFound);
        }

        let replicas = remote.locations.len();
        if (replicas as u64) < self.pin.min_replica_count && self.pin.copy_below_threshold {
            debug!(replicas, "too few replicas, copying locally");
            self.copy_request(remote, cancel).await?;
            return Ok(Pinned::Local);
        }
        Ok(Pinned::Remote { replicas })
    }

    /// Materialize `hash` locally and register this machine as a location.
    #[instrument(skip(self, hash, cancel), fields(hash = %hash.to_short_hash()))]
    pub async fn copy_and_put(
        &self,
        hash: &ContentHash,
        cancel: &CancellationToken,
    ) -> ContentStoreResult<ContentHashWithSize> {
        if let Some(size) = self.content.size(hash).await? {
            self.location_store.touch(&[*hash]).await?;
            return Ok(ContentHashWithSize::new(*hash, size));
        }

        if let Some(put) = self.put_from_blob(hash).await? {
            self.location_store.register_local_location(&[put]).await?;
            return Ok(put);
        }

        let request = self.remote_locations(hash).await?;
        self.copy_request(request, cancel).await
    }

    /// Add a locally produced file and register it.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn put_local(
        &self,
        path: &Path,
        hash_type: HashType,
    ) -> ContentStoreResult<ContentHashWithSize> {
        let put = self.content.put_external(path, hash_type).await?;
        self.location_store.register_local_location(&[put]).await?;

        if let Some(blobs) = &self.blobs
            && put.size <= blobs.max_blob_size()
        {
            let data = self.content.read(&put.hash).await?;
            if let PutBlobResult::Failure(e) = blobs.put_blob(&put.hash, data).await {
                // Peers can still copy the content from this machine.
                debug!(error = %e, "content not stored inline");
            }
        }
        Ok(put)
    }

    /// Evict local content until at most `max_size_bytes` remain.
    #[instrument(skip(self))]
    pub async fn reclaim(&self, max_size_bytes: u64) -> ContentStoreResult<ReclaimStats> {
        let database = self.location_store.local_database();
        let machine = self.location_store.machine_id();
        let now = database.clock().utc_now();

        let mut stats = ReclaimStats::default();
        let mut candidates = Vec::new();
        let mut entries = database.enumerate();
        while let Some(record) = entries.next().await {
            let (hash, entry) = record?;
            if !entry.contains(machine) {
                continue;
            }
            let global = match &self.global_database {
                Some(global) => global.get(&hash).await?,
                None => None,
            };
            stats.scanned += 1;
            stats.total_bytes += entry.size;
            candidates.push(ContentEvictionInfo::from_entry(
                hash,
                &entry,
                global.as_ref(),
                now,
                self.ranker.policy(),
            ));
        }
        drop(entries);

        if stats.total_bytes <= max_size_bytes {
            debug!(total_bytes = stats.total_bytes, "within capacity");
            return Ok(stats);
        }

        for victim in self
            .ranker
            .select(candidates, stats.total_bytes - max_size_bytes)
        {
            let found = self.content.find(&victim.hash).await?;
            // Unregister first so peers stop being sent here.
            self.location_store
                .remove_local_location(&[victim.hash])
                .await?;
            let Some(hash) = found else {
                warn!(hash = %victim.hash, "registered content missing from disk");
                continue;
            };
            self.content.delete(&hash).await?;

            stats.evicted += 1;
            stats.evicted_bytes += victim.size;
            EVICTED_CONTENT.inc();
            EVICTED_BYTES.inc_by(victim.size);
        }

        info!(
            evicted = stats.evicted,
            evicted_bytes = stats.evicted_bytes,
            total_bytes = stats.total_bytes,
            "reclaimed space"
        );
        Ok(stats)
    }

    async fn remote_locations(
        &self,
        hash: &ContentHash,
    ) -> ContentStoreResult<ContentHashWithSizeAndLocations> {
        let mut request = self.get_locations(hash).await?;
        request
            .locations
            .retain(|location| *location != self.local_location);
        Ok(request)
    }

    async fn copy_request(
        &self,
        request: ContentHashWithSizeAndLocations,
        cancel: &CancellationToken,
    ) -> ContentStoreResult<ContentHashWithSize> {
        let copied = self.copier.copy_and_put(&request, cancel).await?;
        let put = ContentHashWithSize::new(copied.hash, copied.size);
        self.location_store.register_local_location(&[put]).await?;
        Ok(put)
    }

    async fn put_from_blob(&self, hash: &ContentHash) -> ContentStoreResult<Option<ContentHashWithSize>> {
        let Some(blobs) = &self.blobs else {
            return Ok(None);
        };
        let data: Bytes = match blobs.get_blob(hash).await {
            GetBlobResult::Found(data) => data,
            GetBlobResult::NotFound => return Ok(None),
            GetBlobResult::Failure(e) => {
                debug!(error = %e, "blob lookup failed, copying from peers");
                return Ok(None);
            }
        };

        let actual = ContentHash::compute(hash.hash_type(), &data);
        if actual != *hash {
            warn!(actual = %actual.to_short_hash(), "inline blob does not match its key");
            return Ok(None);
        }
        Ok(Some(self.content.put_bytes(hash.hash_type(), &data).await?))
    }
}
