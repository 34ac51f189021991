//! Global location store.
//!
//! Answers "which machines hold this hash" from two tiers: the shared view
//! (cluster-wide knowledge folded from the event stream, which may lag local
//! writes) and the local database (synchronous, but possibly incomplete on a
//! cold cache). Local changes are written through compare-exchange and then
//! published for peers. Events the stream rejects stay queued and go out
//! ahead of the next publication, so every local change reaches the stream
//! at least once.

use crate::cluster::ClusterState;
use crate::database::ContentLocationDatabase;
use crate::error::{MetadataError, MetadataResult};
use crate::events::{EventPublisher, LocationEvent, UpdateMetadataEntryEvent};
use crate::models::{Fingerprint, MetadataEntry};
use async_trait::async_trait;
use quarry_core::{
    ContentHash, ContentHashWithSize, ContentHashWithSizeAndLocations, MachineId, ShortHash,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// One tier of location knowledge.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Name used in logs and aggregated errors.
    fn name(&self) -> &'static str;

    /// Known locations of `hash`; an empty list means no entry.
    async fn get_content_locations(
        &self,
        hash: &ContentHash,
    ) -> MetadataResult<ContentHashWithSizeAndLocations>;

    /// Memoization entry for `fingerprint`.
    async fn get_metadata_entry(
        &self,
        fingerprint: &Fingerprint,
    ) -> MetadataResult<Option<MetadataEntry>>;

    async fn startup(&self) -> MetadataResult<()>;

    async fn shutdown(&self) -> MetadataResult<()>;
}

/// A [`LocationSource`] reading a [`ContentLocationDatabase`].
pub struct DatabaseLocationSource {
    name: &'static str,
    database: Arc<ContentLocationDatabase>,
    cluster: Arc<ClusterState>,
}

impl DatabaseLocationSource {
    pub fn new(
        name: &'static str,
        database: Arc<ContentLocationDatabase>,
        cluster: Arc<ClusterState>,
    ) -> Self {
        Self {
            name,
            database,
            cluster,
        }
    }

    pub fn database(&self) -> &Arc<ContentLocationDatabase> {
        &self.database
    }
}

#[async_trait]
impl LocationSource for DatabaseLocationSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get_content_locations(
        &self,
        hash: &ContentHash,
    ) -> MetadataResult<ContentHashWithSizeAndLocations> {
        match self.database.get(&hash.to_short_hash()).await? {
            Some(entry) => {
                let locations = self.cluster.resolve_all(entry.machines.iter().copied()).await?;
                Ok(ContentHashWithSizeAndLocations::new(
                    *hash,
                    Some(entry.size),
                    locations,
                ))
            }
            None => Ok(ContentHashWithSizeAndLocations::new(*hash, None, Vec::new())),
        }
    }

    async fn get_metadata_entry(
        &self,
        fingerprint: &Fingerprint,
    ) -> MetadataResult<Option<MetadataEntry>> {
        self.database.get_metadata(fingerprint).await
    }

    async fn startup(&self) -> MetadataResult<()> {
        self.database.health_check().await
    }

    async fn shutdown(&self) -> MetadataResult<()> {
        Ok(())
    }
}

/// Two-tier location store with event publication.
pub struct GlobalLocationStore {
    machine_id: MachineId,
    local_database: Arc<ContentLocationDatabase>,
    local: Arc<dyn LocationSource>,
    shared: Arc<dyn LocationSource>,
    publisher: Arc<EventPublisher>,
    // Changes already applied locally but not yet accepted by the stream.
    pending: Mutex<VecDeque<LocationEvent>>,
}

impl GlobalLocationStore {
    /// `local_database` receives this machine's writes and must be the
    /// database behind `local`.
    pub fn new(
        local_database: Arc<ContentLocationDatabase>,
        local: Arc<dyn LocationSource>,
        shared: Arc<dyn LocationSource>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            machine_id: publisher.sender(),
            local_database,
            local,
            shared,
            publisher,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Id of this machine.
    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    /// The database holding this machine's writes.
    pub fn local_database(&self) -> &Arc<ContentLocationDatabase> {
        &self.local_database
    }

    fn tiers(&self, prefer_shared: bool) -> (&dyn LocationSource, &dyn LocationSource) {
        if prefer_shared {
            (&*self.shared, &*self.local)
        } else {
            (&*self.local, &*self.shared)
        }
    }

    /// Look up locations, consulting the preferred tier first and the other
    /// only when the first has no entry (or fails).
    #[instrument(skip(self, hash), fields(hash = %hash.to_short_hash()))]
    pub async fn get_content_locations(
        &self,
        hash: &ContentHash,
        prefer_shared: bool,
    ) -> MetadataResult<ContentHashWithSizeAndLocations> {
        let (first, second) = self.tiers(prefer_shared);

        let first_error = match first.get_content_locations(hash).await {
            Ok(result) if !result.is_empty() => return Ok(result),
            Ok(_) => None,
            Err(e) => {
                warn!(source = first.name(), error = %e, "location lookup failed, falling back");
                Some(e)
            }
        };

        debug!(source = second.name(), "falling back to second tier");
        match (second.get_content_locations(hash).await, first_error) {
            (Ok(result), _) => Ok(result),
            (Err(e), Some(first_error)) => Err(MetadataError::Aggregate {
                operation: "get_content_locations",
                errors: vec![
                    format!("{}: {first_error}", first.name()),
                    format!("{}: {e}", second.name()),
                ],
            }),
            (Err(e), None) => {
                warn!(source = second.name(), error = %e, "fallback lookup failed");
                Err(e)
            }
        }
    }

    /// Look up a memoization entry with the same two-tier rule.
    pub async fn get_metadata_entry(
        &self,
        fingerprint: &Fingerprint,
        prefer_shared: bool,
    ) -> MetadataResult<Option<MetadataEntry>> {
        let (first, second) = self.tiers(prefer_shared);

        let first_error = match first.get_metadata_entry(fingerprint).await {
            Ok(Some(entry)) => return Ok(Some(entry)),
            Ok(None) => None,
            Err(e) => {
                warn!(source = first.name(), error = %e, "metadata lookup failed, falling back");
                Some(e)
            }
        };

        match (second.get_metadata_entry(fingerprint).await, first_error) {
            (Ok(entry), _) => Ok(entry),
            (Err(e), Some(first_error)) => Err(MetadataError::Aggregate {
                operation: "get_metadata_entry",
                errors: vec![
                    format!("{}: {first_error}", first.name()),
                    format!("{}: {e}", second.name()),
                ],
            }),
            (Err(e), None) => {
                warn!(source = second.name(), error = %e, "fallback lookup failed");
                Err(e)
            }
        }
    }

    /// Apply a memoization update locally and publish it.
    /// Returns whether the local entry changed; unchanged entries are not
    /// published again, but earlier queued events are.
    #[instrument(skip(self, fingerprint, entry), fields(fingerprint = %fingerprint))]
    pub async fn update_metadata_entry(
        &self,
        fingerprint: &Fingerprint,
        entry: MetadataEntry,
    ) -> MetadataResult<bool> {
        if !self
            .local_database
            .apply_metadata(fingerprint, &entry)
            .await?
        {
            self.publish(None).await?;
            return Ok(false);
        }
        self.publish(Some(LocationEvent::UpdateMetadataEntry(
            UpdateMetadataEntryEvent {
                machine_id: self.machine_id,
                fingerprint: fingerprint.clone(),
                entry,
            },
        )))
        .await?;
        Ok(true)
    }

    /// Record that this machine holds `hashes` and publish the new ones.
    /// Returns how many entries changed.
    pub async fn register_local_location(
        &self,
        hashes: &[ContentHashWithSize],
    ) -> MetadataResult<usize> {
        let mut changed = Vec::new();
        for hash in hashes {
            if self
                .local_database
                .add_location(&hash.hash.to_short_hash(), self.machine_id, hash.size)
                .await?
            {
                changed.push(*hash);
            }
        }
        let count = changed.len();
        let event = (!changed.is_empty()).then_some(LocationEvent::AddLocation { hashes: changed });
        self.publish(event).await?;
        Ok(count)
    }

    /// Record that this machine dropped `hashes` and publish the removals.
    pub async fn remove_local_location(&self, hashes: &[ShortHash]) -> MetadataResult<usize> {
        let mut changed = Vec::new();
        for hash in hashes {
            if self
                .local_database
                .remove_location(hash, self.machine_id)
                .await?
            {
                changed.push(*hash);
            }
        }
        let count = changed.len();
        let event =
            (!changed.is_empty()).then_some(LocationEvent::RemoveLocation { hashes: changed });
        self.publish(event).await?;
        Ok(count)
    }

    /// Record an access to `hashes` now and publish it.
    pub async fn touch(&self, hashes: &[ContentHash]) -> MetadataResult<usize> {
        let access_time = self.local_database.clock().utc_now();
        let mut changed = Vec::new();
        for hash in hashes {
            let short = hash.to_short_hash();
            if self.local_database.touch(&short, access_time).await? {
                changed.push(short);
            }
        }
        let count = changed.len();
        let event = (!changed.is_empty()).then_some(LocationEvent::Touch {
            hashes: changed,
            access_time,
        });
        self.publish(event).await?;
        Ok(count)
    }

    /// Publish events queued by earlier failed publications.
    /// Returns how many went out.
    pub async fn republish_pending(&self) -> MetadataResult<usize> {
        let queued = self.pending.lock().await.len();
        self.publish(None).await?;
        Ok(queued)
    }

    /// Append `event` to the queue and publish the queue in order. On failure
    /// the unpublished events stay queued for the next call.
    async fn publish(&self, event: Option<LocationEvent>) -> MetadataResult<()> {
        let mut pending = self.pending.lock().await;
        pending.extend(event);
        while let Some(event) = pending.front() {
            if let Err(e) = self.publisher.publish(event.clone()).await {
                warn!(queued = pending.len(), error = %e, "event publication failed");
                return Err(e);
            }
            pending.pop_front();
        }
        Ok(())
    }

    /// Start both tiers. Both are attempted; failures are aggregated.
    pub async fn startup(&self) -> MetadataResult<()> {
        let (local, shared) = tokio::join!(self.local.startup(), self.shared.startup());
        self.aggregate("startup", local, shared)?;
        info!(machine_id = %self.machine_id, "location store started");
        Ok(())
    }

    /// Stop both tiers. Both are attempted even if one fails.
    pub async fn shutdown(&self) -> MetadataResult<()> {
        if let Err(e) = self.republish_pending().await {
            warn!(error = %e, "unpublished events dropped at shutdown");
        }
        let (local, shared) = tokio::join!(self.local.shutdown(), self.shared.shutdown());
        self.aggregate("shutdown", local, shared)?;
        info!(machine_id = %self.machine_id, "location store stopped");
        Ok(())
    }

    fn aggregate(
        &self,
        operation: &'static str,
        local: MetadataResult<()>,
        shared: MetadataResult<()>,
    ) -> MetadataResult<()> {
        let mut errors = Vec::new();
        for (source, result) in [(&self.local, local), (&self.shared, shared)] {
            if let Err(e) = result {
                warn!(source = source.name(), operation, error = %e, "sub-store operation failed");
                errors.push(format!("{}: {e}", source.name()));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MetadataError::Aggregate { operation, errors })
        }
    }
}
