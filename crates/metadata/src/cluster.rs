//! Cluster state: the registry mapping machine locations to compact ids.
//!
//! Ids are allocated from a counter through compare-exchange, so concurrent
//! registrations of the same location converge on one id. The store backing
//! the registry must be shared by every machine that exchanges events.
//!
//! A registration writes the location record before the id record. If the
//! second write is lost, the next registration of that location restores it.

use crate::error::{MetadataError, MetadataResult};
use bytes::Bytes;
use dashmap::DashMap;
use futures::TryStreamExt;
use quarry_core::{ContentHash, HashType, MachineId, MachineLocation};
use quarry_storage::{KeyValueStore, KeyValueStoreScanExt};
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Column holding the registry.
pub const CLUSTER_COLUMN: &str = "cluster";

const NEXT_ID_KEY: &str = "next";
const LOCATION_KEY_PREFIX: &str = "loc/";
const ID_KEY_PREFIX: &str = "id/";
const MAX_REGISTER_ATTEMPTS: usize = 64;

/// Machine registry with an in-process cache of resolved ids.
pub struct ClusterState {
    store: Arc<dyn KeyValueStore>,
    by_location: DashMap<MachineLocation, MachineId>,
    by_id: DashMap<MachineId, MachineLocation>,
}

impl ClusterState {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            by_location: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    /// Register `location`, returning its stable id. Idempotent.
    #[instrument(skip(self, location), fields(location = %location))]
    pub async fn register(&self, location: &MachineLocation) -> MetadataResult<MachineId> {
        if let Some(id) = self.by_location.get(location) {
            return Ok(*id);
        }

        let location_key = location_key(location);
        for _ in 0..MAX_REGISTER_ATTEMPTS {
            if let Some(id) = self.read_id(&location_key).await? {
                self.ensure_id_record(id, location).await?;
                self.remember(location.clone(), id);
                return Ok(id);
            }

            let id = self.allocate_id().await?;
            let claimed = self
                .store
                .compare_exchange(
                    CLUSTER_COLUMN,
                    &location_key,
                    None,
                    Some(Bytes::from(id.index().to_string())),
                )
                .await?;
            if !claimed {
                // Another registration won; the allocated id stays unused.
                continue;
            }

            self.ensure_id_record(id, location).await?;
            info!(machine_id = %id, "registered machine");
            self.remember(location.clone(), id);
            return Ok(id);
        }

        Err(MetadataError::Contention {
            key: location_key,
            attempts: MAX_REGISTER_ATTEMPTS,
        })
    }

    /// Look up the id of a registered location.
    pub async fn machine_id(&self, location: &MachineLocation) -> MetadataResult<Option<MachineId>> {
        if let Some(id) = self.by_location.get(location) {
            return Ok(Some(*id));
        }
        let id = self.read_id(&location_key(location)).await?;
        if let Some(id) = id {
            self.remember(location.clone(), id);
        }
        Ok(id)
    }

    /// Resolve an id to its location.
    pub async fn resolve(&self, id: MachineId) -> MetadataResult<Option<MachineLocation>> {
        if let Some(location) = self.by_id.get(&id) {
            return Ok(Some(location.clone()));
        }
        let Some(value) = self.store.get(CLUSTER_COLUMN, &id_key(id)).await? else {
            return Ok(None);
        };
        let location = MachineLocation::from_bytes(&value)?;
        self.remember(location.clone(), id);
        Ok(Some(location))
    }

    /// Resolve many ids, preserving order. Unknown ids are skipped with a warning.
    pub async fn resolve_all(
        &self,
        ids: impl IntoIterator<Item = MachineId>,
    ) -> MetadataResult<Vec<MachineLocation>> {
        let mut locations = Vec::new();
        for id in ids {
            match self.resolve(id).await? {
                Some(location) => locations.push(location),
                None => warn!(machine_id = %id, "skipping unregistered machine"),
            }
        }
        Ok(locations)
    }

    /// All registered machines in id order.
    pub async fn machines(&self) -> MetadataResult<Vec<(MachineId, MachineLocation)>> {
        let entries: Vec<(String, Bytes)> = self
            .store
            .scan_stream(CLUSTER_COLUMN, ID_KEY_PREFIX, 1000)
            .try_collect()
            .await?;

        let mut machines = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let id = parse_id(&key, key.trim_start_matches(ID_KEY_PREFIX))?;
            machines.push((id, MachineLocation::from_bytes(&value)?));
        }
        Ok(machines)
    }

    /// Make sure `id` resolves to `location`, writing the record if absent.
    async fn ensure_id_record(&self, id: MachineId, location: &MachineLocation) -> MetadataResult<()> {
        let key = id_key(id);
        let value = Bytes::from(location.as_str().to_string());
        if self
            .store
            .compare_exchange(CLUSTER_COLUMN, &key, None, Some(value))
            .await?
        {
            return Ok(());
        }
        match self.store.get(CLUSTER_COLUMN, &key).await? {
            Some(existing) if existing.as_ref() == location.as_bytes() => Ok(()),
            Some(existing) => Err(corrupt(
                &key,
                format!(
                    "id already bound to {:?}",
                    String::from_utf8_lossy(&existing)
                ),
            )),
            None => Err(corrupt(&key, "id record removed during registration")),
        }
    }

    async fn read_id(&self, location_key: &str) -> MetadataResult<Option<MachineId>> {
        match self.store.get(CLUSTER_COLUMN, location_key).await? {
            Some(value) => {
                let text = std::str::from_utf8(&value).map_err(|e| corrupt(location_key, e))?;
                Ok(Some(parse_id(location_key, text)?))
            }
            None => Ok(None),
        }
    }

    async fn allocate_id(&self) -> MetadataResult<MachineId> {
        for _ in 0..MAX_REGISTER_ATTEMPTS {
            let current = self.store.get(CLUSTER_COLUMN, NEXT_ID_KEY).await?;
            let next = match &current {
                Some(value) => {
                    let text = std::str::from_utf8(value).map_err(|e| corrupt(NEXT_ID_KEY, e))?;
                    parse_id(NEXT_ID_KEY, text)?.index()
                }
                None => 1,
            };
            let following = next
                .checked_add(1)
                .ok_or_else(|| corrupt(NEXT_ID_KEY, "machine id space exhausted"))?;
            if self
                .store
                .compare_exchange(
                    CLUSTER_COLUMN,
                    NEXT_ID_KEY,
                    current.as_deref(),
                    Some(Bytes::from(following.to_string())),
                )
                .await?
            {
                return Ok(MachineId::new(next));
            }
        }
        Err(MetadataError::Contention {
            key: NEXT_ID_KEY.to_string(),
            attempts: MAX_REGISTER_ATTEMPTS,
        })
    }

    fn remember(&self, location: MachineLocation, id: MachineId) {
        self.by_id.insert(id, location.clone());
        self.by_location.insert(location, id);
    }
}

/// Locations can be long paths, so the registry keys them by digest.
fn location_key(location: &MachineLocation) -> String {
    let digest = ContentHash::compute(HashType::Sha256, location.as_bytes());
    format!("{LOCATION_KEY_PREFIX}{}", digest.to_hex())
}

/// Zero-padded so scans return machines in id order.
fn id_key(id: MachineId) -> String {
    format!("{ID_KEY_PREFIX}{:010}", id.index())
}

fn parse_id(key: &str, text: &str) -> MetadataResult<MachineId> {
    text.parse::<u32>()
        .map(MachineId::new)
        .map_err(|e| corrupt(key, e))
}

fn corrupt(key: &str, message: impl std::fmt::Display) -> MetadataError {
    MetadataError::Corrupt {
        column: CLUSTER_COLUMN.to_string(),
        key: key.to_string(),
        message: message.to_string(),
    }
}
