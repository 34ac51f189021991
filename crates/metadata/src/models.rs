//! Persisted records of the content location database.

use quarry_core::MachineId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use time::OffsetDateTime;

// =============================================================================
// Content locations
// =============================================================================

/// Known locations of one piece of content, keyed by its short hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLocationEntry {
    /// Machines holding a replica.
    pub machines: BTreeSet<MachineId>,
    /// Content size in bytes.
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_access: OffsetDateTime,
}

impl ContentLocationEntry {
    /// Create an entry with no replicas, created and accessed at `now`.
    pub fn new(size: u64, now: OffsetDateTime) -> Self {
        Self {
            machines: BTreeSet::new(),
            size,
            created_at: now,
            last_access: now,
        }
    }

    /// Number of machines holding a replica.
    pub fn replica_count(&self) -> usize {
        self.machines.len()
    }

    /// Whether `machine` holds a replica.
    pub fn contains(&self, machine: MachineId) -> bool {
        self.machines.contains(&machine)
    }
}

// =============================================================================
// Memoization
// =============================================================================

/// Hash of a build step's inputs, used as the memoization key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a fingerprint string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Memoization value: the serialized output set of a build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Opaque serialized content-hash list.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Last update, as Windows file time (100ns ticks since 1601-01-01 UTC).
    pub timestamp_utc_file_time: i64,
}

impl MetadataEntry {
    pub fn new(data: impl Into<Vec<u8>>, timestamp_utc_file_time: i64) -> Self {
        Self {
            data: data.into(),
            timestamp_utc_file_time,
        }
    }

    /// Whether this entry should replace `other` (strictly newer wins).
    pub fn supersedes(&self, other: &MetadataEntry) -> bool {
        self.timestamp_utc_file_time > other.timestamp_utc_file_time
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
