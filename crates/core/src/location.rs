//! Machine identity and content location types.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compact identifier assigned to a machine by the cluster state.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(u32);

impl MachineId {
    /// Create a machine id from its raw index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the raw index.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", self.0)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque, reachable address of a machine.
///
/// Produced by a path transformer from the machine's cache root and consumed
/// by the copier. Equality is by value.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineLocation(String);

impl MachineLocation {
    /// Create a location from its string form.
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    /// Decode a location from its opaque byte form.
    pub fn from_bytes(bytes: &[u8]) -> crate::Result<Self> {
        if bytes.is_empty() {
            return Err(crate::Error::InvalidLocation(
                "location cannot be empty".to_string(),
            ));
        }
        let location = std::str::from_utf8(bytes)
            .map_err(|e| crate::Error::InvalidLocation(e.to_string()))?;
        Ok(Self(location.to_string()))
    }

    /// Get the location string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the opaque byte form handed to path transformers.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineLocation({})", self.0)
    }
}

impl fmt::Display for MachineLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A content hash with its byte length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHashWithSize {
    /// The content hash.
    pub hash: ContentHash,
    /// Size in bytes.
    pub size: u64,
}

impl ContentHashWithSize {
    /// Create a new hash/size pair.
    pub fn new(hash: ContentHash, size: u64) -> Self {
        Self { hash, size }
    }
}

/// A copy request: the target hash, its declared size and ranked candidate locations.
///
/// Built per request from the location store and discarded once the copy completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentHashWithSizeAndLocations {
    /// The content hash.
    pub hash: ContentHash,
    /// Declared size in bytes, if known.
    pub size: Option<u64>,
    /// Candidate machines, in preference order.
    pub locations: Vec<MachineLocation>,
}

impl ContentHashWithSizeAndLocations {
    /// Create a new request.
    pub fn new(hash: ContentHash, size: Option<u64>, locations: Vec<MachineLocation>) -> Self {
        Self {
            hash,
            size,
            locations,
        }
    }

    /// Whether there are no candidate locations.
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}
