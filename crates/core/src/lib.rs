//! Core domain types and shared logic for the Quarry distributed content cache.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content hashes, hash algorithms and short (index) hashes
//! - Machine identifiers and reachable machine locations
//! - The clock abstraction used for expiry, ages and time-boxes
//! - Configuration consumed by the location store, copier and blob adapter

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod location;

pub use clock::{Clock, MemoryClock, SystemClock};
pub use error::{Error, Result};
pub use hash::{ContentHash, ContentHasher, HashType, ShortHash};
pub use location::{
    ContentHashWithSize, ContentHashWithSizeAndLocations, MachineId, MachineLocation,
};
