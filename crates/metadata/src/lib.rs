//! Location knowledge for the Quarry distributed content cache.
//!
//! This crate provides:
//! - The content location database (short hash to machine set, plus
//!   memoization entries), built on compare-exchange
//! - Cluster state mapping machine locations to compact ids
//! - Location events, the in-memory event bus and the idempotent applier
//! - The two-tier global location store
//! - Eviction ranking over local content

pub mod cluster;
pub mod database;
pub mod error;
pub mod events;
pub mod eviction;
pub mod location_store;
pub mod models;

pub use cluster::ClusterState;
pub use database::ContentLocationDatabase;
pub use error::{MetadataError, MetadataResult};
pub use events::{
    EnvelopeStream, EventApplier, EventEnvelope, EventPublisher, EventStream,
    InMemoryEventStream, LocationEvent, UpdateMetadataEntryEvent,
};
pub use eviction::{ContentEvictionInfo, EvictionPolicy, EvictionRanker, ReplicaRank};
pub use location_store::{DatabaseLocationSource, GlobalLocationStore, LocationSource};
pub use models::{ContentLocationEntry, Fingerprint, MetadataEntry};

/// Namespace of the database holding this machine's own writes.
pub const LOCAL_NAMESPACE: &str = "local";

/// Namespace of the database folded from cluster-wide events.
pub const GLOBAL_NAMESPACE: &str = "global";
