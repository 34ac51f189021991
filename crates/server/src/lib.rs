//! The quarryd daemon.
//!
//! This crate wires one node of the distributed content cache:
//! - Configuration-driven construction of the stores, copier and blob adapter
//! - Machine registration and event application
//! - Periodic space reclamation
//! - Metrics export

pub mod error;
pub mod metrics;
pub mod reclaim;
pub mod state;

pub use error::{ServerError, ServerResult};
pub use state::{AppState, ClusterServices};
