//! Machine reputation, consumed when ordering copy candidates.
//!
//! Reports from concurrent copy requests land in a `DashMap`; a non-good
//! reputation expires so a recovered machine is tried first again.

use crate::error::FileCopyError;
use dashmap::DashMap;
use quarry_core::{Clock, MachineLocation};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

/// Observed reliability of a machine. Ordered from most to least preferred.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachineReputation {
    #[default]
    Good,
    /// The machine answered but did not have the content.
    Missing,
    /// The machine failed to serve content or served corrupt content.
    Bad,
}

impl MachineReputation {
    /// Reputation implied by a failed transport attempt, if any.
    pub fn for_copy_error(error: &FileCopyError) -> Option<Self> {
        match error {
            FileCopyError::SourcePath(_) => Some(MachineReputation::Missing),
            FileCopyError::Transport(_) => Some(MachineReputation::Bad),
            // A local write failure says nothing about the peer.
            FileCopyError::DestinationPath(_) => Some(MachineReputation::Good),
            FileCopyError::Cancelled => None,
        }
    }
}

/// Shared tracker of machine reputations.
pub struct MachineReputationTracker {
    clock: Arc<dyn Clock>,
    expiry: Duration,
    entries: DashMap<MachineLocation, (MachineReputation, OffsetDateTime)>,
}

impl MachineReputationTracker {
    pub fn new(clock: Arc<dyn Clock>, expiry: Duration) -> Self {
        Self {
            clock,
            expiry,
            entries: DashMap::new(),
        }
    }

    /// Record the outcome of an interaction with `location`.
    pub fn report(&self, location: &MachineLocation, reputation: MachineReputation) {
        debug!(location = %location, ?reputation, "reputation report");
        if reputation == MachineReputation::Good {
            self.entries.remove(location);
        } else {
            self.entries
                .insert(location.clone(), (reputation, self.clock.utc_now()));
        }
    }

    /// Current reputation of `location`. Unknown and expired entries are good.
    pub fn reputation(&self, location: &MachineLocation) -> MachineReputation {
        let Some(entry) = self.entries.get(location) else {
            return MachineReputation::Good;
        };
        let (reputation, reported_at) = *entry;
        drop(entry);

        let age = Duration::try_from(self.clock.utc_now() - reported_at).unwrap_or(Duration::ZERO);
        if age >= self.expiry {
            self.entries
                .remove_if(location, |_, (_, at)| *at == reported_at);
            MachineReputation::Good
        } else {
            reputation
        }
    }

    /// Order `locations` by reputation, keeping the given order among equals.
    pub fn rank(&self, locations: &[MachineLocation]) -> Vec<MachineLocation> {
        let mut ranked: Vec<(MachineReputation, &MachineLocation)> = locations
            .iter()
            .map(|location| (self.reputation(location), location))
            .collect();
        ranked.sort_by_key(|(reputation, _)| *reputation);
        ranked
            .into_iter()
            .map(|(_, location)| location.clone())
            .collect()
    }
}
