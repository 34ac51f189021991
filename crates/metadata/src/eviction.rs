//! Eviction ranking for local content under capacity pressure.
//!
//! Candidates are ordered by a composite key:
//! 1. effective-age bucket, oldest first
//! 2. replica rank, `None` before `Important`
//! 3. eviction cost, cheapest first
//!
//! Bucketing keeps near-contemporaneous content together so sub-bucket noise
//! in access times does not reorder it.

use crate::models::ContentLocationEntry;
use quarry_core::ShortHash;
use quarry_core::config::EvictionConfig;
use std::cmp::Ordering;
use std::time::Duration;
use time::OffsetDateTime;

/// Importance of a replica. `None < Important`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReplicaRank {
    #[default]
    None,
    /// Few replicas exist elsewhere; evict only after unimportant content.
    Important,
}

/// Eviction view of one piece of local content.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentEvictionInfo {
    pub hash: ShortHash,
    /// Time since the last access anywhere in the cluster.
    pub age: Duration,
    /// Time since the last access on this machine.
    pub local_age: Duration,
    /// Age used for ranking: the more recent of `age` and `local_age`.
    pub effective_age: Duration,
    /// Time since the content was first recorded.
    pub content_age: Duration,
    pub replica_count: u64,
    pub size: u64,
    pub rank: ReplicaRank,
}

impl ContentEvictionInfo {
    /// Derive eviction info from this machine's entry and, when known, the
    /// cluster-wide entry for the same hash.
    pub fn from_entry(
        hash: ShortHash,
        local: &ContentLocationEntry,
        global: Option<&ContentLocationEntry>,
        now: OffsetDateTime,
        policy: &EvictionPolicy,
    ) -> Self {
        let cluster_access = global.map_or(local.last_access, |g| g.last_access.max(local.last_access));
        let created_at = global.map_or(local.created_at, |g| g.created_at.min(local.created_at));
        let replica_count = global
            .map_or(local.replica_count(), |g| g.replica_count().max(local.replica_count()))
            as u64;

        let age = elapsed(now, cluster_access);
        let local_age = elapsed(now, local.last_access);

        Self {
            hash,
            age,
            local_age,
            effective_age: age.min(local_age),
            content_age: elapsed(now, created_at),
            replica_count,
            size: local.size,
            rank: policy.rank_for(replica_count),
        }
    }

    /// Per-byte cost of losing this content: scarcer and smaller content is
    /// more expensive to evict.
    pub fn cost(&self) -> f64 {
        1.0 / (self.replica_count.max(1) as f64 * self.size.max(1) as f64)
    }
}

fn elapsed(now: OffsetDateTime, since: OffsetDateTime) -> Duration {
    Duration::try_from(now - since).unwrap_or(Duration::ZERO)
}

/// Ranking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Width of an effective-age bucket. Zero ranks by raw effective age.
    pub age_bucketing_interval: Duration,
    /// Content with at most this many replicas is `Important`.
    pub important_replica_count: u64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            age_bucketing_interval: Duration::from_secs(3600),
            important_replica_count: 1,
        }
    }
}

impl From<&EvictionConfig> for EvictionPolicy {
    fn from(config: &EvictionConfig) -> Self {
        Self {
            age_bucketing_interval: config.age_bucketing_interval(),
            important_replica_count: config.important_replica_count,
        }
    }
}

impl EvictionPolicy {
    pub fn rank_for(&self, replica_count: u64) -> ReplicaRank {
        if replica_count <= self.important_replica_count {
            ReplicaRank::Important
        } else {
            ReplicaRank::None
        }
    }

    /// Bucket index of an effective age.
    pub fn age_bucket(&self, effective_age: Duration) -> u128 {
        let width = self.age_bucketing_interval.as_nanos();
        if width == 0 {
            effective_age.as_nanos()
        } else {
            effective_age.as_nanos() / width
        }
    }

    /// Total order: `Less` means `a` is evicted before `b`.
    pub fn compare(&self, a: &ContentEvictionInfo, b: &ContentEvictionInfo) -> Ordering {
        self.age_bucket(b.effective_age)
            .cmp(&self.age_bucket(a.effective_age))
            .then_with(|| a.rank.cmp(&b.rank))
            .then_with(|| a.cost().total_cmp(&b.cost()))
    }
}

/// Orders eviction candidates.
#[derive(Debug, Clone, Default)]
pub struct EvictionRanker {
    policy: EvictionPolicy,
}

impl EvictionRanker {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Sort candidates into eviction order.
    pub fn rank(&self, mut candidates: Vec<ContentEvictionInfo>) -> Vec<ContentEvictionInfo> {
        candidates.sort_by(|a, b| self.policy.compare(a, b));
        candidates
    }

    /// The shortest ranked prefix freeing at least `bytes_to_free`.
    pub fn select(
        &self,
        candidates: Vec<ContentEvictionInfo>,
        bytes_to_free: u64,
    ) -> Vec<ContentEvictionInfo> {
        let mut freed = 0u64;
        self.rank(candidates)
            .into_iter()
            .take_while(|candidate| {
                let take = freed < bytes_to_free;
                freed = freed.saturating_add(candidate.size);
                take
            })
            .collect()
    }
}
