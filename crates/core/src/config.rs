//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level daemon configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Identity of this machine.
    #[serde(default)]
    pub machine: MachineConfig,
    /// Local key-value store backing the content location database.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Global location store behaviour.
    #[serde(default)]
    pub location_store: LocationStoreConfig,
    /// Peer-to-peer copy settings.
    #[serde(default)]
    pub copier: CopierConfig,
    /// Small-blob adapter settings.
    #[serde(default)]
    pub blob: BlobConfig,
    /// Local capacity and eviction settings.
    #[serde(default)]
    pub eviction: EvictionConfig,
    /// Machine reputation settings.
    #[serde(default)]
    pub reputation: ReputationConfig,
    /// Pin thresholds.
    #[serde(default)]
    pub pin: PinConfig,
    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Validate every section, reporting the first invalid one.
    pub fn validate(&self) -> Result<(), String> {
        self.machine.validate()?;
        self.storage.validate()?;
        self.copier.validate()?;
        self.blob.validate()?;
        self.eviction.validate()?;
        Ok(())
    }
}

/// Machine identity configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Root directory of the local content cache. Peers derive this
    /// machine's location from it, so it must be stable across restarts.
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./data/cache")
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
        }
    }
}

impl MachineConfig {
    /// Validate machine configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_root.as_os_str().is_empty() {
            return Err("machine.cache_root cannot be empty".to_string());
        }
        Ok(())
    }
}

/// Key-value store backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-process store (tests and single-shot tools).
    Memory,
    /// Durable store on the local filesystem.
    Filesystem {
        /// Root directory for the store.
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/locations"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path cannot be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Global location store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocationStoreConfig {
    /// Consult the shared store before the local database (default: true).
    #[serde(default = "default_prefer_shared")]
    pub prefer_shared: bool,
    /// Capacity of the in-process event channel.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
    /// Page size used when scanning the location database.
    #[serde(default = "default_scan_page_size")]
    pub scan_page_size: usize,
}

fn default_prefer_shared() -> bool {
    true
}

fn default_event_channel_capacity() -> usize {
    4096
}

fn default_scan_page_size() -> usize {
    1000
}

impl Default for LocationStoreConfig {
    fn default() -> Self {
        Self {
            prefer_shared: default_prefer_shared(),
            event_channel_capacity: default_event_channel_capacity(),
            scan_page_size: default_scan_page_size(),
        }
    }
}

/// Peer-to-peer copy configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopierConfig {
    /// Delay before each copy round in milliseconds. The number of entries is
    /// the maximum number of rounds; every candidate is tried once per round.
    #[serde(default = "default_retry_intervals_ms")]
    pub retry_intervals_ms: Vec<u64>,
    /// Content at or above this size is hashed while it streams and then put
    /// without a second hashing pass.
    #[serde(default = "default_trusted_hash_size_boundary")]
    pub trusted_hash_size_boundary: u64,
    /// Buffer size for streaming file copies.
    #[serde(default = "default_copy_buffer_size")]
    pub copy_buffer_size: usize,
}

fn default_retry_intervals_ms() -> Vec<u64> {
    vec![0, 100, 1000, 5000]
}

fn default_trusted_hash_size_boundary() -> u64 {
    100 * 1024 * 1024 // 100 MiB
}

fn default_copy_buffer_size() -> usize {
    64 * 1024
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            retry_intervals_ms: default_retry_intervals_ms(),
            trusted_hash_size_boundary: default_trusted_hash_size_boundary(),
            copy_buffer_size: default_copy_buffer_size(),
        }
    }
}

impl CopierConfig {
    /// Retry intervals as durations.
    pub fn retry_intervals(&self) -> Vec<Duration> {
        self.retry_intervals_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    /// Validate copier configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.retry_intervals_ms.is_empty() {
            return Err("copier.retry_intervals_ms must contain at least one entry".to_string());
        }
        if self.copy_buffer_size == 0 {
            return Err("copier.copy_buffer_size must be positive".to_string());
        }
        Ok(())
    }
}

/// Small-blob adapter configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Enable inline blob storage in the shared store (default: true).
    #[serde(default = "default_blob_enabled")]
    pub enabled: bool,
    /// Blob time-to-live in seconds. Also the width of a capacity time-box.
    #[serde(default = "default_blob_expiry_secs")]
    pub expiry_secs: u64,
    /// Maximum total bytes of live blobs across both time-boxes.
    #[serde(default = "default_blob_max_capacity")]
    pub max_capacity_bytes: u64,
    /// Content larger than this is never stored inline.
    #[serde(default = "default_blob_max_size")]
    pub max_blob_size: u64,
}

fn default_blob_enabled() -> bool {
    true
}

fn default_blob_expiry_secs() -> u64 {
    1800 // 30 minutes
}

fn default_blob_max_capacity() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_blob_max_size() -> u64 {
    1024 * 1024 // 1 MiB
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            enabled: default_blob_enabled(),
            expiry_secs: default_blob_expiry_secs(),
            max_capacity_bytes: default_blob_max_capacity(),
            max_blob_size: default_blob_max_size(),
        }
    }
}

impl BlobConfig {
    /// Blob expiry as a duration.
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    /// Validate blob configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.expiry_secs == 0 {
            return Err("blob.expiry_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Local capacity and eviction configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Target maximum size of local content in bytes.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,
    /// Width of an effective-age bucket in seconds (0 disables bucketing).
    #[serde(default = "default_age_bucketing_interval_secs")]
    pub age_bucketing_interval_secs: u64,
    /// Content with at most this many replicas is ranked important.
    #[serde(default = "default_important_replica_count")]
    pub important_replica_count: u64,
    /// Interval between reclamation passes in seconds.
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
}

fn default_max_size_bytes() -> u64 {
    10 * 1024 * 1024 * 1024 // 10 GiB
}

fn default_age_bucketing_interval_secs() -> u64 {
    3600 // 1 hour
}

fn default_important_replica_count() -> u64 {
    1
}

fn default_reclaim_interval_secs() -> u64 {
    300
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: default_max_size_bytes(),
            age_bucketing_interval_secs: default_age_bucketing_interval_secs(),
            important_replica_count: default_important_replica_count(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
        }
    }
}

impl EvictionConfig {
    /// Age bucket width as a duration.
    pub fn age_bucketing_interval(&self) -> Duration {
        Duration::from_secs(self.age_bucketing_interval_secs)
    }

    /// Reclamation interval as a duration.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    /// Validate eviction configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.reclaim_interval_secs == 0 {
            return Err("eviction.reclaim_interval_secs must be positive".to_string());
        }
        Ok(())
    }
}

/// Machine reputation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReputationConfig {
    /// Seconds after which a non-good reputation is forgotten.
    #[serde(default = "default_reputation_expiry_secs")]
    pub expiry_secs: u64,
}

fn default_reputation_expiry_secs() -> u64 {
    600
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_reputation_expiry_secs(),
        }
    }
}

impl ReputationConfig {
    /// Reputation expiry as a duration.
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }
}

/// Pin configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PinConfig {
    /// Remote content with at least this many replicas pins without a copy.
    #[serde(default = "default_pin_min_replica_count")]
    pub min_replica_count: u64,
    /// Copy content locally when it has fewer replicas than `min_replica_count`.
    #[serde(default)]
    pub copy_below_threshold: bool,
}

fn default_pin_min_replica_count() -> u64 {
    3
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            min_replica_count: default_pin_min_replica_count(),
            copy_below_threshold: false,
        }
    }
}

/// Metrics export configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Write the Prometheus text exposition to this file periodically
    /// (for a node_exporter textfile collector).
    #[serde(default)]
    pub textfile_path: Option<PathBuf>,
    /// Export interval in seconds.
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

fn default_metrics_interval_secs() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            textfile_path: None,
            interval_secs: default_metrics_interval_secs(),
        }
    }
}
