//! Distributed content copier.
//!
//! A copy request walks rounds bounded by the retry-interval list. Each round
//! waits its delay, then tries every candidate once in reputation order.
//! Transport failures move on to the next candidate; integrity failures end
//! the request and the transferred bytes are discarded.

use crate::content::LocalContentStore;
use crate::error::{ContentStoreError, CopyError, FileCopyError};
use crate::file_copier::{CopyOptions, FileCopier};
use crate::metrics::{COPY_ATTEMPTS, COPY_BYTES, COPY_DURATION, record_copy_failure};
use crate::path::PathTransformer;
use crate::reputation::{MachineReputation, MachineReputationTracker};
use quarry_core::config::CopierConfig;
use quarry_core::{ContentHash, ContentHashWithSizeAndLocations, MachineLocation};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Copier settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopierSettings {
    /// Delay before each round; its length is the number of rounds.
    pub retry_intervals: Vec<Duration>,
    /// Content at or above this size is hashed in-stream.
    pub trusted_hash_size_boundary: u64,
    pub buffer_size: usize,
}

impl Default for CopierSettings {
    fn default() -> Self {
        Self::from(&CopierConfig::default())
    }
}

impl From<&CopierConfig> for CopierSettings {
    fn from(config: &CopierConfig) -> Self {
        Self {
            retry_intervals: config.retry_intervals(),
            trusted_hash_size_boundary: config.trusted_hash_size_boundary,
            buffer_size: config.copy_buffer_size,
        }
    }
}

/// A successful copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedContent {
    pub hash: ContentHash,
    pub size: u64,
    /// Machine the bytes came from.
    pub source: MachineLocation,
    /// Transport attempts made, including the successful one.
    pub attempts: usize,
}

/// Failures of one request, keyed by location.
#[derive(Debug, Default)]
struct FailureLog {
    by_location: BTreeMap<MachineLocation, Vec<(usize, FileCopyError)>>,
}

impl FailureLog {
    fn record(&mut self, round: usize, location: &MachineLocation, error: FileCopyError) {
        self.by_location
            .entry(location.clone())
            .or_default()
            .push((round, error));
    }

    fn summary(&self) -> Vec<String> {
        self.by_location
            .iter()
            .flat_map(|(location, failures)| {
                failures
                    .iter()
                    .map(move |(round, error)| format!("{location} (round {}): {error}", round + 1))
            })
            .collect()
    }
}

enum AttemptError {
    /// The transport failed; other candidates may still succeed.
    Transport(FileCopyError),
    /// The transferred bytes are wrong; the request ends.
    Integrity(CopyError),
}

/// Copies content from peers into the local content store.
pub struct DistributedContentCopier<P> {
    path_transformer: Arc<dyn PathTransformer<P>>,
    file_copier: Arc<dyn FileCopier<P>>,
    content_store: Arc<LocalContentStore>,
    reputation: Arc<MachineReputationTracker>,
    settings: CopierSettings,
}

impl<P: Send + Sync + 'static> DistributedContentCopier<P> {
    pub fn new(
        path_transformer: Arc<dyn PathTransformer<P>>,
        file_copier: Arc<dyn FileCopier<P>>,
        content_store: Arc<LocalContentStore>,
        reputation: Arc<MachineReputationTracker>,
        settings: CopierSettings,
    ) -> Self {
        Self {
            path_transformer,
            file_copier,
            content_store,
            reputation,
            settings,
        }
    }

    pub fn reputation(&self) -> &Arc<MachineReputationTracker> {
        &self.reputation
    }

    pub fn settings(&self) -> &CopierSettings {
        &self.settings
    }

    /// Materialize `request.hash` locally from one of its locations.
    #[instrument(
        skip(self, request, cancel),
        fields(hash = %request.hash.to_short_hash(), locations = request.locations.len())
    )]
    pub async fn copy_and_put(
        &self,
        request: &ContentHashWithSizeAndLocations,
        cancel: &CancellationToken,
    ) -> Result<CopiedContent, CopyError> {
        let hash = request.hash.to_short_hash();
        let started = Instant::now();
        let mut failures = FailureLog::default();
        let mut attempts = 0usize;

        if request.locations.is_empty() {
            return Err(CopyError::Exhausted {
                hash,
                attempts,
                failures: Vec::new(),
            });
        }

        for (round, delay) in self.settings.retry_intervals.iter().enumerate() {
            if !delay.is_zero() {
                debug!(round, delay_ms = delay.as_millis() as u64, "waiting before copy round");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CopyError::Cancelled { hash }),
                    _ = tokio::time::sleep(*delay) => {}
                }
            }

            for location in self.reputation.rank(&request.locations) {
                if cancel.is_cancelled() {
                    return Err(CopyError::Cancelled { hash });
                }

                attempts += 1;
                COPY_ATTEMPTS.inc();
                match self.attempt(request, &location, cancel).await {
                    Ok(size) => {
                        self.reputation.report(&location, MachineReputation::Good);
                        COPY_BYTES.inc_by(size);
                        COPY_DURATION.observe(started.elapsed().as_secs_f64());
                        info!(source = %location, size, attempts, "copied content");
                        return Ok(CopiedContent {
                            hash: request.hash,
                            size,
                            source: location,
                            attempts,
                        });
                    }
                    Err(AttemptError::Transport(FileCopyError::Cancelled)) => {
                        return Err(CopyError::Cancelled { hash });
                    }
                    Err(AttemptError::Transport(error)) => {
                        debug!(source = %location, round, error = %error, "copy attempt failed");
                        record_copy_failure(error.reason());
                        if let Some(reputation) = MachineReputation::for_copy_error(&error) {
                            self.reputation.report(&location, reputation);
                        }
                        failures.record(round, &location, error);
                    }
                    Err(AttemptError::Integrity(error)) => {
                        warn!(source = %location, error = %error, "copied content failed verification");
                        record_copy_failure(match error {
                            CopyError::SizeMismatch { .. } => "size_mismatch",
                            _ => "hash_mismatch",
                        });
                        self.reputation.report(&location, MachineReputation::Bad);
                        return Err(error);
                    }
                }
            }
        }

        warn!(attempts, "copy exhausted all rounds");
        Err(CopyError::Exhausted {
            hash,
            attempts,
            failures: failures.summary(),
        })
    }

    /// One transport attempt from `location`, verified and committed.
    async fn attempt(
        &self,
        request: &ContentHashWithSizeAndLocations,
        location: &MachineLocation,
        cancel: &CancellationToken,
    ) -> Result<u64, AttemptError> {
        let hash = &request.hash;
        let source = self.path_transformer.generate_path(hash, location.as_bytes());
        let staged = self.content_store.staging_path();
        let trusted = request
            .size
            .is_some_and(|size| size >= self.settings.trusted_hash_size_boundary);
        let options = CopyOptions {
            expected_size: request.size,
            hash_type: trusted.then(|| hash.hash_type()),
            buffer_size: self.settings.buffer_size,
        };

        let copied = match self
            .file_copier
            .copy_to(&source, &staged, options, cancel)
            .await
        {
            Ok(copied) => copied,
            Err(e) => {
                self.content_store.discard(&staged).await;
                return Err(AttemptError::Transport(e));
            }
        };

        if let Some(expected) = request.size
            && copied.bytes_copied != expected
        {
            self.content_store.discard(&staged).await;
            return Err(AttemptError::Integrity(CopyError::SizeMismatch {
                hash: hash.to_short_hash(),
                expected,
                actual: copied.bytes_copied,
            }));
        }

        let put = match copied.hash {
            Some(streamed) if streamed != *hash => {
                self.content_store.discard(&staged).await;
                return Err(AttemptError::Integrity(CopyError::HashMismatch {
                    expected: hash.to_short_hash(),
                    actual: streamed.to_short_hash(),
                }));
            }
            Some(_) => self.content_store.put_trusted_file(&staged, hash).await,
            None => self.content_store.put_file(&staged, hash).await,
        };

        match put {
            Ok(put) => Ok(put.size),
            Err(ContentStoreError::HashMismatch { expected, actual }) => {
                Err(AttemptError::Integrity(CopyError::HashMismatch { expected, actual }))
            }
            Err(e) => {
                self.content_store.discard(&staged).await;
                Err(AttemptError::Transport(FileCopyError::DestinationPath(
                    e.to_string(),
                )))
            }
        }
    }
}
