//! Location and memoization events exchanged between machines.
//!
//! Delivery is at-least-once and may reorder across producers, so the
//! [`EventApplier`] folds envelopes idempotently: it skips exact replays by
//! sequence number and every event it applies converges regardless of order.
//! An envelope that fails to apply holds its sender's high-water mark below
//! it until a redelivery succeeds.

use crate::database::ContentLocationDatabase;
use crate::error::{MetadataError, MetadataResult};
use crate::models::{Fingerprint, MetadataEntry};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use quarry_core::{ContentHashWithSize, MachineId, ShortHash};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// A memoization update published by `machine_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMetadataEntryEvent {
    pub machine_id: MachineId,
    pub fingerprint: Fingerprint,
    pub entry: MetadataEntry,
}

/// A change to cluster-wide knowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LocationEvent {
    /// The sender now holds these hashes.
    AddLocation { hashes: Vec<ContentHashWithSize> },
    /// The sender no longer holds these hashes.
    RemoveLocation { hashes: Vec<ShortHash> },
    /// The sender accessed these hashes.
    Touch {
        hashes: Vec<ShortHash>,
        #[serde(with = "time::serde::rfc3339")]
        access_time: OffsetDateTime,
    },
    UpdateMetadataEntry(UpdateMetadataEntryEvent),
}

impl LocationEvent {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            LocationEvent::AddLocation { .. } => "add_location",
            LocationEvent::RemoveLocation { .. } => "remove_location",
            LocationEvent::Touch { .. } => "touch",
            LocationEvent::UpdateMetadataEntry(_) => "update_metadata_entry",
        }
    }
}

/// An event stamped with its producer and position in that producer's log.
///
/// `epoch` changes whenever a producer restarts its sequence, so
/// `(epoch, sequence)` increases monotonically per sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sender: MachineId,
    pub epoch: u64,
    pub sequence: u64,
    pub event: LocationEvent,
}

impl EventEnvelope {
    /// Encode for the wire.
    pub fn to_bytes(&self) -> MetadataResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from the wire.
    pub fn from_bytes(bytes: &[u8]) -> MetadataResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A stream of envelopes delivered to one subscriber.
pub type EnvelopeStream = Pin<Box<dyn Stream<Item = EventEnvelope> + Send>>;

/// Append-only event bus.
#[async_trait]
pub trait EventStream: Send + Sync + 'static {
    /// Publish an envelope to every subscriber.
    async fn publish(&self, envelope: &EventEnvelope) -> MetadataResult<()>;

    /// Subscribe to envelopes published from now on.
    fn subscribe(&self) -> EnvelopeStream;

    /// Stop accepting events.
    async fn shutdown(&self) -> MetadataResult<()> {
        Ok(())
    }
}

/// In-process event bus over a tokio broadcast channel.
///
/// Envelopes travel in their wire encoding so every subscriber sees exactly
/// what a remote peer would.
pub struct InMemoryEventStream {
    sender: broadcast::Sender<Bytes>,
    closed: CancellationToken,
}

impl InMemoryEventStream {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl EventStream for InMemoryEventStream {
    async fn publish(&self, envelope: &EventEnvelope) -> MetadataResult<()> {
        if self.closed.is_cancelled() {
            return Err(MetadataError::EventStream("event stream is shut down".to_string()));
        }
        let bytes = envelope.to_bytes()?;
        // No subscribers is not an error; nobody is waiting for the event.
        let receivers = self.sender.send(bytes).unwrap_or(0);
        debug!(
            sender = %envelope.sender,
            sequence = envelope.sequence,
            kind = envelope.event.kind(),
            receivers,
            "published event"
        );
        Ok(())
    }

    fn subscribe(&self) -> EnvelopeStream {
        let mut receiver = self.sender.subscribe();
        let closed = self.closed.clone();
        let stream = async_stream::stream! {
            loop {
                let received = tokio::select! {
                    _ = closed.cancelled() => break,
                    received = receiver.recv() => received,
                };
                match received {
                    Ok(bytes) => match EventEnvelope::from_bytes(&bytes) {
                        Ok(envelope) => yield envelope,
                        Err(e) => warn!(error = %e, "dropping undecodable event"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event subscriber lagged, continuing");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Box::pin(stream)
    }

    async fn shutdown(&self) -> MetadataResult<()> {
        self.closed.cancel();
        Ok(())
    }
}

/// Stamps events from one machine with a monotonically increasing sequence.
pub struct EventPublisher {
    stream: Arc<dyn EventStream>,
    sender: MachineId,
    epoch: u64,
    // Held across publish so envelopes leave in sequence order.
    sequence: Mutex<u64>,
}

impl EventPublisher {
    pub fn new(stream: Arc<dyn EventStream>, sender: MachineId, epoch: u64) -> Self {
        Self {
            stream,
            sender,
            epoch,
            sequence: Mutex::new(0),
        }
    }

    /// Machine this publisher speaks for.
    pub fn sender(&self) -> MachineId {
        self.sender
    }

    /// Publish `event`, returning the envelope that was sent.
    pub async fn publish(&self, event: LocationEvent) -> MetadataResult<EventEnvelope> {
        let mut sequence = self.sequence.lock().await;
        let envelope = EventEnvelope {
            sender: self.sender,
            epoch: self.epoch,
            sequence: *sequence + 1,
            event,
        };
        self.stream.publish(&envelope).await?;
        *sequence += 1;
        Ok(envelope)
    }
}

/// Folds envelopes into a [`ContentLocationDatabase`].
pub struct EventApplier {
    database: Arc<ContentLocationDatabase>,
    high_water: DashMap<MachineId, (u64, u64)>,
    // Earliest position per sender that failed to apply.
    stalled: DashMap<MachineId, (u64, u64)>,
}

impl EventApplier {
    pub fn new(database: Arc<ContentLocationDatabase>) -> Self {
        Self {
            database,
            high_water: DashMap::new(),
            stalled: DashMap::new(),
        }
    }

    /// Apply one envelope. Returns `false` when it was skipped as a replay.
    #[instrument(skip(self, envelope), fields(sender = %envelope.sender, sequence = envelope.sequence))]
    pub async fn apply(&self, envelope: &EventEnvelope) -> MetadataResult<bool> {
        let position = (envelope.epoch, envelope.sequence);
        if let Some(seen) = self.high_water.get(&envelope.sender)
            && position <= *seen
        {
            debug!("skipping replayed event");
            return Ok(false);
        }

        let sender = envelope.sender;
        if let Err(e) = self.fold(sender, &envelope.event).await {
            self.stalled
                .entry(sender)
                .and_modify(|stalled| {
                    if position < *stalled {
                        *stalled = position;
                    }
                })
                .or_insert(position);
            return Err(e);
        }
        self.advance(sender, position);
        Ok(true)
    }

    async fn fold(&self, sender: MachineId, event: &LocationEvent) -> MetadataResult<()> {
        match event {
            LocationEvent::AddLocation { hashes } => {
                for hash in hashes {
                    self.database
                        .add_location(&hash.hash.to_short_hash(), sender, hash.size)
                        .await?;
                }
            }
            LocationEvent::RemoveLocation { hashes } => {
                for hash in hashes {
                    self.database.remove_location(hash, sender).await?;
                }
            }
            LocationEvent::Touch {
                hashes,
                access_time,
            } => {
                for hash in hashes {
                    self.database.touch(hash, *access_time).await?;
                }
            }
            LocationEvent::UpdateMetadataEntry(update) => {
                self.database
                    .apply_metadata(&update.fingerprint, &update.entry)
                    .await?;
            }
        }
        Ok(())
    }

    /// Move the sender's high-water mark to `position`, unless an earlier
    /// envelope from that sender is still unapplied.
    fn advance(&self, sender: MachineId, position: (u64, u64)) {
        let stalled = self.stalled.get(&sender).map(|stalled| *stalled);
        match stalled {
            Some(stalled) if position > stalled => return,
            Some(stalled) if position == stalled => {
                self.stalled.remove(&sender);
            }
            _ => {}
        }

        self.high_water
            .entry(sender)
            .and_modify(|seen| {
                if position > *seen {
                    *seen = position;
                }
            })
            .or_insert(position);
    }

    /// Consume `events` until cancelled or the stream ends.
    ///
    /// Failures are logged and the envelope is dropped; a later replay of the
    /// same envelope is applied because the high-water mark stays below it.
    pub async fn run(self: Arc<Self>, mut events: EnvelopeStream, cancel: CancellationToken) {
        info!("event applier started");
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.next() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            if let Err(e) = self.apply(&envelope).await {
                error!(
                    sender = %envelope.sender,
                    sequence = envelope.sequence,
                    kind = envelope.event.kind(),
                    error = %e,
                    "failed to apply event"
                );
            }
        }
        info!("event applier stopped");
    }
}
