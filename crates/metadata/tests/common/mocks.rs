use async_trait::async_trait;
use quarry_core::{
    ContentHash, ContentHashWithSizeAndLocations, MachineId, MachineLocation, MemoryClock,
};
use quarry_metadata::{
    ContentLocationDatabase, EnvelopeStream, EventEnvelope, EventPublisher, EventStream,
    Fingerprint, GlobalLocationStore, InMemoryEventStream, LocationSource, MetadataEntry,
    MetadataError, MetadataResult,
};
use quarry_storage::MemoryKeyValueStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Scriptable location source that counts calls and can be told to fail.
pub struct MockLocationSource {
    name: &'static str,
    locations: Mutex<HashMap<ContentHash, Vec<MachineLocation>>>,
    metadata: Mutex<HashMap<Fingerprint, MetadataEntry>>,
    pub fail_lookups: AtomicBool,
    pub fail_startup: AtomicBool,
    pub fail_shutdown: AtomicBool,
    pub lookups: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl MockLocationSource {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            locations: Mutex::new(HashMap::new()),
            metadata: Mutex::new(HashMap::new()),
            fail_lookups: AtomicBool::new(false),
            fail_startup: AtomicBool::new(false),
            fail_shutdown: AtomicBool::new(false),
            lookups: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        })
    }

    pub fn set_locations(&self, hash: ContentHash, locations: &[&str]) {
        self.locations.lock().unwrap().insert(
            hash,
            locations.iter().map(|l| MachineLocation::new(*l)).collect(),
        );
    }

    pub fn set_metadata(&self, fingerprint: Fingerprint, entry: MetadataEntry) {
        self.metadata.lock().unwrap().insert(fingerprint, entry);
    }

    fn failure(&self, what: &str) -> MetadataError {
        MetadataError::EventStream(format!("{} {what} unavailable", self.name))
    }
}

#[async_trait]
impl LocationSource for MockLocationSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn get_content_locations(
        &self,
        hash: &ContentHash,
    ) -> MetadataResult<ContentHashWithSizeAndLocations> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(self.failure("lookup"));
        }
        let locations = self
            .locations
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or_default();
        Ok(ContentHashWithSizeAndLocations::new(*hash, Some(1), locations))
    }

    async fn get_metadata_entry(
        &self,
        fingerprint: &Fingerprint,
    ) -> MetadataResult<Option<MetadataEntry>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(self.failure("lookup"));
        }
        Ok(self.metadata.lock().unwrap().get(fingerprint).cloned())
    }

    async fn startup(&self) -> MetadataResult<()> {
        if self.fail_startup.load(Ordering::SeqCst) {
            return Err(self.failure("startup"));
        }
        Ok(())
    }

    async fn shutdown(&self) -> MetadataResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.fail_shutdown.load(Ordering::SeqCst) {
            return Err(self.failure("shutdown"));
        }
        Ok(())
    }
}

/// In-memory event stream that rejects its first `failures` publications.
pub struct FlakyEventStream {
    inner: InMemoryEventStream,
    failures_left: AtomicUsize,
    pub rejected: AtomicUsize,
}

impl FlakyEventStream {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryEventStream::new(64),
            failures_left: AtomicUsize::new(failures),
            rejected: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl EventStream for FlakyEventStream {
    async fn publish(&self, envelope: &EventEnvelope) -> MetadataResult<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(MetadataError::EventStream("bus unavailable".to_string()));
        }
        self.inner.publish(envelope).await
    }

    fn subscribe(&self) -> EnvelopeStream {
        self.inner.subscribe()
    }
}

/// A location store over two mock tiers, publishing to an in-memory stream.
pub fn location_store(
    local: Arc<MockLocationSource>,
    shared: Arc<MockLocationSource>,
) -> (GlobalLocationStore, Arc<dyn EventStream>) {
    let stream: Arc<dyn EventStream> = Arc::new(InMemoryEventStream::new(64));
    (
        location_store_with_stream(local, shared, stream.clone()),
        stream,
    )
}

/// A location store over two mock tiers, publishing to `stream`.
pub fn location_store_with_stream(
    local: Arc<MockLocationSource>,
    shared: Arc<MockLocationSource>,
    stream: Arc<dyn EventStream>,
) -> GlobalLocationStore {
    let database = Arc::new(ContentLocationDatabase::new(
        Arc::new(MemoryKeyValueStore::new()),
        Arc::new(MemoryClock::default()),
        "local",
    ));
    let publisher = Arc::new(EventPublisher::new(stream, MachineId::new(1), 1));
    GlobalLocationStore::new(database, local, shared, publisher)
}
