use super::mocks::{CountingSharedStore, ScriptedFileCopier};
use futures::StreamExt;
use quarry_core::config::BlobConfig;
use quarry_core::{ContentHash, HashType, MachineLocation, MemoryClock};
use quarry_distributed::{
    BlobAdapter, CopierSettings, DistributedContentCopier, DistributedContentStore,
    FilesystemFileCopier, FilesystemPathTransformer, HandlePathTransformer, LocalContentStore,
    MachineReputationTracker, PathTransformer,
};
use quarry_metadata::{
    ClusterState, ContentLocationDatabase, DatabaseLocationSource, EnvelopeStream, EventApplier,
    EventPublisher, EventStream, EvictionRanker, GLOBAL_NAMESPACE, GlobalLocationStore,
    InMemoryEventStream, LOCAL_NAMESPACE,
};
use quarry_storage::{KeyValueStore, MemoryKeyValueStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub fn hash_of(data: &[u8]) -> ContentHash {
    ContentHash::compute(HashType::Sha256, data)
}

/// A copier over scripted handles, writing into a fresh content store.
pub async fn copier(
    file_copier: Arc<ScriptedFileCopier>,
    retry_intervals: Vec<Duration>,
    trusted_hash_size_boundary: u64,
) -> (TempDir, Arc<LocalContentStore>, DistributedContentCopier<String>) {
    let dir = TempDir::new().unwrap();
    let content = Arc::new(LocalContentStore::open(dir.path()).await.unwrap());
    let reputation = Arc::new(MachineReputationTracker::new(
        Arc::new(MemoryClock::default()),
        Duration::from_secs(600),
    ));
    let settings = CopierSettings {
        retry_intervals,
        trusted_hash_size_boundary,
        ..CopierSettings::default()
    };
    let copier = DistributedContentCopier::new(
        Arc::new(HandlePathTransformer),
        file_copier,
        content.clone(),
        reputation,
        settings,
    );
    (dir, content, copier)
}

/// Machines sharing a registry, an event bus and a blob store.
pub struct TestCluster {
    pub clock: Arc<MemoryClock>,
    pub cluster: Arc<ClusterState>,
    pub bus: Arc<dyn EventStream>,
    pub shared: Arc<CountingSharedStore>,
}

/// One machine with its own cache root and databases.
pub struct Machine {
    pub root: TempDir,
    pub location: MachineLocation,
    pub store: DistributedContentStore<PathBuf>,
    pub applier: Arc<EventApplier>,
    pub events: EnvelopeStream,
}

impl TestCluster {
    pub fn new() -> Self {
        let clock = Arc::new(MemoryClock::default());
        let registry: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        Self {
            shared: CountingSharedStore::new(clock.clone()),
            clock,
            cluster: Arc::new(ClusterState::new(registry)),
            bus: Arc::new(InMemoryEventStream::new(256)),
        }
    }

    pub async fn machine(&self, with_blobs: bool) -> Machine {
        let root = TempDir::new().unwrap();
        let location = FilesystemPathTransformer.local_machine_location(&root.path().to_path_buf());
        let id = self.cluster.register(&location).await.unwrap();
        let events = self.bus.subscribe();

        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let local_db = Arc::new(ContentLocationDatabase::new(
            kv.clone(),
            self.clock.clone(),
            LOCAL_NAMESPACE,
        ));
        let global_db = Arc::new(ContentLocationDatabase::new(
            kv,
            self.clock.clone(),
            GLOBAL_NAMESPACE,
        ));
        let location_store = Arc::new(GlobalLocationStore::new(
            local_db.clone(),
            Arc::new(DatabaseLocationSource::new("local", local_db, self.cluster.clone())),
            Arc::new(DatabaseLocationSource::new(
                "shared",
                global_db.clone(),
                self.cluster.clone(),
            )),
            Arc::new(EventPublisher::new(self.bus.clone(), id, 1)),
        ));

        let content = Arc::new(LocalContentStore::open(root.path()).await.unwrap());
        let reputation = Arc::new(MachineReputationTracker::new(
            self.clock.clone(),
            Duration::from_secs(600),
        ));
        let copier = Arc::new(DistributedContentCopier::new(
            Arc::new(FilesystemPathTransformer),
            Arc::new(FilesystemFileCopier),
            content.clone(),
            reputation,
            CopierSettings {
                retry_intervals: vec![Duration::ZERO; 2],
                ..CopierSettings::default()
            },
        ));

        let mut store = DistributedContentStore::new(
            location.clone(),
            location_store,
            content,
            copier,
            EvictionRanker::default(),
        )
        .with_global_database(global_db.clone());
        if with_blobs {
            store = store.with_blob_adapter(Arc::new(BlobAdapter::new(
                self.shared.clone(),
                self.clock.clone(),
                &BlobConfig::default(),
            )));
        }

        Machine {
            root,
            location,
            store,
            applier: Arc::new(EventApplier::new(global_db)),
            events,
        }
    }
}

impl Machine {
    /// Fold every event delivered so far into this machine's global view.
    pub async fn sync(&mut self) {
        while let Ok(Some(envelope)) =
            tokio::time::timeout(Duration::from_millis(50), self.events.next()).await
        {
            self.applier.apply(&envelope).await.unwrap();
        }
    }

    /// Write a file outside the cache and return its path.
    pub async fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let dir = self.root.path().join("work");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join(name);
        tokio::fs::write(&path, data).await.unwrap();
        path
    }
}
