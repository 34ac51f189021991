//! Daemon state: every component of one node, wired from configuration.

use crate::error::{ServerError, ServerResult};
use crate::metrics::{MACHINE_REGISTRATIONS, spawn_textfile_exporter};
use crate::reclaim::spawn_reclaim_loop;
use quarry_core::config::AppConfig;
use quarry_core::{Clock, MachineId, MachineLocation};
use quarry_distributed::{
    BlobAdapter, CopierSettings, DistributedContentCopier, DistributedContentStore,
    FilesystemFileCopier, FilesystemPathTransformer, LocalContentStore, MachineReputationTracker,
    PathTransformer,
};
use quarry_metadata::{
    ClusterState, ContentLocationDatabase, DatabaseLocationSource, EventApplier, EventPublisher,
    EventStream, EvictionPolicy, EvictionRanker, GLOBAL_NAMESPACE, GlobalLocationStore,
    InMemoryEventStream, LOCAL_NAMESPACE,
};
use quarry_storage::{KeyValueStore, MemorySharedStore, SharedStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Services shared by every machine of a cluster.
#[derive(Clone)]
pub struct ClusterServices {
    /// Store holding the machine registry.
    pub registry: Arc<dyn KeyValueStore>,
    /// Bus carrying location events between machines.
    pub events: Arc<dyn EventStream>,
    /// Replicated store for inline blobs and capacity counters.
    pub shared: Arc<dyn SharedStore>,
}

impl ClusterServices {
    /// Services for a node that is its own cluster.
    pub fn in_process(
        registry: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        Self {
            registry,
            events: Arc::new(InMemoryEventStream::new(
                config.location_store.event_channel_capacity,
            )),
            shared: Arc::new(MemorySharedStore::new(clock)),
        }
    }
}

/// One node of the cache.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub clock: Arc<dyn Clock>,
    pub machine_id: MachineId,
    pub location: MachineLocation,
    pub location_store: Arc<GlobalLocationStore>,
    pub global_database: Arc<ContentLocationDatabase>,
    pub events: Arc<dyn EventStream>,
    pub store: Arc<DistributedContentStore<PathBuf>>,
}

impl AppState {
    /// Wire a node over `store` (this machine's location databases) and the
    /// cluster's shared services.
    pub async fn build(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
        services: ClusterServices,
    ) -> ServerResult<Self> {
        config.validate().map_err(ServerError::Config)?;

        let cache_root = std::path::absolute(&config.machine.cache_root)?;
        let content = Arc::new(LocalContentStore::open(&cache_root).await?);
        let location = FilesystemPathTransformer.local_machine_location(&cache_root);

        let cluster = Arc::new(ClusterState::new(services.registry.clone()));
        let machine_id = cluster.register(&location).await?;
        MACHINE_REGISTRATIONS.inc();

        let page_size = config.location_store.scan_page_size;
        let local_database = Arc::new(
            ContentLocationDatabase::new(store.clone(), clock.clone(), LOCAL_NAMESPACE)
                .with_page_size(page_size),
        );
        let global_database = Arc::new(
            ContentLocationDatabase::new(store, clock.clone(), GLOBAL_NAMESPACE)
                .with_page_size(page_size),
        );

        // A restart must publish under a newer epoch than any earlier run.
        let epoch = u64::try_from(clock.utc_now().unix_timestamp_nanos() / 1_000_000).unwrap_or(0);
        let publisher = Arc::new(EventPublisher::new(
            services.events.clone(),
            machine_id,
            epoch,
        ));
        let location_store = Arc::new(GlobalLocationStore::new(
            local_database.clone(),
            Arc::new(DatabaseLocationSource::new(
                "local",
                local_database,
                cluster.clone(),
            )),
            Arc::new(DatabaseLocationSource::new(
                "shared",
                global_database.clone(),
                cluster,
            )),
            publisher,
        ));

        let reputation = Arc::new(MachineReputationTracker::new(
            clock.clone(),
            config.reputation.expiry(),
        ));
        let copier = Arc::new(DistributedContentCopier::new(
            Arc::new(FilesystemPathTransformer),
            Arc::new(FilesystemFileCopier),
            content.clone(),
            reputation,
            CopierSettings::from(&config.copier),
        ));

        let mut distributed = DistributedContentStore::new(
            location.clone(),
            location_store.clone(),
            content,
            copier,
            EvictionRanker::new(EvictionPolicy::from(&config.eviction)),
        )
        .with_global_database(global_database.clone())
        .with_prefer_shared(config.location_store.prefer_shared)
        .with_pin_config(config.pin.clone());
        if config.blob.enabled {
            distributed = distributed.with_blob_adapter(Arc::new(BlobAdapter::new(
                services.shared.clone(),
                clock.clone(),
                &config.blob,
            )));
        }

        info!(machine_id = %machine_id, location = %location, "node initialized");
        Ok(Self {
            config: Arc::new(config),
            clock,
            machine_id,
            location,
            location_store,
            global_database,
            events: services.events,
            store: Arc::new(distributed),
        })
    }

    /// Start the location store and the background tasks: the event applier,
    /// the reclaim loop and, when configured, the metrics exporter.
    pub async fn start(&self, cancel: &CancellationToken) -> ServerResult<Vec<JoinHandle<()>>> {
        self.location_store.startup().await?;

        let applier = Arc::new(EventApplier::new(self.global_database.clone()));
        let mut tasks = vec![tokio::spawn(
            applier.run(self.events.subscribe(), cancel.clone()),
        )];

        tasks.push(spawn_reclaim_loop(
            self.store.clone(),
            self.config.eviction.max_size_bytes,
            self.config.eviction.reclaim_interval(),
            cancel.clone(),
        ));

        if let Some(path) = &self.config.metrics.textfile_path {
            tasks.push(spawn_textfile_exporter(
                path.clone(),
                Duration::from_secs(self.config.metrics.interval_secs.max(1)),
                cancel.clone(),
            ));
        }

        info!(tasks = tasks.len(), "background tasks started");
        Ok(tasks)
    }

    /// Stop the location store and the event bus.
    pub async fn shutdown(&self) -> ServerResult<()> {
        let stores = self.location_store.shutdown().await;
        let events = self.events.shutdown().await;
        stores?;
        events?;
        Ok(())
    }
}
