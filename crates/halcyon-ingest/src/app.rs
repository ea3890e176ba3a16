//! Wiring of the collection engine from [`Settings`]

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::client::HalcyonClient;
use crate::collector::Collector;
use crate::config::Settings;
use crate::emitter::RecordEmitter;
use crate::error::Result;
use crate::health::HealthReporter;
use crate::object_types::ObjectTypeRegistry;
use crate::scheduler::Scheduler;
use crate::sink::{self, RecordSink};
use std::sync::Arc;

/// Fully assembled collector: client, stores, sink, health and scheduler.
pub struct App {
    pub settings: Settings,
    pub registry: ObjectTypeRegistry,
    pub client: Arc<HalcyonClient>,
    pub health: Arc<HealthReporter>,
    pub scheduler: Scheduler,
}

impl App {
    /// Build with the sink and checkpoint store named in `settings`.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let sink = sink::from_settings(&settings.output)?;
        let checkpoints: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::new(&settings.collection.state_dir));
        Self::with_parts(settings, sink, checkpoints)
    }

    /// Build around an explicit sink and checkpoint store.
    pub fn with_parts(
        settings: Settings,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Result<Self> {
        let registry = ObjectTypeRegistry::from_settings(&settings)?;
        let client = Arc::new(HalcyonClient::new(&settings.api, &settings.collection)?);
        let emitter = RecordEmitter::new(sink, settings.output.index.clone());

        let mut health =
            HealthReporter::new().with_snapshot_path(settings.collection.health_snapshot_path());
        if settings.output.collector_events {
            health = health.with_emitter(emitter.clone());
        }
        let health = Arc::new(health);

        let collector = Arc::new(Collector::new(
            Arc::clone(&client),
            checkpoints,
            emitter,
            settings.collection.run_timeout(),
            settings.collection.recent_id_capacity,
        ));

        let scheduler = Scheduler::new(
            registry.clone(),
            collector,
            Arc::clone(&health),
            settings.collection.max_concurrent_runs,
        );

        Ok(Self {
            settings,
            registry,
            client,
            health,
            scheduler,
        })
    }
}
