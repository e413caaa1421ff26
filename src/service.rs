//! Service wiring: one place that owns every component.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::sweeper::{spawn_ttl_sweeper, SweeperHandle};
use crate::cache::{CacheSettings, ContextCacheManager};
use crate::config::Config;
use crate::engine::ComputeEngine;
use crate::error::CoreResult;
use crate::metrics::Metrics;
use crate::pipeline::{DirectGenerator, IngestPipeline, QueryExecutor};
use crate::registry::scheduler::SwitchScheduler;
use crate::registry::ModelRegistry;
use crate::storage::codec::BlobCodec;
use crate::storage::StorageBackend;
use crate::transfer::DevicePool;

/// All serving components, shared by the HTTP handlers.
pub struct VpidService {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub registry: Arc<ModelRegistry>,
    pub scheduler: Arc<SwitchScheduler>,
    pub cache: Arc<ContextCacheManager>,
    pub ingest: IngestPipeline,
    pub query: QueryExecutor,
    pub generator: DirectGenerator,
    pub start_time: Instant,
}

impl VpidService {
    pub fn new(
        config: Config,
        engine: Arc<dyn ComputeEngine>,
        storage: Arc<dyn StorageBackend>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let config = Arc::new(config);

        let registry = Arc::new(ModelRegistry::new(engine, config.registry.default_residency));
        let scheduler = Arc::new(SwitchScheduler::new(registry.clone(), metrics.clone()));

        let device = DevicePool::new(config.tiers.device_memory());
        let codec = BlobCodec::new(config.storage.zstd_compression, config.storage.zstd_level);
        let cache = ContextCacheManager::new(
            CacheSettings::from_config(&config),
            device,
            storage,
            codec,
            metrics.clone(),
        );

        let ingest = IngestPipeline::new(
            registry.clone(),
            cache.clone(),
            metrics.clone(),
            config.eviction.default_ttl_seconds,
        );
        let query = QueryExecutor::new(
            registry.clone(),
            cache.clone(),
            config.query.default_max_tokens,
            config.query.max_tokens_limit,
        );
        let generator = DirectGenerator::new(
            scheduler.clone(),
            config.query.default_max_tokens,
            config.query.max_tokens_limit,
        );

        Self {
            config,
            metrics,
            registry,
            scheduler,
            cache,
            ingest,
            query,
            generator,
            start_time: Instant::now(),
        }
    }

    /// Re-register durable contexts left by a previous run, if configured.
    pub async fn restore(&self) -> CoreResult<usize> {
        if !self.config.storage.restore_on_startup {
            return Ok(0);
        }
        self.cache.restore_from_storage().await
    }

    /// Start the background TTL sweeper.
    pub fn spawn_sweeper(&self) -> SweeperHandle {
        let interval = Duration::from_secs(self.config.eviction.sweep_interval_secs.max(1));
        spawn_ttl_sweeper(self.cache.clone(), interval)
    }

    /// Wait for every pending durable write. Returns how many were pending.
    pub async fn shutdown(&self) -> usize {
        self.cache.flush().await
    }
}
