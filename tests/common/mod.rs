//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use vpid_kv_cache::cache::ContextInfo;
use vpid_kv_cache::config::Config;
use vpid_kv_cache::engine::stub::StubEngine;
use vpid_kv_cache::engine::{ModelSource, ModelType};
use vpid_kv_cache::metrics::Metrics;
use vpid_kv_cache::pipeline::IngestRequest;
use vpid_kv_cache::registry::descriptor::ModelDescriptor;
use vpid_kv_cache::storage::memory::MemoryStorage;
use vpid_kv_cache::VpidService;

/// KV bytes per token with the default engine geometry.
pub const BYTES_PER_TOKEN: usize = 512;

pub struct Harness {
    pub service: Arc<VpidService>,
    pub storage: Arc<MemoryStorage>,
    pub engine: Arc<StubEngine>,
    pub dir: TempDir,
}

/// Defaults with generous tiers and no TTL.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.tiers.hot_capacity_bytes = 16 * 1024 * 1024;
    config.tiers.warm_capacity_bytes = 64 * 1024 * 1024;
    config.eviction.default_ttl_seconds = 0;
    config
}

/// Config whose hot and warm tiers hold `hot` and `warm` contexts of
/// `tokens` tokens each.
pub fn tight_config(tokens: usize, hot: usize, warm: usize) -> Config {
    let mut config = test_config();
    config.tiers.hot_capacity_bytes = tokens * BYTES_PER_TOKEN * hot;
    config.tiers.warm_capacity_bytes = tokens * BYTES_PER_TOKEN * warm;
    config
}

pub fn harness(config: Config) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let engine = Arc::new(StubEngine::new(config.engine.clone()));
    let metrics = Arc::new(Metrics::new().unwrap());
    let service = Arc::new(VpidService::new(
        config,
        engine.clone(),
        storage.clone(),
        metrics,
    ));
    Harness {
        service,
        storage,
        engine,
        dir,
    }
}

/// `n` distinct whitespace-separated words; the stub engine yields one
/// token per word.
pub fn document(n: usize) -> String {
    (0..n)
        .map(|i| format!("w{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Harness {
    /// Write a fake weights file and load it.
    pub async fn load(&self, model_id: &str) -> Arc<ModelDescriptor> {
        let path = self.dir.path().join(format!("{model_id}.gguf"));
        std::fs::write(&path, b"GGUF fake weights").unwrap();
        self.service
            .registry
            .load(
                model_id,
                ModelSource {
                    file_path: path,
                    model_type: ModelType::TextLlm,
                },
            )
            .await
            .unwrap()
    }

    /// Ingest a document of `tokens` words for `model_id`.
    pub async fn ingest(&self, model_id: &str, tokens: usize) -> ContextInfo {
        self.ingest_text(model_id, &document(tokens)).await
    }

    pub async fn ingest_text(&self, model_id: &str, content: &str) -> ContextInfo {
        self.service
            .ingest
            .ingest(IngestRequest {
                content: content.to_string(),
                model_id: model_id.to_string(),
                name: None,
                ttl_seconds: None,
                reuse_existing: false,
            })
            .await
            .unwrap()
            .context
    }
}
