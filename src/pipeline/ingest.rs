//! Document ingestion.
//!
//! Prefill runs the full document through the model once with no prior
//! state. The resulting KV tensors are admitted to the hot tier and a
//! durable copy is written in the background.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::info;

use crate::cache::entry::new_context_id;
use crate::cache::{ContextCacheManager, ContextInfo};
use crate::engine::{ForwardRequest, SamplingParams};
use crate::error::{CoreError, CoreResult};
use crate::metrics::Metrics;
use crate::registry::ModelRegistry;
use crate::storage::codec::ContextRecord;

/// An ingest request.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Document text.
    pub content: String,

    /// Model the KV state is computed with.
    pub model_id: String,

    /// Display name (defaults to the context ID).
    pub name: Option<String>,

    /// Time-to-live in seconds (None = configured default, 0 = never expire).
    pub ttl_seconds: Option<u64>,

    /// Return an existing context for identical content instead of recomputing.
    pub reuse_existing: bool,
}

/// Result of an ingest.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub context: ContextInfo,

    /// True when an existing context was returned.
    pub reused: bool,
}

pub struct IngestPipeline {
    registry: Arc<ModelRegistry>,
    cache: Arc<ContextCacheManager>,
    metrics: Arc<Metrics>,
    default_ttl_seconds: u64,
}

impl IngestPipeline {
    pub fn new(
        registry: Arc<ModelRegistry>,
        cache: Arc<ContextCacheManager>,
        metrics: Arc<Metrics>,
        default_ttl_seconds: u64,
    ) -> Self {
        Self {
            registry,
            cache,
            metrics,
            default_ttl_seconds,
        }
    }

    /// Prefill `request.content` and cache the result.
    pub async fn ingest(&self, request: IngestRequest) -> CoreResult<IngestOutcome> {
        if request.content.trim().is_empty() {
            return Err(CoreError::InvalidRequest("content must not be empty".into()));
        }
        let descriptor = self.registry.get(&request.model_id)?;
        let content_hash = blake3::hash(request.content.as_bytes()).to_hex().to_string();

        if request.reuse_existing {
            if let Some(existing) = self.cache.find_by_hash(&request.model_id, &content_hash) {
                info!(
                    context_id = %existing.context_id,
                    model_id = %request.model_id,
                    "Reusing existing context"
                );
                return Ok(IngestOutcome {
                    context: existing,
                    reused: true,
                });
            }
        }

        let start = Instant::now();
        let engine = self.registry.engine();
        let weights = descriptor.weights();
        let tokens = engine.tokenize(weights, &request.content)?;
        if tokens.is_empty() {
            return Err(CoreError::InvalidRequest("content produced no tokens".into()));
        }

        let output = engine
            .run_forward(
                weights,
                ForwardRequest {
                    tokens: &tokens,
                    prior: None,
                    max_new_tokens: 0,
                    sampling: SamplingParams::default(),
                },
            )
            .await?;

        let context_id = new_context_id();
        let record = ContextRecord {
            name: request.name.unwrap_or_else(|| context_id.clone()),
            context_id,
            model_id: request.model_id,
            token_count: tokens.len(),
            ttl_seconds: request.ttl_seconds.unwrap_or(self.default_ttl_seconds),
            created_at: Utc::now(),
            content_hash,
        };
        let context = self.cache.admit(record, output.kv).await?;
        self.metrics.ingests.inc();

        info!(
            context_id = %context.context_id,
            model_id = %context.model_id,
            tokens = context.token_count,
            size_bytes = context.size_bytes,
            prefill_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Context ingested"
        );

        Ok(IngestOutcome {
            context,
            reused: false,
        })
    }
}
