//! Query execution against cached context state.
//!
//! A query leases its context's hot KV state (promoting it first if
//! needed) and runs only the query tokens on top of it. The streaming
//! variant hands the tokens back over a channel of [`GenerationEvent`]s.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{ContextCacheManager, QueryLease};
use crate::engine::{ForwardRequest, SamplingParams, TokenId};
use crate::error::{CoreError, CoreResult};
use crate::pipeline::generate::GenerationEvent;
use crate::registry::descriptor::ModelDescriptor;
use crate::registry::ModelRegistry;

/// A query request.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub context_id: String,
    pub query: String,

    /// Tokens to generate (None = configured default).
    pub max_tokens: Option<usize>,

    /// Model to answer with (None = the active model).
    pub model_id: Option<String>,
}

/// Token accounting for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueryUsage {
    pub context_tokens: usize,
    pub query_tokens: usize,
    pub generated_tokens: usize,
}

/// Result of a query.
#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub context_id: String,
    pub model_id: String,
    pub response: String,

    /// True iff the context was hot when the query arrived.
    pub cache_hit: bool,

    pub usage: QueryUsage,
}

/// A query answered token by token.
#[derive(Debug)]
pub struct QueryStream {
    pub context_id: String,
    pub model_id: String,

    /// True iff the context was hot when the query arrived.
    pub cache_hit: bool,

    pub events: mpsc::Receiver<GenerationEvent>,
}

/// A leased context with the tokenized query, ready to run.
struct Prepared {
    descriptor: Arc<ModelDescriptor>,
    lease: QueryLease,
    tokens: Vec<TokenId>,
    max_tokens: usize,
}

pub struct QueryExecutor {
    registry: Arc<ModelRegistry>,
    cache: Arc<ContextCacheManager>,
    default_max_tokens: usize,
    max_tokens_limit: usize,
}

impl QueryExecutor {
    pub fn new(
        registry: Arc<ModelRegistry>,
        cache: Arc<ContextCacheManager>,
        default_max_tokens: usize,
        max_tokens_limit: usize,
    ) -> Self {
        Self {
            registry,
            cache,
            default_max_tokens,
            max_tokens_limit,
        }
    }

    async fn prepare(&self, request: &QueryRequest) -> CoreResult<Prepared> {
        if request.query.trim().is_empty() {
            return Err(CoreError::InvalidRequest("query must not be empty".into()));
        }

        // Registry before cache.
        let descriptor = self.registry.resolve(request.model_id.as_deref())?;
        let lease = self
            .cache
            .acquire_for_query(&request.context_id, descriptor.model_id())
            .await?;

        let tokens = self
            .registry
            .engine()
            .tokenize(descriptor.weights(), &request.query)?;
        if tokens.is_empty() {
            return Err(CoreError::InvalidRequest("query produced no tokens".into()));
        }
        let max_tokens = request
            .max_tokens
            .unwrap_or(self.default_max_tokens)
            .min(self.max_tokens_limit);

        Ok(Prepared {
            descriptor,
            lease,
            tokens,
            max_tokens,
        })
    }

    /// Answer `request.query` using the cached state of its context.
    ///
    /// Only the query tokens go through the model; the document prefix comes
    /// from the cache, promoted to the hot tier first if necessary.
    pub async fn query(&self, request: QueryRequest) -> CoreResult<QueryResponse> {
        let start = Instant::now();
        let prepared = self.prepare(&request).await?;

        let engine = self.registry.engine();
        let weights = prepared.descriptor.weights();
        let output = engine
            .run_forward(
                weights,
                ForwardRequest {
                    tokens: &prepared.tokens,
                    prior: Some(prepared.lease.kv()),
                    max_new_tokens: prepared.max_tokens,
                    sampling: SamplingParams::default(),
                },
            )
            .await?;
        let response = engine.detokenize(weights, &output.generated)?;

        let usage = QueryUsage {
            context_tokens: prepared.lease.info.token_count,
            query_tokens: prepared.tokens.len(),
            generated_tokens: output.generated.len(),
        };
        let cache_hit = prepared.lease.cache_hit;
        drop(prepared.lease);

        let elapsed = start.elapsed();
        self.cache.record_query_latency(elapsed);
        info!(
            context_id = %request.context_id,
            model_id = prepared.descriptor.model_id(),
            cache_hit,
            query_tokens = usage.query_tokens,
            generated_tokens = usage.generated_tokens,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Query complete"
        );

        Ok(QueryResponse {
            context_id: request.context_id,
            model_id: prepared.descriptor.model_id().to_string(),
            response,
            cache_hit,
            usage,
        })
    }

    /// Answer `request.query`, streaming tokens to the returned receiver.
    ///
    /// Lookup, promotion and tokenization failures are returned directly;
    /// anything after that arrives as [`GenerationEvent::Error`]. The lease
    /// is released as soon as the forward pass is done.
    pub async fn stream(&self, request: QueryRequest) -> CoreResult<QueryStream> {
        let start = Instant::now();
        let prepared = self.prepare(&request).await?;
        let model_id = prepared.descriptor.model_id().to_string();
        let cache_hit = prepared.lease.cache_hit;

        let engine = self.registry.engine().clone();
        let cache = self.cache.clone();
        let context_id = request.context_id;
        let task_context_id = context_id.clone();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let context_id = task_context_id;
            let Prepared {
                descriptor,
                lease,
                tokens,
                max_tokens,
            } = prepared;
            let weights = descriptor.weights();

            let output = engine
                .run_forward(
                    weights,
                    ForwardRequest {
                        tokens: &tokens,
                        prior: Some(lease.kv()),
                        max_new_tokens: max_tokens,
                        sampling: SamplingParams::default(),
                    },
                )
                .await;
            drop(lease);
            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    warn!(context_id = %context_id, error = %e, "Streaming query failed");
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                    return;
                }
            };

            for &token_id in &output.generated {
                let text = match engine.detokenize(weights, &[token_id]) {
                    Ok(text) => text,
                    Err(e) => {
                        let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if tx.send(GenerationEvent::Token { token_id, text }).await.is_err() {
                    debug!(context_id = %context_id, "Client went away");
                    return;
                }
            }

            let elapsed = start.elapsed();
            cache.record_query_latency(elapsed);
            let prompt_tokens = tokens.len();
            let completion_tokens = output.generated.len();
            let _ = tx
                .send(GenerationEvent::Done {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                })
                .await;
            info!(
                context_id = %context_id,
                model_id = descriptor.model_id(),
                cache_hit,
                completion_tokens,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "Streaming query complete"
            );
        });

        Ok(QueryStream {
            context_id,
            model_id,
            cache_hit,
            events: rx,
        })
    }
}
