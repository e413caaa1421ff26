//! Direct completions without a cached context.
//!
//! Every request switches to its model first, then runs the prompt through
//! the engine with no prior state. The streaming variant hands back a channel
//! of [`GenerationEvent`]s fed by a spawned task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{ForwardRequest, SamplingParams, TokenId};
use crate::error::{CoreError, CoreResult};
use crate::registry::descriptor::ModelDescriptor;
use crate::registry::scheduler::SwitchScheduler;

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Unique request ID.
    pub request_id: String,

    /// Model to switch to.
    pub model: String,

    pub prompt: String,

    /// Tokens to generate (None = configured default).
    pub max_tokens: Option<usize>,

    pub sampling: SamplingParams,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            model: model.into(),
            prompt: prompt.into(),
            max_tokens: None,
            sampling: SamplingParams::default(),
        }
    }
}

/// A finished completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub model_id: String,
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

/// A generated token event.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A new token was generated.
    Token { token_id: TokenId, text: String },

    /// Generation is complete.
    Done {
        prompt_tokens: usize,
        completion_tokens: usize,
        total_tokens: usize,
    },

    /// An error occurred during generation.
    Error(String),
}

pub struct DirectGenerator {
    scheduler: Arc<SwitchScheduler>,
    default_max_tokens: usize,
    max_tokens_limit: usize,
}

/// A switched-to model with the tokenized prompt, ready to run.
struct Prepared {
    descriptor: Arc<ModelDescriptor>,
    tokens: Vec<TokenId>,
    max_tokens: usize,
}

impl DirectGenerator {
    pub fn new(
        scheduler: Arc<SwitchScheduler>,
        default_max_tokens: usize,
        max_tokens_limit: usize,
    ) -> Self {
        Self {
            scheduler,
            default_max_tokens,
            max_tokens_limit,
        }
    }

    fn prepare(&self, request: &CompletionRequest) -> CoreResult<Prepared> {
        if request.prompt.trim().is_empty() {
            return Err(CoreError::InvalidRequest("prompt must not be empty".into()));
        }
        let outcome = self.scheduler.switch(&request.model)?;
        let descriptor = outcome.descriptor;
        let tokens = self
            .scheduler
            .registry()
            .engine()
            .tokenize(descriptor.weights(), &request.prompt)?;
        if tokens.is_empty() {
            return Err(CoreError::InvalidRequest("prompt produced no tokens".into()));
        }
        let max_tokens = request
            .max_tokens
            .unwrap_or(self.default_max_tokens)
            .min(self.max_tokens_limit);

        info!(
            request_id = %request.request_id,
            model_id = descriptor.model_id(),
            prompt_tokens = tokens.len(),
            max_tokens,
            "Starting generation"
        );
        Ok(Prepared {
            descriptor,
            tokens,
            max_tokens,
        })
    }

    /// Run a completion to the end.
    pub async fn complete(&self, request: CompletionRequest) -> CoreResult<Completion> {
        let prepared = self.prepare(&request)?;
        let engine = self.scheduler.registry().engine();
        let weights = prepared.descriptor.weights();

        let output = engine
            .run_forward(
                weights,
                ForwardRequest {
                    tokens: &prepared.tokens,
                    prior: None,
                    max_new_tokens: prepared.max_tokens,
                    sampling: request.sampling,
                },
            )
            .await?;
        let text = engine.detokenize(weights, &output.generated)?;

        Ok(Completion {
            model_id: prepared.descriptor.model_id().to_string(),
            text,
            prompt_tokens: prepared.tokens.len(),
            completion_tokens: output.generated.len(),
        })
    }

    /// Run a completion, streaming tokens to the returned receiver.
    ///
    /// Switch and tokenization failures are returned directly; anything
    /// after that arrives as [`GenerationEvent::Error`].
    pub fn stream(&self, request: CompletionRequest) -> CoreResult<mpsc::Receiver<GenerationEvent>> {
        let prepared = self.prepare(&request)?;
        let engine = self.scheduler.registry().engine().clone();
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let weights = prepared.descriptor.weights();
            let output = engine
                .run_forward(
                    weights,
                    ForwardRequest {
                        tokens: &prepared.tokens,
                        prior: None,
                        max_new_tokens: prepared.max_tokens,
                        sampling: request.sampling,
                    },
                )
                .await;
            let output = match output {
                Ok(output) => output,
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "Generation failed");
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
                    debug!(request_id = %request.request_id, "Client went away");
                    return;
                }
            }

            let prompt_tokens = prepared.tokens.len();
            let completion_tokens = output.generated.len();
            let _ = tx
                .send(GenerationEvent::Done {
                    prompt_tokens,
                    completion_tokens,
                    total_tokens: prompt_tokens + completion_tokens,
                })
                .await;
            info!(
                request_id = %request.request_id,
                completion_tokens,
                "Generation complete"
            );
        });

        Ok(rx)
    }
}
