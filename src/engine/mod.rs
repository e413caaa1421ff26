//! Compute engine capability interface.
//!
//! The transformer forward pass, tokenization and weight materialization are
//! external collaborators. Everything in the crate talks to them through
//! [`ComputeEngine`] so they can be swapped or mocked without touching the
//! scheduler or the cache.
//!
//! - [`kv`]: KV tensor payloads
//! - [`stub`]: deterministic reference engine used by the binary and tests

pub mod kv;
pub mod stub;

use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::kv::KvTensors;
use crate::registry::descriptor::Residency;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to load weights: {0}")]
    LoadFailed(String),

    #[error("Tokenization failed: {0}")]
    TokenizeFailed(String),

    #[error("Forward pass failed: {0}")]
    ForwardFailed(String),

    #[error("KV shape mismatch: expected {expected} bytes, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },
}

/// Token ID type.
pub type TokenId = u32;

/// Model architecture family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    TextLlm,
    MultimodalVl,
    ImageDiffusion,
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "llm" | "text" | "text_llm" => Ok(ModelType::TextLlm),
            "vision" | "vl" | "multimodal" | "multimodal_vl" => Ok(ModelType::MultimodalVl),
            "diffusion" | "image" | "image_diffusion" => Ok(ModelType::ImageDiffusion),
            other => Err(format!("unknown model type '{other}'")),
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelType::TextLlm => write!(f, "text_llm"),
            ModelType::MultimodalVl => write!(f, "multimodal_vl"),
            ModelType::ImageDiffusion => write!(f, "image_diffusion"),
        }
    }
}

/// Where a model's weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    pub file_path: PathBuf,
    #[serde(default)]
    pub model_type: ModelType,
}

/// Opaque handle on materialized model weights.
///
/// Owned exclusively by one model descriptor. Dropping the handle releases
/// the weights through the engine-provided guard.
pub struct WeightsHandle {
    id: u64,
    size_bytes: u64,
    fingerprint: u64,
    residency: Residency,
    _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl WeightsHandle {
    pub fn new(
        id: u64,
        size_bytes: u64,
        fingerprint: u64,
        residency: Residency,
        guard: Option<Box<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            id,
            size_bytes,
            fingerprint,
            residency,
            _guard: guard,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Engine-defined identity of the weights.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }
}

impl fmt::Debug for WeightsHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightsHandle")
            .field("id", &self.id)
            .field("size_bytes", &self.size_bytes)
            .field("residency", &self.residency)
            .finish()
    }
}

/// Sampling knobs passed through to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// One forward invocation: new tokens, optionally seeded with prior KV state.
#[derive(Debug, Clone, Copy)]
pub struct ForwardRequest<'a> {
    pub tokens: &'a [TokenId],
    pub prior: Option<&'a KvTensors>,
    pub max_new_tokens: usize,
    pub sampling: SamplingParams,
}

/// Result of a forward invocation.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// Tokens sampled after the input.
    pub generated: Vec<TokenId>,

    /// KV state covering prior + input tokens.
    pub kv: KvTensors,
}

/// The compute engine capability.
#[async_trait]
pub trait ComputeEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Materialize weights for a model.
    async fn load_weights(
        &self,
        model_id: &str,
        source: &ModelSource,
        residency: Residency,
    ) -> Result<WeightsHandle, EngineError>;

    fn tokenize(&self, weights: &WeightsHandle, text: &str) -> Result<Vec<TokenId>, EngineError>;

    fn detokenize(&self, weights: &WeightsHandle, tokens: &[TokenId])
        -> Result<String, EngineError>;

    /// Run the given tokens through the model. The prior state is read-only.
    async fn run_forward(
        &self,
        weights: &WeightsHandle,
        request: ForwardRequest<'_>,
    ) -> Result<ForwardOutput, EngineError>;
}
