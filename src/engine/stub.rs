//! Deterministic reference engine.
//!
//! Stands in for a real llama.cpp-style backend. Output depends only on the
//! weights fingerprint, the prior KV bytes and the input tokens, so a cached
//! payload that round-trips through storage yields exactly the same answer
//! as one that never left the device.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use half::f16;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::engine::kv::{KvShape, KvTensors};
use crate::engine::{
    ComputeEngine, EngineError, ForwardOutput, ForwardRequest, ModelSource, TokenId,
    WeightsHandle,
};
use crate::registry::descriptor::Residency;

const WORDS: &[&str] = &[
    "the", "policy", "allows", "employees", "to", "take", "days", "of", "paid", "leave",
    "each", "year", "requests", "must", "be", "approved", "by", "a", "manager", "in",
    "advance", "and", "unused", "time", "carries", "over", "up", "limit", "per", "team",
    "document", "section",
];

/// Decrements the live-weights counter when the owning handle drops.
struct LiveWeights(Arc<AtomicUsize>);

impl Drop for LiveWeights {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The stub engine.
pub struct StubEngine {
    config: EngineConfig,
    next_handle: AtomicU64,
    live: Arc<AtomicUsize>,
}

impl StubEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            next_handle: AtomicU64::new(1),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of weights handles currently alive.
    pub fn live_weights(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// KV geometry this engine produces, for `seq_len` tokens.
    pub fn kv_shape(&self, seq_len: usize) -> KvShape {
        KvShape {
            n_layers: self.config.n_layers,
            n_kv_heads: self.config.n_kv_heads,
            head_dim: self.config.head_dim,
            seq_len,
        }
    }

    fn token_kv(&self, fingerprint: u64, tokens: &[TokenId], start_pos: usize) -> Vec<f16> {
        let per_token = self.kv_shape(1).elements_per_token();
        let mut values = Vec::with_capacity(per_token * tokens.len());
        for (i, &token) in tokens.iter().enumerate() {
            let pos = (start_pos + i) as u64;
            let base = splitmix64(fingerprint ^ ((token as u64) << 32) ^ pos);
            for j in 0..per_token as u64 {
                let bits = splitmix64(base.wrapping_add(j));
                let v = ((bits % 2001) as f32 - 1000.0) / 1000.0;
                values.push(f16::from_f32(v));
            }
        }
        values
    }
}

#[async_trait]
impl ComputeEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    async fn load_weights(
        &self,
        model_id: &str,
        source: &ModelSource,
        residency: Residency,
    ) -> Result<WeightsHandle, EngineError> {
        let size_bytes = if self.config.require_model_files {
            let meta = tokio::fs::metadata(&source.file_path).await.map_err(|e| {
                EngineError::LoadFailed(format!("{}: {e}", source.file_path.display()))
            })?;
            if !meta.is_file() {
                return Err(EngineError::LoadFailed(format!(
                    "{} is not a file",
                    source.file_path.display()
                )));
            }
            meta.len()
        } else {
            0
        };

        let mut hasher = blake3::Hasher::new();
        hasher.update(model_id.as_bytes());
        hasher.update(source.file_path.to_string_lossy().as_bytes());
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let fingerprint = u64::from_le_bytes(prefix);

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::SeqCst);

        info!(
            model_id,
            path = %source.file_path.display(),
            model_type = %source.model_type,
            size_bytes,
            residency = ?residency,
            "Materialized weights"
        );

        Ok(WeightsHandle::new(
            id,
            size_bytes,
            fingerprint,
            residency,
            Some(Box::new(LiveWeights(self.live.clone()))),
        ))
    }

    fn tokenize(&self, _weights: &WeightsHandle, text: &str) -> Result<Vec<TokenId>, EngineError> {
        let vocab = self.config.vocab_size.max(1) as u64;
        Ok(text
            .split_whitespace()
            .map(|word| (fnv1a(word.as_bytes()) % vocab) as TokenId)
            .collect())
    }

    fn detokenize(
        &self,
        _weights: &WeightsHandle,
        tokens: &[TokenId],
    ) -> Result<String, EngineError> {
        Ok(tokens
            .iter()
            .map(|&t| WORDS[t as usize % WORDS.len()])
            .collect::<Vec<_>>()
            .join(" "))
    }

    async fn run_forward(
        &self,
        weights: &WeightsHandle,
        request: ForwardRequest<'_>,
    ) -> Result<ForwardOutput, EngineError> {
        let prior_len = request.prior.map(|kv| kv.seq_len()).unwrap_or(0);
        if let Some(prior) = request.prior {
            if !prior.shape().same_geometry(&self.kv_shape(0)) {
                return Err(EngineError::ShapeMismatch {
                    expected: self.kv_shape(1).bytes_per_token(),
                    actual: prior.shape().bytes_per_token(),
                });
            }
        }

        let values = self.token_kv(weights.fingerprint(), request.tokens, prior_len);
        let fresh = KvTensors::from_f16(self.kv_shape(request.tokens.len()), &values)?;
        let kv = match request.prior {
            Some(prior) => prior.extend(&fresh)?,
            None => fresh,
        };

        // Sampling state: everything the model has attended to.
        let mut hasher = blake3::Hasher::new();
        hasher.update(&weights.fingerprint().to_le_bytes());
        if let Some(prior) = request.prior {
            hasher.update(prior.digest().as_bytes());
        }
        for token in request.tokens {
            hasher.update(&token.to_le_bytes());
        }
        let digest = hasher.finalize();
        let mut state_bytes = [0u8; 8];
        state_bytes.copy_from_slice(&digest.as_bytes()[..8]);
        let mut state = u64::from_le_bytes(state_bytes);

        let vocab = self.config.vocab_size.max(1) as u64;
        let generated = (0..request.max_new_tokens)
            .map(|_| {
                state = splitmix64(state);
                (state % vocab) as TokenId
            })
            .collect::<Vec<_>>();

        debug!(
            input_tokens = request.tokens.len(),
            prior_tokens = prior_len,
            generated = generated.len(),
            "Forward pass"
        );

        Ok(ForwardOutput { generated, kv })
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
