//! KV tensor payloads produced by the compute engine.
//!
//! Layout is token-major: for each token, for each layer, the K then V
//! vectors of every KV head, stored as little-endian FP16 on every host. Extending a
//! sequence is therefore a plain byte concatenation.

use bytes::{Bytes, BytesMut};
use half::f16;
use serde::{Deserialize, Serialize};

use crate::engine::EngineError;

/// Dimensions of a KV payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvShape {
    /// Number of transformer layers.
    pub n_layers: usize,

    /// Number of KV heads (for GQA/MQA, may differ from attention heads).
    pub n_kv_heads: usize,

    /// Dimension per attention head.
    pub head_dim: usize,

    /// Number of cached token positions.
    pub seq_len: usize,
}

impl KvShape {
    /// FP16 elements per token across all layers, K and V.
    pub fn elements_per_token(&self) -> usize {
        2 * self.n_kv_heads * self.head_dim * self.n_layers
    }

    /// KV bytes per token (FP16, K+V, all layers).
    pub fn bytes_per_token(&self) -> usize {
        self.elements_per_token() * 2
    }

    /// Total payload size in bytes.
    pub fn byte_len(&self) -> usize {
        self.bytes_per_token() * self.seq_len
    }

    /// Same geometry with a different sequence length.
    pub fn with_seq_len(&self, seq_len: usize) -> Self {
        Self { seq_len, ..*self }
    }

    /// Whether two shapes describe the same model geometry.
    pub fn same_geometry(&self, other: &KvShape) -> bool {
        self.n_layers == other.n_layers
            && self.n_kv_heads == other.n_kv_heads
            && self.head_dim == other.head_dim
    }
}

/// An immutable KV payload. Cloning shares the underlying buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvTensors {
    shape: KvShape,
    data: Bytes,
}

impl KvTensors {
    /// Wrap raw bytes, checking they match the shape.
    pub fn new(shape: KvShape, data: Bytes) -> Result<Self, EngineError> {
        if data.len() != shape.byte_len() {
            return Err(EngineError::ShapeMismatch {
                expected: shape.byte_len(),
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Build a payload from FP16 values.
    pub fn from_f16(shape: KvShape, values: &[f16]) -> Result<Self, EngineError> {
        let data = if cfg!(target_endian = "little") {
            Bytes::copy_from_slice(bytemuck::cast_slice::<f16, u8>(values))
        } else {
            values.iter().flat_map(|v| v.to_le_bytes()).collect()
        };
        Self::new(shape, data)
    }

    /// Append the KV of further token positions.
    pub fn extend(&self, more: &KvTensors) -> Result<Self, EngineError> {
        if !self.shape.same_geometry(&more.shape) {
            return Err(EngineError::ShapeMismatch {
                expected: self.shape.bytes_per_token(),
                actual: more.shape.bytes_per_token(),
            });
        }
        let mut buf = BytesMut::with_capacity(self.data.len() + more.data.len());
        buf.extend_from_slice(&self.data);
        buf.extend_from_slice(&more.data);
        Ok(Self {
            shape: self.shape.with_seq_len(self.shape.seq_len + more.shape.seq_len),
            data: buf.freeze(),
        })
    }

    pub fn shape(&self) -> KvShape {
        self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn seq_len(&self) -> usize {
        self.shape.seq_len
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Decode the payload back into FP16 values.
    pub fn to_f16(&self) -> Vec<f16> {
        self.data
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    /// Content digest of the payload (blake3).
    pub fn digest(&self) -> blake3::Hash {
        blake3::hash(&self.data)
    }
}
