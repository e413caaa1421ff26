//! Blob codec for persisted contexts.
//!
//! Layout:
//!
//! ```text
//! "VKVC" | version: u16 LE | header_len: u32 LE | JSON header | payload
//! ```
//!
//! The payload is the raw little-endian FP16 KV bytes, optionally
//! zstd-compressed. The header carries a blake3 checksum of the
//! uncompressed payload, so a bit flip anywhere is reported as corruption
//! rather than silently decoded.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::kv::{KvShape, KvTensors};
use crate::storage::StorageError;

pub const MAGIC: &[u8; 4] = b"VKVC";
pub const FORMAT_VERSION: u16 = 1;

const PREAMBLE_LEN: usize = 4 + 2 + 4;

/// Context metadata carried in every blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub context_id: String,
    pub model_id: String,
    pub name: String,
    pub token_count: usize,
    pub ttl_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
}

/// The JSON header of a blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobHeader {
    #[serde(flatten)]
    pub record: ContextRecord,
    pub shape: KvShape,
    pub compressed: bool,

    /// Length of the uncompressed payload.
    pub payload_len: usize,

    /// blake3 hex digest of the uncompressed payload.
    pub checksum: String,
}

/// Encodes and decodes context blobs.
#[derive(Debug, Clone, Copy)]
pub struct BlobCodec {
    compress: bool,
    level: i32,
}

impl BlobCodec {
    pub fn new(compress: bool, level: i32) -> Self {
        Self { compress, level }
    }

    pub fn encode(&self, record: &ContextRecord, kv: &KvTensors) -> Result<Bytes, StorageError> {
        let raw = kv.data();
        let header = BlobHeader {
            record: record.clone(),
            shape: kv.shape(),
            compressed: self.compress,
            payload_len: raw.len(),
            checksum: kv.digest().to_hex().to_string(),
        };
        let header_json =
            serde_json::to_vec(&header).map_err(|e| StorageError::Encode(e.to_string()))?;
        let header_len = u32::try_from(header_json.len())
            .map_err(|_| StorageError::Encode("header too large".into()))?;

        let payload = if self.compress {
            zstd::encode_all(raw.as_ref(), self.level)?
        } else {
            raw.to_vec()
        };

        let mut out = Vec::with_capacity(PREAMBLE_LEN + header_json.len() + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header_json);
        out.extend_from_slice(&payload);
        Ok(Bytes::from(out))
    }

    /// Parse only the header. Cheap enough for startup restore.
    pub fn decode_header(&self, blob: &[u8], location: &str) -> Result<BlobHeader, StorageError> {
        let (header, _) = split(blob, location)?;
        Ok(header)
    }

    /// Fully decode and verify a blob.
    pub fn decode(
        &self,
        blob: &[u8],
        location: &str,
    ) -> Result<(ContextRecord, KvTensors), StorageError> {
        let (header, payload) = split(blob, location)?;

        let raw = if header.compressed {
            zstd::decode_all(payload).map_err(|e| corrupted(location, format!("zstd: {e}")))?
        } else {
            payload.to_vec()
        };
        if raw.len() != header.payload_len {
            return Err(corrupted(
                location,
                format!("payload is {} bytes, header says {}", raw.len(), header.payload_len),
            ));
        }
        let checksum = blake3::hash(&raw).to_hex();
        if checksum.as_str() != header.checksum {
            return Err(corrupted(location, "checksum mismatch".to_string()));
        }

        let kv = KvTensors::new(header.shape, Bytes::from(raw))
            .map_err(|e| corrupted(location, e.to_string()))?;
        Ok((header.record, kv))
    }
}

fn split<'a>(blob: &'a [u8], location: &str) -> Result<(BlobHeader, &'a [u8]), StorageError> {
    if blob.len() < PREAMBLE_LEN {
        return Err(corrupted(location, format!("truncated ({} bytes)", blob.len())));
    }
    if &blob[..4] != MAGIC {
        return Err(corrupted(location, "bad magic".to_string()));
    }
    let version = u16::from_le_bytes([blob[4], blob[5]]);
    if version != FORMAT_VERSION {
        return Err(corrupted(location, format!("unsupported version {version}")));
    }
    let header_len = u32::from_le_bytes([blob[6], blob[7], blob[8], blob[9]]) as usize;
    let header_end = PREAMBLE_LEN
        .checked_add(header_len)
        .filter(|end| *end <= blob.len())
        .ok_or_else(|| corrupted(location, "header length out of range".to_string()))?;

    let header: BlobHeader = serde_json::from_slice(&blob[PREAMBLE_LEN..header_end])
        .map_err(|e| corrupted(location, format!("header: {e}")))?;
    Ok((header, &blob[header_end..]))
}

fn corrupted(location: &str, reason: String) -> StorageError {
    StorageError::Corrupted {
        location: location.to_string(),
        reason,
    }
}
