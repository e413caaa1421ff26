//! Durable storage for context blobs.
//!
//! - [`codec`]: the self-describing blob format
//! - [`disk`]: sharded on-disk backend
//! - [`memory`]: in-process backend with fault injection, for tests
//!
//! Backends move opaque bytes keyed by context id; encoding, checksums and
//! compression live in the codec so every backend gets the same integrity
//! checks.

pub mod codec;
pub mod disk;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Corrupted blob at {location}: {reason}")]
    Corrupted { location: String, reason: String },

    #[error("Failed to encode blob: {0}")]
    Encode(String),

    #[error("Invalid context id for storage: {0}")]
    InvalidKey(String),
}

/// Where a context's durable copy lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    pub context_id: String,

    /// Backend-specific location (a path for disk storage).
    pub location: String,

    /// Size of the stored blob in bytes.
    pub stored_bytes: u64,
}

/// Storage backend capability.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Persist a blob, replacing any previous blob for the same context.
    async fn write_blob(&self, context_id: &str, blob: Bytes) -> Result<StorageRef, StorageError>;

    /// Read back a blob.
    async fn read_blob(&self, context_id: &str) -> Result<Bytes, StorageError>;

    /// Remove a blob. Removing a missing blob is not an error.
    async fn delete_blob(&self, context_id: &str) -> Result<(), StorageError>;

    /// Every blob currently stored.
    async fn list(&self) -> Result<Vec<StorageRef>, StorageError>;
}

/// Reject ids that could escape the storage root.
pub(crate) fn validate_key(context_id: &str) -> Result<(), StorageError> {
    let ok = !context_id.is_empty()
        && context_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(context_id.to_string()))
    }
}
