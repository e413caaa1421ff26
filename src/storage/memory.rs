//! In-memory storage backend.
//!
//! Used by tests and benches. Supports fault injection: failing writes or
//! reads, delaying writes or reads, and corrupting a stored blob in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::storage::{validate_key, StorageBackend, StorageError, StorageRef};

#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Bytes>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_delay_ms: AtomicU64,
    read_delay_ms: AtomicU64,
    writes: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Delay every subsequent write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay every subsequent read by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Flip one byte near the end of a stored blob. Returns false if absent.
    pub fn corrupt(&self, context_id: &str) -> bool {
        let mut blobs = self.blobs.lock();
        match blobs.get_mut(context_id) {
            Some(blob) if !blob.is_empty() => {
                let mut bytes = blob.to_vec();
                let idx = bytes.len() - 1;
                bytes[idx] ^= 0xFF;
                *blob = Bytes::from(bytes);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, context_id: &str) -> bool {
        self.blobs.lock().contains_key(context_id)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn injected(op: &str) -> StorageError {
        StorageError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("injected {op} failure"),
        ))
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_blob(&self, context_id: &str, blob: Bytes) -> Result<StorageRef, StorageError> {
        validate_key(context_id)?;
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("write"));
        }

        let stored_bytes = blob.len() as u64;
        self.blobs.lock().insert(context_id.to_string(), blob);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(StorageRef {
            context_id: context_id.to_string(),
            location: format!("mem://{context_id}"),
            stored_bytes,
        })
    }

    async fn read_blob(&self, context_id: &str) -> Result<Bytes, StorageError> {
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected("read"));
        }
        self.blobs
            .lock()
            .get(context_id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(context_id.to_string()))
    }

    async fn delete_blob(&self, context_id: &str) -> Result<(), StorageError> {
        self.blobs.lock().remove(context_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<StorageRef>, StorageError> {
        let mut refs: Vec<StorageRef> = self
            .blobs
            .lock()
            .iter()
            .map(|(id, blob)| StorageRef {
                context_id: id.clone(),
                location: format!("mem://{id}"),
                stored_bytes: blob.len() as u64,
            })
            .collect();
        refs.sort_by(|a, b| a.context_id.cmp(&b.context_id));
        Ok(refs)
    }
}
