//! On-disk blob storage.
//!
//! Blobs live under a two-level directory structure to avoid too many files
//! in one directory: `ctx_3fa9…` → `<root>/3f/ctx_3fa9….kvctx`. Writes go to
//! a temp file that is renamed into place, so a crash never leaves a
//! half-written blob under the final name.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use crate::storage::{validate_key, StorageBackend, StorageError, StorageRef};

const EXTENSION: &str = "kvctx";

/// Disk storage backend.
pub struct DiskStorage {
    root: PathBuf,
    stats: DiskStats,
}

/// I/O counters.
#[derive(Debug, Default)]
pub struct DiskStats {
    pub writes: AtomicU64,
    pub reads: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
}

impl DiskStorage {
    /// Open (and create if needed) a storage root.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            stats: DiskStats::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stats(&self) -> &DiskStats {
        &self.stats
    }

    fn blob_path(&self, context_id: &str) -> Result<PathBuf, StorageError> {
        validate_key(context_id)?;
        Ok(self
            .root
            .join(shard_of(context_id))
            .join(format!("{context_id}.{EXTENSION}")))
    }
}

/// First two characters of the id after the `ctx_` prefix.
fn shard_of(context_id: &str) -> String {
    let suffix = context_id.strip_prefix("ctx_").unwrap_or(context_id);
    let shard: String = suffix.chars().take(2).collect();
    if shard.len() == 2 {
        shard
    } else {
        "00".to_string()
    }
}

#[async_trait]
impl StorageBackend for DiskStorage {
    fn name(&self) -> &str {
        "disk"
    }

    async fn write_blob(&self, context_id: &str, blob: Bytes) -> Result<StorageRef, StorageError> {
        let path = self.blob_path(context_id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
        fs::write(&tmp, &blob).await?;
        if let Err(e) = fs::rename(&tmp, &path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(
            context_id,
            path = %path.display(),
            size = blob.len(),
            "Wrote context blob"
        );
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(blob.len() as u64, Ordering::Relaxed);

        Ok(StorageRef {
            context_id: context_id.to_string(),
            location: path.display().to_string(),
            stored_bytes: blob.len() as u64,
        })
    }

    async fn read_blob(&self, context_id: &str) -> Result<Bytes, StorageError> {
        let path = self.blob_path(context_id)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(context_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        debug!(context_id, path = %path.display(), size = data.len(), "Read context blob");
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(Bytes::from(data))
    }

    async fn delete_blob(&self, context_id: &str) -> Result<(), StorageError> {
        let path = self.blob_path(context_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(context_id, path = %path.display(), "Deleted context blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<StorageRef>, StorageError> {
        let mut refs = Vec::new();
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                let Some(context_id) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let meta = entry.metadata().await?;
                refs.push(StorageRef {
                    context_id: context_id.to_string(),
                    location: path.display().to_string(),
                    stored_bytes: meta.len(),
                });
            }
        }
        refs.sort_by(|a, b| a.context_id.cmp(&b.context_id));
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_and_read_blob() {
        let tmp = TempDir::new().unwrap();
        let storage = DiskStorage::open(tmp.path().join("contexts")).await.unwrap();

        let data = Bytes::from(vec![42u8; 4096]);
        let stored = storage.write_blob("ctx_ab12", data.clone()).await.unwrap();
        assert!(stored.location.contains("/ab/"));
        assert_eq!(stored.stored_bytes, 4096);

        let read = storage.read_blob("ctx_ab12").await.unwrap();
        assert_eq!(read, data);
        assert_eq!(storage.stats().writes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_delete_blob() {
        let tmp = TempDir::new().unwrap();
        let storage = DiskStorage::open(tmp.path()).await.unwrap();

        storage
            .write_blob("ctx_ff00", Bytes::from_static(b"blob"))
            .await
            .unwrap();
        storage.delete_blob("ctx_ff00").await.unwrap();
        // Deleting twice is fine.
        storage.delete_blob("ctx_ff00").await.unwrap();

        let result = storage.read_blob("ctx_ff00").await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_skips_temp_files() {
        let tmp = TempDir::new().unwrap();
        let storage = DiskStorage::open(tmp.path()).await.unwrap();
        storage
            .write_blob("ctx_aa01", Bytes::from_static(b"a"))
            .await
            .unwrap();
        storage
            .write_blob("ctx_bb02", Bytes::from_static(b"bb"))
            .await
            .unwrap();
        std::fs::write(tmp.path().join("aa").join("ctx_aa99.kvctx.tmp"), b"partial").unwrap();

        let listed = storage.list().await.unwrap();
        let ids: Vec<_> = listed.iter().map(|r| r.context_id.as_str()).collect();
        assert_eq!(ids, vec!["ctx_aa01", "ctx_bb02"]);
        assert_eq!(listed[1].stored_bytes, 2);
    }
}
