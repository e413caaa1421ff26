//! Accelerator memory pool and host ↔ device transfers.
//!
//! Device memory is modelled as a byte budget. Space is claimed up front
//! with [`DevicePool::try_reserve`]; an upload then moves the reservation
//! into a [`DeviceBuffers`], and dropping the buffers returns the space to
//! the pool. Queries hold an `Arc<DeviceBuffers>`, so memory stays allocated
//! until the last lease is gone even if the entry has already been demoted.
//! Every release wakes waiters on [`DevicePool::released`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::debug;

use crate::engine::kv::KvTensors;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Out of device memory: need {needed} bytes, {available} available")]
    OutOfMemory { needed: usize, available: usize },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),
}

/// Host-resident KV payload (the warm tier representation).
#[derive(Debug, Clone)]
pub struct HostBuffers {
    kv: KvTensors,
}

impl HostBuffers {
    pub fn new(kv: KvTensors) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &KvTensors {
        &self.kv
    }

    pub fn byte_len(&self) -> usize {
        self.kv.byte_len()
    }
}

/// Claimed device memory. Returned to the pool on drop unless it has been
/// moved into [`DeviceBuffers`] by an upload.
#[derive(Debug)]
pub struct DeviceReservation {
    bytes: usize,
    pool: Arc<PoolInner>,
}

impl DeviceReservation {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        {
            let mut used = self.pool.used.lock();
            *used = used.saturating_sub(self.bytes);
        }
        debug!(bytes = self.bytes, "Freed device memory");
        self.pool.released.notify_waiters();
    }
}

/// Device-resident KV payload (the hot tier representation).
#[derive(Debug)]
pub struct DeviceBuffers {
    kv: KvTensors,
    allocation: DeviceReservation,
}

impl DeviceBuffers {
    pub fn kv(&self) -> &KvTensors {
        &self.kv
    }

    pub fn byte_len(&self) -> usize {
        self.allocation.bytes
    }
}

/// Wakes [`DevicePool::released`] waiters when dropped. Held by query leases
/// so that giving up a lease lets a waiting admission retry its victims.
#[derive(Debug)]
pub struct ReleaseNotice {
    pool: Arc<PoolInner>,
}

impl Drop for ReleaseNotice {
    fn drop(&mut self) {
        self.pool.released.notify_waiters();
    }
}

/// Transfer counters.
#[derive(Debug, Default)]
pub struct TransferStats {
    pub d2h_bytes: AtomicU64,
    pub h2d_bytes: AtomicU64,
    pub d2h_transfers: AtomicU64,
    pub h2d_transfers: AtomicU64,
}

#[derive(Debug)]
struct PoolInner {
    capacity: usize,
    used: Mutex<usize>,
    released: Notify,
    stats: TransferStats,
    fail_uploads: AtomicBool,
}

/// Accelerator memory pool.
#[derive(Debug, Clone)]
pub struct DevicePool {
    inner: Arc<PoolInner>,
}

impl DevicePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                used: Mutex::new(0),
                released: Notify::new(),
                stats: TransferStats::default(),
                fail_uploads: AtomicBool::new(false),
            }),
        }
    }

    /// Claim `bytes` of device memory if available.
    pub fn try_reserve(&self, bytes: usize) -> Option<DeviceReservation> {
        let mut used = self.inner.used.lock();
        if bytes > self.inner.capacity.saturating_sub(*used) {
            return None;
        }
        *used += bytes;
        Some(DeviceReservation {
            bytes,
            pool: self.inner.clone(),
        })
    }

    /// Copy a host payload onto the device (Host-to-Device) into memory
    /// claimed beforehand.
    pub async fn upload(
        &self,
        host: &HostBuffers,
        allocation: DeviceReservation,
    ) -> Result<DeviceBuffers, DeviceError> {
        if self.inner.fail_uploads.load(Ordering::SeqCst) {
            return Err(DeviceError::TransferFailed("injected upload failure".into()));
        }

        let needed = host.byte_len();
        if needed > allocation.bytes {
            return Err(DeviceError::OutOfMemory {
                needed,
                available: allocation.bytes,
            });
        }
        let kv = KvTensors::new(host.kv.shape(), Bytes::copy_from_slice(host.kv.data()))
            .map_err(|e| DeviceError::TransferFailed(e.to_string()))?;

        debug!(size = needed, "H2D transfer");
        let stats = &self.inner.stats;
        stats.h2d_bytes.fetch_add(needed as u64, Ordering::Relaxed);
        stats.h2d_transfers.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceBuffers { kv, allocation })
    }

    /// Copy device buffers back into host memory (Device-to-Host).
    pub async fn download(&self, device: &DeviceBuffers) -> Result<HostBuffers, DeviceError> {
        let kv = KvTensors::new(device.kv.shape(), Bytes::copy_from_slice(device.kv.data()))
            .map_err(|e| DeviceError::TransferFailed(e.to_string()))?;

        debug!(size = kv.byte_len(), "D2H transfer");
        let stats = &self.inner.stats;
        stats
            .d2h_bytes
            .fetch_add(kv.byte_len() as u64, Ordering::Relaxed);
        stats.d2h_transfers.fetch_add(1, Ordering::Relaxed);
        Ok(HostBuffers::new(kv))
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn used(&self) -> usize {
        *self.inner.used.lock()
    }

    pub fn available(&self) -> usize {
        self.inner.capacity.saturating_sub(self.used())
    }

    pub fn stats(&self) -> &TransferStats {
        &self.inner.stats
    }

    /// Make every subsequent upload fail.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.inner.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Resolves on the next release of device memory or of a query lease.
    /// Call [`Notified::enable`] before re-checking to avoid missing one.
    pub fn released(&self) -> Notified<'_> {
        self.inner.released.notified()
    }

    /// A guard that signals [`released`](Self::released) when dropped.
    pub fn release_notice(&self) -> ReleaseNotice {
        ReleaseNotice {
            pool: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::kv::KvShape;

    fn host(seq_len: usize) -> HostBuffers {
        let shape = KvShape {
            n_layers: 1,
            n_kv_heads: 1,
            head_dim: 4,
            seq_len,
        };
        let data: Vec<u8> = (0..shape.byte_len()).map(|i| i as u8).collect();
        HostBuffers::new(KvTensors::new(shape, Bytes::from(data)).unwrap())
    }

    async fn upload(pool: &DevicePool, h: &HostBuffers) -> DeviceBuffers {
        let allocation = pool.try_reserve(h.byte_len()).unwrap();
        pool.upload(h, allocation).await.unwrap()
    }

    #[tokio::test]
    async fn test_upload_download_roundtrip() {
        let pool = DevicePool::new(1024);
        let h = host(4); // 64 bytes
        let dev = upload(&pool, &h).await;
        assert_eq!(pool.used(), 64);

        let back = pool.download(&dev).await.unwrap();
        assert_eq!(back.kv().data(), h.kv().data());
        assert_eq!(pool.stats().h2d_transfers.load(Ordering::Relaxed), 1);
        assert_eq!(pool.stats().d2h_bytes.load(Ordering::Relaxed), 64);

        drop(dev);
        assert_eq!(pool.used(), 0);
    }

    #[tokio::test]
    async fn test_reservation_respects_capacity() {
        let pool = DevicePool::new(100);
        let _first = upload(&pool, &host(4)).await;
        assert!(pool.try_reserve(64).is_none());

        let small = pool.try_reserve(36).unwrap();
        let err = pool.upload(&host(4), small).await.unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { needed: 64, available: 36 }));
        // The failed upload returned its reservation.
        assert_eq!(pool.used(), 64);
    }

    #[tokio::test]
    async fn test_lease_keeps_memory_allocated() {
        let pool = DevicePool::new(1024);
        let dev = Arc::new(upload(&pool, &host(2)).await);
        let lease = dev.clone();
        drop(dev);
        assert_eq!(pool.used(), 32);
        drop(lease);
        assert_eq!(pool.used(), 0);
    }

    #[tokio::test]
    async fn test_release_wakes_waiters() {
        let pool = DevicePool::new(1024);
        let dev = upload(&pool, &host(2)).await;

        let released = pool.released();
        tokio::pin!(released);
        released.as_mut().enable();
        drop(dev);
        tokio::time::timeout(std::time::Duration::from_secs(1), released)
            .await
            .unwrap();

        let notice = pool.release_notice();
        let released = pool.released();
        tokio::pin!(released);
        released.as_mut().enable();
        drop(notice);
        tokio::time::timeout(std::time::Duration::from_secs(1), released)
            .await
            .unwrap();
    }
}
