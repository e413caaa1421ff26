//! Context cache manager: owns the tier placement of every context.
//!
//! The manager is the central coordinator for the tiered context cache. It:
//! - Admits freshly ingested contexts into the hot tier
//! - Leases hot device buffers to queries, promoting on a miss
//! - Demotes least-recently-used contexts when a tier runs out of room
//! - Removes expired or deleted contexts together with their storage blob
//!
//! Each entry sits behind its own async mutex, held across the I/O of a
//! transition. New representations are built in locals and committed only
//! after the last await, so a cancelled request leaves an entry either
//! fully transitioned or untouched. Capacity victims are taken with
//! `try_lock` and skipped when busy or leased to a running query, so two
//! requests never wait on each other's entries. Hot room is claimed in both
//! the tier ledger and the device pool before any transfer starts; when only
//! leases or in-flight transitions stand in the way, admission waits for a
//! release (bounded by `lease_wait`) instead of failing outright.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::entry::{
    CatalogRecord, ContextEntry, ContextId, ContextInfo, Durability, Residence, Slot, Tier,
};
use crate::cache::evictor;
use crate::cache::ledger::{Reservation, TierLedger, TierUsage};
use crate::config::{AdmissionPolicy, Config, PressureMode};
use crate::engine::kv::KvTensors;
use crate::error::{CoreError, CoreResult};
use crate::metrics::Metrics;
use crate::storage::codec::{BlobCodec, ContextRecord};
use crate::storage::{StorageBackend, StorageError, StorageRef};
use crate::transfer::{
    DeviceBuffers, DeviceError, DevicePool, DeviceReservation, HostBuffers, ReleaseNotice,
};

/// Re-check interval while waiting on busy victims that signal nothing.
const RETRY_TICK: Duration = Duration::from_millis(10);

/// Capacity and policy knobs for the cache.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub hot_capacity_bytes: usize,
    pub warm_capacity_bytes: usize,
    pub admission: AdmissionPolicy,
    pub pressure: PressureMode,
    pub low_watermark: f64,

    /// Upper bound on waiting for leased or in-flight hot memory.
    pub lease_wait: Duration,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hot_capacity_bytes: config.tiers.hot_capacity_bytes,
            warm_capacity_bytes: config.tiers.warm_capacity_bytes,
            admission: config.eviction.admission,
            pressure: config.eviction.pressure,
            low_watermark: config.eviction.low_watermark,
            lease_wait: Duration::from_millis(config.eviction.lease_wait_ms),
        }
    }
}

/// Listing filter.
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    pub tier: Option<Tier>,
    pub model_id: Option<String>,
}

/// A query's handle on hot KV state. Device memory stays allocated until
/// the lease is dropped, even if the entry is demoted meanwhile.
#[derive(Debug)]
pub struct QueryLease {
    pub buffers: Arc<DeviceBuffers>,

    /// Whether the entry was already hot when the query arrived.
    pub cache_hit: bool,

    pub info: ContextInfo,

    // Declared last so it fires after `buffers` has been released.
    _released: ReleaseNotice,
}

impl QueryLease {
    pub fn kv(&self) -> &KvTensors {
        self.buffers.kv()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hot: TierUsage,
    pub warm: TierUsage,
    pub cold: TierUsage,
    pub total_contexts: usize,
    pub hits: u64,
    pub misses: u64,
    pub queries: u64,
    pub hit_rate: f64,
    pub avg_query_latency_ms: f64,

    /// Device memory in use, including buffers pinned by running queries.
    pub device_bytes: usize,
}

/// Room claimed in the hot tier: ledger space plus device memory.
struct HotRoom {
    ledger: Reservation,
    device: DeviceReservation,
}

enum HotRound {
    Admitted(HotRoom),
    /// No room. `transient` is set when leases, locked victims or other
    /// in-flight transitions may free some shortly.
    Exhausted { transient: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VictimOutcome {
    Demoted,
    /// Locked by another request or leased to a running query.
    Busy,
    /// Gone, already moved, or the demotion failed.
    Unavailable,
}

#[derive(Debug, Default)]
struct QueryCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    completed: AtomicU64,
    latency_us: AtomicU64,
}

pub struct ContextCacheManager {
    settings: CacheSettings,
    entries: DashMap<ContextId, Arc<Mutex<Slot>>>,
    catalog: RwLock<HashMap<ContextId, CatalogRecord>>,
    ledger: TierLedger,
    device: DevicePool,
    storage: Arc<dyn StorageBackend>,
    codec: BlobCodec,
    metrics: Arc<Metrics>,
    clock: AtomicU64,
    counters: QueryCounters,
    rebalancing: AtomicBool,
    self_ref: Weak<ContextCacheManager>,
}

impl ContextCacheManager {
    pub fn new(
        settings: CacheSettings,
        device: DevicePool,
        storage: Arc<dyn StorageBackend>,
        codec: BlobCodec,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let ledger = TierLedger::new(
            settings.hot_capacity_bytes,
            settings.warm_capacity_bytes,
            metrics.clone(),
        );
        Arc::new_cyclic(|self_ref| Self {
            settings,
            entries: DashMap::new(),
            catalog: RwLock::new(HashMap::new()),
            ledger,
            device,
            storage,
            codec,
            metrics,
            clock: AtomicU64::new(1),
            counters: QueryCounters::default(),
            rebalancing: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Admit a freshly computed context into the hot tier and start its
    /// durable write. Returns once the hot state is ready.
    pub async fn admit(&self, record: ContextRecord, kv: KvTensors) -> CoreResult<ContextInfo> {
        let id = record.context_id.clone();
        let bytes = kv.byte_len();

        let room = self.reserve_hot(bytes, &id).await?;
        let host = HostBuffers::new(kv);
        let buffers = self
            .device
            .upload(&host, room.device)
            .await
            .map_err(|e| admission_failure(&id, e))?;

        let write = self.spawn_durable_write(record.clone(), host.kv().clone());
        let info = ContextInfo::from_record(&record, Tier::Hot, bytes);
        let entry = ContextEntry {
            record,
            kv_bytes: bytes,
            residence: Residence::Hot(Arc::new(buffers)),
            durability: Durability::Pending(write),
        };

        self.entries
            .insert(id.clone(), Arc::new(Mutex::new(Slot::Live(entry))));
        self.catalog.write().insert(
            id.clone(),
            CatalogRecord {
                info: info.clone(),
                lru_tick: self.next_tick(),
            },
        );
        room.ledger.commit();

        info!(
            context_id = %id,
            model_id = %info.model_id,
            tokens = info.token_count,
            bytes,
            "Context admitted to hot tier"
        );
        Ok(info)
    }

    /// Lease hot KV state for a query, promoting the entry if needed.
    pub async fn acquire_for_query(
        &self,
        context_id: &str,
        model_id: &str,
    ) -> CoreResult<QueryLease> {
        let slot = self.slot(context_id)?;
        let mut guard = slot.lock().await;
        let entry = live(&mut guard, context_id)?;

        if entry.record.model_id != model_id {
            return Err(CoreError::ModelMismatch {
                context_id: context_id.to_string(),
                expected: entry.record.model_id.clone(),
                requested: model_id.to_string(),
            });
        }

        let cache_hit = entry.tier() == Tier::Hot;
        if cache_hit {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_lookups.with_label_values(&["hit"]).inc();
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.cache_lookups.with_label_values(&["miss"]).inc();
            debug!(context_id, tier = %entry.tier(), "Cache miss, promoting");
            self.promote_locked(entry, Tier::Hot).await?;
        }

        let buffers = match &entry.residence {
            Residence::Hot(buffers) => buffers.clone(),
            _ => {
                return Err(CoreError::PromotionFailure {
                    context_id: context_id.to_string(),
                    reason: "entry not resident after promotion".into(),
                })
            }
        };
        let info = self.touch(context_id)?;
        drop(guard);

        Ok(QueryLease {
            buffers,
            cache_hit,
            info,
            _released: self.device.release_notice(),
        })
    }

    /// Record the end-to-end latency of a completed query.
    pub fn record_query_latency(&self, elapsed: Duration) {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .latency_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Move an entry up to `target`. No-op if it is already there or above.
    pub async fn promote(&self, context_id: &str, target: Tier) -> CoreResult<ContextInfo> {
        let slot = self.slot(context_id)?;
        let mut guard = slot.lock().await;
        let entry = live(&mut guard, context_id)?;
        if entry.tier() > target {
            self.promote_locked(entry, target).await?;
        }
        self.get(context_id)
    }

    /// Move an entry down to `target`. No-op if it is already there or below.
    pub async fn demote(&self, context_id: &str, target: Tier) -> CoreResult<ContextInfo> {
        let slot = self.slot(context_id)?;
        let mut guard = slot.lock().await;
        let entry = live(&mut guard, context_id)?;
        match (entry.tier(), target) {
            (Tier::Hot, Tier::Warm) => {
                let reservation = self.make_room_warm(entry.kv_bytes, context_id).await?;
                self.hot_to_warm(entry, reservation).await?;
            }
            (Tier::Hot | Tier::Warm, Tier::Cold) => self.to_cold(entry).await?,
            _ => {}
        }
        self.get(context_id)
    }

    /// Remove a context and every representation of it.
    pub async fn delete(&self, context_id: &str) -> CoreResult<()> {
        let slot = self.slot(context_id)?;
        let mut guard = slot.lock().await;
        if matches!(*guard, Slot::Deleted) {
            return Err(CoreError::ContextNotFound(context_id.to_string()));
        }
        self.remove_locked(&mut guard, "delete").await;
        Ok(())
    }

    /// Remove every context whose TTL has elapsed. Returns the count.
    pub async fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now()).await
    }

    /// [`evict_expired`](Self::evict_expired) against an explicit clock.
    pub async fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let candidates = {
            let catalog = self.catalog.read();
            evictor::expired(catalog.values(), now)
        };

        let mut removed = 0;
        for id in candidates {
            let Ok(slot) = self.slot(&id) else {
                continue;
            };
            let mut guard = slot.lock().await;
            if matches!(*guard, Slot::Deleted) {
                continue;
            }
            // A query may have touched the entry while we waited for the lock.
            let still_expired = self
                .catalog
                .read()
                .get(&id)
                .is_some_and(|record| record.info.is_expired(now));
            if !still_expired {
                continue;
            }
            self.remove_locked(&mut guard, "ttl").await;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "TTL eviction round complete");
        }
        removed
    }

    /// Wait for every pending durable write. Returns how many were pending.
    pub async fn flush(&self) -> usize {
        let slots: Vec<Arc<Mutex<Slot>>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        let mut settled = 0;
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Slot::Live(entry) = &mut *guard {
                if matches!(entry.durability, Durability::Pending(_)) {
                    self.settle_durability(entry).await;
                    settled += 1;
                }
            }
        }
        if settled > 0 {
            info!(settled, "Flushed pending durable writes");
        }
        settled
    }

    /// Register every valid blob in storage as a cold entry.
    pub async fn restore_from_storage(&self) -> CoreResult<usize> {
        let refs = self.storage.list().await?;
        let mut restored = 0;
        for sref in refs {
            if self.entries.contains_key(&sref.context_id) {
                continue;
            }
            let (record, kv) = match self.read_verified(&sref).await {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.metrics
                        .storage_failures
                        .with_label_values(&["restore"])
                        .inc();
                    warn!(
                        context_id = %sref.context_id,
                        location = %sref.location,
                        error = %e,
                        "Skipping unreadable context blob"
                    );
                    continue;
                }
            };

            let bytes = kv.byte_len();
            let stored = sref.stored_bytes as usize;
            let id = record.context_id.clone();
            let info = ContextInfo::from_record(&record, Tier::Cold, bytes);
            let entry = ContextEntry {
                record,
                kv_bytes: bytes,
                residence: Residence::Cold(sref.clone()),
                durability: Durability::Persisted(sref),
            };
            self.entries
                .insert(id.clone(), Arc::new(Mutex::new(Slot::Live(entry))));
            self.catalog.write().insert(
                id,
                CatalogRecord {
                    info,
                    lru_tick: self.next_tick(),
                },
            );
            self.ledger.add(Tier::Cold, stored);
            restored += 1;
        }

        info!(restored, backend = self.storage.name(), "Restored contexts from storage");
        Ok(restored)
    }

    // ─── Read-only views (catalog only, never wait on entry locks) ──────────

    pub fn get(&self, context_id: &str) -> CoreResult<ContextInfo> {
        self.catalog
            .read()
            .get(context_id)
            .map(|record| record.info.clone())
            .ok_or_else(|| CoreError::ContextNotFound(context_id.to_string()))
    }

    pub fn list(&self, filter: &ContextFilter) -> Vec<ContextInfo> {
        let mut infos: Vec<ContextInfo> = self
            .catalog
            .read()
            .values()
            .filter(|r| filter.tier.map_or(true, |t| r.info.tier == t))
            .filter(|r| {
                filter
                    .model_id
                    .as_deref()
                    .map_or(true, |m| r.info.model_id == m)
            })
            .map(|r| r.info.clone())
            .collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.context_id.cmp(&b.context_id))
        });
        infos
    }

    /// A live context of `model_id` ingested from identical content.
    pub fn find_by_hash(&self, model_id: &str, content_hash: &str) -> Option<ContextInfo> {
        self.catalog
            .read()
            .values()
            .find(|r| r.info.model_id == model_id && r.info.content_hash == content_hash)
            .map(|r| r.info.clone())
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let completed = self.counters.completed.load(Ordering::Relaxed);
        let latency_us = self.counters.latency_us.load(Ordering::Relaxed);
        let queries = hits + misses;

        CacheStats {
            hot: self.ledger.usage(Tier::Hot),
            warm: self.ledger.usage(Tier::Warm),
            cold: self.ledger.usage(Tier::Cold),
            total_contexts: self.catalog.read().len(),
            hits,
            misses,
            queries,
            hit_rate: if queries == 0 {
                0.0
            } else {
                hits as f64 / queries as f64
            },
            avg_query_latency_ms: if completed == 0 {
                0.0
            } else {
                latency_us as f64 / completed as f64 / 1000.0
            },
            device_bytes: self.device.used(),
        }
    }

    pub fn len(&self) -> usize {
        self.catalog.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.read().is_empty()
    }

    pub fn device(&self) -> &DevicePool {
        &self.device
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    // ─── Transitions (caller holds the entry lock) ──────────────────────────

    async fn promote_locked(&self, entry: &mut ContextEntry, target: Tier) -> CoreResult<()> {
        if entry.tier() <= target {
            return Ok(());
        }
        let id = entry.context_id().to_string();
        let bytes = entry.kv_bytes;

        match target {
            Tier::Hot => {
                let room = self.reserve_hot(bytes, &id).await?;
                let host = self.host_copy(entry).await?;
                let buffers = self
                    .device
                    .upload(&host, room.device)
                    .await
                    .map_err(|e| promotion_failure(&id, e))?;
                let residence = Residence::Hot(Arc::new(buffers));
                self.commit_transition(entry, residence, Some(room.ledger));
            }
            _ => {
                let reservation = self.make_room_warm(bytes, &id).await?;
                let host = self.host_copy(entry).await?;
                self.commit_transition(entry, Residence::Warm(host), Some(reservation));
            }
        }
        Ok(())
    }

    /// The payload of a warm or cold entry in host memory, reading and
    /// verifying the blob if cold.
    async fn host_copy(&self, entry: &ContextEntry) -> CoreResult<HostBuffers> {
        match &entry.residence {
            Residence::Hot(buffers) => Ok(HostBuffers::new(buffers.kv().clone())),
            Residence::Warm(host) => Ok(host.clone()),
            Residence::Cold(sref) => {
                let (_, kv) = self.read_verified(sref).await?;
                if kv.byte_len() != entry.kv_bytes {
                    return Err(CoreError::StorageCorruption(format!(
                        "{}: payload is {} bytes, expected {}",
                        entry.context_id(),
                        kv.byte_len(),
                        entry.kv_bytes
                    )));
                }
                Ok(HostBuffers::new(kv))
            }
        }
    }

    async fn hot_to_warm(
        &self,
        entry: &mut ContextEntry,
        reservation: Reservation,
    ) -> CoreResult<()> {
        let Residence::Hot(buffers) = &entry.residence else {
            return Ok(());
        };
        let buffers = buffers.clone();
        let host = self
            .device
            .download(&buffers)
            .await
            .map_err(|e| promotion_failure(entry.context_id(), e))?;
        drop(buffers);

        self.commit_transition(entry, Residence::Warm(host), Some(reservation));
        Ok(())
    }

    /// Write-before-evict: the payload leaves memory only once a durable
    /// copy is known to exist.
    async fn to_cold(&self, entry: &mut ContextEntry) -> CoreResult<()> {
        if entry.tier() == Tier::Cold {
            return Ok(());
        }
        let sref = self.ensure_persisted(entry).await?;
        self.commit_transition(entry, Residence::Cold(sref), None);
        Ok(())
    }

    fn commit_transition(
        &self,
        entry: &mut ContextEntry,
        residence: Residence,
        reservation: Option<Reservation>,
    ) {
        let from = entry.tier();
        let from_bytes = entry.tier_bytes();
        entry.residence = residence;
        let to = entry.tier();
        match reservation {
            Some(reservation) => reservation.commit(),
            None => self.ledger.add(to, entry.tier_bytes()),
        }
        self.ledger.release(from, from_bytes);

        if let Some(record) = self.catalog.write().get_mut(entry.context_id()) {
            record.info.tier = to;
        }
        self.metrics
            .tier_transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        info!(
            context_id = %entry.context_id(),
            from = %from,
            to = %to,
            bytes = entry.kv_bytes,
            "Tier transition"
        );
    }

    async fn remove_locked(&self, slot: &mut Slot, reason: &'static str) {
        let Slot::Live(entry) = &mut *slot else {
            return;
        };
        self.settle_durability(entry).await;
        let id = entry.context_id().to_string();

        let Slot::Live(entry) = std::mem::replace(slot, Slot::Deleted) else {
            return;
        };
        self.entries.remove(&id);
        self.catalog.write().remove(&id);
        self.ledger.release(entry.tier(), entry.tier_bytes());
        self.metrics.evictions.with_label_values(&[reason]).inc();
        drop(entry);

        // Detached so the blob still goes away if the caller is cancelled.
        let storage = self.storage.clone();
        let blob_id = id.clone();
        let cleanup = tokio::spawn(async move { storage.delete_blob(&blob_id).await });
        match cleanup.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics
                    .storage_failures
                    .with_label_values(&["delete"])
                    .inc();
                warn!(context_id = %id, error = %e, "Failed to delete context blob");
            }
            Err(e) => warn!(context_id = %id, error = %e, "Blob cleanup task failed"),
        }

        info!(context_id = %id, reason, "Context removed");
    }

    // ─── Durability ─────────────────────────────────────────────────────────

    fn spawn_durable_write(
        &self,
        record: ContextRecord,
        kv: KvTensors,
    ) -> tokio::task::JoinHandle<Result<StorageRef, StorageError>> {
        let storage = self.storage.clone();
        let codec = self.codec;
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let id = record.context_id.clone();
            let result = write_blob(storage, codec, record, kv).await;
            match &result {
                Ok(sref) => debug!(
                    context_id = %id,
                    stored_bytes = sref.stored_bytes,
                    "Durable write complete"
                ),
                Err(e) => {
                    metrics.storage_failures.with_label_values(&["write"]).inc();
                    error!(context_id = %id, error = %e, "Background durable write failed");
                }
            }
            result
        })
    }

    /// Resolve a pending background write into its outcome.
    async fn settle_durability(&self, entry: &mut ContextEntry) {
        if let Durability::Pending(handle) = &mut entry.durability {
            let outcome = handle.await;
            entry.durability = match outcome {
                Ok(Ok(sref)) => Durability::Persisted(sref),
                Ok(Err(_)) => Durability::Missing,
                Err(e) => {
                    error!(
                        context_id = %entry.record.context_id,
                        error = %e,
                        "Durable write task failed"
                    );
                    Durability::Missing
                }
            };
        }
    }

    async fn ensure_persisted(&self, entry: &mut ContextEntry) -> CoreResult<StorageRef> {
        self.settle_durability(entry).await;
        if let Durability::Persisted(sref) = &entry.durability {
            return Ok(sref.clone());
        }

        let kv = match &entry.residence {
            Residence::Hot(buffers) => buffers.kv().clone(),
            Residence::Warm(host) => host.kv().clone(),
            Residence::Cold(sref) => return Ok(sref.clone()),
        };
        warn!(context_id = %entry.record.context_id, "No durable copy, writing synchronously");
        let sref = write_blob(self.storage.clone(), self.codec, entry.record.clone(), kv)
            .await
            .map_err(|e| {
                self.metrics
                    .storage_failures
                    .with_label_values(&["write"])
                    .inc();
                CoreError::from(e)
            })?;
        entry.durability = Durability::Persisted(sref.clone());
        Ok(sref)
    }

    /// Read, verify and decode a blob.
    async fn read_verified(&self, sref: &StorageRef) -> CoreResult<(ContextRecord, KvTensors)> {
        let blob = self.storage.read_blob(&sref.context_id).await.map_err(|e| {
            self.metrics
                .storage_failures
                .with_label_values(&["read"])
                .inc();
            CoreError::from(e)
        })?;
        let codec = self.codec;
        let location = sref.location.clone();
        let (record, kv) = tokio::task::spawn_blocking(move || codec.decode(&blob, &location))
            .await
            .map_err(|e| CoreError::StorageFailure(e.to_string()))??;
        if record.context_id != sref.context_id {
            return Err(CoreError::StorageCorruption(format!(
                "{} holds context {}",
                sref.location, record.context_id
            )));
        }
        Ok((record, kv))
    }

    // ─── Capacity pressure ──────────────────────────────────────────────────

    /// Claim hot room for `bytes`, honouring the pressure mode.
    async fn reserve_hot(&self, bytes: usize, protect: &str) -> CoreResult<HotRoom> {
        let capacity = self.settings.hot_capacity_bytes;
        if bytes > capacity || bytes > self.device.capacity() {
            return Err(capacity_exceeded(Tier::Hot, bytes));
        }
        if let Some(room) = self.hot_room_within(bytes, capacity) {
            return Ok(room);
        }
        if self.settings.pressure == PressureMode::Deferred {
            if let Some(device) = self.device.try_reserve(bytes) {
                let ledger = self.ledger.force_reserve(Tier::Hot, bytes);
                self.schedule_rebalance();
                return Ok(HotRoom { ledger, device });
            }
        }
        self.make_room_hot(bytes, protect).await
    }

    /// Usage target for a tier under the configured admission policy.
    fn pressure_limit(&self, capacity: usize, bytes: usize) -> usize {
        match self.settings.admission {
            AdmissionPolicy::SingleVictim => capacity,
            AdmissionPolicy::Batch => {
                let watermark = self.settings.low_watermark.clamp(0.0, 1.0);
                ((capacity as f64 * watermark) as usize)
                    .max(bytes)
                    .min(capacity)
            }
        }
    }

    fn reserve_within(&self, tier: Tier, bytes: usize, limit: usize) -> Option<Reservation> {
        if self.ledger.usage(tier).committed_and_reserved() + bytes <= limit {
            self.ledger.try_reserve(tier, bytes)
        } else {
            None
        }
    }

    /// Ledger space and device memory together, or neither.
    fn hot_room_within(&self, bytes: usize, limit: usize) -> Option<HotRoom> {
        let ledger = self.reserve_within(Tier::Hot, bytes, limit)?;
        let device = self.device.try_reserve(bytes)?;
        Some(HotRoom { ledger, device })
    }

    fn victims(&self, tier: Tier, protect: &str) -> Vec<evictor::EvictionCandidate> {
        let catalog = self.catalog.read();
        evictor::select_victims(catalog.values(), tier, usize::MAX, &[protect])
    }

    /// Demote hot victims until `bytes` fit. Rounds that were blocked only by
    /// leased, locked or in-flight entries are retried as those release,
    /// until `lease_wait` runs out.
    async fn make_room_hot(&self, bytes: usize, protect: &str) -> CoreResult<HotRoom> {
        let deadline = Instant::now() + self.settings.lease_wait;
        loop {
            let released = self.device.released();
            tokio::pin!(released);
            released.as_mut().enable();

            let transient = match self.hot_round(bytes, protect).await {
                HotRound::Admitted(room) => return Ok(room),
                HotRound::Exhausted { transient } => transient,
            };
            let now = Instant::now();
            if !transient || now >= deadline {
                return Err(capacity_exceeded(Tier::Hot, bytes));
            }
            debug!(bytes, protect, "Hot tier held by in-flight work, waiting");
            let _ = tokio::time::timeout((deadline - now).min(RETRY_TICK), released).await;
        }
    }

    async fn hot_round(&self, bytes: usize, protect: &str) -> HotRound {
        let capacity = self.settings.hot_capacity_bytes;
        if let Some(room) = self.hot_room_within(bytes, capacity) {
            return HotRound::Admitted(room);
        }

        // Free down to the admission policy's target.
        let limit = self.pressure_limit(capacity, bytes);

        let mut busy = false;
        for victim in self.victims(Tier::Hot, protect) {
            match self.evict_hot_victim(&victim.context_id).await {
                VictimOutcome::Demoted => {}
                VictimOutcome::Busy => {
                    busy = true;
                    continue;
                }
                VictimOutcome::Unavailable => continue,
            }
            if let Some(room) = self.hot_room_within(bytes, limit) {
                return HotRound::Admitted(room);
            }
        }
        if let Some(room) = self.hot_room_within(bytes, capacity) {
            return HotRound::Admitted(room);
        }

        // Reserved bytes belong to other transitions still in flight; device
        // memory beyond the ledger is pinned by leases on demoted entries.
        let usage = self.ledger.usage(Tier::Hot);
        let transient = busy || usage.reserved > 0 || self.device.used() > usage.bytes;
        HotRound::Exhausted { transient }
    }

    async fn make_room_warm(&self, bytes: usize, protect: &str) -> CoreResult<Reservation> {
        let capacity = self.settings.warm_capacity_bytes;
        if bytes > capacity {
            return Err(capacity_exceeded(Tier::Warm, bytes));
        }
        if let Some(reservation) = self.ledger.try_reserve(Tier::Warm, bytes) {
            return Ok(reservation);
        }

        // Free down to the admission policy's target.
        let limit = self.pressure_limit(capacity, bytes);

        for victim in self.victims(Tier::Warm, protect) {
            if self.evict_warm_victim(&victim.context_id).await != VictimOutcome::Demoted {
                continue;
            }
            if let Some(reservation) = self.reserve_within(Tier::Warm, bytes, limit) {
                return Ok(reservation);
            }
        }
        self.ledger
            .try_reserve(Tier::Warm, bytes)
            .ok_or_else(|| capacity_exceeded(Tier::Warm, bytes))
    }

    /// Demote one hot victim: to warm if warm can make room, else straight
    /// to cold. Entries a query still holds a lease on are left alone.
    async fn evict_hot_victim(&self, context_id: &str) -> VictimOutcome {
        let Ok(slot) = self.slot(context_id) else {
            return VictimOutcome::Unavailable;
        };
        let Ok(mut guard) = slot.try_lock() else {
            debug!(context_id, "Victim busy, skipping");
            return VictimOutcome::Busy;
        };
        let Slot::Live(entry) = &mut *guard else {
            return VictimOutcome::Unavailable;
        };
        let Residence::Hot(buffers) = &entry.residence else {
            return VictimOutcome::Unavailable;
        };
        if Arc::strong_count(buffers) > 1 {
            debug!(context_id, "Victim leased by a running query, skipping");
            return VictimOutcome::Busy;
        }

        let result = match self.make_room_warm(entry.kv_bytes, context_id).await {
            Ok(reservation) => self.hot_to_warm(entry, reservation).await,
            Err(CoreError::CapacityExceeded { .. }) => self.to_cold(entry).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => VictimOutcome::Demoted,
            Err(e) => {
                warn!(context_id, error = %e, "Failed to demote hot victim");
                VictimOutcome::Unavailable
            }
        }
    }

    async fn evict_warm_victim(&self, context_id: &str) -> VictimOutcome {
        let Ok(slot) = self.slot(context_id) else {
            return VictimOutcome::Unavailable;
        };
        let Ok(mut guard) = slot.try_lock() else {
            debug!(context_id, "Victim busy, skipping");
            return VictimOutcome::Busy;
        };
        let Slot::Live(entry) = &mut *guard else {
            return VictimOutcome::Unavailable;
        };
        if entry.tier() != Tier::Warm {
            return VictimOutcome::Unavailable;
        }

        match self.to_cold(entry).await {
            Ok(()) => VictimOutcome::Demoted,
            Err(e) => {
                warn!(context_id, error = %e, "Failed to demote warm victim");
                VictimOutcome::Unavailable
            }
        }
    }

    fn over_budget(&self) -> bool {
        self.ledger.usage(Tier::Hot).over_capacity()
            || self.ledger.usage(Tier::Warm).over_capacity()
    }

    fn schedule_rebalance(&self) {
        if self.rebalancing.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.self_ref.upgrade() else {
            self.rebalancing.store(false, Ordering::SeqCst);
            return;
        };
        tokio::spawn(async move {
            loop {
                let settled = this.rebalance_until_settled().await;
                this.rebalancing.store(false, Ordering::SeqCst);
                // An admission may have overcommitted after the last check.
                if !settled
                    || !this.over_budget()
                    || this.rebalancing.swap(true, Ordering::SeqCst)
                {
                    break;
                }
            }
        });
    }

    /// Run rebalance rounds until within budget. Returns false if leased
    /// entries kept it over budget past `lease_wait`.
    async fn rebalance_until_settled(&self) -> bool {
        loop {
            let released = self.device.released();
            tokio::pin!(released);
            released.as_mut().enable();

            let demoted = self.rebalance_round().await;
            if !self.over_budget() {
                return true;
            }
            if demoted == 0
                && tokio::time::timeout(self.settings.lease_wait, released)
                    .await
                    .is_err()
            {
                warn!("Rebalance gave up with tiers over budget");
                return false;
            }
        }
    }

    /// Demote LRU entries until hot and warm are back within budget.
    async fn rebalance_round(&self) -> usize {
        let mut demoted = 0;

        let limit = self.pressure_limit(self.settings.hot_capacity_bytes, 0);
        for victim in self.victims(Tier::Hot, "") {
            if self.ledger.usage(Tier::Hot).committed_and_reserved() <= limit {
                break;
            }
            if self.evict_hot_victim(&victim.context_id).await == VictimOutcome::Demoted {
                demoted += 1;
            }
        }

        let limit = self.pressure_limit(self.settings.warm_capacity_bytes, 0);
        for victim in self.victims(Tier::Warm, "") {
            if self.ledger.usage(Tier::Warm).committed_and_reserved() <= limit {
                break;
            }
            if self.evict_warm_victim(&victim.context_id).await == VictimOutcome::Demoted {
                demoted += 1;
            }
        }

        if demoted > 0 {
            info!(demoted, "Rebalance round complete");
        }
        demoted
    }

    // ─── Helpers ────────────────────────────────────────────────────────────

    fn slot(&self, context_id: &str) -> CoreResult<Arc<Mutex<Slot>>> {
        self.entries
            .get(context_id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| CoreError::ContextNotFound(context_id.to_string()))
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Record an access: bumps recency, access count and `last_accessed`.
    fn touch(&self, context_id: &str) -> CoreResult<ContextInfo> {
        let tick = self.next_tick();
        let mut catalog = self.catalog.write();
        let record = catalog
            .get_mut(context_id)
            .ok_or_else(|| CoreError::ContextNotFound(context_id.to_string()))?;
        record.lru_tick = tick;
        record.info.last_accessed = Utc::now();
        record.info.access_count += 1;
        Ok(record.info.clone())
    }
}

fn live<'a>(slot: &'a mut Slot, context_id: &str) -> CoreResult<&'a mut ContextEntry> {
    match slot {
        Slot::Live(entry) => Ok(entry),
        Slot::Deleted => Err(CoreError::ContextNotFound(context_id.to_string())),
    }
}

async fn write_blob(
    storage: Arc<dyn StorageBackend>,
    codec: BlobCodec,
    record: ContextRecord,
    kv: KvTensors,
) -> Result<StorageRef, StorageError> {
    let id = record.context_id.clone();
    let blob = tokio::task::spawn_blocking(move || codec.encode(&record, &kv))
        .await
        .map_err(|e| StorageError::Encode(e.to_string()))??;
    storage.write_blob(&id, blob).await
}

fn promotion_failure(context_id: &str, err: DeviceError) -> CoreError {
    CoreError::PromotionFailure {
        context_id: context_id.to_string(),
        reason: err.to_string(),
    }
}

/// An admission upload that failed. Room was claimed beforehand, so this is
/// a transfer fault rather than a promotion.
fn admission_failure(context_id: &str, err: DeviceError) -> CoreError {
    match err {
        DeviceError::OutOfMemory { needed, .. } => capacity_exceeded(Tier::Hot, needed),
        DeviceError::TransferFailed(reason) => {
            CoreError::ComputeFailure(format!("upload of {context_id} failed: {reason}"))
        }
    }
}

fn capacity_exceeded(tier: Tier, needed: usize) -> CoreError {
    CoreError::CapacityExceeded {
        tier: tier.to_string(),
        needed,
    }
}
