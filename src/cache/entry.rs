//! Context entries and their tier representations.
//!
//! An entry's KV payload lives in exactly one representation at a time:
//! device buffers (hot), host buffers (warm) or a storage blob (cold).

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::storage::codec::ContextRecord;
use crate::storage::{StorageError, StorageRef};
use crate::transfer::{DeviceBuffers, HostBuffers};

/// Context identifier (`ctx_<uuid>`).
pub type ContextId = String;

/// Generate a fresh context id.
pub fn new_context_id() -> ContextId {
    format!("ctx_{}", uuid::Uuid::new_v4().simple())
}

/// Storage tier. Ordered hot < warm < cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Accelerator memory.
    Hot,
    /// Host memory.
    Warm,
    /// Disk only.
    Cold,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(Tier::Hot),
            "warm" => Ok(Tier::Warm),
            "cold" => Ok(Tier::Cold),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Live representation of an entry's payload.
#[derive(Debug)]
pub enum Residence {
    Hot(Arc<DeviceBuffers>),
    Warm(HostBuffers),
    Cold(StorageRef),
}

impl Residence {
    pub fn tier(&self) -> Tier {
        match self {
            Residence::Hot(_) => Tier::Hot,
            Residence::Warm(_) => Tier::Warm,
            Residence::Cold(_) => Tier::Cold,
        }
    }
}

/// State of the entry's durable copy.
#[derive(Debug)]
pub enum Durability {
    /// Background write still in flight.
    Pending(JoinHandle<Result<StorageRef, StorageError>>),
    Persisted(StorageRef),
    /// The background write failed; a synchronous write is needed before
    /// the payload may leave memory.
    Missing,
}

/// A cached context, guarded by its per-entry lock.
#[derive(Debug)]
pub struct ContextEntry {
    pub record: ContextRecord,

    /// Size of the uncompressed KV payload.
    pub kv_bytes: usize,

    pub residence: Residence,

    pub durability: Durability,
}

impl ContextEntry {
    pub fn tier(&self) -> Tier {
        self.residence.tier()
    }

    pub fn context_id(&self) -> &str {
        &self.record.context_id
    }

    /// Bytes charged to the current tier: the KV size while in memory, the
    /// stored blob size once cold.
    pub fn tier_bytes(&self) -> usize {
        match &self.residence {
            Residence::Cold(sref) => sref.stored_bytes as usize,
            _ => self.kv_bytes,
        }
    }
}

/// What the per-entry lock protects. `Deleted` is terminal: requests that
/// were waiting on the lock observe it and report the context as missing.
#[derive(Debug)]
pub enum Slot {
    Live(ContextEntry),
    Deleted,
}

/// Point-in-time view of an entry, served from the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInfo {
    pub context_id: ContextId,
    pub model_id: String,
    pub name: String,
    pub token_count: usize,
    pub tier: Tier,
    pub size_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,

    /// 0 = never expires.
    pub ttl_seconds: u64,
    pub content_hash: String,
}

impl ContextInfo {
    pub fn from_record(record: &ContextRecord, tier: Tier, size_bytes: usize) -> Self {
        Self {
            context_id: record.context_id.clone(),
            model_id: record.model_id.clone(),
            name: record.name.clone(),
            token_count: record.token_count,
            tier,
            size_bytes,
            created_at: record.created_at,
            last_accessed: Utc::now(),
            access_count: 0,
            ttl_seconds: record.ttl_seconds,
            content_hash: record.content_hash.clone(),
        }
    }

    /// Whether the TTL has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        let idle_ms = (now - self.last_accessed).num_milliseconds();
        idle_ms > (self.ttl_seconds as i64).saturating_mul(1000)
    }
}

/// Catalog row: entry metadata plus its recency position.
#[derive(Debug, Clone)]
pub struct CatalogRecord {
    pub info: ContextInfo,

    /// Logical access clock; lower is less recently used.
    pub lru_tick: u64,
}
