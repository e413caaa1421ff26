//! Tiered context cache.
//!
//! Precomputed document KV state moves between three tiers:
//!   accelerator memory (hot) → host memory (warm) → disk (cold)
//!
//! - [`entry`]: context entries, tiers and their representations
//! - [`ledger`]: per-tier capacity accounting and reservations
//! - [`evictor`]: LRU victim selection and TTL expiry
//! - [`manager`]: the cache manager coordinating all transitions
//! - [`sweeper`]: background TTL eviction

pub mod entry;
pub mod evictor;
pub mod ledger;
pub mod manager;
pub mod sweeper;

pub use entry::{ContextId, ContextInfo, Tier};
pub use manager::{CacheSettings, CacheStats, ContextCacheManager, ContextFilter, QueryLease};
