//! Eviction policy: decides which contexts leave a tier.
//!
//! Capacity pressure uses least-recently-accessed order within a tier. TTL
//! expiry is independent of tier and capacity.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::cache::entry::{CatalogRecord, ContextId, Tier};

/// An eviction candidate with its recency.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub context_id: ContextId,
    pub lru_tick: u64,
    pub size_bytes: usize,
}

impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.lru_tick == other.lru_tick
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lru_tick.cmp(&other.lru_tick)
    }
}

/// Select up to `count` contexts in `tier`, least recently used first.
/// Contexts in `protected` are never selected.
pub fn select_victims<'a>(
    records: impl Iterator<Item = &'a CatalogRecord>,
    tier: Tier,
    count: usize,
    protected: &[&str],
) -> Vec<EvictionCandidate> {
    let mut heap = BinaryHeap::new();
    for record in records {
        if record.info.tier != tier {
            continue;
        }
        if protected.contains(&record.info.context_id.as_str()) {
            continue;
        }
        heap.push(Reverse(EvictionCandidate {
            context_id: record.info.context_id.clone(),
            lru_tick: record.lru_tick,
            size_bytes: record.info.size_bytes,
        }));
    }

    let mut victims = Vec::with_capacity(count.min(heap.len()));
    while victims.len() < count {
        match heap.pop() {
            Some(Reverse(candidate)) => victims.push(candidate),
            None => break,
        }
    }
    victims
}

/// Contexts whose TTL has elapsed at `now`.
pub fn expired<'a>(
    records: impl Iterator<Item = &'a CatalogRecord>,
    now: DateTime<Utc>,
) -> Vec<ContextId> {
    records
        .filter(|record| record.info.is_expired(now))
        .map(|record| record.info.context_id.clone())
        .collect()
}
