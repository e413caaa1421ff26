//! Per-tier capacity accounting.
//!
//! Space in a bounded tier is claimed with a [`Reservation`] before any I/O
//! starts. Committing the reservation turns it into a resident entry;
//! dropping it uncommitted (an error or a cancelled request) gives the space
//! back.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::entry::Tier;
use crate::metrics::Metrics;

/// Usage of one tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TierUsage {
    /// Number of resident entries.
    pub entries: usize,

    /// Bytes held by resident entries.
    pub bytes: usize,

    /// Capacity budget in bytes (None = unbounded).
    pub capacity: Option<usize>,

    /// Bytes claimed by in-flight transitions.
    #[serde(skip)]
    pub reserved: usize,
}

impl TierUsage {
    /// Bytes in use, counting in-flight reservations.
    pub fn committed_and_reserved(&self) -> usize {
        self.bytes + self.reserved
    }

    /// Usage as a fraction of capacity (0.0 for unbounded tiers).
    pub fn usage_fraction(&self) -> f64 {
        match self.capacity {
            Some(cap) if cap > 0 => self.committed_and_reserved() as f64 / cap as f64,
            _ => 0.0,
        }
    }

    fn fits(&self, bytes: usize) -> bool {
        match self.capacity {
            Some(cap) => self.committed_and_reserved() + bytes <= cap,
            None => true,
        }
    }

    /// Whether usage is over the budget (possible after a deferred admission).
    pub fn over_capacity(&self) -> bool {
        matches!(self.capacity, Some(cap) if self.committed_and_reserved() > cap)
    }
}

#[derive(Debug)]
struct LedgerState {
    tiers: HashMap<Tier, TierUsage>,
}

/// Shared tier ledger.
#[derive(Clone)]
pub struct TierLedger {
    state: Arc<Mutex<LedgerState>>,
    metrics: Arc<Metrics>,
}

impl TierLedger {
    pub fn new(hot_capacity: usize, warm_capacity: usize, metrics: Arc<Metrics>) -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            Tier::Hot,
            TierUsage {
                capacity: Some(hot_capacity),
                ..Default::default()
            },
        );
        tiers.insert(
            Tier::Warm,
            TierUsage {
                capacity: Some(warm_capacity),
                ..Default::default()
            },
        );
        tiers.insert(Tier::Cold, TierUsage::default());
        Self {
            state: Arc::new(Mutex::new(LedgerState { tiers })),
            metrics,
        }
    }

    /// Claim `bytes` in `tier` if it fits.
    pub fn try_reserve(&self, tier: Tier, bytes: usize) -> Option<Reservation> {
        let mut state = self.state.lock();
        let usage = state.tiers.entry(tier).or_default();
        if !usage.fits(bytes) {
            return None;
        }
        usage.reserved += bytes;
        Some(self.reservation(tier, bytes))
    }

    /// Claim `bytes` regardless of capacity (deferred admission).
    pub fn force_reserve(&self, tier: Tier, bytes: usize) -> Reservation {
        let mut state = self.state.lock();
        state.tiers.entry(tier).or_default().reserved += bytes;
        self.reservation(tier, bytes)
    }

    fn reservation(&self, tier: Tier, bytes: usize) -> Reservation {
        Reservation {
            ledger: self.clone(),
            tier,
            bytes,
            committed: false,
        }
    }

    /// Account a resident entry in `tier` directly (cold entries, restore).
    pub fn add(&self, tier: Tier, bytes: usize) {
        {
            let mut state = self.state.lock();
            let usage = state.tiers.entry(tier).or_default();
            usage.entries += 1;
            usage.bytes += bytes;
        }
        self.publish(tier);
    }

    /// Remove a resident entry from `tier`.
    pub fn release(&self, tier: Tier, bytes: usize) {
        {
            let mut state = self.state.lock();
            let usage = state.tiers.entry(tier).or_default();
            usage.entries = usage.entries.saturating_sub(1);
            usage.bytes = usage.bytes.saturating_sub(bytes);
        }
        self.publish(tier);
    }

    pub fn usage(&self, tier: Tier) -> TierUsage {
        self.state
            .lock()
            .tiers
            .get(&tier)
            .cloned()
            .unwrap_or_default()
    }

    pub fn capacity(&self, tier: Tier) -> Option<usize> {
        self.usage(tier).capacity
    }

    fn publish(&self, tier: Tier) {
        let usage = self.usage(tier);
        self.metrics
            .tier_entries
            .with_label_values(&[tier.as_str()])
            .set(usage.entries as i64);
        self.metrics
            .tier_bytes
            .with_label_values(&[tier.as_str()])
            .set(usage.bytes as i64);
    }
}

/// Claimed but not yet committed tier space.
pub struct Reservation {
    ledger: TierLedger,
    tier: Tier,
    bytes: usize,
    committed: bool,
}

impl Reservation {
    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Turn the reservation into a resident entry.
    pub fn commit(mut self) {
        {
            let mut state = self.ledger.state.lock();
            let usage = state.tiers.entry(self.tier).or_default();
            usage.reserved = usage.reserved.saturating_sub(self.bytes);
            usage.entries += 1;
            usage.bytes += self.bytes;
        }
        self.committed = true;
        self.ledger.publish(self.tier);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.ledger.state.lock();
        let usage = state.tiers.entry(self.tier).or_default();
        usage.reserved = usage.reserved.saturating_sub(self.bytes);
    }
}
