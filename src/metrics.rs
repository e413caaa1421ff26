//! Prometheus metrics.
//!
//! All collectors live in one [`Metrics`] value with its own registry, so
//! several servers (or tests) in one process do not collide.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    /// Completed model switches.
    pub switches: IntCounter,

    /// Switch latency in seconds.
    pub switch_latency: Histogram,

    /// Cache lookups by result (hit | miss).
    pub cache_lookups: IntCounterVec,

    /// Tier transitions by source and destination tier.
    pub tier_transitions: IntCounterVec,

    /// Entries per tier.
    pub tier_entries: IntGaugeVec,

    /// Bytes per tier.
    pub tier_bytes: IntGaugeVec,

    /// Evictions by reason (ttl | delete).
    pub evictions: IntCounterVec,

    /// Completed ingests.
    pub ingests: IntCounter,

    /// Failed durable writes, reads and deletes.
    pub storage_failures: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("vpid".to_string()), None)?;

        let switches = IntCounter::new("model_switches_total", "Completed model switches")?;
        let switch_latency = Histogram::with_opts(
            HistogramOpts::new("model_switch_seconds", "Model switch latency").buckets(vec![
                0.000_001, 0.000_005, 0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.01,
            ]),
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new("cache_lookups_total", "Context lookups by result"),
            &["result"],
        )?;
        let tier_transitions = IntCounterVec::new(
            Opts::new("tier_transitions_total", "Context tier transitions"),
            &["from", "to"],
        )?;
        let tier_entries = IntGaugeVec::new(
            Opts::new("tier_entries", "Contexts resident per tier"),
            &["tier"],
        )?;
        let tier_bytes =
            IntGaugeVec::new(Opts::new("tier_bytes", "KV bytes per tier"), &["tier"])?;
        let evictions = IntCounterVec::new(
            Opts::new("evictions_total", "Contexts removed by reason"),
            &["reason"],
        )?;
        let ingests = IntCounter::new("ingests_total", "Completed document ingests")?;
        let storage_failures = IntCounterVec::new(
            Opts::new("storage_failures_total", "Failed storage operations"),
            &["op"],
        )?;

        registry.register(Box::new(switches.clone()))?;
        registry.register(Box::new(switch_latency.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(tier_transitions.clone()))?;
        registry.register(Box::new(tier_entries.clone()))?;
        registry.register(Box::new(tier_bytes.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(ingests.clone()))?;
        registry.register(Box::new(storage_failures.clone()))?;

        Ok(Self {
            registry,
            switches,
            switch_latency,
            cache_lookups,
            tier_transitions,
            tier_entries,
            tier_bytes,
            evictions,
            ingests,
            storage_failures,
        })
    }

    /// Render all metrics in the text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
