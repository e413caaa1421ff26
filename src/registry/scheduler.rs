//! Model switch scheduler.
//!
//! A switch is a pointer change: no I/O, no weight copy. Each request takes
//! a ticket on entry so that concurrent switches resolve to the logically
//! last one, whatever order they reach the registry in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::info;

use crate::error::CoreResult;
use crate::metrics::Metrics;
use crate::registry::descriptor::ModelDescriptor;
use crate::registry::{ModelRegistry, SwitchTicket};

/// Outcome of a switch request.
#[derive(Debug)]
pub struct SwitchOutcome {
    pub descriptor: Arc<ModelDescriptor>,
    pub sequence: u64,
    pub superseded: bool,
    pub elapsed: Duration,
}

pub struct SwitchScheduler {
    registry: Arc<ModelRegistry>,
    metrics: Arc<Metrics>,
    next_seq: AtomicU64,
}

impl SwitchScheduler {
    pub fn new(registry: Arc<ModelRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            registry,
            metrics,
            next_seq: AtomicU64::new(1),
        }
    }

    /// Make `model_id` the active model.
    pub fn switch(&self, model_id: &str) -> CoreResult<SwitchOutcome> {
        let start = Instant::now();
        let ticket = SwitchTicket::new(self.next_seq.fetch_add(1, Ordering::SeqCst));
        let applied = self.registry.set_active(model_id, ticket)?;
        let elapsed = start.elapsed();

        self.metrics.switches.inc();
        self.metrics.switch_latency.observe(elapsed.as_secs_f64());
        info!(
            model_id,
            vpid = applied.descriptor.vpid(),
            sequence = ticket.sequence(),
            superseded = applied.superseded,
            elapsed_us = elapsed.as_micros() as u64,
            "Model switch"
        );

        Ok(SwitchOutcome {
            descriptor: applied.descriptor,
            sequence: ticket.sequence(),
            superseded: applied.superseded,
            elapsed,
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }
}
