//! Model descriptors: one per loaded model.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{ModelSource, WeightsHandle};

/// Where a model's weights currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Residency {
    Accelerator,
    Host,
    Unloaded,
}

impl std::fmt::Display for Residency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Residency::Accelerator => write!(f, "accelerator"),
            Residency::Host => write!(f, "host"),
            Residency::Unloaded => write!(f, "unloaded"),
        }
    }
}

/// A virtual process descriptor for a loaded model.
///
/// The descriptor exclusively owns its weights handle; dropping the last
/// `Arc<ModelDescriptor>` releases the weights.
#[derive(Debug)]
pub struct ModelDescriptor {
    model_id: String,
    vpid: u32,
    source: ModelSource,
    weights: WeightsHandle,
    loaded_at: DateTime<Utc>,

    /// Milliseconds since the epoch; updated on every switch.
    last_used_ms: AtomicI64,
}

impl ModelDescriptor {
    pub(crate) fn new(
        model_id: String,
        vpid: u32,
        source: ModelSource,
        weights: WeightsHandle,
    ) -> Self {
        let now = Utc::now();
        Self {
            model_id,
            vpid,
            source,
            weights,
            loaded_at: now,
            last_used_ms: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn vpid(&self) -> u32 {
        self.vpid
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    pub fn weights(&self) -> &WeightsHandle {
        &self.weights
    }

    pub fn residency(&self) -> Residency {
        self.weights.residency()
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_used_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.loaded_at)
    }

    /// Record use at `now_ms`. A single atomic store, no allocation.
    pub(crate) fn touch(&self, now_ms: i64) {
        self.last_used_ms.store(now_ms, Ordering::Relaxed);
    }

    /// Serializable snapshot for listings.
    pub fn info(&self, active: bool) -> ModelInfo {
        ModelInfo {
            model_id: self.model_id.clone(),
            vpid: self.vpid,
            file_path: self.source.file_path.display().to_string(),
            model_type: self.source.model_type.to_string(),
            residency: self.residency(),
            size_bytes: self.weights.size_bytes(),
            loaded_at: self.loaded_at,
            last_used: self.last_used(),
            active,
        }
    }
}

/// Point-in-time view of a descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub vpid: u32,
    pub file_path: String,
    pub model_type: String,
    pub residency: Residency,
    pub size_bytes: u64,
    pub loaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub active: bool,
}
