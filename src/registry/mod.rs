//! vPID registry: the set of loaded models and the single active slot.
//!
//! - [`descriptor`]: per-model descriptor and residency
//! - [`scheduler`]: sequence-ticketed model switching
//!
//! Lock order inside the registry is always the model map, then the switch
//! lock. The active slot itself is an [`ArcSwapOption`] so readers never
//! block and never see a torn reference.

pub mod descriptor;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn};

use crate::engine::{ComputeEngine, ModelSource};
use crate::error::{CoreError, CoreResult};
use descriptor::{ModelDescriptor, ModelInfo, Residency};

/// Monotonic switch sequence number. Only the scheduler issues these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwitchTicket(u64);

impl SwitchTicket {
    pub(crate) fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }
}

/// Result of applying a ticketed switch.
#[derive(Debug)]
pub struct SwitchApplied {
    pub descriptor: Arc<ModelDescriptor>,

    /// A newer switch had already been applied; the active slot is unchanged.
    pub superseded: bool,
}

pub struct ModelRegistry {
    engine: Arc<dyn ComputeEngine>,
    default_residency: Residency,
    models: RwLock<HashMap<String, Arc<ModelDescriptor>>>,
    active: ArcSwapOption<ModelDescriptor>,

    /// Sequence of the last applied switch.
    switch_lock: Mutex<u64>,
    next_vpid: AtomicU32,
}

impl ModelRegistry {
    pub fn new(engine: Arc<dyn ComputeEngine>, default_residency: Residency) -> Self {
        Self {
            engine,
            default_residency,
            models: RwLock::new(HashMap::new()),
            active: ArcSwapOption::const_empty(),
            switch_lock: Mutex::new(0),
            next_vpid: AtomicU32::new(1),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ComputeEngine> {
        &self.engine
    }

    /// Load a model and register its descriptor. The model is not made active.
    pub async fn load(
        &self,
        model_id: &str,
        source: ModelSource,
    ) -> CoreResult<Arc<ModelDescriptor>> {
        if model_id.trim().is_empty() {
            return Err(CoreError::InvalidRequest("model_id must not be empty".into()));
        }
        if self.models.read().contains_key(model_id) {
            return Err(CoreError::DuplicateModel(model_id.to_string()));
        }

        // Weights are materialized without holding the map lock.
        let weights = self
            .engine
            .load_weights(model_id, &source, self.default_residency)
            .await
            .map_err(|e| CoreError::LoadFailure {
                model_id: model_id.to_string(),
                reason: e.to_string(),
            })?;

        let descriptor = {
            let mut models = self.models.write();
            if models.contains_key(model_id) {
                None
            } else {
                let vpid = self.next_vpid.fetch_add(1, Ordering::Relaxed);
                let descriptor = Arc::new(ModelDescriptor::new(
                    model_id.to_string(),
                    vpid,
                    source,
                    weights,
                ));
                models.insert(model_id.to_string(), descriptor.clone());
                Some(descriptor)
            }
        };

        match descriptor {
            Some(descriptor) => {
                info!(
                    model_id,
                    vpid = descriptor.vpid(),
                    residency = %descriptor.residency(),
                    "Model loaded"
                );
                Ok(descriptor)
            }
            None => {
                warn!(model_id, "Concurrent load won the race; dropping duplicate weights");
                Err(CoreError::DuplicateModel(model_id.to_string()))
            }
        }
    }

    /// Unload a model. An active model is only unloaded with `force`, which
    /// also clears the active slot.
    pub fn unload(&self, model_id: &str, force: bool) -> CoreResult<()> {
        let removed = {
            let mut models = self.models.write();
            if !models.contains_key(model_id) {
                return Err(CoreError::ModelNotLoaded(model_id.to_string()));
            }
            let _last_applied = self.switch_lock.lock();
            let is_active = matches!(&*self.active.load(), Some(d) if d.model_id() == model_id);
            if is_active {
                if !force {
                    return Err(CoreError::ModelBusy(model_id.to_string()));
                }
                self.active.store(None);
            }
            models.remove(model_id)
        };

        // Weights are released once the last in-flight request drops its Arc.
        if let Some(descriptor) = removed {
            info!(model_id, vpid = descriptor.vpid(), force, "Model unloaded");
        }
        Ok(())
    }

    /// Apply a ticketed switch. Older tickets than the last applied one are
    /// reported as superseded and leave the active slot alone.
    pub fn set_active(&self, model_id: &str, ticket: SwitchTicket) -> CoreResult<SwitchApplied> {
        let models = self.models.read();
        let descriptor = models
            .get(model_id)
            .ok_or_else(|| CoreError::ModelNotLoaded(model_id.to_string()))?
            .clone();

        let mut last_applied = self.switch_lock.lock();
        if ticket.0 <= *last_applied {
            return Ok(SwitchApplied {
                descriptor,
                superseded: true,
            });
        }
        *last_applied = ticket.0;
        descriptor.touch(Utc::now().timestamp_millis());
        self.active.store(Some(descriptor.clone()));

        Ok(SwitchApplied {
            descriptor,
            superseded: false,
        })
    }

    /// The active descriptor, if any.
    pub fn active(&self) -> Option<Arc<ModelDescriptor>> {
        self.active.load_full()
    }

    pub fn get(&self, model_id: &str) -> CoreResult<Arc<ModelDescriptor>> {
        self.models
            .read()
            .get(model_id)
            .cloned()
            .ok_or_else(|| CoreError::ModelNotLoaded(model_id.to_string()))
    }

    /// An explicit model, or the active one when none is named.
    pub fn resolve(&self, model_id: Option<&str>) -> CoreResult<Arc<ModelDescriptor>> {
        match model_id {
            Some(id) => self.get(id),
            None => self
                .active()
                .ok_or_else(|| CoreError::ModelNotLoaded("no active model".into())),
        }
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.read().contains_key(model_id)
    }

    /// All loaded models ordered by vPID.
    pub fn list(&self) -> Vec<ModelInfo> {
        let active = self.active();
        let active_id = active.as_ref().map(|d| d.model_id());
        let mut infos: Vec<ModelInfo> = self
            .models
            .read()
            .values()
            .map(|d| d.info(Some(d.model_id()) == active_id))
            .collect();
        infos.sort_by_key(|info| info.vpid);
        infos
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }
}
