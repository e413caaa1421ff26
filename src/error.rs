//! Structured error kinds returned by every core operation.
//!
//! Subsystems keep their own error enums ([`StorageError`], [`EngineError`],
//! `DeviceError`) and convert into [`CoreError`] at the component boundary.

use thiserror::Error;

use crate::engine::EngineError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("Model already loaded: {0}")]
    DuplicateModel(String),

    #[error("Model {0} is active; switch away first or force the unload")]
    ModelBusy(String),

    #[error("Failed to load model {model_id}: {reason}")]
    LoadFailure { model_id: String, reason: String },

    #[error("Context not found: {0}")]
    ContextNotFound(String),

    #[error("Context {context_id} belongs to model {expected}, not {requested}")]
    ModelMismatch {
        context_id: String,
        expected: String,
        requested: String,
    },

    #[error("No capacity in {tier} tier for {needed} bytes")]
    CapacityExceeded { tier: String, needed: usize },

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Storage corruption: {0}")]
    StorageCorruption(String),

    #[error("Promotion of {context_id} failed: {reason}")]
    PromotionFailure { context_id: String, reason: String },

    #[error("Compute engine failure: {0}")]
    ComputeFailure(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CoreError {
    /// Stable kind name surfaced to API clients.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::ModelNotLoaded(_) => "ModelNotLoaded",
            CoreError::DuplicateModel(_) => "DuplicateModel",
            CoreError::ModelBusy(_) => "ModelBusy",
            CoreError::LoadFailure { .. } => "LoadFailure",
            CoreError::ContextNotFound(_) => "ContextNotFound",
            CoreError::ModelMismatch { .. } => "ModelMismatch",
            CoreError::CapacityExceeded { .. } => "CapacityExceeded",
            CoreError::StorageFailure(_) => "StorageFailure",
            CoreError::StorageCorruption(_) => "StorageCorruption",
            CoreError::PromotionFailure { .. } => "PromotionFailure",
            CoreError::ComputeFailure(_) => "ComputeFailure",
            CoreError::InvalidRequest(_) => "InvalidRequest",
        }
    }

    /// Whether the failure indicates unrecoverable on-disk damage rather than
    /// a transient fault.
    pub fn is_corruption(&self) -> bool {
        matches!(self, CoreError::StorageCorruption(_))
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => {
                CoreError::StorageFailure(format!("durable copy of {id} is missing"))
            }
            StorageError::Corrupted { .. } => CoreError::StorageCorruption(err.to_string()),
            other => CoreError::StorageFailure(other.to_string()),
        }
    }
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        CoreError::ComputeFailure(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
