//! vpid-kv-cache: multi-model inference with vPID switching and a tiered
//! context cache.
//!
//! Loaded models are tracked as virtual process descriptors; switching the
//! active model is a pointer swap. Ingested documents are prefilled once and
//! their KV state is kept in a hierarchy of tiers:
//!   accelerator memory (hot) → host memory (warm) → disk (cold)
//!
//! - [`registry`]: model descriptors and the switch scheduler
//! - [`cache`]: the tiered context cache
//! - [`pipeline`]: ingest, query and direct generation
//! - [`engine`]: compute engine interface and the reference engine
//! - [`storage`]: durable blob storage
//! - [`transfer`]: accelerator memory pool
//! - [`server`]: HTTP API

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod server;
pub mod service;
pub mod storage;
pub mod transfer;

pub use error::{CoreError, CoreResult};
pub use service::VpidService;
