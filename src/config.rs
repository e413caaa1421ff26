//! Runtime configuration for vpid-kv-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Every section has defaults, so a partial file only overrides what it names.
//! All tier-related knobs (capacities, admission policy, TTL) live here.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::registry::descriptor::Residency;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "vpid-kv-cache",
    about = "Multi-model inference server with vPID switching and a tiered context cache"
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Directory for durable context blobs (overrides the config file).
    #[arg(long)]
    pub storage_path: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model registry configuration.
    pub registry: RegistryConfig,

    /// Tier configuration.
    pub tiers: TierConfig,

    /// Eviction and admission policy.
    pub eviction: EvictionConfig,

    /// Durable storage settings.
    pub storage: StorageConfig,

    /// Reference engine geometry.
    pub engine: EngineConfig,

    /// Query defaults.
    pub query: QueryConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Maximum concurrent requests.
    pub max_concurrent_requests: usize,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:6930".to_string(),
            max_concurrent_requests: 64,
            request_timeout_secs: 300,
        }
    }
}

/// Model registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Where newly loaded weights are placed.
    pub default_residency: Residency,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_residency: Residency::Accelerator,
        }
    }
}

/// Tier capacities.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Accelerator memory budget for hot contexts, in bytes.
    pub hot_capacity_bytes: usize,

    /// Host memory budget for warm contexts, in bytes.
    pub warm_capacity_bytes: usize,

    /// Device memory available for uploads (0 = same as the hot budget).
    pub device_memory_bytes: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            hot_capacity_bytes: 4 * 1024 * 1024 * 1024,   // 4 GB
            warm_capacity_bytes: 16 * 1024 * 1024 * 1024, // 16 GB
            device_memory_bytes: 0,
        }
    }
}

impl TierConfig {
    /// Effective device memory size.
    pub fn device_memory(&self) -> usize {
        if self.device_memory_bytes == 0 {
            self.hot_capacity_bytes
        } else {
            self.device_memory_bytes
        }
    }
}

/// How a full tier makes room for a new entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Demote one LRU victim at a time until the new entry fits.
    SingleVictim,
    /// Demote LRU victims until usage is at or below the low watermark.
    Batch,
}

/// When capacity-pressure demotion runs relative to the admitting request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureMode {
    /// The admitting request demotes victims before it proceeds.
    Synchronous,
    /// Admit with a transient overcommit and rebalance in the background.
    Deferred,
}

/// Eviction policy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// TTL applied when an ingest does not specify one (0 = never expires).
    pub default_ttl_seconds: u64,

    /// Interval between background TTL sweeps.
    pub sweep_interval_secs: u64,

    /// Victim selection policy under capacity pressure.
    pub admission: AdmissionPolicy,

    /// Synchronous or deferred pressure handling.
    pub pressure: PressureMode,

    /// Batch policy target: fraction of capacity to demote down to.
    pub low_watermark: f64,

    /// How long an admission waits for leased or in-flight hot memory to be
    /// released before failing with capacity exceeded.
    pub lease_wait_ms: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 86_400,
            sweep_interval_secs: 30,
            admission: AdmissionPolicy::SingleVictim,
            pressure: PressureMode::Synchronous,
            low_watermark: 0.70,
            lease_wait_ms: 2_000,
        }
    }
}

/// Durable storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding context blobs.
    pub path: PathBuf,

    /// Apply zstd compression to blob payloads.
    pub zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Register persisted contexts as cold entries at startup.
    pub restore_on_startup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/vpid-kv-cache/contexts"),
            zstd_compression: true,
            zstd_level: 3,
            restore_on_startup: true,
        }
    }
}

/// Geometry of the reference engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of layers in the model.
    pub n_layers: usize,

    /// Number of KV heads.
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Vocabulary size.
    pub vocab_size: usize,

    /// Refuse to load models whose file does not exist.
    pub require_model_files: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_layers: 4,
            n_kv_heads: 2,
            head_dim: 16,
            vocab_size: 32_000,
            require_model_files: true,
        }
    }
}

/// Defaults applied to queries and completions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Tokens generated when the request does not say.
    pub default_max_tokens: usize,

    /// Upper bound on tokens generated per request.
    pub max_tokens_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 256,
            max_tokens_limit: 4096,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Apply command-line overrides.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(path) = &cli.storage_path {
            self.storage.path = path.clone();
        }
    }
}
