//! Run configuration.
//!
//! Loaded from an optional JSON file; every field has a default so an empty
//! object (or no file at all) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::caller::TierModels;
use crate::gateway::GatewayConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Knobs the execution engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Max in-flight fast-tier calls (units, files).
    #[serde(default = "default_fast_concurrency")]
    pub fast_concurrency: usize,
    /// Max in-flight strong-tier calls (directories, modules, root).
    #[serde(default = "default_strong_concurrency")]
    pub strong_concurrency: usize,
    /// Root child-summary tokens above which the root gathers iteratively.
    #[serde(default = "default_deep_mode_threshold_tokens")]
    pub deep_mode_threshold_tokens: usize,
    #[serde(default = "default_directory_chunk_size")]
    pub directory_chunk_size: usize,
    #[serde(default = "default_module_cluster_size")]
    pub module_cluster_size: usize,
    #[serde(default = "default_max_batch_units")]
    pub max_batch_units: usize,
    #[serde(default = "default_max_batch_tokens")]
    pub max_batch_tokens: usize,
    /// Units above this many tokens are never batched.
    #[serde(default = "default_batchable_unit_tokens")]
    pub batchable_unit_tokens: usize,
    #[serde(default = "default_max_root_iterations")]
    pub max_root_iterations: usize,
    #[serde(default = "default_true")]
    pub resume: bool,
    #[serde(default)]
    pub diff_only: bool,
}

fn default_fast_concurrency() -> usize {
    8
}
fn default_strong_concurrency() -> usize {
    2
}
fn default_deep_mode_threshold_tokens() -> usize {
    6_000
}
fn default_directory_chunk_size() -> usize {
    40
}
fn default_module_cluster_size() -> usize {
    12
}
fn default_max_batch_units() -> usize {
    6
}
fn default_max_batch_tokens() -> usize {
    3_000
}
fn default_batchable_unit_tokens() -> usize {
    800
}
fn default_max_root_iterations() -> usize {
    4
}
fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fast_concurrency: default_fast_concurrency(),
            strong_concurrency: default_strong_concurrency(),
            deep_mode_threshold_tokens: default_deep_mode_threshold_tokens(),
            directory_chunk_size: default_directory_chunk_size(),
            module_cluster_size: default_module_cluster_size(),
            max_batch_units: default_max_batch_units(),
            max_batch_tokens: default_max_batch_tokens(),
            batchable_unit_tokens: default_batchable_unit_tokens(),
            max_root_iterations: default_max_root_iterations(),
            resume: true,
            diff_only: false,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("fast_concurrency", self.fast_concurrency),
            ("strong_concurrency", self.strong_concurrency),
            ("directory_chunk_size", self.directory_chunk_size),
            ("module_cluster_size", self.module_cluster_size),
            ("max_batch_units", self.max_batch_units),
            ("max_root_iterations", self.max_root_iterations),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TiersConfig {
    #[serde(default = "default_fast_model")]
    pub fast_model: String,
    #[serde(default = "default_strong_model")]
    pub strong_model: String,
    #[serde(default = "default_fast_max_output_tokens")]
    pub fast_max_output_tokens: u32,
    #[serde(default = "default_strong_max_output_tokens")]
    pub strong_max_output_tokens: u32,
}

fn default_fast_model() -> String {
    "anthropic/claude-3-5-haiku".to_string()
}
fn default_strong_model() -> String {
    "anthropic/claude-sonnet-4".to_string()
}
fn default_fast_max_output_tokens() -> u32 {
    600
}
fn default_strong_max_output_tokens() -> u32 {
    1_500
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            fast_model: default_fast_model(),
            strong_model: default_strong_model(),
            fast_max_output_tokens: default_fast_max_output_tokens(),
            strong_max_output_tokens: default_strong_max_output_tokens(),
        }
    }
}

impl TiersConfig {
    pub fn models(&self) -> TierModels {
        TierModels {
            fast_model: self.fast_model.clone(),
            strong_model: self.strong_model.clone(),
            fast_max_output_tokens: self.fast_max_output_tokens,
            strong_max_output_tokens: self.strong_max_output_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GatewaySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    1_000
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl GatewaySettings {
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScanConfig {
    /// Gitignore-style exclusions; a bare name matches at any depth.
    #[serde(default = "default_ignore")]
    pub ignore: Vec<String>,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_ignore() -> Vec<String> {
    [
        ".git",
        "target",
        "node_modules",
        "__pycache__",
        ".venv",
        "venv",
        "dist",
        "build",
        ".synopsis*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_max_file_bytes() -> u64 {
    256 * 1024
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore: default_ignore(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,
    /// Manifests kept per repository after each run.
    #[serde(default = "default_manifest_retention")]
    pub manifest_retention: usize,
}

fn default_cache_path() -> PathBuf {
    crate::cache::SqliteSummaryCache::default_path()
}
fn default_checkpoint_path() -> PathBuf {
    crate::checkpoint::SqliteCheckpointStore::default_path()
}
fn default_manifest_dir() -> PathBuf {
    crate::manifest::ManifestStore::default_dir()
}
fn default_manifest_retention() -> usize {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            checkpoint_path: default_checkpoint_path(),
            manifest_dir: default_manifest_dir(),
            manifest_retention: default_manifest_retention(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct SynopsisConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub tiers: TiersConfig,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl SynopsisConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: "<inline>".to_string(),
            source,
        })?;
        config.engine.validate()?;
        Ok(config)
    }

    /// `path` when given, otherwise defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
