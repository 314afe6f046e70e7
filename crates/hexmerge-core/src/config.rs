//! Runtime configuration: an optional JSON file, then environment overrides.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::Aggregation;
use crate::error::PipelineError;
use crate::hex::{HexGrid, DEFAULT_RESOLUTION};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{var}={value:?} is invalid: {reason}")]
    Env { var: &'static str, value: String, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Aggregation function per prediction type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub default: Aggregation,
    pub by_prediction_type: BTreeMap<String, Aggregation>,
}

impl AggregationConfig {
    pub fn for_prediction_type(&self, prediction_type: &str) -> Aggregation {
        self.by_prediction_type.get(prediction_type).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Prepended to every bucket name, e.g. `test-` for staging.
    pub bucket_prefix: String,
    pub batch_predictions_bucket: String,
    pub chunk_predictions_bucket: String,
    pub spatialized_bucket: String,
    pub merged_bucket: String,
    pub h3_resolution: u8,
    /// CPU-bound workers for chunk-subset merges. `None` uses all cores but one.
    pub max_workers: Option<usize>,
    /// Threads per worker for object reads and writes.
    pub io_threads: usize,
    pub aggregation: AggregationConfig,
    /// Held merge locks older than this are reported as stale.
    pub lock_stale_after_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            bucket_prefix: String::new(),
            batch_predictions_bucket: "predictions".into(),
            chunk_predictions_bucket: "chunk-predictions".into(),
            spatialized_bucket: "spatialized-chunk-predictions".into(),
            merged_bucket: "spatialized-merged-predictions".into(),
            h3_resolution: DEFAULT_RESOLUTION,
            max_workers: None,
            io_threads: 8,
            aggregation: AggregationConfig::default(),
            lock_stale_after_secs: None,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|e| ConfigError::Env { var, reason: e.to_string(), value })
}

impl PipelineConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Reads `path` if given, applies environment overrides and validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let bytes = std::fs::read(p)
                    .map_err(|source| ConfigError::Io { path: p.to_path_buf(), source })?;
                Self::from_json(&bytes)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `BUCKET_PREFIX`, `H3_RESOLUTION`, `MAX_WORKERS`, `IO_THREADS`
    /// and `LOCK_STALE_AFTER_SECS` from `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("BUCKET_PREFIX") {
            self.bucket_prefix = v;
        }
        if let Some(v) = lookup("H3_RESOLUTION") {
            self.h3_resolution = parse_env("H3_RESOLUTION", v)?;
        }
        if let Some(v) = lookup("MAX_WORKERS") {
            self.max_workers = Some(parse_env("MAX_WORKERS", v)?);
        }
        if let Some(v) = lookup("IO_THREADS") {
            self.io_threads = parse_env("IO_THREADS", v)?;
        }
        if let Some(v) = lookup("LOCK_STALE_AFTER_SECS") {
            self.lock_stale_after_secs = Some(parse_env("LOCK_STALE_AFTER_SECS", v)?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.h3_resolution > 15 {
            return Err(ConfigError::Invalid(format!(
                "h3_resolution must be 0..=15, got {}",
                self.h3_resolution
            )));
        }
        if self.io_threads == 0 {
            return Err(ConfigError::Invalid("io_threads must be at least 1".into()));
        }
        if self.max_workers == Some(0) {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        Ok(())
    }

    pub fn bucket(&self, name: &str) -> String {
        format!("{}{}", self.bucket_prefix, name)
    }

    /// Worker count for chunk-subset merges.
    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, |n| n.get().saturating_sub(1).max(1))
        })
    }

    pub fn grid(&self) -> Result<HexGrid, PipelineError> {
        HexGrid::new(self.h3_resolution)
    }

    pub fn lock_stale_after(&self) -> Option<chrono::Duration> {
        self.lock_stale_after_secs
            .and_then(|s| i64::try_from(s).ok())
            .map(chrono::Duration::seconds)
    }
}
