//! Splits batched model output into one raw prediction object per chunk.
//!
//! Batch prediction jobs write `prediction.results-<n>-of-<total>` shards, each
//! holding one JSON line per chunk. Once every shard of a scenario is present,
//! each line is copied to `<batch>/<type>/<model>/<area>/<scenario>/<chunk_id>`.

use std::time::Instant;

use rayon::prelude::*;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::{first_failure, PipelineError};
use crate::keys::{BatchKey, ChunkKey};
use crate::raster::PredictionInstance;
use crate::storage::ObjectStore;

pub const SHARD_KEY_FORMAT: &str = concat!(
    "<id>/<prediction_type>/<model_id>/<study_area_name>/<scenario_id>/",
    "prediction.results-<file_number>-of-<number_of_files>"
);

const SHARD_PREFIX: &str = "prediction.results";

/// A parsed shard key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardKey {
    pub batch: BatchKey,
    pub scenario_id: String,
    pub file_number: u32,
    pub file_count: u32,
}

impl ShardKey {
    pub fn parse(key: &str) -> Result<Self, PipelineError> {
        let malformed =
            || PipelineError::MalformedKey { key: key.to_string(), expected: SHARD_KEY_FORMAT };
        let parts: Vec<&str> = key.split('/').collect();
        let [batch_id, prediction_type, model_id, study_area, scenario_id, filename] =
            parts.as_slice()
        else {
            return Err(malformed());
        };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(malformed());
        }
        let (n, total) = filename
            .strip_prefix(SHARD_PREFIX)
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.split_once("-of-"))
            .ok_or_else(malformed)?;
        let file_number = n.parse().map_err(|_| malformed())?;
        let file_count = total.parse().map_err(|_| malformed())?;
        Ok(Self {
            batch: BatchKey::new(*batch_id, *prediction_type, *model_id, *study_area),
            scenario_id: scenario_id.to_string(),
            file_number,
            file_count,
        })
    }

    /// Listing prefix matching every shard of this scenario.
    pub fn shards_prefix(&self) -> String {
        format!("{}/{}/{SHARD_PREFIX}", self.batch, self.scenario_id)
    }
}

#[derive(Debug)]
pub enum SplitOutcome {
    /// Not every shard has landed yet; a later shard write will retrigger.
    NotYetComplete { found: usize, expected: usize },
    /// Raw per-chunk keys written, in shard then line order.
    Split { keys: Vec<String> },
    /// A non-retriable failure, already logged.
    Rejected(PipelineError),
}

#[derive(Deserialize)]
struct RoutedLine {
    #[serde(default)]
    instance: Option<PredictionInstance>,
}

pub struct PredictionSplitter<'a> {
    input: &'a dyn ObjectStore,
    output: &'a dyn ObjectStore,
    io_threads: usize,
}

impl<'a> PredictionSplitter<'a> {
    pub fn new(input: &'a dyn ObjectStore, output: &'a dyn ObjectStore, io_threads: usize) -> Self {
        Self { input, output, io_threads: io_threads.max(1) }
    }

    pub fn run(&self, object_key: &str) -> Result<SplitOutcome, PipelineError> {
        let started = Instant::now();
        let shard = ShardKey::parse(object_key)?;
        let shards = self.input.list(&shard.shards_prefix())?;
        let expected = shard.file_count as usize;
        if shards.len() != expected {
            if shards.len() > expected {
                warn!(
                    object_key,
                    found = shards.len(),
                    expected,
                    "more prediction shards than announced"
                );
            } else {
                debug!(
                    object_key,
                    found = shards.len(),
                    expected,
                    "waiting for remaining prediction shards"
                );
            }
            return Ok(SplitOutcome::NotYetComplete { found: shards.len(), expected });
        }

        let mut routed: Vec<(String, String)> = Vec::new();
        for shard_key in &shards {
            let bytes = self
                .input
                .get(shard_key)?
                .ok_or_else(|| PipelineError::MissingPredictions { key: shard_key.clone() })?;
            let text = String::from_utf8_lossy(&bytes);
            for (i, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
                let bad = |reason: String| PipelineError::MalformedPredictionLine {
                    key: shard_key.clone(),
                    line: i + 1,
                    reason,
                };
                let parsed: RoutedLine =
                    serde_json::from_str(line).map_err(|e| bad(e.to_string()))?;
                let chunk_id = parsed
                    .instance
                    .and_then(|inst| inst.chunk_id())
                    .ok_or_else(|| bad("missing instance.key".into()))?;
                let target = ChunkKey {
                    batch: shard.batch.clone(),
                    scenario_id: shard.scenario_id.clone(),
                    chunk_id,
                };
                routed.push((target.raw_key(), format!("{line}\n")));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.io_threads)
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
        let results: Vec<Result<String, PipelineError>> = pool.install(|| {
            routed
                .par_iter()
                .map(|(key, line)| {
                    self.output.put(key, line.as_bytes())?;
                    Ok(key.clone())
                })
                .collect()
        });
        let keys = first_failure(results)?;

        info!(
            object_key,
            chunks = keys.len(),
            shards = shards.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "split predictions into chunk files"
        );
        Ok(SplitOutcome::Split { keys })
    }

    /// Runs [`Self::run`], absorbing non-retriable failures.
    pub fn handle(&self, object_key: &str) -> Result<SplitOutcome, PipelineError> {
        match self.run(object_key) {
            Err(e) if !e.is_retriable() => {
                error!(object_key, kind = %e.kind(), error = %e, "rejected prediction shard");
                Ok(SplitOutcome::Rejected(e))
            }
            other => other,
        }
    }
}
