//! Scenario merge coordination.
//!
//! Each per-scenario hex table write triggers [`MergeCoordinator::handle`].
//! Most triggers find the batch incomplete and return. The one that sees every
//! expected table takes the batch's merge lock, fans the chunks out over a
//! worker pool and releases the lock on every exit path.

pub mod chunk;
pub mod lock;
pub mod manifest;

use std::time::Instant;

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::{first_failure, PipelineError};
use crate::keys::{BatchKey, ChunkKey};
use crate::metadata::{LockRecord, LockStore, MetadataStore};
use crate::storage::ObjectStore;

pub use chunk::ScenarioMerger;
pub use lock::{is_stale, Acquisition, MergeLockGuard};
pub use manifest::{chunk_ids_by_scenario, ChunkIdsByScenario, Completeness, ScenarioManifest};

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Parallel chunk-subset workers.
    pub workers: usize,
    /// Read/write threads inside each worker.
    pub io_threads: usize,
    pub lock_stale_after: Option<chrono::Duration>,
    /// Recorded in the lock document for operators.
    pub holder: String,
}

impl MergeOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            workers: config.workers(),
            io_threads: config.io_threads,
            lock_stale_after: config.lock_stale_after(),
            holder: format!("pid-{}", std::process::id()),
        }
    }
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[derive(Debug)]
pub enum MergeOutcome {
    /// The trigger key is not a per-scenario hex table.
    Ignored,
    NotYetComplete,
    /// Another invocation holds the lock.
    AlreadyRunning { lock: Option<LockRecord>, stale: bool },
    Merged { chunks: usize, hexes: usize },
    /// A non-retriable failure, already logged. Any lock taken was released.
    Rejected(PipelineError),
}

pub struct MergeCoordinator<'a> {
    metadata: &'a dyn MetadataStore,
    locks: &'a dyn LockStore,
    /// Per-scenario hex tables.
    input: &'a dyn ObjectStore,
    /// Merged wide tables.
    output: &'a dyn ObjectStore,
    options: MergeOptions,
}

/// Splits `items` into at most `workers` contiguous subsets of near-equal size.
pub fn partition<T: Clone>(items: &[T], workers: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let size = items.len().div_ceil(workers.max(1));
    items.chunks(size).map(<[T]>::to_vec).collect()
}

impl<'a> MergeCoordinator<'a> {
    pub fn new(
        metadata: &'a dyn MetadataStore,
        locks: &'a dyn LockStore,
        input: &'a dyn ObjectStore,
        output: &'a dyn ObjectStore,
        options: MergeOptions,
    ) -> Self {
        Self { metadata, locks, input, output, options }
    }

    /// Handles one trigger. Non-retriable failures come back as
    /// [`MergeOutcome::Rejected`]; only retriable ones are `Err`.
    pub fn handle(&self, object_key: &str) -> Result<MergeOutcome, PipelineError> {
        let key = match ChunkKey::parse_table(object_key) {
            Ok(k) => k,
            Err(e) => {
                warn!(object_key, error = %e, "ignoring object");
                return Ok(MergeOutcome::Ignored);
            }
        };
        let batch = key.batch;
        match self.merge_batch(&batch) {
            Err(e) if !e.is_retriable() => {
                error!(
                    batch_id = %batch.batch_id,
                    prediction_type = %batch.prediction_type,
                    model_id = %batch.model_id,
                    study_area = %batch.study_area,
                    kind = %e.kind(),
                    error = %e,
                    "merge rejected"
                );
                Ok(MergeOutcome::Rejected(e))
            }
            other => other,
        }
    }

    /// Checks readiness of `batch` and merges it if complete and unlocked.
    pub fn merge_batch(&self, batch: &BatchKey) -> Result<MergeOutcome, PipelineError> {
        let started = Instant::now();
        let manifest = ScenarioManifest::load(self.metadata, batch)?;
        let listed = self.input.list(&batch.prefix())?;
        let chunk_ids = match manifest.check(&chunk_ids_by_scenario(&listed, batch))? {
            Completeness::Complete { chunk_ids } => chunk_ids,
            Completeness::Incomplete { mismatched_chunk_ids } => {
                if mismatched_chunk_ids {
                    warn!(batch = %batch, "chunk ids differ across scenarios");
                } else {
                    info!(batch = %batch, "not all files ready");
                }
                return Ok(MergeOutcome::NotYetComplete);
            }
        };

        let lock_key = batch.lock_key();
        let guard = match MergeLockGuard::acquire(self.locks, &lock_key, &self.options.holder)? {
            Acquisition::Acquired(guard) => guard,
            Acquisition::Held(lock) => {
                let now = chrono::Utc::now();
                let stale = lock
                    .as_ref()
                    .is_some_and(|l| is_stale(l, self.options.lock_stale_after, now));
                if stale {
                    warn!(
                        batch = %batch,
                        lock_key = %lock_key,
                        holder = lock.as_ref().map(|l| l.holder.as_str()).unwrap_or_default(),
                        "merge lock is stale; clear it if the holder is gone"
                    );
                } else {
                    warn!(batch = %batch, "merge already running");
                }
                return Ok(MergeOutcome::AlreadyRunning { lock, stale });
            }
        };

        debug!(
            batch = %batch,
            chunks = chunk_ids.len(),
            scenarios = manifest.scenario_ids.len(),
            "starting merge"
        );
        let result = self.dispatch(batch, &manifest.scenario_ids, &chunk_ids);
        let released = guard.release();

        match result {
            Ok(hexes) => {
                released?;
                info!(
                    batch = %batch,
                    chunks = chunk_ids.len(),
                    hexes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "merged scenario predictions"
                );
                Ok(MergeOutcome::Merged { chunks: chunk_ids.len(), hexes })
            }
            Err(e) => {
                if let Err(release_error) = released {
                    error!(batch = %batch, error = %release_error, "failed to release merge lock");
                    if !e.is_retriable() {
                        return Err(release_error.into());
                    }
                }
                Err(e)
            }
        }
    }

    /// Merges `chunk_ids` on the worker pool, one subset per worker.
    fn dispatch(
        &self,
        batch: &BatchKey,
        scenario_ids: &[String],
        chunk_ids: &[String],
    ) -> Result<usize, PipelineError> {
        let workers = self.options.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
        let subsets = partition(chunk_ids, workers);
        let results: Vec<Result<usize, PipelineError>> = pool.install(|| {
            subsets
                .par_iter()
                .map(|subset| {
                    let io_threads = self.options.io_threads;
                    ScenarioMerger::new(self.input, self.output, batch, scenario_ids, io_threads)?
                        .merge_chunk_set(subset)
                })
                .collect()
        });
        Ok(first_failure(results)?.into_iter().sum())
    }
}
