//! Per-chunk merge of every scenario's hex table into one wide table.

use std::collections::BTreeMap;

use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::debug;

use crate::error::{first_failure, PipelineError};
use crate::keys::BatchKey;
use crate::storage::ObjectStore;
use crate::table::{read_prediction_table, write_wide_table};

pub struct ScenarioMerger<'a> {
    input: &'a dyn ObjectStore,
    output: &'a dyn ObjectStore,
    batch: &'a BatchKey,
    scenario_ids: &'a [String],
    /// Bounded pool for object reads and writes.
    io: ThreadPool,
}

impl<'a> ScenarioMerger<'a> {
    pub fn new(
        input: &'a dyn ObjectStore,
        output: &'a dyn ObjectStore,
        batch: &'a BatchKey,
        scenario_ids: &'a [String],
        io_threads: usize,
    ) -> Result<Self, PipelineError> {
        let io = rayon::ThreadPoolBuilder::new()
            .num_threads(io_threads.max(1))
            .build()
            .map_err(|e| PipelineError::WorkerPool(e.to_string()))?;
        Ok(Self { input, output, batch, scenario_ids, io })
    }

    fn read_scenario(
        &self,
        scenario_id: &str,
        chunk_id: &str,
    ) -> Result<Vec<(String, f64)>, PipelineError> {
        let key = self.batch.table_key(scenario_id, chunk_id);
        let bytes = self
            .input
            .get(&key)?
            .ok_or_else(|| PipelineError::MissingPredictions { key: key.clone() })?;
        read_prediction_table(&bytes, &key)
    }

    /// Merges one chunk and writes `<batch>/<type>/<model>/<area>/<chunk>.csv`.
    /// Returns the number of hex rows written.
    ///
    /// Every hex must have a value from every scenario; otherwise nothing is
    /// written and the first such hex (in index order) is reported.
    pub fn merge_chunk(&self, chunk_id: &str) -> Result<usize, PipelineError> {
        let results: Vec<Result<Vec<(String, f64)>, PipelineError>> = self.io.install(|| {
            self.scenario_ids.par_iter().map(|s| self.read_scenario(s, chunk_id)).collect()
        });
        let tables = first_failure(results)?;

        let width = self.scenario_ids.len();
        let mut by_hex: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();
        for (column, rows) in tables.into_iter().enumerate() {
            for (hex, value) in rows {
                by_hex.entry(hex).or_insert_with(|| vec![None; width])[column] = Some(value);
            }
        }

        let mut rows = Vec::with_capacity(by_hex.len());
        for (hex, values) in by_hex {
            let missing: Vec<String> = values
                .iter()
                .zip(self.scenario_ids)
                .filter(|(v, _)| v.is_none())
                .map(|(_, id)| id.clone())
                .collect();
            if !missing.is_empty() {
                return Err(PipelineError::MissingCellData {
                    hex_index: hex,
                    missing_scenarios: missing,
                });
            }
            rows.push((hex, values.into_iter().flatten().collect::<Vec<f64>>()));
        }

        let key = self.batch.merged_key(chunk_id);
        let table = write_wide_table(self.scenario_ids, &rows, &key)?;
        self.output.put(&key, &table)?;
        debug!(chunk_id, output_key = %key, hexes = rows.len(), "merged chunk scenarios");
        Ok(rows.len())
    }

    /// Merges every chunk in `chunk_ids`, waiting for all before reporting the
    /// first failure. Returns the total number of hex rows written.
    pub fn merge_chunk_set(&self, chunk_ids: &[String]) -> Result<usize, PipelineError> {
        let results: Vec<Result<usize, PipelineError>> =
            self.io.install(|| chunk_ids.par_iter().map(|c| self.merge_chunk(c)).collect());
        Ok(first_failure(results)?.into_iter().sum())
    }
}
