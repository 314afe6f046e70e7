//! Expected scenarios and chunk count for one batch, and the readiness check
//! against what is actually in storage.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{MissingFields, PipelineError};
use crate::keys::{BatchKey, ChunkKey};
use crate::metadata::MetadataStore;

/// Scenario id -> chunk ids present in storage.
pub type ChunkIdsByScenario = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioManifest {
    /// Sorted, deduplicated. Also the merged table's column order.
    pub scenario_ids: Vec<String>,
    pub expected_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness {
    Incomplete {
        /// Every scenario has the expected count but the chunk ids disagree.
        mismatched_chunk_ids: bool,
    },
    Complete {
        chunk_ids: Vec<String>,
    },
}

impl ScenarioManifest {
    pub fn new(scenario_ids: impl IntoIterator<Item = String>, expected_chunks: usize) -> Self {
        let scenario_ids: BTreeSet<String> = scenario_ids.into_iter().collect();
        Self { scenario_ids: scenario_ids.into_iter().collect(), expected_chunks }
    }

    /// Scenario ids from the run document, chunk count from the study area's
    /// partition dimensions.
    pub fn load(store: &dyn MetadataStore, batch: &BatchKey) -> Result<Self, PipelineError> {
        let run = store.run(&batch.model_id, &batch.batch_id)?.ok_or_else(|| {
            PipelineError::MissingMetadata(format!(
                "Metadata for run {} model {} does not exist",
                batch.batch_id, batch.model_id
            ))
        })?;
        let scenario_ids = run.scenario_ids.ok_or_else(|| PipelineError::InvalidMetadata {
            entity: "Run",
            id: format!("{}/{}", batch.model_id, batch.batch_id),
            missing: MissingFields(vec!["scenario_ids"]),
        })?;

        let area = store.study_area(&batch.study_area)?.ok_or_else(|| {
            PipelineError::MissingMetadata(format!(
                "Metadata for study_area {} does not exist",
                batch.study_area
            ))
        })?;
        let (x, y) = match (area.chunk_x_count, area.chunk_y_count) {
            (Some(x), Some(y)) => (x, y),
            (x, y) => {
                let mut missing = Vec::new();
                if x.is_none() {
                    missing.push("chunk_x_count");
                }
                if y.is_none() {
                    missing.push("chunk_y_count");
                }
                return Err(PipelineError::InvalidMetadata {
                    entity: "Study area",
                    id: batch.study_area.clone(),
                    missing: MissingFields(missing),
                });
            }
        };
        Ok(Self::new(scenario_ids, x as usize * y as usize))
    }

    /// Decides whether every expected (scenario, chunk) table is present.
    ///
    /// More scenarios or chunks than expected is an error, not a wait state.
    pub fn check(&self, actual: &ChunkIdsByScenario) -> Result<Completeness, PipelineError> {
        let unexpected: Vec<String> = actual
            .keys()
            .filter(|id| self.scenario_ids.binary_search(id).is_err())
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(PipelineError::TooManyScenarios { unexpected });
        }
        let oversized = actual.iter().find(|(_, chunks)| chunks.len() > self.expected_chunks);
        if let Some((scenario_id, chunks)) = oversized {
            return Err(PipelineError::TooManyChunks {
                scenario_id: scenario_id.clone(),
                expected: self.expected_chunks,
                actual: chunks.len(),
            });
        }

        let all_present = actual.len() == self.scenario_ids.len()
            && actual.values().all(|chunks| chunks.len() == self.expected_chunks);
        if !all_present {
            return Ok(Completeness::Incomplete { mismatched_chunk_ids: false });
        }
        let mut sets = actual.values();
        let first = sets.next().cloned().unwrap_or_default();
        if sets.any(|s| *s != first) {
            return Ok(Completeness::Incomplete { mismatched_chunk_ids: true });
        }
        Ok(Completeness::Complete { chunk_ids: first.into_iter().collect() })
    }
}

/// Groups listed per-scenario table keys of `batch` by scenario. Keys of other
/// shapes are skipped.
pub fn chunk_ids_by_scenario(keys: &[String], batch: &BatchKey) -> ChunkIdsByScenario {
    let mut out = ChunkIdsByScenario::new();
    for key in keys {
        if let Ok(parsed) = ChunkKey::parse_table(key) {
            if parsed.batch == *batch {
                out.entry(parsed.scenario_id).or_default().insert(parsed.chunk_id);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{MemoryMetadataStore, RunDoc, StudyAreaDoc};

    fn actual(entries: &[(&str, &[&str])]) -> ChunkIdsByScenario {
        entries
            .iter()
            .map(|(s, chunks)| (s.to_string(), chunks.iter().map(|c| c.to_string()).collect()))
            .collect()
    }

    fn manifest() -> ScenarioManifest {
        ScenarioManifest::new(["scenario1".to_string(), "scenario0".to_string()], 2)
    }

    #[test]
    fn scenario_ids_are_sorted() {
        assert_eq!(manifest().scenario_ids, vec!["scenario0", "scenario1"]);
    }

    #[test]
    fn missing_scenario_is_incomplete() {
        let state = actual(&[("scenario0", &["chunk0", "chunk1"])]);
        assert_eq!(
            manifest().check(&state).unwrap(),
            Completeness::Incomplete { mismatched_chunk_ids: false }
        );
    }

    #[test]
    fn missing_chunk_is_incomplete() {
        let state = actual(&[("scenario0", &["chunk0", "chunk1"]), ("scenario1", &["chunk0"])]);
        assert!(matches!(manifest().check(&state).unwrap(), Completeness::Incomplete { .. }));
    }

    #[test]
    fn all_present_is_complete() {
        let state = actual(&[
            ("scenario0", &["chunk0", "chunk1"]),
            ("scenario1", &["chunk1", "chunk0"]),
        ]);
        assert_eq!(
            manifest().check(&state).unwrap(),
            Completeness::Complete { chunk_ids: vec!["chunk0".into(), "chunk1".into()] }
        );
    }

    #[test]
    fn equal_counts_with_different_ids_are_incomplete() {
        let state = actual(&[
            ("scenario0", &["chunk0", "chunk1"]),
            ("scenario1", &["chunk0", "chunk2"]),
        ]);
        assert_eq!(
            manifest().check(&state).unwrap(),
            Completeness::Incomplete { mismatched_chunk_ids: true }
        );
    }

    #[test]
    fn extra_scenario_is_an_error() {
        let state = actual(&[
            ("scenario0", &["chunk0", "chunk1"]),
            ("scenario1", &["chunk0", "chunk1"]),
            ("scenario2", &["chunk0", "chunk1"]),
        ]);
        match manifest().check(&state) {
            Err(PipelineError::TooManyScenarios { unexpected }) => {
                assert_eq!(unexpected, vec!["scenario2"])
            }
            other => panic!("expected TooManyScenarios, got {other:?}"),
        }
    }

    #[test]
    fn unexpected_scenario_is_an_error_even_when_others_are_missing() {
        let state = actual(&[("scenario0", &["chunk0"]), ("other", &["chunk0"])]);
        assert!(matches!(manifest().check(&state), Err(PipelineError::TooManyScenarios { .. })));
    }

    #[test]
    fn extra_chunk_is_an_error() {
        let state = actual(&[("scenario0", &["chunk0", "chunk1", "chunk2"])]);
        match manifest().check(&state) {
            Err(PipelineError::TooManyChunks { scenario_id, expected: 2, actual: 3 }) => {
                assert_eq!(scenario_id, "scenario0")
            }
            other => panic!("expected TooManyChunks, got {other:?}"),
        }
    }

    #[test]
    fn listing_is_grouped_by_scenario() {
        let batch = BatchKey::new("b", "flood", "m", "area");
        let keys: Vec<String> = [
            "b/flood/m/area/s0/c0.csv",
            "b/flood/m/area/s0/c1.csv",
            "b/flood/m/area/s1/c0.csv",
            "b/flood/m/area/s1/c0",
            "b/flood/m/area/c0.csv",
            "b/flood/m/area-2/s0/c0.csv",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let grouped = chunk_ids_by_scenario(&keys, &batch);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["s0"].len(), 2);
        assert_eq!(grouped["s1"].len(), 1);
    }

    #[test]
    fn loads_from_metadata() {
        let store = MemoryMetadataStore::new();
        let batch = BatchKey::new("b", "flood", "m", "area");
        assert!(matches!(
            ScenarioManifest::load(&store, &batch),
            Err(PipelineError::MissingMetadata(_))
        ));

        store.put_run("m", "b", RunDoc { scenario_ids: Some(vec!["s1".into(), "s0".into()]) });
        store.put_study_area("area", StudyAreaDoc { chunk_x_count: Some(2), ..Default::default() });
        match ScenarioManifest::load(&store, &batch) {
            Err(PipelineError::InvalidMetadata { missing, .. }) => {
                assert_eq!(missing.0, vec!["chunk_y_count"])
            }
            other => panic!("expected InvalidMetadata, got {other:?}"),
        }

        let complete =
            StudyAreaDoc { chunk_x_count: Some(2), chunk_y_count: Some(3), ..Default::default() };
        store.put_study_area("area", complete);
        let m = ScenarioManifest::load(&store, &batch).unwrap();
        assert_eq!(m, ScenarioManifest::new(["s0".to_string(), "s1".to_string()], 6));
    }
}
