//! Object key conventions.
//!
//! ```text
//! raw chunk predictions   <batch>/<type>/<model>/<area>/<scenario>/<chunk>
//! per-scenario hex table  <batch>/<type>/<model>/<area>/<scenario>/<chunk>.csv
//! merged wide table       <batch>/<type>/<model>/<area>/<chunk>.csv
//! ```

use std::fmt;

use crate::error::PipelineError;

pub const RAW_KEY_FORMAT: &str =
    "<id>/<prediction_type>/<model_id>/<study_area_name>/<scenario_id>/<chunk_id>";
pub const TABLE_KEY_FORMAT: &str =
    "<id>/<prediction_type>/<model_id>/<study_area_name>/<scenario_id>/<chunk_id>.csv";

const CSV_EXT: &str = ".csv";

/// Identifies one batch/model/study-area merge unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchKey {
    pub batch_id: String,
    pub prediction_type: String,
    pub model_id: String,
    pub study_area: String,
}

impl BatchKey {
    pub fn new(
        batch_id: impl Into<String>,
        prediction_type: impl Into<String>,
        model_id: impl Into<String>,
        study_area: impl Into<String>,
    ) -> Self {
        Self {
            batch_id: batch_id.into(),
            prediction_type: prediction_type.into(),
            model_id: model_id.into(),
            study_area: study_area.into(),
        }
    }

    /// Listing prefix, with a trailing slash so `area` never matches `area-2`.
    pub fn prefix(&self) -> String {
        format!("{}/", self)
    }

    /// Hyphen-joined so the key is usable in a URL path.
    pub fn lock_key(&self) -> String {
        format!("{}-{}-{}-{}", self.batch_id, self.prediction_type, self.model_id, self.study_area)
    }

    pub fn table_key(&self, scenario_id: &str, chunk_id: &str) -> String {
        format!("{self}/{scenario_id}/{chunk_id}{CSV_EXT}")
    }

    pub fn merged_key(&self, chunk_id: &str) -> String {
        format!("{self}/{chunk_id}{CSV_EXT}")
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.batch_id, self.prediction_type, self.model_id, self.study_area
        )
    }
}

/// One (scenario, chunk) object within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    pub batch: BatchKey,
    pub scenario_id: String,
    pub chunk_id: String,
}

fn components(key: &str) -> Option<[&str; 6]> {
    let parts: Vec<&str> = key.split('/').collect();
    if parts.len() != 6 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    Some([parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]])
}

impl ChunkKey {
    fn from_parts(p: [&str; 6], chunk_id: &str) -> Self {
        Self {
            batch: BatchKey::new(p[0], p[1], p[2], p[3]),
            scenario_id: p[4].to_string(),
            chunk_id: chunk_id.to_string(),
        }
    }

    /// Parses a raw per-chunk prediction key (exactly six components).
    pub fn parse_raw(key: &str) -> Result<Self, PipelineError> {
        let malformed =
            || PipelineError::MalformedKey { key: key.to_string(), expected: RAW_KEY_FORMAT };
        let p = components(key).ok_or_else(malformed)?;
        Ok(Self::from_parts(p, p[5]))
    }

    /// Parses a per-scenario hex table key (six components, `.csv` chunk).
    pub fn parse_table(key: &str) -> Result<Self, PipelineError> {
        let malformed =
            || PipelineError::MalformedKey { key: key.to_string(), expected: TABLE_KEY_FORMAT };
        let p = components(key).ok_or_else(malformed)?;
        let chunk_id = p[5].strip_suffix(CSV_EXT).filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        Ok(Self::from_parts(p, chunk_id))
    }

    pub fn raw_key(&self) -> String {
        format!("{}/{}/{}", self.batch, self.scenario_id, self.chunk_id)
    }

    pub fn table_key(&self) -> String {
        self.batch.table_key(&self.scenario_id, &self.chunk_id)
    }

    /// The raw key of another chunk in the same batch and scenario.
    pub fn sibling(&self, chunk_id: &str) -> Self {
        Self {
            batch: self.batch.clone(),
            scenario_id: self.scenario_id.clone(),
            chunk_id: chunk_id.to_string(),
        }
    }
}
