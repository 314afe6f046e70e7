//! Error taxonomy shared by every pipeline stage.
//!
//! Each variant of [`PipelineError`] maps to one [`ErrorKind`]. The kind decides
//! the propagation policy at an entry point: non-retriable kinds are logged and
//! absorbed, while [`ErrorKind::Unexpected`] is always handed back to the caller.

use std::fmt;

use thiserror::Error;

use crate::storage::StoreError;

/// Coarse classification of a [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MalformedKey,
    MissingMetadata,
    InvalidMetadata,
    MissingNeighbor,
    InvalidNeighborMetadata,
    MissingPredictions,
    TooManyPredictions,
    TooManyScenarios,
    TooManyChunks,
    MissingCellData,
    /// Input that parsed but cannot be used: raster shape, CRS, table rows.
    InvalidInput,
    Unexpected,
}

impl ErrorKind {
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::Unexpected)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Names of the required fields a metadata document is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFields(pub Vec<&'static str>);

impl fmt::Display for MissingFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid object name '{key}', expected '{expected}'")]
    MalformedKey { key: String, expected: &'static str },

    #[error("{0}")]
    MissingMetadata(String),

    #[error("{entity} \"{id}\" is missing one or more required fields: {missing}")]
    InvalidMetadata {
        entity: &'static str,
        id: String,
        missing: MissingFields,
    },

    #[error("neighbor chunk at index ({x}, {y}) is missing from study area \"{study_area}\"")]
    MissingNeighbor { study_area: String, x: u32, y: u32 },

    #[error(
        "neighbor chunk \"{chunk_id}\" at index ({x}, {y}) is missing one or more required \
         fields: {missing}"
    )]
    InvalidNeighborMetadata {
        chunk_id: String,
        x: u32,
        y: u32,
        missing: MissingFields,
    },

    #[error("missing predictions for {key}")]
    MissingPredictions { key: String },

    #[error("predictions file {key} has too many predictions")]
    TooManyPredictions { key: String },

    #[error("prediction line {line} of {key} is malformed: {reason}")]
    MalformedPredictionLine { key: String, line: usize, reason: String },

    #[error("there are more scenario ids in storage than expected: unexpected {unexpected:?}")]
    TooManyScenarios { unexpected: Vec<String> },

    #[error("scenario {scenario_id} has {actual} chunks in storage, expected {expected}")]
    TooManyChunks {
        scenario_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("missing predictions for {hex_index} for {}", .missing_scenarios.join(", "))]
    MissingCellData {
        hex_index: String,
        missing_scenarios: Vec<String>,
    },

    #[error(
        "chunk \"{chunk_id}\" declares a {expected_rows}x{expected_cols} raster but predictions \
         are {actual_rows}x{actual_cols}"
    )]
    RasterShape {
        chunk_id: String,
        expected_rows: usize,
        expected_cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },

    #[error("raster in {key} is not rectangular: row {row} has {len} values, expected {expected}")]
    InvalidRaster {
        key: String,
        row: usize,
        len: usize,
        expected: usize,
    },

    #[error("hex table {key} line {line}: {reason}")]
    InvalidTable { key: String, line: usize, reason: String },

    #[error("projection error for {crs}: {reason}")]
    Projection { crs: String, reason: String },

    #[error("{0}")]
    HexResolution(String),

    #[error("invalid geographic coordinate lat={lat}, lon={lon}")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::MalformedKey { .. } => ErrorKind::MalformedKey,
            PipelineError::MissingMetadata(_) => ErrorKind::MissingMetadata,
            PipelineError::InvalidMetadata { .. } => ErrorKind::InvalidMetadata,
            PipelineError::MissingNeighbor { .. } => ErrorKind::MissingNeighbor,
            PipelineError::InvalidNeighborMetadata { .. } => ErrorKind::InvalidNeighborMetadata,
            PipelineError::MissingPredictions { .. } => ErrorKind::MissingPredictions,
            PipelineError::TooManyPredictions { .. } => ErrorKind::TooManyPredictions,
            PipelineError::MalformedPredictionLine { .. } => ErrorKind::InvalidInput,
            PipelineError::TooManyScenarios { .. } => ErrorKind::TooManyScenarios,
            PipelineError::TooManyChunks { .. } => ErrorKind::TooManyChunks,
            PipelineError::MissingCellData { .. } => ErrorKind::MissingCellData,
            PipelineError::RasterShape { .. }
            | PipelineError::InvalidRaster { .. }
            | PipelineError::InvalidTable { .. }
            | PipelineError::Projection { .. }
            | PipelineError::HexResolution(_)
            | PipelineError::InvalidCoordinate { .. } => ErrorKind::InvalidInput,
            PipelineError::Store(StoreError::Corrupt { .. }) => ErrorKind::InvalidMetadata,
            PipelineError::Store(_) | PipelineError::WorkerPool(_) => ErrorKind::Unexpected,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }
}

/// Returns the first error in submission order, after every task has finished.
///
pub fn first_failure<T, I>(results: I) -> Result<Vec<T>, PipelineError>
where
    I: IntoIterator<Item = Result<T, PipelineError>>,
{
    let mut values = Vec::new();
    let mut failure = None;
    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) if failure.is_none() => failure = Some(err),
            Err(_) => {}
        }
    }
    match failure {
        Some(err) => Err(err),
        None => Ok(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retriable() {
        let io = PipelineError::Store(StoreError::Unavailable("connection reset".into()));
        assert!(io.is_retriable());

        let corrupt = PipelineError::Store(StoreError::Corrupt {
            key: "study_areas/a.json".into(),
            reason: "expected value".into(),
        });
        assert!(!corrupt.is_retriable(), "an undecodable document cannot fix itself");

        let missing = PipelineError::MissingCellData {
            hex_index: "8d2a1072b59ffff".into(),
            missing_scenarios: vec!["s1".into()],
        };
        assert!(!missing.is_retriable());
        assert_eq!(missing.kind(), ErrorKind::MissingCellData);
    }

    #[test]
    fn missing_cell_data_names_hex_and_scenarios() {
        let err = PipelineError::MissingCellData {
            hex_index: "h1".into(),
            missing_scenarios: vec!["s1".into(), "s2".into()],
        };
        assert_eq!(err.to_string(), "missing predictions for h1 for s1, s2");
    }

    #[test]
    fn invalid_metadata_lists_every_missing_field() {
        let err = PipelineError::InvalidMetadata {
            entity: "Chunk",
            id: "chunk-id".into(),
            missing: MissingFields(vec!["row_count", "x_index"]),
        };
        assert_eq!(
            err.to_string(),
            "Chunk \"chunk-id\" is missing one or more required fields: row_count, x_index"
        );
    }

    #[test]
    fn first_failure_waits_for_all_and_keeps_submission_order() {
        let results = vec![
            Ok(1),
            Err(PipelineError::MissingPredictions { key: "a".into() }),
            Ok(3),
            Err(PipelineError::MissingPredictions { key: "b".into() }),
        ];
        match first_failure(results) {
            Err(PipelineError::MissingPredictions { key }) => assert_eq!(key, "a"),
            other => panic!("expected first failure, got {other:?}"),
        }

        let ok: Vec<Result<i32, PipelineError>> = vec![Ok(1), Ok(2)];
        assert_eq!(first_failure(ok).unwrap(), vec![1, 2]);
    }
}
