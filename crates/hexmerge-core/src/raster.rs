use serde::Deserialize;

use crate::error::PipelineError;
use crate::storage::ObjectStore;

/// A chunk's model output: one value per raster cell, row-major.
///
/// Rows are stored top-row-first, as the model emits them. Geography runs the
/// other way (row 0 of a chunk is its southern edge), so spatial lookups go
/// through [`RasterPrediction::get_bottom_up`].
#[derive(Debug, Clone, PartialEq)]
pub struct RasterPrediction {
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl RasterPrediction {
    /// Builds a raster from nested rows. `key` names the source in errors.
    pub fn from_rows(rows: Vec<Vec<f64>>, key: &str) -> Result<Self, PipelineError> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, Vec::len);
        let mut data = Vec::with_capacity(n_rows * n_cols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != n_cols {
                return Err(PipelineError::InvalidRaster {
                    key: key.to_string(),
                    row: i,
                    len: row.len(),
                    expected: n_cols,
                });
            }
            data.extend(row);
        }
        Ok(Self { data, rows: n_rows, cols: n_cols })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Value at (row, col) in stored, top-row-first order.
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// Value at (row, col) with row 0 the bottom row (vertical flip).
    #[inline]
    pub fn get_bottom_up(&self, row: usize, col: usize) -> f64 {
        self.get(self.rows - 1 - row, col)
    }
}

/// One line of a model prediction file.
#[derive(Debug, Deserialize)]
pub struct PredictionLine {
    #[serde(default)]
    pub instance: Option<PredictionInstance>,
    pub prediction: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
pub struct PredictionInstance {
    /// Chunk id the prediction belongs to. Numeric keys are accepted.
    #[serde(default)]
    pub key: Option<serde_json::Value>,
}

impl PredictionInstance {
    pub fn chunk_id(&self) -> Option<String> {
        match self.key.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Parses a per-chunk prediction object, which holds exactly one line.
pub fn parse_chunk_predictions(bytes: &[u8], key: &str) -> Result<RasterPrediction, PipelineError> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let first = lines
        .next()
        .ok_or_else(|| PipelineError::MissingPredictions { key: key.to_string() })?;
    if lines.next().is_some() {
        return Err(PipelineError::TooManyPredictions { key: key.to_string() });
    }
    let line: PredictionLine =
        serde_json::from_str(first).map_err(|e| PipelineError::MalformedPredictionLine {
            key: key.to_string(),
            line: 1,
            reason: e.to_string(),
        })?;
    RasterPrediction::from_rows(line.prediction, key)
}

/// Reads and parses the per-chunk prediction object at `key`.
pub fn read_chunk_predictions(
    store: &dyn ObjectStore,
    key: &str,
) -> Result<RasterPrediction, PipelineError> {
    let bytes = store
        .get(key)?
        .ok_or_else(|| PipelineError::MissingPredictions { key: key.to_string() })?;
    parse_chunk_predictions(&bytes, key)
}
