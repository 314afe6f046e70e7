//! CSV codec for hex tables.
//!
//! Per-scenario tables are two columns, `h3_index,prediction` (older writers
//! used `cell_code` for the first column). Merged tables are `h3_index`
//! followed by one column per scenario id.

use csv::{ReaderBuilder, StringRecord, Trim, Writer};

use crate::error::PipelineError;

pub const INDEX_COLUMN: &str = "h3_index";
const LEGACY_INDEX_COLUMN: &str = "cell_code";
pub const VALUE_COLUMN: &str = "prediction";

fn invalid(key: &str, line: u64, reason: impl Into<String>) -> PipelineError {
    PipelineError::InvalidTable {
        key: key.to_string(),
        line: line as usize,
        reason: reason.into(),
    }
}

fn csv_error(key: &str, e: &csv::Error) -> PipelineError {
    let line = e.position().map_or(0, |p| p.line());
    invalid(key, line, e.to_string())
}

fn finish(writer: Writer<Vec<u8>>, key: &str) -> Result<Vec<u8>, PipelineError> {
    writer
        .into_inner()
        .map_err(|e| invalid(key, 0, e.error().to_string()))
}

/// Encodes a per-scenario hex table. `key` names the destination in errors.
pub fn write_prediction_table(
    rows: &[(String, f64)],
    key: &str,
) -> Result<Vec<u8>, PipelineError> {
    let mut writer = Writer::from_writer(Vec::new());
    writer
        .write_record([INDEX_COLUMN, VALUE_COLUMN])
        .map_err(|e| csv_error(key, &e))?;
    for (hex, value) in rows {
        writer
            .write_record([hex.as_str(), value.to_string().as_str()])
            .map_err(|e| csv_error(key, &e))?;
    }
    finish(writer, key)
}

fn check_header(header: &StringRecord, key: &str) -> Result<(), PipelineError> {
    let columns: Vec<&str> = header.iter().collect();
    match columns.as_slice() {
        [index, VALUE_COLUMN] if [INDEX_COLUMN, LEGACY_INDEX_COLUMN].contains(index) => Ok(()),
        _ => Err(invalid(
            key,
            1,
            format!(
                "expected header '{INDEX_COLUMN},{VALUE_COLUMN}' or \
                 '{LEGACY_INDEX_COLUMN},{VALUE_COLUMN}', got '{}'",
                columns.join(",")
            ),
        )),
    }
}

/// Decodes a per-scenario hex table. `key` names the source in errors.
pub fn read_prediction_table(
    bytes: &[u8],
    key: &str,
) -> Result<Vec<(String, f64)>, PipelineError> {
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(bytes);
    let header = reader.headers().map_err(|e| csv_error(key, &e))?.clone();
    check_header(&header, key)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| csv_error(key, &e))?;
        let line = record.position().map_or(0, |p| p.line());
        let value = &record[1];
        let parsed: f64 = value
            .parse()
            .map_err(|e| invalid(key, line, format!("bad value '{value}': {e}")))?;
        rows.push((record[0].to_string(), parsed));
    }
    Ok(rows)
}

/// Encodes a merged table: one row per hex, values in `scenario_ids` order.
pub fn write_wide_table(
    scenario_ids: &[String],
    rows: &[(String, Vec<f64>)],
    key: &str,
) -> Result<Vec<u8>, PipelineError> {
    let mut writer = Writer::from_writer(Vec::new());
    let header = std::iter::once(INDEX_COLUMN).chain(scenario_ids.iter().map(String::as_str));
    writer.write_record(header).map_err(|e| csv_error(key, &e))?;
    for (hex, values) in rows {
        let record = std::iter::once(hex.clone()).chain(values.iter().map(f64::to_string));
        writer.write_record(record).map_err(|e| csv_error(key, &e))?;
    }
    finish(writer, key)
}
