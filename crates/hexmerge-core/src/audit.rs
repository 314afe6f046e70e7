//! Pre-run check of a study area's partition.
//!
//! Neighbor aggregation assumes a dense grid of valid chunks whose cells are
//! large enough for 8-neighbor sufficiency. The audit walks every grid
//! position and reports every violation instead of stopping at the first.

use std::fmt;

use tracing::{info, warn};

use crate::error::PipelineError;
use crate::hex::HexGrid;
use crate::metadata::{load_study_area, MetadataStore};
use crate::projection::{CrsTransform, ProjTransform};

#[derive(Debug, Clone, PartialEq)]
pub enum AuditProblem {
    MissingChunk { x: u32, y: u32 },
    InvalidChunk { chunk_id: String, missing: Vec<&'static str> },
    /// Registered at a position outside the partition bounds.
    OutOfBounds { chunk_id: String, x: u32, y: u32 },
    HexTooLarge { chunk_id: String, reason: String },
}

impl fmt::Display for AuditProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditProblem::MissingChunk { x, y } => write!(f, "no chunk registered at ({x}, {y})"),
            AuditProblem::InvalidChunk { chunk_id, missing } => {
                write!(f, "chunk \"{chunk_id}\" is missing {}", missing.join(", "))
            }
            AuditProblem::OutOfBounds { chunk_id, x, y } => {
                write!(f, "chunk \"{chunk_id}\" is at ({x}, {y}), outside the partition")
            }
            AuditProblem::HexTooLarge { reason, .. } => f.write_str(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditReport {
    pub study_area: String,
    pub expected_chunks: usize,
    pub registered_chunks: usize,
    pub problems: Vec<AuditProblem>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Audits study area `name`. Errors only when the study area itself cannot
/// be loaded or its CRS is unusable; chunk-level issues go in the report.
pub fn audit_study_area(
    store: &dyn MetadataStore,
    name: &str,
    grid: HexGrid,
) -> Result<AuditReport, PipelineError> {
    let area = load_study_area(store, name)?;
    let transform = ProjTransform::from_crs(&area.crs)?;
    let ids = store.chunk_ids(name)?;
    let mut problems = Vec::new();

    for x in 0..area.chunk_x_count {
        for y in 0..area.chunk_y_count {
            if store.chunk_at(name, x, y)?.is_none() {
                problems.push(AuditProblem::MissingChunk { x, y });
            }
        }
    }

    for id in &ids {
        let Some(doc) = store.chunk(name, id)? else { continue };
        let chunk = match doc.validate(id) {
            Ok(c) => c,
            Err(missing) => {
                problems
                    .push(AuditProblem::InvalidChunk { chunk_id: id.clone(), missing: missing.0 });
                continue;
            }
        };
        if !area.in_bounds(chunk.x_index as i64, chunk.y_index as i64) {
            problems.push(AuditProblem::OutOfBounds {
                chunk_id: chunk.id.clone(),
                x: chunk.x_index,
                y: chunk.y_index,
            });
        }
        if !transform.is_geographic() {
            if let Err(e) = grid.check_neighbor_sufficiency(&area, &chunk) {
                problems.push(AuditProblem::HexTooLarge {
                    chunk_id: chunk.id.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    let report = AuditReport {
        study_area: name.to_string(),
        expected_chunks: area.expected_chunk_count(),
        registered_chunks: ids.len(),
        problems,
    };
    if report.is_clean() {
        info!(
            study_area = name,
            chunks = report.registered_chunks,
            "study area partition is consistent"
        );
    } else {
        warn!(
            study_area = name,
            problems = report.problems.len(),
            "study area partition has problems"
        );
    }
    Ok(report)
}
