//! Study-area, chunk, run and lock metadata.
//!
//! Documents are stored loosely (every field optional, as written by the
//! upstream partitioning step). Each document type has exactly one
//! `validate` that turns it into a typed record or names every missing
//! required field.

pub mod fs;
pub mod memory;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coords::{SourcePoint, SourceRect};
use crate::error::{MissingFields, PipelineError};
use crate::storage::StoreError;

pub use fs::FsMetadataStore;
pub use memory::MemoryMetadataStore;

// ── Stored documents ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudyAreaDoc {
    pub cell_size: Option<f64>,
    pub crs: Option<String>,
    pub chunk_x_count: Option<u32>,
    pub chunk_y_count: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDoc {
    pub row_count: Option<usize>,
    pub col_count: Option<usize>,
    pub x_ll_corner: Option<f64>,
    pub y_ll_corner: Option<f64>,
    pub x_index: Option<u32>,
    pub y_index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDoc {
    pub scenario_ids: Option<Vec<String>>,
}

/// Lock document keyed by [`crate::keys::BatchKey::lock_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub running: bool,
    pub acquired_at: DateTime<Utc>,
    /// Free-form identity of the acquiring invocation, for operators.
    #[serde(default)]
    pub holder: String,
}

impl LockRecord {
    pub fn new(holder: impl Into<String>) -> Self {
        Self { running: true, acquired_at: Utc::now(), holder: holder.into() }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.acquired_at
    }
}

// ── Typed records ────────────────────────────────────────────────────────────

/// Immutable per-run study area configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyArea {
    pub name: String,
    /// Raster cell edge length in source CRS units.
    pub cell_size: f64,
    pub crs: String,
    pub chunk_x_count: u32,
    pub chunk_y_count: u32,
}

impl StudyArea {
    pub fn expected_chunk_count(&self) -> usize {
        self.chunk_x_count as usize * self.chunk_y_count as usize
    }

    pub fn in_bounds(&self, x: i64, y: i64) -> bool {
        x >= 0 && y >= 0 && x < self.chunk_x_count as i64 && y < self.chunk_y_count as i64
    }
}

/// One rectangular chunk of a study area.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub row_count: usize,
    pub col_count: usize,
    pub x_ll_corner: f64,
    pub y_ll_corner: f64,
    pub x_index: u32,
    pub y_index: u32,
}

impl Chunk {
    /// Footprint in the source CRS.
    pub fn extent(&self, cell_size: f64) -> SourceRect {
        SourceRect {
            min_x: self.x_ll_corner,
            min_y: self.y_ll_corner,
            max_x: self.x_ll_corner + self.col_count as f64 * cell_size,
            max_y: self.y_ll_corner + self.row_count as f64 * cell_size,
        }
    }

    /// Centre of cell (row, col), rows counted from the bottom edge.
    pub fn cell_center(&self, cell_size: f64, row: usize, col: usize) -> SourcePoint {
        SourcePoint::new(
            self.x_ll_corner + (col as f64 + 0.5) * cell_size,
            self.y_ll_corner + (row as f64 + 0.5) * cell_size,
        )
    }

    /// Bottom-up (row, col) of the cell containing `p`, if inside the chunk.
    pub fn cell_containing(&self, cell_size: f64, p: SourcePoint) -> Option<(usize, usize)> {
        let col = ((p.x - self.x_ll_corner) / cell_size).floor();
        let row = ((p.y - self.y_ll_corner) / cell_size).floor();
        if col < 0.0 || row < 0.0 || col >= self.col_count as f64 || row >= self.row_count as f64 {
            return None;
        }
        Some((row as usize, col as usize))
    }
}

impl StudyAreaDoc {
    pub fn validate(&self, name: &str) -> Result<StudyArea, MissingFields> {
        let mut missing = Vec::new();
        if self.cell_size.is_none() {
            missing.push("cell_size");
        }
        if self.crs.is_none() {
            missing.push("crs");
        }
        if self.chunk_x_count.is_none() {
            missing.push("chunk_x_count");
        }
        if self.chunk_y_count.is_none() {
            missing.push("chunk_y_count");
        }
        match (self.cell_size, &self.crs, self.chunk_x_count, self.chunk_y_count) {
            (Some(cell_size), Some(crs), Some(chunk_x_count), Some(chunk_y_count)) => Ok(StudyArea {
                name: name.to_string(),
                cell_size,
                crs: crs.clone(),
                chunk_x_count,
                chunk_y_count,
            }),
            _ => Err(MissingFields(missing)),
        }
    }
}

impl ChunkDoc {
    pub fn validate(&self, id: &str) -> Result<Chunk, MissingFields> {
        let fields: [(&'static str, bool); 6] = [
            ("row_count", self.row_count.is_some()),
            ("col_count", self.col_count.is_some()),
            ("x_ll_corner", self.x_ll_corner.is_some()),
            ("y_ll_corner", self.y_ll_corner.is_some()),
            ("x_index", self.x_index.is_some()),
            ("y_index", self.y_index.is_some()),
        ];
        let missing: Vec<&'static str> =
            fields.iter().filter(|(_, present)| !present).map(|(name, _)| *name).collect();
        match (
            self.row_count,
            self.col_count,
            self.x_ll_corner,
            self.y_ll_corner,
            self.x_index,
            self.y_index,
        ) {
            (
                Some(row_count),
                Some(col_count),
                Some(x_ll_corner),
                Some(y_ll_corner),
                Some(x_index),
                Some(y_index),
            ) => Ok(Chunk {
                id: id.to_string(),
                row_count,
                col_count,
                x_ll_corner,
                y_ll_corner,
                x_index,
                y_index,
            }),
            _ => Err(MissingFields(missing)),
        }
    }
}

impl From<&Chunk> for ChunkDoc {
    fn from(c: &Chunk) -> Self {
        Self {
            row_count: Some(c.row_count),
            col_count: Some(c.col_count),
            x_ll_corner: Some(c.x_ll_corner),
            y_ll_corner: Some(c.y_ll_corner),
            x_index: Some(c.x_index),
            y_index: Some(c.y_index),
        }
    }
}

impl From<&StudyArea> for StudyAreaDoc {
    fn from(s: &StudyArea) -> Self {
        Self {
            cell_size: Some(s.cell_size),
            crs: Some(s.crs.clone()),
            chunk_x_count: Some(s.chunk_x_count),
            chunk_y_count: Some(s.chunk_y_count),
        }
    }
}

/// Loads and validates a study area. It must exist and have at least one chunk.
pub fn load_study_area(store: &dyn MetadataStore, name: &str) -> Result<StudyArea, PipelineError> {
    let doc = store.study_area(name)?.ok_or_else(|| {
        PipelineError::MissingMetadata(format!("Study area \"{name}\" does not exist"))
    })?;
    if store.chunk_ids(name)?.is_empty() {
        return Err(PipelineError::MissingMetadata(format!(
            "Study area \"{name}\" is missing chunks"
        )));
    }
    doc.validate(name).map_err(|missing| PipelineError::InvalidMetadata {
        entity: "Study area",
        id: name.to_string(),
        missing,
    })
}

pub fn load_chunk(
    store: &dyn MetadataStore,
    study_area: &str,
    chunk_id: &str,
) -> Result<Chunk, PipelineError> {
    let doc = store.chunk(study_area, chunk_id)?.ok_or_else(|| {
        PipelineError::MissingMetadata(format!("Chunk \"{chunk_id}\" does not exist"))
    })?;
    doc.validate(chunk_id).map_err(|missing| PipelineError::InvalidMetadata {
        entity: "Chunk",
        id: chunk_id.to_string(),
        missing,
    })
}

// ── Store seams ──────────────────────────────────────────────────────────────

/// Read access to partition and run metadata.
///
/// Implementations must serve [`MetadataStore::chunk_at`] from a composite
/// `(x_index, y_index)` index; neighbor lookups issue up to eight of these per
/// chunk and must not scan the chunk collection.
pub trait MetadataStore: Send + Sync {
    fn study_area(&self, name: &str) -> Result<Option<StudyAreaDoc>, StoreError>;

    fn chunk(&self, study_area: &str, chunk_id: &str) -> Result<Option<ChunkDoc>, StoreError>;

    /// The chunk registered at grid position (x, y), with its id.
    fn chunk_at(
        &self,
        study_area: &str,
        x: u32,
        y: u32,
    ) -> Result<Option<(String, ChunkDoc)>, StoreError>;

    fn chunk_ids(&self, study_area: &str) -> Result<Vec<String>, StoreError>;

    fn run(&self, model_id: &str, batch_id: &str) -> Result<Option<RunDoc>, StoreError>;
}

/// Cross-invocation mutual exclusion records.
pub trait LockStore: Send + Sync {
    /// Atomically creates `key`. Returns `false` without writing when the key
    /// already exists.
    fn try_create(&self, key: &str, record: &LockRecord) -> Result<bool, StoreError>;

    fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError>;

    /// Deleting an absent lock is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<(String, LockRecord)>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_validation_names_every_missing_field() {
        let doc = ChunkDoc {
            row_count: Some(2),
            col_count: Some(3),
            x_ll_corner: Some(500.0),
            ..Default::default()
        };
        let missing = doc.validate("chunk-id").unwrap_err();
        assert_eq!(missing.0, vec!["y_ll_corner", "x_index", "y_index"]);
    }

    #[test]
    fn study_area_validation() {
        let doc = StudyAreaDoc {
            crs: Some("EPSG:32618".into()),
            chunk_x_count: Some(1),
            ..Default::default()
        };
        assert_eq!(doc.validate("a").unwrap_err().0, vec!["cell_size", "chunk_y_count"]);

        let full = StudyAreaDoc { cell_size: Some(10.0), chunk_y_count: Some(2), ..doc };
        let area = full.validate("a").unwrap();
        assert_eq!(area.expected_chunk_count(), 2);
        assert!(area.in_bounds(0, 1));
        assert!(!area.in_bounds(1, 0));
        assert!(!area.in_bounds(-1, 0));
    }

    #[test]
    fn study_area_loading_requires_chunks() {
        let store = MemoryMetadataStore::new();
        assert!(matches!(load_study_area(&store, "a"), Err(PipelineError::MissingMetadata(_))));

        store.put_study_area("a", StudyAreaDoc { cell_size: Some(10.0), ..Default::default() });
        match load_study_area(&store, "a") {
            Err(PipelineError::MissingMetadata(msg)) => {
                assert!(msg.contains("missing chunks"), "{msg}")
            }
            other => panic!("expected missing chunks, got {other:?}"),
        }

        store.put_chunk("a", "c", ChunkDoc::default());
        assert!(matches!(
            load_study_area(&store, "a"),
            Err(PipelineError::InvalidMetadata { entity: "Study area", .. })
        ));
        assert!(matches!(
            load_chunk(&store, "a", "c"),
            Err(PipelineError::InvalidMetadata { entity: "Chunk", .. })
        ));
        assert!(matches!(load_chunk(&store, "a", "x"), Err(PipelineError::MissingMetadata(_))));
    }

    #[test]
    fn documents_decode_with_absent_fields() {
        let doc: ChunkDoc = serde_json::from_str(r#"{"row_count": 2, "col_count": 3}"#).unwrap();
        assert_eq!(doc.row_count, Some(2));
        assert!(doc.x_index.is_none());
    }

    #[test]
    fn cell_geometry() {
        let chunk = Chunk {
            id: "c".into(),
            row_count: 2,
            col_count: 3,
            x_ll_corner: 500.0,
            y_ll_corner: 100.0,
            x_index: 0,
            y_index: 0,
        };
        assert_eq!(chunk.cell_center(10.0, 0, 0), SourcePoint::new(505.0, 105.0));
        assert_eq!(chunk.cell_center(10.0, 1, 2), SourcePoint::new(525.0, 115.0));
        assert_eq!(chunk.cell_containing(10.0, SourcePoint::new(525.0, 115.0)), Some((1, 2)));
        assert_eq!(chunk.cell_containing(10.0, SourcePoint::new(531.0, 115.0)), None);
        let ext = chunk.extent(10.0);
        assert_eq!((ext.max_x, ext.max_y), (530.0, 120.0));
    }
}
