//! Adjacent-chunk lookup through the metadata store's position index.

use tracing::debug;

use crate::error::PipelineError;
use crate::metadata::{Chunk, MetadataStore, StudyArea};

/// Axis and diagonal offsets, north row first.
const OFFSETS: [(i64, i64); 8] =
    [(-1, 1), (0, 1), (1, 1), (-1, 0), (1, 0), (-1, -1), (0, -1), (1, -1)];

/// In-bounds grid positions adjacent to (x, y). Edge and corner chunks get
/// fewer than eight.
pub fn neighbor_positions(x: u32, y: u32, area: &StudyArea) -> Vec<(u32, u32)> {
    OFFSETS
        .iter()
        .map(|(dx, dy)| (x as i64 + dx, y as i64 + dy))
        .filter(|&(nx, ny)| area.in_bounds(nx, ny))
        .map(|(nx, ny)| (nx as u32, ny as u32))
        .collect()
}

pub trait NeighborResolver {
    /// Every in-bounds neighbor of `chunk`, validated.
    ///
    /// A position inside the study area with no registered chunk is a
    /// `MissingNeighbor` error; the partition is expected to be dense.
    fn neighbors(&self, area: &StudyArea, chunk: &Chunk) -> Result<Vec<Chunk>, PipelineError>;
}

/// Resolves neighbors with one indexed `chunk_at` lookup per position.
pub struct MetadataNeighborResolver<'a> {
    store: &'a dyn MetadataStore,
}

impl<'a> MetadataNeighborResolver<'a> {
    pub fn new(store: &'a dyn MetadataStore) -> Self {
        Self { store }
    }
}

impl NeighborResolver for MetadataNeighborResolver<'_> {
    fn neighbors(&self, area: &StudyArea, chunk: &Chunk) -> Result<Vec<Chunk>, PipelineError> {
        let positions = neighbor_positions(chunk.x_index, chunk.y_index, area);
        let mut out = Vec::with_capacity(positions.len());
        for (x, y) in positions {
            let (id, doc) = self.store.chunk_at(&area.name, x, y)?.ok_or_else(|| {
                PipelineError::MissingNeighbor { study_area: area.name.clone(), x, y }
            })?;
            let neighbor = doc.validate(&id).map_err(|missing| {
                PipelineError::InvalidNeighborMetadata { chunk_id: id.clone(), x, y, missing }
            })?;
            out.push(neighbor);
        }
        debug!(
            study_area = %area.name,
            chunk_id = %chunk.id,
            count = out.len(),
            "resolved neighbor chunks"
        );
        Ok(out)
    }
}
