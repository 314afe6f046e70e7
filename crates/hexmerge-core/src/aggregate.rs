//! Point -> hex aggregation with cross-chunk boundary merging.
//!
//! A hex belongs to the single chunk whose geographic rectangle contains its
//! centroid. Raster points from either side of a chunk edge can fall into the
//! same hex, so for hexes that stick out of the owning chunk the aggregator
//! pulls the adjacent chunks' rasters and folds their points in. Hex cells are
//! smaller than a chunk, so the 8 immediate neighbors are always enough.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use h3o::CellIndex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::geometry::Polygon;
use crate::hex::HexGrid;
use crate::keys::ChunkKey;
use crate::metadata::{Chunk, StudyArea};
use crate::neighbors::NeighborResolver;
use crate::projection::CrsTransform;
use crate::raster::{read_chunk_predictions, RasterPrediction};
use crate::spatialize::{chunk_boundary, spatialize, SpatializedPoint};
use crate::storage::ObjectStore;

/// How the values of all points landing in one hex are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Max,
    Mean,
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    max: f64,
    sum: f64,
    count: usize,
}

impl Accumulator {
    fn new(v: f64) -> Self {
        Self { max: v, sum: v, count: 1 }
    }

    fn push(&mut self, v: f64) {
        self.max = self.max.max(v);
        self.sum += v;
        self.count += 1;
    }

    fn finish(self, how: Aggregation) -> f64 {
        match how {
            Aggregation::Max => self.max,
            Aggregation::Mean => self.sum / self.count as f64,
        }
    }
}

/// Source of neighbor chunk rasters.
pub trait RasterSource {
    fn raster(&self, chunk: &Chunk) -> Result<RasterPrediction, PipelineError>;
}

/// Reads neighbor rasters from the same batch and scenario as `origin`.
pub struct StoreRasterSource<'a> {
    store: &'a dyn ObjectStore,
    origin: &'a ChunkKey,
}

impl<'a> StoreRasterSource<'a> {
    pub fn new(store: &'a dyn ObjectStore, origin: &'a ChunkKey) -> Self {
        Self { store, origin }
    }
}

impl RasterSource for StoreRasterSource<'_> {
    fn raster(&self, chunk: &Chunk) -> Result<RasterPrediction, PipelineError> {
        read_chunk_predictions(self.store, &self.origin.sibling(&chunk.id).raw_key())
    }
}

/// Hex index -> aggregated value for the hexes one chunk owns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedPrediction {
    values: BTreeMap<CellIndex, f64>,
}

impl AggregatedPrediction {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, cell: CellIndex) -> Option<f64> {
        self.values.get(&cell).copied()
    }

    /// Entries in ascending hex index order.
    pub fn iter(&self) -> impl Iterator<Item = (CellIndex, f64)> + '_ {
        self.values.iter().map(|(c, v)| (*c, *v))
    }

    /// `(hex index string, value)` rows for the hex table writer.
    pub fn rows(&self) -> Vec<(String, f64)> {
        self.iter().map(|(c, v)| (c.to_string(), v)).collect()
    }
}

pub struct HexAggregator {
    grid: HexGrid,
    aggregation: Aggregation,
}

impl HexAggregator {
    pub fn new(grid: HexGrid, aggregation: Aggregation) -> Self {
        Self { grid, aggregation }
    }

    fn assign_cells(&self, points: &[SpatializedPoint]) -> Result<Vec<CellIndex>, PipelineError> {
        points.par_iter().map(|p| self.grid.cell_at(p.location())).collect()
    }

    /// Aggregates `points` (the spatialized primary chunk) into the hexes the
    /// chunk owns, merging in neighbor points for hexes that cross its edge.
    ///
    /// The resolver is only consulted when at least one owned hex crosses the
    /// chunk boundary. Any neighbor failure aborts the whole chunk.
    pub fn aggregate(
        &self,
        area: &StudyArea,
        chunk: &Chunk,
        points: &[SpatializedPoint],
        transform: &dyn CrsTransform,
        resolver: &dyn NeighborResolver,
        rasters: &dyn RasterSource,
    ) -> Result<AggregatedPrediction, PipelineError> {
        let boundary = chunk_boundary(area, chunk, transform)?;
        let cells = self.assign_cells(points)?;

        // Ownership and boundary status per distinct hex.
        let distinct: Vec<CellIndex> =
            cells.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let classified: Vec<(CellIndex, bool, Option<Polygon>)> = distinct
            .par_iter()
            .map(|&cell| {
                if !boundary.contains_point(self.grid.centroid(cell)) {
                    return (cell, false, None);
                }
                let hex = self.grid.boundary(cell);
                let crossing = if boundary.contains_polygon(&hex) { None } else { Some(hex) };
                (cell, true, crossing)
            })
            .collect();

        let owned: HashSet<CellIndex> =
            classified.iter().filter(|(_, own, _)| *own).map(|(c, _, _)| *c).collect();
        let crossing: Vec<Polygon> =
            classified.into_iter().filter_map(|(_, _, poly)| poly).collect();

        let mut acc: BTreeMap<CellIndex, Accumulator> = BTreeMap::new();
        let mut add = |cell: CellIndex, value: f64| {
            acc.entry(cell)
                .and_modify(|a| a.push(value))
                .or_insert_with(|| Accumulator::new(value));
        };
        for (cell, p) in cells.iter().zip(points) {
            if owned.contains(cell) {
                add(*cell, p.value);
            }
        }

        debug!(
            chunk_id = %chunk.id,
            points = points.len(),
            owned = owned.len(),
            boundary_cells = crossing.len(),
            "assigned hex cells"
        );

        if !crossing.is_empty() {
            for neighbor in resolver.neighbors(area, chunk)? {
                let neighbor_boundary = chunk_boundary(area, &neighbor, transform)?;
                if !crossing.iter().any(|hex| hex.intersects(&neighbor_boundary)) {
                    continue;
                }
                let raster = rasters.raster(&neighbor)?;
                let neighbor_points = spatialize(area, &neighbor, &raster, transform)?;
                let neighbor_cells = self.assign_cells(&neighbor_points)?;
                let mut merged = 0usize;
                for (cell, p) in neighbor_cells.iter().zip(&neighbor_points) {
                    if owned.contains(cell) {
                        add(*cell, p.value);
                        merged += 1;
                    }
                }
                debug!(
                    chunk_id = %chunk.id,
                    neighbor_id = %neighbor.id,
                    merged,
                    "merged neighbor points"
                );
            }
        }

        Ok(AggregatedPrediction {
            values: acc.into_iter().map(|(cell, a)| (cell, a.finish(self.aggregation))).collect(),
        })
    }
}
