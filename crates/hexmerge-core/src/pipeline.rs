//! Per-chunk spatialization: raw raster object in, per-scenario hex table out.

use std::time::Instant;

use tracing::{error, info};

use crate::aggregate::{HexAggregator, StoreRasterSource};
use crate::config::AggregationConfig;
use crate::error::PipelineError;
use crate::hex::HexGrid;
use crate::keys::ChunkKey;
use crate::metadata::{load_chunk, load_study_area, MetadataStore};
use crate::neighbors::MetadataNeighborResolver;
use crate::projection::{CrsTransform, ProjTransform};
use crate::raster::read_chunk_predictions;
use crate::spatialize::spatialize;
use crate::storage::ObjectStore;
use crate::table::write_prediction_table;

#[derive(Debug)]
pub enum SpatializeOutcome {
    Written { key: String, hexes: usize },
    /// A non-retriable failure, already logged.
    Rejected(PipelineError),
}

pub struct ChunkSpatializer<'a> {
    metadata: &'a dyn MetadataStore,
    /// Raw per-chunk predictions.
    input: &'a dyn ObjectStore,
    /// Per-scenario hex tables.
    output: &'a dyn ObjectStore,
    grid: HexGrid,
    aggregation: AggregationConfig,
}

impl<'a> ChunkSpatializer<'a> {
    pub fn new(
        metadata: &'a dyn MetadataStore,
        input: &'a dyn ObjectStore,
        output: &'a dyn ObjectStore,
        grid: HexGrid,
        aggregation: AggregationConfig,
    ) -> Self {
        Self { metadata, input, output, grid, aggregation }
    }

    /// Spatializes the chunk at raw key `object_key` and writes its hex table.
    /// Returns the written table key and the number of hexes.
    pub fn run(&self, object_key: &str) -> Result<(String, usize), PipelineError> {
        let started = Instant::now();
        let key = ChunkKey::parse_raw(object_key)?;
        let raster = read_chunk_predictions(self.input, object_key)?;
        let area = load_study_area(self.metadata, &key.batch.study_area)?;
        let chunk = load_chunk(self.metadata, &area.name, &key.chunk_id)?;

        let transform = ProjTransform::from_crs(&area.crs)?;
        if !transform.is_geographic() {
            self.grid.check_neighbor_sufficiency(&area, &chunk)?;
        }

        let points = spatialize(&area, &chunk, &raster, &transform)?;
        let aggregation = self.aggregation.for_prediction_type(&key.batch.prediction_type);
        let hexes = HexAggregator::new(self.grid, aggregation).aggregate(
            &area,
            &chunk,
            &points,
            &transform,
            &MetadataNeighborResolver::new(self.metadata),
            &StoreRasterSource::new(self.input, &key),
        )?;

        let table_key = key.table_key();
        let table = write_prediction_table(&hexes.rows(), &table_key)?;
        self.output.put(&table_key, &table)?;
        info!(
            object_key,
            output_key = %table_key,
            hexes = hexes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "spatialized chunk predictions"
        );
        Ok((table_key, hexes.len()))
    }

    /// Runs [`Self::run`], absorbing non-retriable failures.
    pub fn handle(&self, object_key: &str) -> Result<SpatializeOutcome, PipelineError> {
        match self.run(object_key) {
            Ok((key, hexes)) => Ok(SpatializeOutcome::Written { key, hexes }),
            Err(e) if !e.is_retriable() => {
                error!(object_key, kind = %e.kind(), error = %e, "rejected chunk predictions");
                Ok(SpatializeOutcome::Rejected(e))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregation;
    use crate::error::ErrorKind;
    use crate::metadata::{Chunk, MemoryMetadataStore, StudyArea};
    use crate::storage::{MemoryObjectStore, StoreError};
    use crate::table::read_prediction_table;

    const KEY: &str = "id/flood/model-id/study-area/scenario-id/chunk-id";

    fn seeded() -> (MemoryMetadataStore, MemoryObjectStore) {
        let area = StudyArea {
            name: "study-area".into(),
            cell_size: 10.0,
            crs: "EPSG:32618".into(),
            chunk_x_count: 1,
            chunk_y_count: 1,
        };
        let chunk = Chunk {
            id: "chunk-id".into(),
            row_count: 2,
            col_count: 3,
            x_ll_corner: 500.0,
            y_ll_corner: 100.0,
            x_index: 0,
            y_index: 0,
        };
        let metadata = MemoryMetadataStore::new();
        metadata.put_partition(&area, &[chunk]);
        let input = MemoryObjectStore::new();
        let line = concat!(
            r#"{"instance": {"values": [1, 2, 3], "key": "chunk-id"}, "#,
            r#""prediction": [[1, 2, 3], [4, 5, 6]]}"#
        );
        input.put(KEY, line.as_bytes()).unwrap();
        (metadata, input)
    }

    fn spatializer<'a>(
        metadata: &'a MemoryMetadataStore,
        input: &'a dyn ObjectStore,
        output: &'a MemoryObjectStore,
        grid: HexGrid,
    ) -> ChunkSpatializer<'a> {
        ChunkSpatializer::new(metadata, input, output, grid, AggregationConfig::default())
    }

    #[test]
    fn writes_one_row_per_owned_hex() {
        let (metadata, input) = seeded();
        let output = MemoryObjectStore::new();
        let s = spatializer(&metadata, &input, &output, HexGrid::default());

        let (key, hexes) = s.run(KEY).unwrap();
        assert_eq!(key, "id/flood/model-id/study-area/scenario-id/chunk-id.csv");
        assert_eq!(hexes, 6);
        let rows = read_prediction_table(&output.get(&key).unwrap().unwrap(), &key).unwrap();
        let mut values: Vec<f64> = rows.iter().map(|(_, v)| *v).collect();
        values.sort_by(f64::total_cmp);
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn rerun_overwrites_identically() {
        let (metadata, input) = seeded();
        let output = MemoryObjectStore::new();
        let config = AggregationConfig { default: Aggregation::Mean, ..Default::default() };
        let s = ChunkSpatializer::new(&metadata, &input, &output, HexGrid::default(), config);
        let (key, _) = s.run(KEY).unwrap();
        let first = output.get(&key).unwrap();
        s.run(KEY).unwrap();
        assert_eq!(output.get(&key).unwrap(), first);
    }

    #[test]
    fn data_problems_are_rejected_not_raised() {
        let (metadata, input) = seeded();
        let output = MemoryObjectStore::new();
        let s = spatializer(&metadata, &input, &output, HexGrid::default());

        for (key, kind) in [
            ("invalid_name", ErrorKind::MalformedKey),
            ("id/flood/model-id/study-area/scenario-id/absent", ErrorKind::MissingPredictions),
        ] {
            match s.handle(key).unwrap() {
                SpatializeOutcome::Rejected(e) => assert_eq!(e.kind(), kind, "{key}"),
                other => panic!("expected rejection for {key}, got {other:?}"),
            }
        }

        metadata.put_chunk("study-area", "chunk-id", Default::default());
        match s.handle(KEY).unwrap() {
            SpatializeOutcome::Rejected(PipelineError::InvalidMetadata { entity, .. }) => {
                assert_eq!(entity, "Chunk")
            }
            other => panic!("expected invalid chunk metadata, got {other:?}"),
        }
        assert!(output.is_empty(), "nothing written on rejection");
    }

    #[test]
    fn coarse_resolution_is_refused_before_aggregating() {
        let (metadata, input) = seeded();
        let output = MemoryObjectStore::new();
        let s = spatializer(&metadata, &input, &output, HexGrid::new(8).unwrap());
        assert!(matches!(s.run(KEY), Err(PipelineError::HexResolution(_))));
    }

    #[test]
    fn transport_failures_propagate() {
        struct Down;
        impl ObjectStore for Down {
            fn get(&self, _: &str) -> Result<Option<Vec<u8>>, StoreError> {
                Err(StoreError::Unavailable("connection reset".into()))
            }
            fn put(&self, _: &str, _: &[u8]) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("connection reset".into()))
            }
            fn list(&self, _: &str) -> Result<Vec<String>, StoreError> {
                Ok(Vec::new())
            }
        }
        let (metadata, _) = seeded();
        let output = MemoryObjectStore::new();
        let s = spatializer(&metadata, &Down, &output, HexGrid::default());
        let err = s.handle(KEY).unwrap_err();
        assert!(err.is_retriable());
    }
}
