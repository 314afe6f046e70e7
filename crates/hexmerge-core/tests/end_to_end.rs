//! Split -> spatialize -> merge over in-memory stores.

use hexmerge_core::config::AggregationConfig;
use hexmerge_core::metadata::{Chunk, LockStore, MemoryMetadataStore, RunDoc, StudyArea};
use hexmerge_core::storage::{MemoryObjectStore, ObjectStore};
use hexmerge_core::table::read_prediction_table;
use hexmerge_core::{
    ChunkSpatializer, HexGrid, MergeCoordinator, MergeOptions, MergeOutcome, PredictionSplitter,
    SpatializeOutcome, SplitOutcome,
};

const SCENARIOS: [&str; 2] = ["s0", "s1"];

fn partition() -> MemoryMetadataStore {
    let area = StudyArea {
        name: "study-area".into(),
        cell_size: 10.0,
        crs: "EPSG:32618".into(),
        chunk_x_count: 2,
        chunk_y_count: 1,
    };
    let chunk = |id: &str, x: u32| Chunk {
        id: id.into(),
        row_count: 2,
        col_count: 3,
        x_ll_corner: 500.0 + x as f64 * 30.0,
        y_ll_corner: 100.0,
        x_index: x,
        y_index: 0,
    };
    let store = MemoryMetadataStore::new();
    store.put_partition(&area, &[chunk("c0", 0), chunk("c1", 1)]);
    let scenario_ids = SCENARIOS.iter().map(|s| s.to_string()).collect();
    store.put_run("model-id", "id", RunDoc { scenario_ids: Some(scenario_ids) });
    store
}

fn shard(scale: f64) -> String {
    let line = |chunk: &str, base: f64| {
        format!(
            r#"{{"instance": {{"key": "{chunk}"}}, "prediction": [[{}, {}, {}], [{}, {}, {}]]}}"#,
            base * scale,
            (base + 1.0) * scale,
            (base + 2.0) * scale,
            (base + 3.0) * scale,
            (base + 4.0) * scale,
            (base + 5.0) * scale,
        )
    };
    format!("{}\n{}\n", line("c0", 1.0), line("c1", 7.0))
}

#[test]
fn batch_output_becomes_merged_hex_tables() {
    let metadata = partition();
    let predictions = MemoryObjectStore::new();
    let chunk_predictions = MemoryObjectStore::new();
    let spatialized = MemoryObjectStore::new();
    let merged = MemoryObjectStore::new();

    // Split.
    let splitter = PredictionSplitter::new(&predictions, &chunk_predictions, 4);
    let mut raw_keys = Vec::new();
    for (i, scenario) in SCENARIOS.iter().enumerate() {
        let key =
            format!("id/flood/model-id/study-area/{scenario}/prediction.results-00000-of-00001");
        predictions.put(&key, shard(i as f64 + 1.0).as_bytes()).unwrap();
        match splitter.handle(&key).unwrap() {
            SplitOutcome::Split { keys } => raw_keys.extend(keys),
            other => panic!("expected Split for {key}, got {other:?}"),
        }
    }
    assert_eq!(raw_keys.len(), 4);

    // Every table write triggers the coordinator; only the last one merges.
    let spatializer = ChunkSpatializer::new(
        &metadata,
        &chunk_predictions,
        &spatialized,
        HexGrid::default(),
        AggregationConfig::default(),
    );
    let options =
        MergeOptions { workers: 2, io_threads: 2, lock_stale_after: None, holder: "e2e".into() };
    let coordinator = MergeCoordinator::new(&metadata, &metadata, &spatialized, &merged, options);
    let mut outcomes = Vec::new();
    for key in &raw_keys {
        match spatializer.handle(key).unwrap() {
            SpatializeOutcome::Written { key, hexes } => {
                assert!(hexes > 0, "{key} produced no hexes");
                outcomes.push(coordinator.handle(&key).unwrap());
            }
            SpatializeOutcome::Rejected(e) => panic!("{key} rejected: {e}"),
        }
    }
    let (last, earlier) = outcomes.split_last().unwrap();
    assert_eq!(earlier.len(), 3);
    for outcome in earlier {
        assert!(matches!(outcome, MergeOutcome::NotYetComplete), "got {outcome:?}");
    }
    match last {
        MergeOutcome::Merged { chunks, .. } => assert_eq!(*chunks, 2),
        other => panic!("expected Merged, got {other:?}"),
    }
    assert!(LockStore::list(&metadata).unwrap().is_empty(), "merge lock released");

    for chunk in ["c0", "c1"] {
        let merged_key = format!("id/flood/model-id/study-area/{chunk}.csv");
        let text = String::from_utf8(merged.get(&merged_key).unwrap().unwrap()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("h3_index,s0,s1"));

        let s0_key = format!("id/flood/model-id/study-area/s0/{chunk}.csv");
        let s0_bytes = spatialized.get(&s0_key).unwrap().unwrap();
        let s0 = read_prediction_table(&s0_bytes, &s0_key).unwrap();
        let rows: Vec<&str> = lines.collect();
        assert_eq!(rows.len(), s0.len(), "one merged row per hex of {chunk}");
        for row in rows {
            let fields: Vec<f64> = row.split(',').skip(1).map(|v| v.parse().unwrap()).collect();
            assert_eq!(fields.len(), 2);
            assert_eq!(fields[1], fields[0] * 2.0, "scenario s1 doubles s0 under max aggregation");
        }
    }
}
