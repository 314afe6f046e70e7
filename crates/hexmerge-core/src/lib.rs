//! Chunked raster predictions to deduplicated H3 hex tables, merged across
//! simulation scenarios.

pub mod aggregate;
pub mod audit;
pub mod config;
pub mod coords;
pub mod error;
pub mod geometry;
pub mod hex;
pub mod keys;
pub mod logging;
pub mod merge;
pub mod metadata;
pub mod neighbors;
pub mod pipeline;
pub mod projection;
pub mod raster;
pub mod spatialize;
pub mod split;
pub mod storage;
pub mod table;

pub use aggregate::{AggregatedPrediction, Aggregation, HexAggregator};
pub use config::PipelineConfig;
pub use error::{ErrorKind, PipelineError};
pub use hex::HexGrid;
pub use keys::{BatchKey, ChunkKey};
pub use merge::{MergeCoordinator, MergeOptions, MergeOutcome};
pub use pipeline::{ChunkSpatializer, SpatializeOutcome};
pub use split::{PredictionSplitter, SplitOutcome};
