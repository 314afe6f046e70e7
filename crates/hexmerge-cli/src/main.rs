//! `hexmerge`: runs each pipeline entry point against directory-backed buckets.
//!
//! Every bucket is a directory `<data-dir>/buckets/<prefix><bucket>`; metadata
//! documents and merge locks live under `<data-dir>/metadata`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::error;

use hexmerge_core::audit::audit_study_area;
use hexmerge_core::logging::{self, LogFormat};
use hexmerge_core::merge::lock::is_stale;
use hexmerge_core::metadata::{FsMetadataStore, LockStore};
use hexmerge_core::storage::FsObjectStore;
use hexmerge_core::{
    ChunkSpatializer, MergeCoordinator, MergeOptions, MergeOutcome, PipelineConfig, PipelineError,
    PredictionSplitter, SpatializeOutcome, SplitOutcome,
};

#[derive(Parser, Debug)]
#[command(name = "hexmerge", about = "Chunk predictions to merged H3 hex tables")]
struct Args {
    /// JSON pipeline config; environment overrides apply on top.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root holding bucket directories and metadata.
    #[arg(long, env = "HEXMERGE_DATA_DIR", default_value = "data", global = true)]
    data_dir: PathBuf,

    /// `json` or `pretty`.
    #[arg(long, default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split a batch prediction shard into per-chunk raw files.
    Split { key: String },
    /// Aggregate one raw chunk prediction into a hex table.
    Spatialize { key: String },
    /// Merge a batch's scenario tables once all of them exist.
    Merge { key: String },
    /// Check a study area's chunk partition.
    Audit { study_area: String },
    /// Inspect or clear merge locks.
    Locks {
        #[command(subcommand)]
        action: LocksCommand,
    },
}

#[derive(Subcommand, Debug)]
enum LocksCommand {
    List,
    /// Delete a lock left behind by a crashed merge.
    Clear { key: String },
}

enum Status {
    Done,
    Rejected,
}

struct Workspace {
    config: PipelineConfig,
    data_dir: PathBuf,
    metadata: FsMetadataStore,
}

impl Workspace {
    fn open(config: PipelineConfig, data_dir: &Path) -> Self {
        let metadata = FsMetadataStore::new(data_dir.join("metadata"));
        Self { config, data_dir: data_dir.to_path_buf(), metadata }
    }

    fn bucket(&self, name: &str) -> FsObjectStore {
        FsObjectStore::new(self.data_dir.join("buckets").join(self.config.bucket(name)))
    }
}

fn print(value: serde_json::Value) {
    println!("{value}");
}

fn rejected(e: &PipelineError) -> Status {
    print(json!({
        "status": "rejected",
        "kind": format!("{:?}", e.kind()),
        "error": e.to_string(),
    }));
    Status::Rejected
}

fn split(ws: &Workspace, key: &str) -> Result<Status> {
    let input = ws.bucket(&ws.config.batch_predictions_bucket);
    let output = ws.bucket(&ws.config.chunk_predictions_bucket);
    let splitter = PredictionSplitter::new(&input, &output, ws.config.io_threads);
    Ok(match splitter.handle(key).with_context(|| format!("splitting {key}"))? {
        SplitOutcome::NotYetComplete { found, expected } => {
            print(json!({ "status": "waiting", "found": found, "expected": expected }));
            Status::Done
        }
        SplitOutcome::Split { keys } => {
            print(json!({ "status": "split", "keys": keys }));
            Status::Done
        }
        SplitOutcome::Rejected(e) => rejected(&e),
    })
}

fn spatialize(ws: &Workspace, key: &str) -> Result<Status> {
    let input = ws.bucket(&ws.config.chunk_predictions_bucket);
    let output = ws.bucket(&ws.config.spatialized_bucket);
    let grid = ws.config.grid().context("configuring the hex grid")?;
    let aggregation = ws.config.aggregation.clone();
    let spatializer = ChunkSpatializer::new(&ws.metadata, &input, &output, grid, aggregation);
    Ok(match spatializer.handle(key).with_context(|| format!("spatializing {key}"))? {
        SpatializeOutcome::Written { key, hexes } => {
            print(json!({ "status": "written", "key": key, "hexes": hexes }));
            Status::Done
        }
        SpatializeOutcome::Rejected(e) => rejected(&e),
    })
}

fn merge(ws: &Workspace, key: &str) -> Result<Status> {
    let input = ws.bucket(&ws.config.spatialized_bucket);
    let output = ws.bucket(&ws.config.merged_bucket);
    let options = MergeOptions::from_config(&ws.config);
    let coordinator = MergeCoordinator::new(&ws.metadata, &ws.metadata, &input, &output, options);
    Ok(match coordinator.handle(key).with_context(|| format!("merging after {key}"))? {
        MergeOutcome::Ignored => {
            print(json!({ "status": "ignored" }));
            Status::Done
        }
        MergeOutcome::NotYetComplete => {
            print(json!({ "status": "waiting" }));
            Status::Done
        }
        MergeOutcome::AlreadyRunning { lock, stale } => {
            print(json!({ "status": "locked", "lock": lock, "stale": stale }));
            Status::Done
        }
        MergeOutcome::Merged { chunks, hexes } => {
            print(json!({ "status": "merged", "chunks": chunks, "hexes": hexes }));
            Status::Done
        }
        MergeOutcome::Rejected(e) => rejected(&e),
    })
}

fn audit(ws: &Workspace, study_area: &str) -> Result<Status> {
    let grid = ws.config.grid().context("configuring the hex grid")?;
    let report = match audit_study_area(&ws.metadata, study_area, grid) {
        Ok(report) => report,
        Err(e) if !e.is_retriable() => return Ok(rejected(&e)),
        Err(e) => return Err(e).with_context(|| format!("auditing {study_area}")),
    };
    let problems: Vec<String> = report.problems.iter().map(ToString::to_string).collect();
    print(json!({
        "study_area": report.study_area,
        "expected_chunks": report.expected_chunks,
        "registered_chunks": report.registered_chunks,
        "problems": problems,
    }));
    Ok(if report.is_clean() { Status::Done } else { Status::Rejected })
}

fn locks(ws: &Workspace, action: &LocksCommand) -> Result<Status> {
    match action {
        LocksCommand::List => {
            let now = Utc::now();
            let stale_after = ws.config.lock_stale_after();
            for (key, record) in ws.metadata.list().context("listing merge locks")? {
                print(json!({
                    "key": key,
                    "holder": record.holder,
                    "acquired_at": record.acquired_at,
                    "age_secs": record.age(now).num_seconds(),
                    "stale": is_stale(&record, stale_after, now),
                }));
            }
        }
        LocksCommand::Clear { key } => {
            ws.metadata.delete(key).with_context(|| format!("clearing lock {key}"))?;
            print(json!({ "status": "cleared", "key": key }));
        }
    }
    Ok(Status::Done)
}

fn run(args: Args) -> Result<Status> {
    let config = PipelineConfig::load(args.config.as_deref()).context("loading pipeline config")?;
    let ws = Workspace::open(config, &args.data_dir);
    match &args.command {
        Command::Split { key } => split(&ws, key),
        Command::Spatialize { key } => spatialize(&ws, key),
        Command::Merge { key } => merge(&ws, key),
        Command::Audit { study_area } => audit(&ws, study_area),
        Command::Locks { action } => locks(&ws, action),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.log_format);

    match run(args) {
        Ok(Status::Done) => ExitCode::SUCCESS,
        Ok(Status::Rejected) => ExitCode::from(2),
        Err(e) => {
            error!(error = format!("{e:#}"), "hexmerge failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
