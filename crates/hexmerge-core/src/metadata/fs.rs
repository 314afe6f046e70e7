//! JSON-document metadata store on a local directory.
//!
//! Layout under the root:
//!
//! ```text
//! study_areas/<name>.json
//! study_areas/<name>/chunks/<chunk_id>.json
//! models/<model_id>/runs/<batch_id>.json
//! locks/<key>.json
//! ```
//!
//! The `(x_index, y_index)` index is built once per study area on first use and
//! kept for the lifetime of the store; chunk documents are immutable once
//! published so the index never goes stale within an invocation.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ChunkDoc, LockRecord, LockStore, MetadataStore, RunDoc, StudyAreaDoc};
use crate::storage::StoreError;

type PositionIndex = HashMap<(u32, u32), String>;

#[derive(Debug)]
pub struct FsMetadataStore {
    root: PathBuf,
    positions: Mutex<HashMap<String, PositionIndex>>,
}

impl FsMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), positions: Mutex::new(HashMap::new()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn study_area_path(&self, name: &str) -> PathBuf {
        self.root.join("study_areas").join(format!("{name}.json"))
    }

    fn chunks_dir(&self, study_area: &str) -> PathBuf {
        self.root.join("study_areas").join(study_area).join("chunks")
    }

    fn run_path(&self, model_id: &str, batch_id: &str) -> PathBuf {
        self.root.join("models").join(model_id).join("runs").join(format!("{batch_id}.json"))
    }

    fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn write_study_area(&self, name: &str, doc: &StudyAreaDoc) -> Result<(), StoreError> {
        write_json(&self.study_area_path(name), doc)
    }

    pub fn write_chunk(
        &self,
        study_area: &str,
        chunk_id: &str,
        doc: &ChunkDoc,
    ) -> Result<(), StoreError> {
        write_json(&self.chunks_dir(study_area).join(format!("{chunk_id}.json")), doc)?;
        if let Ok(mut positions) = self.positions.lock() {
            positions.remove(study_area);
        }
        Ok(())
    }

    pub fn write_run(
        &self,
        model_id: &str,
        batch_id: &str,
        doc: &RunDoc,
    ) -> Result<(), StoreError> {
        write_json(&self.run_path(model_id, batch_id), doc)
    }

    fn build_index(&self, study_area: &str) -> Result<PositionIndex, StoreError> {
        let mut index = PositionIndex::new();
        for id in self.chunk_ids(study_area)? {
            if let Some(doc) = self.chunk(study_area, &id)? {
                if let (Some(x), Some(y)) = (doc.x_index, doc.y_index) {
                    index.insert((x, y), id);
                }
            }
        }
        Ok(index)
    }
}

fn key_of(path: &Path) -> String {
    path.display().to_string()
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(key_of(path), e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Corrupt { key: key_of(path), reason: e.to_string() })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(key_of(path), e))?;
    }
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Corrupt { key: key_of(path), reason: e.to_string() })?;
    fs::write(path, bytes).map_err(|e| StoreError::io(key_of(path), e))
}

/// Document names (file stems) of the `.json` files directly under `dir`.
fn json_stems(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(key_of(dir), e)),
    };
    let mut stems = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(key_of(dir), e))?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.push(stem.to_string());
            }
        }
    }
    stems.sort();
    Ok(stems)
}

impl MetadataStore for FsMetadataStore {
    fn study_area(&self, name: &str) -> Result<Option<StudyAreaDoc>, StoreError> {
        read_json(&self.study_area_path(name))
    }

    fn chunk(&self, study_area: &str, chunk_id: &str) -> Result<Option<ChunkDoc>, StoreError> {
        read_json(&self.chunks_dir(study_area).join(format!("{chunk_id}.json")))
    }

    fn chunk_at(
        &self,
        study_area: &str,
        x: u32,
        y: u32,
    ) -> Result<Option<(String, ChunkDoc)>, StoreError> {
        let cached = self
            .positions
            .lock()
            .map_err(|_| StoreError::Unavailable("position index lock poisoned".into()))?
            .get(study_area)
            .map(|index| index.get(&(x, y)).cloned());
        let id = match cached {
            Some(id) => id,
            None => {
                let index = self.build_index(study_area)?;
                let id = index.get(&(x, y)).cloned();
                if let Ok(mut positions) = self.positions.lock() {
                    positions.insert(study_area.to_string(), index);
                }
                id
            }
        };
        match id {
            Some(id) => Ok(self.chunk(study_area, &id)?.map(|doc| (id, doc))),
            None => Ok(None),
        }
    }

    fn chunk_ids(&self, study_area: &str) -> Result<Vec<String>, StoreError> {
        json_stems(&self.chunks_dir(study_area))
    }

    fn run(&self, model_id: &str, batch_id: &str) -> Result<Option<RunDoc>, StoreError> {
        read_json(&self.run_path(model_id, batch_id))
    }
}

impl LockStore for FsMetadataStore {
    fn try_create(&self, key: &str, record: &LockRecord) -> Result<bool, StoreError> {
        let dir = self.locks_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(key, e))?;
        let bytes = serde_json::to_vec(record)
            .map_err(|e| StoreError::Corrupt { key: key.to_string(), reason: e.to_string() })?;

        // The record is complete on disk before the lock name appears.
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(key, e))?;
        tmp.write_all(&bytes).map_err(|e| StoreError::io(key, e))?;
        match tmp.persist_noclobber(dir.join(format!("{key}.json"))) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::io(key, e.error)),
        }
    }

    fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        read_json(&self.locks_dir().join(format!("{key}.json")))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.locks_dir().join(format!("{key}.json"))) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn list(&self) -> Result<Vec<(String, LockRecord)>, StoreError> {
        let mut locks = Vec::new();
        for key in json_stems(&self.locks_dir())? {
            if let Some(record) = LockStore::get(self, &key)? {
                locks.push((key, record));
            }
        }
        Ok(locks)
    }
}
