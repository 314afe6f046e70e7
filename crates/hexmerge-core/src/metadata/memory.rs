use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};

use super::{ChunkDoc, LockRecord, LockStore, MetadataStore, RunDoc, StudyArea, StudyAreaDoc, Chunk};
use crate::storage::StoreError;

#[derive(Debug, Default)]
struct AreaEntry {
    doc: StudyAreaDoc,
    chunks: BTreeMap<String, ChunkDoc>,
    /// Composite (x_index, y_index) -> chunk id.
    by_position: HashMap<(u32, u32), String>,
}

/// In-process metadata and lock store.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    areas: RwLock<HashMap<String, AreaEntry>>,
    runs: RwLock<HashMap<(String, String), RunDoc>>,
    locks: Mutex<BTreeMap<String, LockRecord>>,
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory metadata lock poisoned".into())
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_study_area(&self, name: &str, doc: StudyAreaDoc) {
        if let Ok(mut areas) = self.areas.write() {
            areas.entry(name.to_string()).or_default().doc = doc;
        }
    }

    pub fn put_chunk(&self, study_area: &str, chunk_id: &str, doc: ChunkDoc) {
        if let Ok(mut areas) = self.areas.write() {
            let entry = areas.entry(study_area.to_string()).or_default();
            if let Some(old) = entry.chunks.get(chunk_id) {
                if let (Some(x), Some(y)) = (old.x_index, old.y_index) {
                    entry.by_position.remove(&(x, y));
                }
            }
            if let (Some(x), Some(y)) = (doc.x_index, doc.y_index) {
                entry.by_position.insert((x, y), chunk_id.to_string());
            }
            entry.chunks.insert(chunk_id.to_string(), doc);
        }
    }

    pub fn remove_chunk(&self, study_area: &str, chunk_id: &str) {
        if let Ok(mut areas) = self.areas.write() {
            if let Some(entry) = areas.get_mut(study_area) {
                if let Some(old) = entry.chunks.remove(chunk_id) {
                    if let (Some(x), Some(y)) = (old.x_index, old.y_index) {
                        entry.by_position.remove(&(x, y));
                    }
                }
            }
        }
    }

    /// Registers a validated study area and its chunks.
    pub fn put_partition(&self, area: &StudyArea, chunks: &[Chunk]) {
        self.put_study_area(&area.name, area.into());
        for chunk in chunks {
            self.put_chunk(&area.name, &chunk.id, chunk.into());
        }
    }

    pub fn put_run(&self, model_id: &str, batch_id: &str, doc: RunDoc) {
        if let Ok(mut runs) = self.runs.write() {
            runs.insert((model_id.to_string(), batch_id.to_string()), doc);
        }
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn study_area(&self, name: &str) -> Result<Option<StudyAreaDoc>, StoreError> {
        let areas = self.areas.read().map_err(|_| poisoned())?;
        Ok(areas.get(name).map(|e| e.doc.clone()))
    }

    fn chunk(&self, study_area: &str, chunk_id: &str) -> Result<Option<ChunkDoc>, StoreError> {
        let areas = self.areas.read().map_err(|_| poisoned())?;
        Ok(areas.get(study_area).and_then(|e| e.chunks.get(chunk_id).cloned()))
    }

    fn chunk_at(
        &self,
        study_area: &str,
        x: u32,
        y: u32,
    ) -> Result<Option<(String, ChunkDoc)>, StoreError> {
        let areas = self.areas.read().map_err(|_| poisoned())?;
        Ok(areas.get(study_area).and_then(|e| {
            let id = e.by_position.get(&(x, y))?;
            e.chunks.get(id).map(|doc| (id.clone(), doc.clone()))
        }))
    }

    fn chunk_ids(&self, study_area: &str) -> Result<Vec<String>, StoreError> {
        let areas = self.areas.read().map_err(|_| poisoned())?;
        Ok(areas.get(study_area).map(|e| e.chunks.keys().cloned().collect()).unwrap_or_default())
    }

    fn run(&self, model_id: &str, batch_id: &str) -> Result<Option<RunDoc>, StoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs.get(&(model_id.to_string(), batch_id.to_string())).cloned())
    }
}

impl LockStore for MemoryMetadataStore {
    fn try_create(&self, key: &str, record: &LockRecord) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().map_err(|_| poisoned())?;
        if locks.contains_key(key) {
            return Ok(false);
        }
        locks.insert(key.to_string(), record.clone());
        Ok(true)
    }

    fn get(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        let locks = self.locks.lock().map_err(|_| poisoned())?;
        Ok(locks.get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut locks = self.locks.lock().map_err(|_| poisoned())?;
        locks.remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<(String, LockRecord)>, StoreError> {
        let locks = self.locks.lock().map_err(|_| poisoned())?;
        Ok(locks.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_index_follows_updates() {
        let store = MemoryMetadataStore::new();
        let doc = ChunkDoc { x_index: Some(1), y_index: Some(2), ..Default::default() };
        store.put_chunk("area", "c1", doc);
        assert_eq!(store.chunk_at("area", 1, 2).unwrap().map(|(id, _)| id), Some("c1".to_string()));

        let moved = ChunkDoc { x_index: Some(0), y_index: Some(0), ..Default::default() };
        store.put_chunk("area", "c1", moved);
        assert!(
            store.chunk_at("area", 1, 2).unwrap().is_none(),
            "stale position must be unindexed"
        );
        assert!(store.chunk_at("area", 0, 0).unwrap().is_some());

        store.remove_chunk("area", "c1");
        assert!(store.chunk_at("area", 0, 0).unwrap().is_none());
    }

    #[test]
    fn lock_create_is_exclusive() {
        let store = MemoryMetadataStore::new();
        assert!(store.try_create("k", &LockRecord::new("a")).unwrap());
        assert!(!store.try_create("k", &LockRecord::new("b")).unwrap());
        assert_eq!(store.get("k").unwrap().unwrap().holder, "a");
        store.delete("k").unwrap();
        store.delete("k").unwrap();
        assert!(store.try_create("k", &LockRecord::new("b")).unwrap());
    }

    #[test]
    fn concurrent_acquisition_has_one_winner() {
        let store = MemoryMetadataStore::new();
        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = &store;
                    let record = LockRecord::new(format!("w{i}"));
                    s.spawn(move || store.try_create("batch-lock", &record).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(winners, 1, "exactly one invocation may hold the lock");
    }
}
