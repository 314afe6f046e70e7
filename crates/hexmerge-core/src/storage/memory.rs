use std::collections::BTreeMap;
use std::sync::RwLock;

use super::{ObjectStore, StoreError};

/// In-process bucket. Used by tests and by dry runs of the CLI.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
