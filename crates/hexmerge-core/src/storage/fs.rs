//! Directory-backed bucket: one file per object, keys map to relative paths.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::{ObjectStore, StoreError};

/// Suffix of in-flight writes; such files are never listed.
const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(StoreError::io(
                key,
                io::Error::new(io::ErrorKind::InvalidInput, "invalid object key"),
            ));
        }
        Ok(self.root.join(key))
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).map_err(|e| StoreError::io(key, e))?;
        // Each write stages its own temp file, then renames it over the key.
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(PARTIAL_SUFFIX)
            .tempfile_in(parent)
            .map_err(|e| StoreError::io(key, e))?;
        tmp.write_all(data).map_err(|e| StoreError::io(key, e))?;
        tmp.as_file().sync_all().map_err(|e| StoreError::io(key, e))?;
        tmp.persist(&path).map_err(|e| StoreError::io(key, e.error))?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let cause = e.into_io_error().unwrap_or_else(|| io::Error::other("walk failed"));
                StoreError::io(prefix, cause)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.ends_with(PARTIAL_SUFFIX) || !key.starts_with(prefix) {
                continue;
            }
            keys.push(key);
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("batch/flood/m/area/s0/c1.csv", b"h3_index,prediction\n").unwrap();
        store.put("batch/flood/m/area/s1/c1.csv", b"h3_index,prediction\n").unwrap();
        store.put("other/x", b"1").unwrap();

        let keys = store.list("batch/flood/m/area/").unwrap();
        assert_eq!(
            keys,
            vec!["batch/flood/m/area/s0/c1.csv", "batch/flood/m/area/s1/c1.csv"]
        );
        assert_eq!(
            store.get("other/x").unwrap().as_deref(),
            Some(&b"1"[..]),
            "written object must read back"
        );
        assert!(store.get("nope").unwrap().is_none());
    }

    #[test]
    fn concurrent_puts_of_one_key_leave_a_whole_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        let key = "batch/flood/m/area/c0.csv";
        let bodies: Vec<Vec<u8>> = (0..8u8).map(|i| vec![b'a' + i; 64 * 1024]).collect();
        std::thread::scope(|scope| {
            for body in &bodies {
                let store = &store;
                scope.spawn(move || store.put(key, body).unwrap());
            }
        });

        let stored = store.get(key).unwrap().unwrap();
        assert!(bodies.contains(&stored), "object is exactly one writer's bytes");
        assert_eq!(store.list("").unwrap(), vec![key], "no in-flight files remain or are listed");
        let files = fs::read_dir(dir.path().join("batch/flood/m/area")).unwrap().count();
        assert_eq!(files, 1);
    }

    #[test]
    fn list_on_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("absent"));
        assert!(store.list("").unwrap().is_empty());
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());
        assert!(store.put("../escape", b"x").is_err());
        assert!(store.get("a//b").is_err());
    }
}
