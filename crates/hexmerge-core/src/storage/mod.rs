//! Object storage seam.
//!
//! Buckets are flat key spaces with slash-delimited keys. Components receive a
//! `&dyn ObjectStore` per bucket instead of building clients themselves.

pub mod fs;
pub mod memory;

use thiserror::Error;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// A stored document exists but cannot be decoded.
    #[error("corrupt document {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io { key: key.into(), source }
    }
}

pub trait ObjectStore: Send + Sync {
    /// Returns `None` when the object does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Creates or replaces the object.
    fn put(&self, key: &str, data: &[u8]) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}
