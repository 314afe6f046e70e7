//! Scoped ownership of a merge lock.

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use crate::metadata::{LockRecord, LockStore};
use crate::storage::StoreError;

/// Holds a merge lock until [`MergeLockGuard::release`] or drop.
///
/// Dropping without `release` (early return, panic unwinding) still deletes
/// the lock; a failed delete there can only be logged.
pub struct MergeLockGuard<'a> {
    store: &'a dyn LockStore,
    key: String,
    released: bool,
}

pub enum Acquisition<'a> {
    Acquired(MergeLockGuard<'a>),
    /// Another invocation holds the lock. `None` if it vanished between the
    /// failed create and the read, or its record could not be parsed.
    Held(Option<LockRecord>),
}

impl<'a> MergeLockGuard<'a> {
    pub fn acquire(
        store: &'a dyn LockStore,
        key: &str,
        holder: &str,
    ) -> Result<Acquisition<'a>, StoreError> {
        if store.try_create(key, &LockRecord::new(holder))? {
            debug!(lock_key = key, holder, "acquired merge lock");
            let guard = Self { store, key: key.to_string(), released: false };
            return Ok(Acquisition::Acquired(guard));
        }
        match store.get(key) {
            Ok(record) => Ok(Acquisition::Held(record)),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!(
                    lock_key = key,
                    reason = %reason,
                    "merge lock exists but its record is unreadable"
                );
                Ok(Acquisition::Held(None))
            }
            Err(e) => Err(e),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.store.delete(&self.key)?;
        debug!(lock_key = %self.key, "released merge lock");
        Ok(())
    }
}

impl Drop for MergeLockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.store.delete(&self.key) {
            Ok(()) => debug!(lock_key = %self.key, "released merge lock on unwind"),
            Err(e) => error!(
                lock_key = %self.key,
                error = %e,
                "failed to release merge lock; clear it manually"
            ),
        }
    }
}

/// True when `record` is older than `stale_after`.
pub fn is_stale(
    record: &LockRecord,
    stale_after: Option<chrono::Duration>,
    now: DateTime<Utc>,
) -> bool {
    stale_after.is_some_and(|limit| record.age(now) > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{FsMetadataStore, MemoryMetadataStore};

    #[test]
    fn second_acquire_sees_holder() {
        let store = MemoryMetadataStore::new();
        let guard = match MergeLockGuard::acquire(&store, "k", "first").unwrap() {
            Acquisition::Acquired(g) => g,
            Acquisition::Held(_) => panic!("lock should be free"),
        };
        match MergeLockGuard::acquire(&store, "k", "second").unwrap() {
            Acquisition::Held(Some(record)) => assert_eq!(record.holder, "first"),
            _ => panic!("lock should be held"),
        }
        guard.release().unwrap();
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn drop_releases() {
        let store = MemoryMetadataStore::new();
        {
            let _guard = match MergeLockGuard::acquire(&store, "k", "h").unwrap() {
                Acquisition::Acquired(g) => g,
                Acquisition::Held(_) => panic!("lock should be free"),
            };
            assert!(store.get("k").unwrap().is_some());
        }
        assert!(store.get("k").unwrap().is_none(), "dropping the guard deletes the lock");
    }

    #[test]
    fn panic_releases() {
        let store = MemoryMetadataStore::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = MergeLockGuard::acquire(&store, "k", "h").unwrap();
            panic!("merge worker blew up");
        }));
        assert!(result.is_err());
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn unreadable_lock_record_still_counts_as_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsMetadataStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("locks")).unwrap();
        std::fs::write(dir.path().join("locks/k.json"), b"").unwrap();
        match MergeLockGuard::acquire(&store, "k", "second").unwrap() {
            Acquisition::Held(None) => {}
            Acquisition::Held(Some(r)) => panic!("unexpected record {r:?}"),
            Acquisition::Acquired(_) => panic!("lock file exists"),
        }
        assert!(dir.path().join("locks/k.json").exists(), "the other holder's lock is untouched");
    }

    #[test]
    fn staleness() {
        let mut record = LockRecord::new("h");
        let now = record.acquired_at + chrono::Duration::seconds(120);
        assert!(!is_stale(&record, None, now));
        assert!(!is_stale(&record, Some(chrono::Duration::seconds(300)), now));
        record.acquired_at -= chrono::Duration::seconds(600);
        assert!(is_stale(&record, Some(chrono::Duration::seconds(300)), now));
    }
}
