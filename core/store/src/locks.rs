//! Per-record serialization.
//!
//! The sync engine's pull and the live change channel can both try to update
//! the same record. Every read-resolve-write sequence runs under the lock of
//! its record, so unrelated records never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ledgerkeep_common::{EntityType, Error, RecordId, Result};

type RecordKey = (EntityType, RecordId);

/// Table of locks keyed by record, created on demand and dropped when idle.
#[derive(Default)]
pub struct RecordLocks {
    locks: Mutex<HashMap<RecordKey, Arc<Mutex<()>>>>,
}

impl RecordLocks {
    /// Run `f` while holding the lock for one record.
    pub fn with<T>(
        &self,
        entity_type: EntityType,
        id: &RecordId,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let key = (entity_type, id.clone());
        let lock = {
            let mut map = self.locks.lock().map_err(|_| poisoned())?;
            map.entry(key.clone()).or_default().clone()
        };

        let result = {
            let _guard = lock.lock().map_err(|_| poisoned())?;
            f()
        };

        // Clones are only handed out under the map lock, so a count of two
        // (map + ours) means nobody else is waiting on this record.
        if let Ok(mut map) = self.locks.lock() {
            if Arc::strong_count(&lock) == 2 {
                map.remove(&key);
            }
        }

        result
    }

    /// Number of records with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> Error {
    Error::Storage("record lock poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_lock_entries_are_released() {
        let locks = RecordLocks::default();
        let id = RecordId::new("r-1").unwrap();

        let value = locks.with(EntityType::Inventory, &id, || Ok(42)).unwrap();
        assert_eq!(value, 42);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_same_record_is_serialized() {
        let locks = Arc::new(RecordLocks::default());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let id = RecordId::new("shared").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = inside.clone();
                let max_seen = max_seen.clone();
                let id = id.clone();
                thread::spawn(move || {
                    locks
                        .with(EntityType::Inventory, &id, || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(2));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn test_error_is_propagated() {
        let locks = RecordLocks::default();
        let id = RecordId::new("r-1").unwrap();
        let result: Result<()> = locks.with(EntityType::Contact, &id, || {
            Err(Error::InvalidInput("nope".into()))
        });
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(locks.is_empty());
    }
}
