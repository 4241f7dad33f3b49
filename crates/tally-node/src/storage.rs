//! RocksDB-backed [`Store`] implementation.
//!
//! The flat key space uses the protocol's ASCII prefixes directly
//! (`block:`, `utxo:`, …); all mutations go through atomic
//! [`WriteBatch`]es. Snapshot handles are implemented as undo journals:
//! while a snapshot is open, every mutation records the key's prior value,
//! and rollback replays those priors in one batch. RocksDB's own
//! read-snapshots cannot restore state, so the journal is what makes a
//! reorganization abortable.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rocksdb::{Options, WriteBatch, DB};
use tracing::debug;

use tally_core::error::StoreError;
use tally_core::store::{BatchOp, SnapshotId, Store};

/// Undo journal for one open snapshot: key → value before the snapshot
/// (first write wins, so rollback restores the snapshot-time state).
type Journal = HashMap<Vec<u8>, Option<Vec<u8>>>;

/// Persistent key-value store over RocksDB.
pub struct RocksStore {
    db: DB,
    journals: Mutex<HashMap<SnapshotId, Journal>>,
    next_snapshot: AtomicU64,
}

impl RocksStore {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(Self {
            db,
            journals: Mutex::new(HashMap::new()),
            next_snapshot: AtomicU64::new(1),
        })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Record the prior value of `key` in every open journal that has not
    /// seen it yet. Must run before the mutation lands.
    fn journal_prior(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut journals = self.journals.lock();
        if journals.is_empty() {
            return Ok(());
        }
        let prior = self
            .db
            .get(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        for journal in journals.values_mut() {
            journal.entry(key.to_vec()).or_insert_with(|| prior.clone());
        }
        Ok(())
    }
}

impl Store for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.journal_prior(key)?;
        self.db
            .put(key, value)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.journal_prior(key)?;
        self.db
            .delete(key)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mode = rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward);
        let mut out = Vec::new();
        for item in self.db.iterator(mode) {
            let (key, value) = item.map_err(|e| StoreError::Corruption(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for op in &ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.journal_prior(key)?;
                    batch.put(key, value);
                }
                BatchOp::Delete { key } => {
                    self.journal_prior(key)?;
                    batch.delete(key);
                }
            }
        }
        self.db
            .write(batch)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn snapshot(&self) -> Result<SnapshotId, StoreError> {
        let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst);
        self.journals.lock().insert(id, Journal::new());
        debug!(id, "storage: snapshot opened");
        Ok(id)
    }

    fn commit_snapshot(&self, id: SnapshotId) -> Result<(), StoreError> {
        self.journals
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::UnknownSnapshot(id))
    }

    fn rollback_snapshot(&self, id: SnapshotId) -> Result<(), StoreError> {
        let journal = self
            .journals
            .lock()
            .remove(&id)
            .ok_or(StoreError::UnknownSnapshot(id))?;

        let mut batch = WriteBatch::default();
        for (key, prior) in journal {
            match prior {
                Some(value) => batch.put(&key, &value),
                None => batch.delete(&key),
            }
        }
        debug!(id, "storage: snapshot rolled back");
        self.db
            .write(batch)
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::store::keys;
    use tally_core::types::Hash256;

    fn open_temp() -> (tempfile::TempDir, RocksStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_delete_round_trip() {
        let (_dir, store) = open_temp();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RocksStore::open(dir.path()).unwrap();
            store.put(b"persist", b"1").unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"persist").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn iterate_honors_prefix() {
        let (_dir, store) = open_temp();
        store
            .put(&keys::utxo(&Hash256([1; 32]), 0), b"a")
            .unwrap();
        store
            .put(&keys::utxo(&Hash256([2; 32]), 0), b"b")
            .unwrap();
        store.put(&keys::tx(&Hash256([3; 32])), b"c").unwrap();

        let utxos = store.iterate(&keys::utxo_prefix()).unwrap();
        assert_eq!(utxos.len(), 2);
        assert!(utxos.iter().all(|(k, _)| k.starts_with(b"utxo:")));
    }

    #[test]
    fn batch_is_atomic_under_iteration() {
        let (_dir, store) = open_temp();
        store.put(b"old", b"x").unwrap();
        store
            .batch(vec![
                BatchOp::Put { key: b"a".to_vec(), value: b"1".to_vec() },
                BatchOp::Delete { key: b"old".to_vec() },
            ])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"old").unwrap(), None);
    }

    #[test]
    fn rollback_restores_prior_values() {
        let (_dir, store) = open_temp();
        store.put(b"kept", b"before").unwrap();

        let snapshot = store.snapshot().unwrap();
        store.put(b"kept", b"after").unwrap();
        store.put(b"fresh", b"x").unwrap();
        store.delete(b"kept").unwrap();

        store.rollback_snapshot(snapshot).unwrap();
        assert_eq!(store.get(b"kept").unwrap(), Some(b"before".to_vec()));
        assert_eq!(store.get(b"fresh").unwrap(), None);
    }

    #[test]
    fn rollback_covers_batches() {
        let (_dir, store) = open_temp();
        store.put(b"a", b"1").unwrap();

        let snapshot = store.snapshot().unwrap();
        store
            .batch(vec![
                BatchOp::Put { key: b"a".to_vec(), value: b"2".to_vec() },
                BatchOp::Put { key: b"b".to_vec(), value: b"9".to_vec() },
            ])
            .unwrap();

        store.rollback_snapshot(snapshot).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
    }

    #[test]
    fn commit_discards_journal() {
        let (_dir, store) = open_temp();
        let snapshot = store.snapshot().unwrap();
        store.put(b"k", b"v").unwrap();
        store.commit_snapshot(snapshot).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(matches!(
            store.rollback_snapshot(snapshot),
            Err(StoreError::UnknownSnapshot(_))
        ));
    }

    #[test]
    fn first_write_wins_in_journal() {
        let (_dir, store) = open_temp();
        store.put(b"k", b"original").unwrap();
        let snapshot = store.snapshot().unwrap();

        // Multiple writes to the same key: rollback restores the value at
        // snapshot time, not an intermediate.
        store.put(b"k", b"first").unwrap();
        store.put(b"k", b"second").unwrap();
        store.rollback_snapshot(snapshot).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"original".to_vec()));
    }
}
