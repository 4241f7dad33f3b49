//! Abstract key-value store consumed by the core.
//!
//! The [`Store`] trait offers plain reads/writes, prefix iteration, atomic
//! batches, and snapshot handles for rollback during reorganizations.
//! [`MemoryStore`] is the in-memory implementation used by tests; the node
//! crate provides the persistent RocksDB implementation.
//!
//! Key namespaces (all ASCII-prefixed):
//! `block:<hash>`, `block_height:<h>`, `utxo:<tx>:<idx>`, `tx:<id>`,
//! `undo:<hash>`, `vote:<period>:<voter>`, `chain_state`, `peer:<id>:*`,
//! `ban:<addr>`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::StoreError;
use crate::types::Hash256;

/// Opaque snapshot handle returned by [`Store::snapshot`].
pub type SnapshotId = u64;

/// A single mutation inside an atomic batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Key-value store with atomic batches and rollback snapshots.
///
/// All methods take `&self`; implementations provide interior mutability so
/// a store can be shared behind an `Arc`.
pub trait Store: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply all operations atomically: either every op lands or none does.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;

    /// Open a rollback point covering all subsequent mutations.
    fn snapshot(&self) -> Result<SnapshotId, StoreError>;

    /// Discard the rollback point, keeping mutations made since.
    fn commit_snapshot(&self, id: SnapshotId) -> Result<(), StoreError>;

    /// Restore the state captured at the rollback point.
    fn rollback_snapshot(&self, id: SnapshotId) -> Result<(), StoreError>;
}

/// Key builders for the store namespaces.
pub mod keys {
    use super::*;
    use crate::address::Address;

    pub fn block(hash: &Hash256) -> Vec<u8> {
        let mut k = b"block:".to_vec();
        k.extend_from_slice(hash.as_bytes());
        k
    }

    /// Zero-padded decimal height so lexicographic key order equals height order.
    pub fn block_height(height: u64) -> Vec<u8> {
        format!("block_height:{height:020}").into_bytes()
    }

    pub fn block_height_prefix() -> Vec<u8> {
        b"block_height:".to_vec()
    }

    pub fn utxo(txid: &Hash256, index: u32) -> Vec<u8> {
        let mut k = b"utxo:".to_vec();
        k.extend_from_slice(txid.as_bytes());
        k.push(b':');
        k.extend_from_slice(&index.to_be_bytes());
        k
    }

    pub fn utxo_prefix() -> Vec<u8> {
        b"utxo:".to_vec()
    }

    pub fn tx(id: &Hash256) -> Vec<u8> {
        let mut k = b"tx:".to_vec();
        k.extend_from_slice(id.as_bytes());
        k
    }

    pub fn undo(block_hash: &Hash256) -> Vec<u8> {
        let mut k = b"undo:".to_vec();
        k.extend_from_slice(block_hash.as_bytes());
        k
    }

    pub fn vote(period_id: u64, voter: &Address) -> Vec<u8> {
        format!("vote:{period_id:020}:{voter}").into_bytes()
    }

    pub fn vote_prefix(period_id: u64) -> Vec<u8> {
        format!("vote:{period_id:020}:").into_bytes()
    }

    pub fn chain_state() -> Vec<u8> {
        b"chain_state".to_vec()
    }

    pub fn peer(peer_id: &str, field: &str) -> Vec<u8> {
        format!("peer:{peer_id}:{field}").into_bytes()
    }

    pub fn ban(addr: &str) -> Vec<u8> {
        format!("ban:{addr}").into_bytes()
    }
}

/// Persisted chain-state record under the `chain_state` key, updated
/// atomically with every commit.
#[derive(
    Clone, Debug, PartialEq, Eq,
    serde::Serialize, serde::Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct ChainStateRecord {
    pub height: u64,
    pub best_hash: Hash256,
    pub last_block_ts: u64,
}

/// In-memory [`Store`] for tests: a `BTreeMap` guarded by a `RwLock`, with
/// full-copy snapshots. No persistence, unbounded growth.
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    snapshots: RwLock<HashMap<SnapshotId, BTreeMap<Vec<u8>, Vec<u8>>>>,
    next_snapshot: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            next_snapshot: AtomicU64::new(1),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.data.write().remove(key);
        Ok(())
    }

    fn iterate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let data = self.data.read();
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<SnapshotId, StoreError> {
        let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst);
        let copy = self.data.read().clone();
        self.snapshots.write().insert(id, copy);
        Ok(id)
    }

    fn commit_snapshot(&self, id: SnapshotId) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::UnknownSnapshot(id))
    }

    fn rollback_snapshot(&self, id: SnapshotId) -> Result<(), StoreError> {
        let saved = self
            .snapshots
            .write()
            .remove(&id)
            .ok_or(StoreError::UnknownSnapshot(id))?;
        *self.data.write() = saved;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStore::new();
        store.put(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }

    #[test]
    fn iterate_respects_prefix_and_order() {
        let store = MemoryStore::new();
        store.put(b"utxo:b", b"2").unwrap();
        store.put(b"utxo:a", b"1").unwrap();
        store.put(b"tx:z", b"x").unwrap();

        let pairs = store.iterate(b"utxo:").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, b"utxo:a".to_vec());
        assert_eq!(pairs[1].0, b"utxo:b".to_vec());
    }

    #[test]
    fn batch_applies_all_ops() {
        let store = MemoryStore::new();
        store.put(b"old", b"1").unwrap();
        store
            .batch(vec![
                BatchOp::Put { key: b"a".to_vec(), value: b"1".to_vec() },
                BatchOp::Put { key: b"b".to_vec(), value: b"2".to_vec() },
                BatchOp::Delete { key: b"old".to_vec() },
            ])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"old").unwrap(), None);
    }

    #[test]
    fn rollback_restores_snapshot_state() {
        let store = MemoryStore::new();
        store.put(b"k", b"before").unwrap();

        let snap = store.snapshot().unwrap();
        store.put(b"k", b"after").unwrap();
        store.put(b"new", b"x").unwrap();

        store.rollback_snapshot(snap).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"before".to_vec()));
        assert_eq!(store.get(b"new").unwrap(), None);
    }

    #[test]
    fn commit_keeps_changes() {
        let store = MemoryStore::new();
        let snap = store.snapshot().unwrap();
        store.put(b"k", b"v").unwrap();
        store.commit_snapshot(snap).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn unknown_snapshot_errors() {
        let store = MemoryStore::new();
        assert_eq!(
            store.rollback_snapshot(99).unwrap_err(),
            StoreError::UnknownSnapshot(99)
        );
        assert_eq!(
            store.commit_snapshot(99).unwrap_err(),
            StoreError::UnknownSnapshot(99)
        );
    }

    #[test]
    fn height_keys_sort_numerically() {
        assert!(keys::block_height(9) < keys::block_height(10));
        assert!(keys::block_height(99) < keys::block_height(100));
    }

    #[test]
    fn utxo_keys_distinct_per_index() {
        let tx = Hash256([1; 32]);
        assert_ne!(keys::utxo(&tx, 0), keys::utxo(&tx, 1));
        assert!(keys::utxo(&tx, 0).starts_with(&keys::utxo_prefix()));
    }

    #[test]
    fn chain_state_round_trip() {
        let store = MemoryStore::new();
        let record = ChainStateRecord {
            height: 7,
            best_hash: Hash256([3; 32]),
            last_block_ts: 1_700_000_000_000,
        };
        let encoded = bincode::encode_to_vec(&record, bincode::config::standard()).unwrap();
        store.put(&keys::chain_state(), &encoded).unwrap();

        let raw = store.get(&keys::chain_state()).unwrap().unwrap();
        let (decoded, _): (ChainStateRecord, usize) =
            bincode::decode_from_slice(&raw, bincode::config::standard()).unwrap();
        assert_eq!(decoded, record);
    }
}
