//! The authoritative unspent-output set.
//!
//! Backed by the [`Store`] under the `utxo:` namespace, with per-block undo
//! records under `undo:` so any applied block can be reverted during a
//! reorganization. Application is atomic: the whole block's spends and
//! creations land in one store batch or not at all.
//!
//! A small write-through LRU cache sits on the lookup path only; the store
//! is always authoritative. Spent entries are recorded in undo data with
//! the `spent` tombstone set; committed state never contains a tombstone,
//! and [`validate`](UtxoSet::validate) treats one as corruption.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::constants::MAX_SUPPLY_UNITS;
use crate::error::UtxoError;
use crate::store::{keys, BatchOp, Store};
use crate::traits::UtxoView;
use crate::types::{Amount, Block, Hash256, OutPoint, Utxo};

/// Default lookup-cache capacity in entries.
pub const DEFAULT_CACHE_ENTRIES: usize = 8_192;

/// Undo record persisted alongside each applied block.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
struct BlockUndo {
    /// The UTXOs this block consumed, tombstoned, in spend order.
    spent: Vec<Utxo>,
}

/// The UTXO changes a block makes, computed before commit.
#[derive(Debug, Clone)]
pub struct UtxoDiff {
    pub block_hash: Hash256,
    /// Outputs the block creates.
    pub created: Vec<Utxo>,
    /// Outputs the block consumes (tombstoned copies, for undo).
    pub spent: Vec<Utxo>,
}

impl UtxoDiff {
    /// The store operations that realize this diff, including the undo
    /// record. Suitable for embedding in a larger atomic commit batch.
    pub fn batch_ops(&self) -> Result<Vec<BatchOp>, UtxoError> {
        let mut ops = Vec::with_capacity(self.spent.len() + self.created.len() + 1);
        for utxo in &self.spent {
            ops.push(BatchOp::Delete {
                key: keys::utxo(&utxo.tx_id, utxo.output_index),
            });
        }
        for utxo in &self.created {
            ops.push(BatchOp::Put {
                key: keys::utxo(&utxo.tx_id, utxo.output_index),
                value: encode(utxo)?,
            });
        }
        let undo = BlockUndo { spent: self.spent.clone() };
        ops.push(BatchOp::Put {
            key: keys::undo(&self.block_hash),
            value: bincode::encode_to_vec(&undo, bincode::config::standard())
                .map_err(|e| UtxoError::Serialization(e.to_string()))?,
        });
        Ok(ops)
    }
}

fn encode(utxo: &Utxo) -> Result<Vec<u8>, UtxoError> {
    bincode::encode_to_vec(utxo, bincode::config::standard())
        .map_err(|e| UtxoError::Serialization(e.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Utxo, UtxoError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(u, _)| u)
        .map_err(|e| UtxoError::Serialization(e.to_string()))
}

/// Fixed-capacity LRU over outpoints.
struct LruCache {
    capacity: usize,
    map: HashMap<OutPoint, (Utxo, u64)>,
    order: BTreeMap<u64, OutPoint>,
    clock: u64,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    fn get(&mut self, key: &OutPoint) -> Option<Utxo> {
        self.clock += 1;
        let clock = self.clock;
        let (utxo, stamp) = self.map.get_mut(key)?;
        self.order.remove(&*stamp);
        *stamp = clock;
        let value = utxo.clone();
        self.order.insert(clock, key.clone());
        Some(value)
    }

    fn put(&mut self, key: OutPoint, value: Utxo) {
        if self.capacity == 0 {
            return;
        }
        self.clock += 1;
        if let Some((_, old_stamp)) = self.map.insert(key.clone(), (value, self.clock)) {
            self.order.remove(&old_stamp);
        }
        self.order.insert(self.clock, key);
        while self.map.len() > self.capacity {
            let Some((_, evicted)) = self.order.pop_first() else {
                break;
            };
            self.map.remove(&evicted);
        }
    }

    fn remove(&mut self, key: &OutPoint) {
        if let Some((_, stamp)) = self.map.remove(key) {
            self.order.remove(&stamp);
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

/// Authoritative unspent-output map with apply/revert/validate.
pub struct UtxoSet {
    store: Arc<dyn Store>,
    cache: Mutex<LruCache>,
}

impl UtxoSet {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_cache_capacity(store, DEFAULT_CACHE_ENTRIES)
    }

    pub fn with_cache_capacity(store: Arc<dyn Store>, capacity: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Exact lookup by `(tx_id, output_index)`.
    pub fn get(&self, tx_id: &Hash256, index: u32) -> Result<Option<Utxo>, UtxoError> {
        let outpoint = OutPoint { txid: *tx_id, index };
        if let Some(hit) = self.cache.lock().get(&outpoint) {
            return Ok(Some(hit));
        }
        let raw = self
            .store
            .get(&keys::utxo(tx_id, index))
            .map_err(|e| UtxoError::Store(e.to_string()))?;
        match raw {
            Some(bytes) => {
                let utxo = decode(&bytes)?;
                self.cache.lock().put(outpoint, utxo.clone());
                Ok(Some(utxo))
            }
            None => Ok(None),
        }
    }

    /// Compute the diff a block would apply, without mutating anything.
    ///
    /// Fails with [`UtxoError::DoubleSpend`] if any input's UTXO is absent
    /// (or consumed earlier in the same block) and
    /// [`UtxoError::AmountMismatch`] if an input's claimed amount differs
    /// from the recorded one.
    pub fn diff_for_block(&self, block: &Block) -> Result<UtxoDiff, UtxoError> {
        let mut spent = Vec::new();
        let mut spent_set: HashSet<OutPoint> = HashSet::new();
        let mut created = Vec::new();

        for tx in &block.transactions {
            if !tx.kind.is_reward() {
                for input in &tx.inputs {
                    let outpoint = input.outpoint();
                    if !spent_set.insert(outpoint.clone()) {
                        return Err(UtxoError::DoubleSpend(outpoint.to_string()));
                    }
                    let mut utxo = self
                        .get(&input.previous_tx, input.previous_index)?
                        .ok_or_else(|| UtxoError::DoubleSpend(outpoint.to_string()))?;
                    if utxo.amount != input.claimed_amount {
                        return Err(UtxoError::AmountMismatch {
                            outpoint: outpoint.to_string(),
                            claimed: input.claimed_amount.to_string(),
                            recorded: utxo.amount.to_string(),
                        });
                    }
                    utxo.spent = true;
                    spent.push(utxo);
                }
            }

            let txid = tx.id().map_err(|e| UtxoError::Serialization(e.to_string()))?;
            for output in &tx.outputs {
                created.push(Utxo {
                    tx_id: txid,
                    output_index: output.index,
                    amount: output.amount,
                    address: output.address.clone(),
                    script: output.script.clone(),
                    timestamp_ms: block.header.timestamp_ms,
                    block_height: block.header.height,
                    coinbase: tx.kind.is_reward(),
                    spent: false,
                });
            }
        }

        Ok(UtxoDiff {
            block_hash: block.header.hash(),
            created,
            spent,
        })
    }

    /// Apply a block atomically. A failure leaves the set unchanged.
    pub fn apply_block(&self, block: &Block) -> Result<UtxoDiff, UtxoError> {
        let diff = self.diff_for_block(block)?;
        let ops = diff.batch_ops()?;
        self.store
            .batch(ops)
            .map_err(|e| UtxoError::Store(e.to_string()))?;
        self.note_applied(&diff);
        Ok(diff)
    }

    /// Refresh the cache after a diff's ops were committed externally (the
    /// chain committer folds them into one store batch with its own ops).
    pub fn note_applied(&self, diff: &UtxoDiff) {
        let mut cache = self.cache.lock();
        for utxo in &diff.spent {
            cache.remove(&utxo.outpoint());
        }
        for utxo in &diff.created {
            cache.put(utxo.outpoint(), utxo.clone());
        }
    }

    /// Drop every cached entry. Required after a store snapshot rollback,
    /// which changes state underneath the cache.
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// Revert a previously applied block using its undo record: the block's
    /// outputs are removed and its consumed UTXOs restored.
    pub fn revert_block(&self, block: &Block) -> Result<(), UtxoError> {
        let block_hash = block.header.hash();
        let undo_raw = self
            .store
            .get(&keys::undo(&block_hash))
            .map_err(|e| UtxoError::Store(e.to_string()))?
            .ok_or_else(|| UtxoError::UndoMissing(block_hash.to_string()))?;
        let undo: BlockUndo = bincode::decode_from_slice(&undo_raw, bincode::config::standard())
            .map(|(u, _)| u)
            .map_err(|e| UtxoError::Serialization(e.to_string()))?;

        let mut ops = Vec::new();
        let mut removed = Vec::new();
        for tx in block.transactions.iter().rev() {
            let txid = tx.id().map_err(|e| UtxoError::Serialization(e.to_string()))?;
            for output in &tx.outputs {
                ops.push(BatchOp::Delete {
                    key: keys::utxo(&txid, output.index),
                });
                removed.push(OutPoint { txid, index: output.index });
            }
        }
        let mut restored = Vec::new();
        for mut utxo in undo.spent {
            utxo.spent = false;
            ops.push(BatchOp::Put {
                key: keys::utxo(&utxo.tx_id, utxo.output_index),
                value: encode(&utxo)?,
            });
            restored.push(utxo);
        }
        ops.push(BatchOp::Delete { key: keys::undo(&block_hash) });

        self.store
            .batch(ops)
            .map_err(|e| UtxoError::Store(e.to_string()))?;

        let mut cache = self.cache.lock();
        for outpoint in &removed {
            cache.remove(outpoint);
        }
        for utxo in restored {
            cache.put(utxo.outpoint(), utxo);
        }
        Ok(())
    }

    /// Recompute the total supply and verify set integrity.
    ///
    /// Fails if any committed entry carries the `spent` tombstone or the
    /// total exceeds the supply cap. Returns the total.
    pub fn validate(&self) -> Result<Amount, UtxoError> {
        let cap = Amount::from_units(MAX_SUPPLY_UNITS);
        let mut total = Amount::ZERO;
        for (key, value) in self
            .store
            .iterate(&keys::utxo_prefix())
            .map_err(|e| UtxoError::Store(e.to_string()))?
        {
            let utxo = decode(&value)?;
            if utxo.spent {
                return Err(UtxoError::SpentTombstone(hex::encode(key)));
            }
            total = total
                .checked_add(utxo.amount)
                .ok_or_else(|| UtxoError::SupplyExceeded {
                    total: "overflow".into(),
                    cap: cap.to_string(),
                })?;
        }
        if total > cap {
            return Err(UtxoError::SupplyExceeded {
                total: total.to_string(),
                cap: cap.to_string(),
            });
        }
        Ok(total)
    }

    /// Wipe the set and rebuild it by applying every committed block in
    /// order. Used after corruption is detected.
    pub fn rebuild_from<I>(&self, blocks: I) -> Result<(), UtxoError>
    where
        I: IntoIterator<Item = Block>,
    {
        let mut ops = Vec::new();
        for prefix in [keys::utxo_prefix(), b"undo:".to_vec()] {
            for (key, _) in self
                .store
                .iterate(&prefix)
                .map_err(|e| UtxoError::Store(e.to_string()))?
            {
                ops.push(BatchOp::Delete { key });
            }
        }
        self.store
            .batch(ops)
            .map_err(|e| UtxoError::Store(e.to_string()))?;
        self.cache.lock().clear();

        for block in blocks {
            self.apply_block(&block)?;
        }
        Ok(())
    }

    /// Number of entries currently in the set. Linear scan; diagnostics only.
    pub fn entry_count(&self) -> Result<usize, UtxoError> {
        Ok(self
            .store
            .iterate(&keys::utxo_prefix())
            .map_err(|e| UtxoError::Store(e.to_string()))?
            .len())
    }
}

impl UtxoView for UtxoSet {
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, UtxoError> {
        self.get(&outpoint.txid, outpoint.index)
    }
}
