//! The ordered block store: active chain, tip tracking, cumulative work.
//!
//! The chain keeps an in-memory index (active hash sequence, headers,
//! known alternative tips) over the persistent [`Store`]; blocks live
//! under `block:<hash>`, the height index under `block_height:<h>`, and
//! the tip record under `chain_state`. Mutations are driven by the
//! consensus engine under its commit lock; this type only synchronizes
//! its own index with a `RwLock`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use primitive_types::U256;
use tracing::debug;

use tally_core::error::ChainError;
use tally_core::store::{keys, BatchOp, ChainStateRecord, Store};
use tally_core::traits::ChainView;
use tally_core::types::{Block, BlockHeader, ChainTip, Hash256, TipStatus};

struct ChainInner {
    /// Active chain hashes; index equals height.
    active: Vec<Hash256>,
    /// Height of each active hash, for O(1) ancestry checks.
    active_index: HashMap<Hash256, u64>,
    /// Headers of every known block, active or side.
    headers: HashMap<Hash256, BlockHeader>,
    /// Known alternative tips by tip hash. The active tip is not stored here.
    tips: HashMap<Hash256, ChainTip>,
    /// Cumulative work of the active chain.
    work: U256,
}

/// Active-chain index plus alternative-tip bookkeeping.
pub struct Chain {
    store: Arc<dyn Store>,
    inner: RwLock<ChainInner>,
}

impl Chain {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            inner: RwLock::new(ChainInner {
                active: Vec::new(),
                active_index: HashMap::new(),
                headers: HashMap::new(),
                tips: HashMap::new(),
                work: U256::zero(),
            }),
        }
    }

    /// Rebuild the in-memory index from the store. Called once at startup;
    /// alternative tips are rediscovered as peers resend fork blocks.
    pub fn load(&self) -> Result<(), ChainError> {
        let mut inner = self.inner.write();
        inner.active.clear();
        inner.active_index.clear();
        inner.headers.clear();
        inner.work = U256::zero();

        for (_, hash_bytes) in self
            .store
            .iterate(&keys::block_height_prefix())
            .map_err(|e| ChainError::Store(e.to_string()))?
        {
            let hash = decode_hash(&hash_bytes)?;
            let block = self.read_block(&hash)?.ok_or_else(|| {
                ChainError::BlockNotFound(hash.to_string())
            })?;
            let height = inner.active.len() as u64;
            if block.header.height != height {
                return Err(ChainError::HeightMismatch {
                    expected: height,
                    got: block.header.height,
                });
            }
            inner.work += block.header.work();
            inner.active.push(hash);
            inner.active_index.insert(hash, height);
            inner.headers.insert(hash, block.header);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().active.is_empty()
    }

    /// Store operations that commit `block` to the active chain. Combined
    /// with the UTXO diff into one atomic batch by the engine.
    pub fn commit_ops(&self, block: &Block) -> Result<Vec<BatchOp>, ChainError> {
        let hash = block.header.hash();
        let record = ChainStateRecord {
            height: block.header.height,
            best_hash: hash,
            last_block_ts: block.header.timestamp_ms,
        };
        Ok(vec![
            BatchOp::Put {
                key: keys::block(&hash),
                value: encode_block(block)?,
            },
            BatchOp::Put {
                key: keys::block_height(block.header.height),
                value: hash.as_bytes().to_vec(),
            },
            BatchOp::Put {
                key: keys::chain_state(),
                value: encode_record(&record)?,
            },
        ])
    }

    /// Update the in-memory index after [`commit_ops`](Self::commit_ops)
    /// landed in the store.
    pub fn apply_committed(&self, block: &Block) {
        let hash = block.header.hash();
        let mut inner = self.inner.write();
        let height = block.header.height;
        inner.active.push(hash);
        inner.active_index.insert(hash, height);
        inner.headers.insert(hash, block.header.clone());
        inner.work += block.header.work();
        // Extending the active tip consumes any tip record for the parent.
        inner.tips.remove(&block.header.previous_hash);
        debug!(%hash, height, "chain: block committed");
    }

    /// Store operations that revert the active tip `block` back to its
    /// parent. The block data itself is kept for history and fork tracking.
    pub fn revert_ops(&self, block: &Block) -> Result<Vec<BatchOp>, ChainError> {
        let parent = block.header.previous_hash;
        let mut ops = vec![BatchOp::Delete {
            key: keys::block_height(block.header.height),
        }];
        if block.header.height > 0 {
            let parent_header = self
                .header_of(&parent)?
                .ok_or_else(|| ChainError::BlockNotFound(parent.to_string()))?;
            ops.push(BatchOp::Put {
                key: keys::chain_state(),
                value: encode_record(&ChainStateRecord {
                    height: parent_header.height,
                    best_hash: parent,
                    last_block_ts: parent_header.timestamp_ms,
                })?,
            });
        } else {
            ops.push(BatchOp::Delete { key: keys::chain_state() });
        }
        Ok(ops)
    }

    /// Update the in-memory index after [`revert_ops`](Self::revert_ops)
    /// landed in the store.
    pub fn apply_reverted(&self, block: &Block) {
        let hash = block.header.hash();
        let mut inner = self.inner.write();
        if inner.active.last() == Some(&hash) {
            inner.active.pop();
            inner.active_index.remove(&hash);
            inner.work -= block.header.work();
        }
    }

    /// Persist a block that is not (yet) on the active chain.
    pub fn store_side_block(&self, block: &Block) -> Result<(), ChainError> {
        let hash = block.header.hash();
        self.store
            .put(&keys::block(&hash), &encode_block(block)?)
            .map_err(|e| ChainError::Store(e.to_string()))?;
        self.inner.write().headers.insert(hash, block.header.clone());
        Ok(())
    }

    /// Insert or replace a tip record. Any record keyed by the tip's parent
    /// is removed (the branch grew).
    pub fn upsert_tip(&self, tip: ChainTip, parent: &Hash256) {
        let mut inner = self.inner.write();
        inner.tips.remove(parent);
        inner.tips.insert(tip.hash, tip);
    }

    pub fn tip_record(&self, hash: &Hash256) -> Option<ChainTip> {
        self.inner.read().tips.get(hash).cloned()
    }

    pub fn mark_tip_invalid(&self, hash: &Hash256, now_ms: u64) {
        let mut inner = self.inner.write();
        if let Some(tip) = inner.tips.get_mut(hash) {
            tip.status = TipStatus::Invalid;
            tip.last_validated_ms = now_ms;
        }
    }

    pub fn remove_tip(&self, hash: &Hash256) {
        self.inner.write().tips.remove(hash);
    }

    /// All known tips: the active tip first, then alternatives.
    pub fn tips(&self) -> Vec<ChainTip> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(1 + inner.tips.len());
        if let Some(&hash) = inner.active.last() {
            let height = inner.active.len() as u64 - 1;
            let last_validated_ms = inner
                .headers
                .get(&hash)
                .map(|h| h.timestamp_ms)
                .unwrap_or(0);
            out.push(ChainTip {
                height,
                hash,
                branch_len: 0,
                status: TipStatus::Active,
                first_block_hash: None,
                last_validated_ms,
            });
        }
        out.extend(inner.tips.values().cloned());
        out
    }

    /// Cumulative work of the active chain (sum of per-block difficulty).
    pub fn chain_work(&self) -> U256 {
        self.inner.read().work
    }

    /// Height of `hash` on the active chain, if it is on it.
    pub fn active_height_of(&self, hash: &Hash256) -> Option<u64> {
        self.inner.read().active_index.get(hash).copied()
    }

    pub fn hash_at(&self, height: u64) -> Option<Hash256> {
        self.inner.read().active.get(height as usize).copied()
    }

    /// Header by hash, from the index or the store.
    pub fn header_of(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ChainError> {
        if let Some(header) = self.inner.read().headers.get(hash).cloned() {
            return Ok(Some(header));
        }
        Ok(self.read_block(hash)?.map(|b| b.header))
    }

    /// The last `count` active-header timestamps, oldest first.
    pub fn timestamp_tail(&self, count: usize) -> Vec<u64> {
        let inner = self.inner.read();
        let start = inner.active.len().saturating_sub(count);
        inner.active[start..]
            .iter()
            .filter_map(|h| inner.headers.get(h).map(|hdr| hdr.timestamp_ms))
            .collect()
    }

    /// Work of the active suffix strictly above `ancestor_height`.
    pub fn suffix_work(&self, ancestor_height: u64) -> U256 {
        let inner = self.inner.read();
        inner
            .active
            .iter()
            .skip(ancestor_height as usize + 1)
            .filter_map(|h| inner.headers.get(h))
            .map(|hdr| hdr.work())
            .fold(U256::zero(), |acc, w| acc + w)
    }

    /// The active blocks strictly above `ancestor_height`, tip-first.
    pub fn suffix_blocks(&self, ancestor_height: u64) -> Result<Vec<Block>, ChainError> {
        let hashes: Vec<Hash256> = {
            let inner = self.inner.read();
            inner.active[(ancestor_height as usize + 1)..].to_vec()
        };
        let mut blocks = Vec::with_capacity(hashes.len());
        for hash in hashes.iter().rev() {
            blocks.push(
                self.read_block(hash)?
                    .ok_or_else(|| ChainError::BlockNotFound(hash.to_string()))?,
            );
        }
        Ok(blocks)
    }

    /// Walk a side branch from `tip_hash` back to the active chain.
    ///
    /// Returns the common-ancestor height and the branch blocks oldest
    /// first. Gives up after `max_depth` steps with
    /// [`ChainError::NoCommonAncestor`].
    pub fn walk_branch(
        &self,
        tip_hash: &Hash256,
        max_depth: u64,
    ) -> Result<(u64, Vec<Block>), ChainError> {
        let mut branch = Vec::new();
        let mut cursor = *tip_hash;
        for _ in 0..=max_depth {
            if let Some(height) = self.active_height_of(&cursor) {
                branch.reverse();
                return Ok((height, branch));
            }
            let block = self
                .read_block(&cursor)?
                .ok_or_else(|| ChainError::BlockNotFound(cursor.to_string()))?;
            cursor = block.header.previous_hash;
            branch.push(block);
        }
        Err(ChainError::NoCommonAncestor(max_depth))
    }

    fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        let raw = self
            .store
            .get(&keys::block(hash))
            .map_err(|e| ChainError::Store(e.to_string()))?;
        raw.map(|bytes| decode_block(&bytes)).transpose()
    }
}

impl ChainView for Chain {
    fn height(&self) -> Result<u64, ChainError> {
        let inner = self.inner.read();
        if inner.active.is_empty() {
            return Err(ChainError::EmptyChain);
        }
        Ok(inner.active.len() as u64 - 1)
    }

    fn tip_hash(&self) -> Result<Hash256, ChainError> {
        self.inner
            .read()
            .active
            .last()
            .copied()
            .ok_or(ChainError::EmptyChain)
    }

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        self.read_block(hash)
    }

    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, ChainError> {
        match self.hash_at(height) {
            Some(hash) => self.read_block(&hash),
            None => Ok(None),
        }
    }

    fn get_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ChainError> {
        self.header_of(hash)
    }
}

fn encode_block(block: &Block) -> Result<Vec<u8>, ChainError> {
    bincode::encode_to_vec(block, bincode::config::standard())
        .map_err(|e| ChainError::Store(e.to_string()))
}

fn decode_block(bytes: &[u8]) -> Result<Block, ChainError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(b, _)| b)
        .map_err(|e| ChainError::Store(e.to_string()))
}

fn encode_record(record: &ChainStateRecord) -> Result<Vec<u8>, ChainError> {
    bincode::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| ChainError::Store(e.to_string()))
}

fn decode_hash(bytes: &[u8]) -> Result<Hash256, ChainError> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| ChainError::Store("malformed height index entry".into()))?;
    Ok(Hash256(arr))
}
