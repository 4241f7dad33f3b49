//! Capability interfaces between crates.
//!
//! The concrete `Chain`, `UtxoSet`, and consensus engine implement these
//! narrow traits and are composed top-down by the node; nothing holds a
//! back-reference to its owner, and tests substitute in-memory
//! implementations.
//!
//! - [`ChainView`] — read-only chain height and block lookup
//! - [`UtxoView`] — read-only UTXO queries
//! - [`ConsensusEngine`] — block validation and commit

use crate::error::{ChainError, TallyError, UtxoError};
use crate::types::{Block, BlockHeader, ChainTip, Hash256, OutPoint, Utxo};

/// Read-only view of the active chain.
pub trait ChainView: Send + Sync {
    /// Height of the active tip.
    fn height(&self) -> Result<u64, ChainError>;

    /// Hash of the active tip.
    fn tip_hash(&self) -> Result<Hash256, ChainError>;

    fn get_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError>;

    fn get_block_by_height(&self, height: u64) -> Result<Option<Block>, ChainError>;

    fn get_header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ChainError>;

    /// Default implementation delegates to [`get_header`](Self::get_header).
    fn contains_block(&self, hash: &Hash256) -> Result<bool, ChainError> {
        Ok(self.get_header(hash)?.is_some())
    }
}

/// Read-only view of the unspent output set.
pub trait UtxoView: Send + Sync {
    /// Look up a UTXO. `None` means spent or never created.
    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>, UtxoError>;
}

/// Result of submitting a block to the consensus engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The block extended the active chain.
    Extended { height: u64, hash: Hash256 },
    /// The block landed on a side branch; the active chain is unchanged.
    SideChain { tip: ChainTip },
    /// The block triggered a reorganization onto its branch.
    Reorganized {
        old_tip: Hash256,
        new_tip: Hash256,
        reverted: u64,
        applied: u64,
    },
}

/// Block validation and commit.
pub trait ConsensusEngine: Send + Sync {
    /// Validate `block` and, on success, commit it atomically. Exactly one
    /// submission is processed at a time.
    fn submit_block(&self, block: Block) -> Result<CommitOutcome, TallyError>;

    /// Validate without committing.
    fn verify_block(&self, block: &Block) -> Result<(), TallyError>;
}
