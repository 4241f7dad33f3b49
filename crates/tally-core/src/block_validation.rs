//! Block validation.
//!
//! Structural checks ([`validate_block_structure`]) are context-free:
//! coinbase position, duplicate ids, merkle and validator roots, size,
//! proof-of-work against the header's own claimed difficulty, and the
//! miner's header signature. Contextual checks ([`validate_block`]) add
//! parent linkage, expected difficulty, the median-past/future-drift
//! timestamp rules, per-transaction UTXO validation with intra-block
//! double-spend detection, and the coinbase reward equation.
//!
//! The genesis block is constructed, not validated, and never passes
//! through this module.

use std::collections::HashSet;

use crate::constants::MAX_CLOCK_DRIFT_MS;
use crate::crypto::Crypto;
use crate::error::{BlockError, TransactionError};
use crate::merkle;
use crate::reward;
use crate::types::{Amount, Block, Hash256, OutPoint, Transaction, TxKind, Utxo};
use crate::validation;

/// Context the chain supplies for full block validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    /// Height the block must claim.
    pub height: u64,
    /// Required parent hash.
    pub prev_hash: Hash256,
    /// Median of the previous chain's last eleven timestamps.
    pub median_time_past_ms: u64,
    /// Difficulty the retarget schedule demands at this height.
    pub expected_difficulty: u64,
    /// Wall-clock now, for the future-drift bound.
    pub current_time_ms: u64,
    /// Dynamic block size limit at this height.
    pub max_size: usize,
}

/// Summary of a successfully validated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBlock {
    /// Sum of non-coinbase transaction fees.
    pub total_fees: Amount,
    /// Total coinbase payout.
    pub coinbase_value: Amount,
}

/// Whether the header hash satisfies the header's own difficulty target.
pub fn check_pow(block: &Block) -> bool {
    block.header.meets_target()
}

/// Median of the last up-to-eleven timestamps. `timestamps_ms` is the tail
/// of the chain's header times, oldest first; passing more than eleven uses
/// only the most recent eleven.
pub fn median_time_past(timestamps_ms: &[u64]) -> u64 {
    if timestamps_ms.is_empty() {
        return 0;
    }
    let take = timestamps_ms.len().min(crate::constants::MEDIAN_TIME_SPAN);
    let mut window: Vec<u64> = timestamps_ms[timestamps_ms.len() - take..].to_vec();
    window.sort_unstable();
    window[window.len() / 2]
}

/// Leaf value committing to one validator address.
fn validator_leaf(address: &crate::address::Address) -> Hash256 {
    crate::crypto::blake3_hash(address.as_str().as_bytes())
}

/// Merkle root over a block's validator set.
pub fn validator_root(validators: &[crate::address::Address]) -> Hash256 {
    let leaves: Vec<Hash256> = validators.iter().map(validator_leaf).collect();
    merkle::merkle_root(&leaves)
}

/// Context-free block checks.
pub fn validate_block_structure(
    block: &Block,
    max_size: usize,
    crypto: &dyn Crypto,
) -> Result<(), BlockError> {
    if block.header.version != 1 {
        return Err(BlockError::InvalidVersion(block.header.version));
    }

    if block.transactions.is_empty() {
        return Err(BlockError::NoCoinbase);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.kind == TxKind::Coinbase {
            return Err(BlockError::MultipleCoinbase);
        }
        if tx.kind == TxKind::PowReward {
            return Err(BlockError::Transaction {
                index: i,
                source: TransactionError::InvalidCoinbase(
                    "pow reward outside coinbase position".into(),
                ),
            });
        }
    }

    for (i, tx) in block.transactions.iter().enumerate() {
        validation::validate_transaction_structure(tx)
            .map_err(|source| BlockError::Transaction { index: i, source })?;
    }

    // Unique ids, and the merkle root over them.
    let mut ids = HashSet::with_capacity(block.transactions.len());
    let mut id_vec = Vec::with_capacity(block.transactions.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        let id = tx
            .id()
            .map_err(|source| BlockError::Transaction { index: i, source })?;
        if !ids.insert(id) {
            return Err(BlockError::DuplicateTxid(id.to_string()));
        }
        id_vec.push(id);
    }
    if block.header.merkle_root != merkle::merkle_root(&id_vec) {
        return Err(BlockError::InvalidMerkleRoot);
    }

    if block.header.validator_root != validator_root(&block.validators) {
        return Err(BlockError::InvalidValidatorRoot);
    }

    let size = block
        .serialized_size()
        .map_err(|source| BlockError::Transaction { index: 0, source })?;
    if size > max_size {
        return Err(BlockError::Oversized { size, max: max_size });
    }

    if !check_pow(block) {
        return Err(BlockError::InvalidPoW);
    }

    let base = block.header.header_base();
    if !crypto.verify(&base, &block.header.signature, &block.header.miner_public_key) {
        return Err(BlockError::BadMinerSignature);
    }
    let owner = crypto.public_key_hash(&block.header.miner_public_key);
    if block.header.miner_address.pubkey_hash().ok() != Some(owner) {
        return Err(BlockError::MinerAddressMismatch);
    }

    Ok(())
}

/// Full contextual validation.
///
/// `get_utxo` resolves outpoints in the state at the block's parent.
/// Spending an output created earlier in the same block is not permitted.
/// `VoteReward` transactions are structurally accepted here; their payout
/// rules are the voting engine's to enforce.
pub fn validate_block<F>(
    block: &Block,
    context: &BlockContext,
    get_utxo: F,
    crypto: &dyn Crypto,
) -> Result<ValidatedBlock, BlockError>
where
    F: Fn(&OutPoint) -> Option<Utxo>,
{
    validate_block_structure(block, context.max_size, crypto)?;

    if block.header.previous_hash != context.prev_hash {
        return Err(BlockError::UnknownParent(block.header.previous_hash.to_string()));
    }
    if block.header.height != context.height {
        return Err(BlockError::HeightMismatch {
            got: block.header.height,
            expected: context.height,
        });
    }
    if block.header.difficulty != context.expected_difficulty {
        return Err(BlockError::InvalidDifficulty {
            got: block.header.difficulty,
            expected: context.expected_difficulty,
        });
    }

    if block.header.timestamp_ms <= context.median_time_past_ms {
        return Err(BlockError::TimestampBeforeMedian);
    }
    let max_time = context.current_time_ms.saturating_add(MAX_CLOCK_DRIFT_MS);
    if block.header.timestamp_ms > max_time {
        return Err(BlockError::TimestampTooFar(
            block.header.timestamp_ms as i64 - context.current_time_ms as i64,
        ));
    }

    let mut block_spent: HashSet<OutPoint> = HashSet::new();
    let mut total_fees = Amount::ZERO;

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        for input in &tx.inputs {
            if !block_spent.insert(input.outpoint()) {
                return Err(BlockError::DoubleSpend(input.outpoint().to_string()));
            }
        }

        let validated = validation::validate_transaction(tx, &get_utxo, crypto, context.height)
            .map_err(|source| BlockError::Transaction { index: i, source })?;

        total_fees = total_fees
            .checked_add(validated.fee)
            .ok_or_else(|| BlockError::InvalidReward {
                got: "overflow".into(),
                expected: "overflow".into(),
            })?;
    }

    let coinbase = &block.transactions[0];
    reward::validate_reward(coinbase, context.height, total_fees)?;

    let coinbase_value = coinbase
        .total_output_amount()
        .ok_or_else(|| BlockError::InvalidReward {
            got: "overflow".into(),
            expected: "overflow".into(),
        })?;

    Ok(ValidatedBlock { total_fees, coinbase_value })
}

/// Helper shared by coinbase-building call sites.
pub fn coinbase_transaction(
    miner: crate::address::Address,
    value: Amount,
    height: u64,
    timestamp_ms: u64,
) -> Transaction {
    Transaction {
        version: 1,
        kind: TxKind::Coinbase,
        inputs: vec![],
        outputs: vec![crate::types::TxOutput {
            address: miner,
            amount: value,
            script: vec![],
            index: 0,
        }],
        // Height in lock_time keeps coinbase ids unique across heights.
        lock_time: height,
        timestamp_ms,
        signature: vec![],
    }
}
