//! Deterministic genesis blocks.
//!
//! The genesis block is constructed, never validated: it has no parent, no
//! miner signature, and minimum difficulty. Each network gets a distinct
//! genesis hash via its address prefix.

use crate::address::{Address, Network};
use crate::block_validation;
use crate::constants::{INITIAL_REWARD, MIN_DIFFICULTY};
use crate::merkle;
use crate::types::{Amount, Block, BlockHeader, Hash256};

/// Fixed genesis timestamp (2023-11-14T22:13:20Z), in milliseconds.
pub const GENESIS_TIMESTAMP_MS: u64 = 1_700_000_000_000;

/// Pubkey hash credited by the genesis coinbase.
const GENESIS_PUBKEY_HASH: [u8; 32] = [0x54; 32];

/// The genesis coinbase address for a network.
pub fn genesis_address(network: Network) -> Address {
    Address::from_pubkey_hash(network, &Hash256(GENESIS_PUBKEY_HASH))
}

/// Build the deterministic genesis block for a network.
pub fn genesis_block(network: Network) -> Block {
    let miner = genesis_address(network);
    let coinbase = block_validation::coinbase_transaction(
        miner.clone(),
        Amount::from_units(INITIAL_REWARD),
        0,
        GENESIS_TIMESTAMP_MS,
    );
    let ids = vec![coinbase.id().expect("genesis coinbase encodes")];
    Block {
        header: BlockHeader {
            version: 1,
            previous_hash: Hash256::ZERO,
            merkle_root: merkle::merkle_root(&ids),
            validator_root: Hash256::ZERO,
            timestamp_ms: GENESIS_TIMESTAMP_MS,
            difficulty: MIN_DIFFICULTY,
            nonce: 0,
            height: 0,
            miner_address: miner,
            miner_public_key: vec![],
            signature: vec![],
        },
        transactions: vec![coinbase],
        votes: vec![],
        validators: vec![],
    }
}

/// The genesis block hash for a network.
pub fn genesis_hash(network: Network) -> Hash256 {
    genesis_block(network).header.hash()
}

/// Whether `block` is the genesis block of `network`.
pub fn is_genesis(block: &Block, network: Network) -> bool {
    block.header.height == 0
        && block.header.previous_hash.is_zero()
        && block.header.hash() == genesis_hash(network)
}
