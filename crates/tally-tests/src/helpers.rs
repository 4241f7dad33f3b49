//! Test fixtures: a permissive crypto provider, a composed consensus
//! stack over the in-memory store, and block/transaction builders.

use std::sync::Arc;

use parking_lot::Mutex;

use tally_consensus::{Chain, Consensus, ConsensusConfig};
use tally_core::address::{Address, Network};
use tally_core::block_validation;
use tally_core::constants::MAX_REORG_DEPTH;
use tally_core::crypto::Crypto;
use tally_core::error::CryptoError;
use tally_core::genesis::GENESIS_TIMESTAMP_MS;
use tally_core::mempool::Mempool;
use tally_core::merkle;
use tally_core::reward;
use tally_core::store::{MemoryStore, Store};
use tally_core::types::{
    Amount, Block, BlockHeader, Hash256, Transaction, TxInput, TxKind, TxOutput,
};
use tally_core::utxo::UtxoSet;
use tally_voting::DirectVoting;

/// Accepts any non-empty signature; lets tests focus on consensus logic
/// without real keys.
pub struct PermissiveCrypto;

impl Crypto for PermissiveCrypto {
    fn sign(&self, _message: &[u8], _private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(vec![0xAB; 64])
    }

    fn verify(&self, _message: &[u8], signature: &[u8], _public_key: &[u8]) -> bool {
        !signature.is_empty()
    }

    fn derive_address(&self, public_key: &[u8]) -> Result<Address, CryptoError> {
        Ok(Address::from_pubkey_hash(
            Network::Devnet,
            &self.public_key_hash(public_key),
        ))
    }
}

/// A fixed "now" comfortably after the genesis timestamp.
pub const NOW_MS: u64 = GENESIS_TIMESTAMP_MS + 86_400_000;

pub fn pk(seed: u8) -> Vec<u8> {
    vec![seed; 32]
}

pub fn owned(seed: u8) -> Address {
    PermissiveCrypto.derive_address(&pk(seed)).unwrap()
}

/// A composed consensus stack over a fresh in-memory store, with genesis
/// connected.
pub struct Stack {
    pub store: Arc<MemoryStore>,
    pub chain: Arc<Chain>,
    pub utxos: Arc<UtxoSet>,
    pub mempool: Arc<Mutex<Mempool>>,
    pub voting: Arc<DirectVoting>,
    pub consensus: Arc<Consensus>,
}

pub fn stack() -> Stack {
    stack_with_depth(MAX_REORG_DEPTH)
}

pub fn stack_with_depth(max_reorg_depth: u64) -> Stack {
    let store = Arc::new(MemoryStore::new());
    let dyn_store: Arc<dyn Store> = store.clone();
    let crypto: Arc<dyn Crypto> = Arc::new(PermissiveCrypto);
    let chain = Arc::new(Chain::new(dyn_store.clone()));
    let utxos = Arc::new(UtxoSet::new(dyn_store.clone()));
    let mempool = Arc::new(Mutex::new(Mempool::with_defaults()));
    let voting = Arc::new(DirectVoting::new(dyn_store.clone(), crypto.clone()));
    let mut config = ConsensusConfig::new(Network::Devnet);
    config.max_reorg_depth = max_reorg_depth;
    let consensus = Arc::new(Consensus::with_clock(
        chain.clone(),
        utxos.clone(),
        mempool.clone(),
        voting.clone(),
        dyn_store,
        crypto,
        config,
        || NOW_MS,
    ));
    consensus.init_genesis().unwrap();
    Stack { store, chain, utxos, mempool, voting, consensus }
}

/// Build a valid child of `parent` at difficulty 1, mined to `owned(0x01)`.
/// `seed` perturbs the nonce so sibling blocks differ; `fees` must equal
/// the total fees of `txs`.
pub fn child_block(parent: &BlockHeader, seed: u8, txs: Vec<Transaction>, fees: u64) -> Block {
    let height = parent.height + 1;
    let coinbase_value = reward::block_reward(height)
        .checked_add(Amount::from_units(fees))
        .unwrap();
    let timestamp_ms = parent.timestamp_ms + 60_000;
    let coinbase =
        block_validation::coinbase_transaction(owned(0x01), coinbase_value, height, timestamp_ms);
    let mut transactions = vec![coinbase];
    transactions.extend(txs);
    let ids: Vec<Hash256> = transactions.iter().map(|t| t.id().unwrap()).collect();
    Block {
        header: BlockHeader {
            version: 1,
            previous_hash: parent.hash(),
            merkle_root: merkle::merkle_root(&ids),
            validator_root: Hash256::ZERO,
            timestamp_ms,
            difficulty: 1,
            nonce: seed as u64,
            height,
            miner_address: owned(0x01),
            miner_public_key: pk(0x01),
            signature: vec![0xAB; 64],
        },
        transactions,
        votes: vec![],
        validators: vec![],
    }
}

/// Tip header of a stack's active chain.
pub fn tip_header(stack: &Stack) -> BlockHeader {
    use tally_core::traits::ChainView;
    let hash = stack.chain.tip_hash().unwrap();
    stack.chain.header_of(&hash).unwrap().unwrap()
}

/// Extend the active chain with `count` empty blocks; returns the headers
/// committed, oldest first.
pub fn extend_chain(stack: &Stack, count: u64) -> Vec<BlockHeader> {
    use tally_core::traits::ConsensusEngine;
    let mut parent = tip_header(stack);
    let mut headers = Vec::with_capacity(count as usize);
    for i in 0..count {
        let block = child_block(&parent, (i % 250) as u8, vec![], 0);
        parent = block.header.clone();
        headers.push(block.header.clone());
        stack.consensus.submit_block(block).unwrap();
    }
    headers
}

/// Spend output 0 of `source` (which must pay `owned(owner_seed)`),
/// sending everything minus `fee` to `owned(0xEE)`.
pub fn spend_output(source: &Transaction, owner_seed: u8, fee: u64, sequence: u32) -> Transaction {
    let value = source.outputs[0].amount;
    Transaction {
        version: 1,
        kind: TxKind::Standard,
        inputs: vec![TxInput {
            previous_tx: source.id().unwrap(),
            previous_index: 0,
            script_sig: vec![0xAB; 64],
            public_key: pk(owner_seed),
            sequence,
            claimed_amount: value,
        }],
        outputs: vec![TxOutput {
            address: owned(0xEE),
            amount: value.checked_sub(Amount::from_units(fee)).unwrap(),
            script: vec![],
            index: 0,
        }],
        lock_time: 0,
        timestamp_ms: 1,
        signature: vec![0xAB; 64],
    }
}
