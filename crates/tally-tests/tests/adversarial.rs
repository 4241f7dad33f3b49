//! Adversarial inputs: malformed blocks, forged signatures, inflation
//! attempts, timestamp games, and vote abuse.

use std::sync::Arc;

use tally_core::address::Network;
use tally_core::constants::{
    max_block_size, MAX_CLOCK_DRIFT_MS, MIN_ACCOUNT_AGE, MIN_FEE, PARTICIPATION_REWARD,
    VOTING_PERIOD_BLOCKS,
};
use tally_core::crypto::{Crypto, Ed25519Crypto};
use tally_core::error::{BlockError, MempoolError, TallyError, VotingError};
use tally_core::store::MemoryStore;
use tally_core::traits::{ChainView, ConsensusEngine};
use tally_core::types::{Amount, Hash256, PeriodKind, TxKind, TxOutput, Vote};
use tally_node::{Node, NodeConfig};
use tally_tests::helpers::{
    child_block, extend_chain, spend_output, stack, tip_header, PermissiveCrypto, NOW_MS,
};
use tally_voting::{voting_power, DirectVoting};

// ---------------------------------------------------------------------------
// Block-level attacks
// ---------------------------------------------------------------------------

#[test]
fn oversized_block_rejected() {
    let s = stack();
    let mut block = child_block(&tip_header(&s), 1, vec![], 0);
    block.transactions[0].outputs[0].script = vec![0; max_block_size(1) + 1];
    // Rebuild the roots so only the size rule can fail.
    let ids: Vec<Hash256> = block.transactions.iter().map(|t| t.id().unwrap()).collect();
    block.header.merkle_root = tally_core::merkle::merkle_root(&ids);

    let err = s.consensus.submit_block(block).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Block(BlockError::Transaction { .. } | BlockError::Oversized { .. })
    ));
}

#[test]
fn forged_miner_signature_rejected_with_real_crypto() {
    // A node with real Ed25519 verification.
    let node = Node::with_store(
        NodeConfig::devnet("/unused"),
        Arc::new(MemoryStore::new()),
    )
    .unwrap();
    let (_, pk) = Ed25519Crypto::generate_keypair();
    let (other_sk, _) = Ed25519Crypto::generate_keypair();
    let crypto = Ed25519Crypto::new(Network::Devnet);

    // Build a block claiming pk but signed by a different key.
    let genesis = node.chain().get_block_by_height(0).unwrap().unwrap();
    let mut block = child_block(&genesis.header, 1, vec![], 0);
    block.header.miner_address = crypto.derive_address(&pk).unwrap();
    block.transactions[0].outputs[0].address = block.header.miner_address.clone();
    let ids: Vec<Hash256> = block.transactions.iter().map(|t| t.id().unwrap()).collect();
    block.header.merkle_root = tally_core::merkle::merkle_root(&ids);
    block.header.miner_public_key = pk;
    let base = block.header.header_base();
    block.header.signature = crypto.sign(&base, &other_sk).unwrap();

    let err = node.submit_block(block).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Block(BlockError::BadMinerSignature)
    ));
    assert_eq!(node.chain().height().unwrap(), 0);
}

#[test]
fn reward_inflation_rejected() {
    let s = stack();
    let block = child_block(&tip_header(&s), 1, vec![], 1);
    let err = s.consensus.submit_block(block).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Block(BlockError::InvalidReward { .. })
    ));
}

#[test]
fn far_future_timestamp_rejected() {
    let s = stack();
    let mut block = child_block(&tip_header(&s), 1, vec![], 0);
    block.header.timestamp_ms = NOW_MS + MAX_CLOCK_DRIFT_MS + 1;
    let err = s.consensus.submit_block(block).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Block(BlockError::TimestampTooFar(_))
    ));
}

#[test]
fn stale_timestamp_rejected() {
    let s = stack();
    extend_chain(&s, 12);
    let mut block = child_block(&tip_header(&s), 1, vec![], 0);
    // At or before the median of the last eleven: rejected.
    block.header.timestamp_ms = tally_core::genesis::GENESIS_TIMESTAMP_MS;
    let err = s.consensus.submit_block(block).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Block(BlockError::TimestampBeforeMedian)
    ));
}

#[test]
fn duplicate_transaction_in_block_rejected() {
    let s = stack();
    let headers = extend_chain(&s, 101);
    let source_block = s.chain.get_block(&headers[0].hash()).unwrap().unwrap();
    let source = source_block.transactions[0].clone();

    let spend = spend_output(&source, 0x01, MIN_FEE, 1);
    let block = child_block(&tip_header(&s), 1, vec![spend.clone(), spend], 2 * MIN_FEE);
    let err = s.consensus.submit_block(block).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Block(BlockError::DuplicateTxid(_))
    ));
}

#[test]
fn wrong_difficulty_rejected() {
    let s = stack();
    let mut block = child_block(&tip_header(&s), 1, vec![], 0);
    block.header.difficulty = 2; // schedule says 1
    let err = s.consensus.submit_block(block).unwrap_err();
    assert!(matches!(
        err,
        TallyError::Block(BlockError::InvalidDifficulty { got: 2, expected: 1 })
    ));
}

// ---------------------------------------------------------------------------
// Mempool attacks
// ---------------------------------------------------------------------------

#[test]
fn sequence_replay_rejected() {
    let s = stack();
    let headers = extend_chain(&s, 102);
    let height = s.chain.height().unwrap();

    let source_a = s
        .chain
        .get_block(&headers[0].hash())
        .unwrap()
        .unwrap()
        .transactions[0]
        .clone();
    let source_b = s
        .chain
        .get_block(&headers[1].hash())
        .unwrap()
        .unwrap()
        .transactions[0]
        .clone();

    let mut pool = s.mempool.lock();
    pool.add(
        spend_output(&source_a, 0x01, MIN_FEE, 5),
        s.utxos.as_ref(),
        &PermissiveCrypto,
        height,
        NOW_MS,
    )
    .unwrap();

    // Same sender replays an old sequence from a different outpoint.
    let err = pool
        .add(
            spend_output(&source_b, 0x01, MIN_FEE, 5),
            s.utxos.as_ref(),
            &PermissiveCrypto,
            height,
            NOW_MS,
        )
        .unwrap_err();
    assert!(matches!(err, MempoolError::NonceInvalid { .. }));
}

#[test]
fn immature_coinbase_spend_rejected() {
    let s = stack();
    let headers = extend_chain(&s, 5);
    let young = s
        .chain
        .get_block(&headers[4].hash())
        .unwrap()
        .unwrap()
        .transactions[0]
        .clone();

    let err = s
        .mempool
        .lock()
        .add(
            spend_output(&young, 0x01, MIN_FEE, 1),
            s.utxos.as_ref(),
            &PermissiveCrypto,
            s.chain.height().unwrap(),
            NOW_MS,
        )
        .unwrap_err();
    assert!(matches!(err, MempoolError::Invalid(_)));
}

// ---------------------------------------------------------------------------
// Voting attacks
// ---------------------------------------------------------------------------

fn valid_vote(seed: u8, balance_units: u64) -> Vote {
    let balance = Amount::from_units(balance_units);
    Vote {
        vote_id: Hash256([seed; 32]),
        period_id: 0,
        block_hash: Hash256([0xBB; 32]),
        voter: PermissiveCrypto.derive_address(&[seed; 32].to_vec()).unwrap(),
        approve: true,
        voting_power: voting_power(balance),
        height: 1,
        balance,
        signature: vec![0xAB; 64],
        public_key: vec![seed; 32],
        timestamp_ms: 1_000,
        chain_vote: None,
    }
}

#[test]
fn inflated_voting_power_rejected() {
    let voting = DirectVoting::new(Arc::new(MemoryStore::new()), Arc::new(PermissiveCrypto));
    voting.open_period(0, 1_000, PeriodKind::NodeSelection);

    let mut vote = valid_vote(1, 10_000);
    vote.voting_power = Amount::from_units(10_000); // claims linear power
    assert!(matches!(
        voting.submit(vote, MIN_ACCOUNT_AGE).unwrap_err(),
        VotingError::PowerMismatch { .. }
    ));
}

#[test]
fn vote_reward_for_non_voter_rejected() {
    let voting = DirectVoting::new(Arc::new(MemoryStore::new()), Arc::new(PermissiveCrypto));
    voting.open_period(0, 1_000, PeriodKind::NodeSelection);
    voting.submit(valid_vote(1, 10_000), MIN_ACCOUNT_AGE).unwrap();
    voting.on_block_committed(VOTING_PERIOD_BLOCKS, 2_000);

    let reward = tally_core::types::Transaction {
        version: 1,
        kind: TxKind::VoteReward,
        inputs: vec![],
        outputs: vec![TxOutput {
            address: PermissiveCrypto.derive_address(&[9; 32].to_vec()).unwrap(),
            amount: Amount::from_units(PARTICIPATION_REWARD),
            script: vec![],
            index: 0,
        }],
        lock_time: 0,
        timestamp_ms: 1,
        signature: vec![],
    };
    assert!(matches!(
        voting
            .validate_participation_reward(&reward, VOTING_PERIOD_BLOCKS + 1)
            .unwrap_err(),
        VotingError::NotAVoter(_)
    ));
}

#[test]
fn double_vote_rejected() {
    let voting = DirectVoting::new(Arc::new(MemoryStore::new()), Arc::new(PermissiveCrypto));
    voting.open_period(0, 1_000, PeriodKind::NodeSelection);
    voting.submit(valid_vote(1, 10_000), MIN_ACCOUNT_AGE).unwrap();

    let mut again = valid_vote(1, 400);
    again.vote_id = Hash256([0x99; 32]);
    assert!(matches!(
        voting.submit(again, MIN_ACCOUNT_AGE).unwrap_err(),
        VotingError::DuplicateVote { .. }
    ));
}
