//! The hybrid consensus engine.
//!
//! Validates blocks through the ordered stages (structure, signatures,
//! proof-of-work, linkage, time, transactions, participation rewards),
//! commits accepted blocks atomically across the chain index, the UTXO
//! set, the store, and the mempool, and resolves forks by cumulative work
//! with the voting layer's fork decision as the second signal.
//!
//! One commit lock totally orders `submit_block` calls and
//! reorganizations; no caller observes intermediate state. A
//! reorganization is not cancellable once the revert phase begins: it runs
//! inside a store snapshot that is rolled back wholesale on any failure.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use primitive_types::U256;
use tracing::{debug, info, warn};

use tally_core::address::Network;
use tally_core::block_validation::{self, BlockContext};
use tally_core::constants::{
    max_block_size, HASH_RATE_WINDOW, MAX_REORG_DEPTH, MEDIAN_TIME_SPAN, WINDOW_SIZE,
};
use tally_core::crypto::Crypto;
use tally_core::difficulty::{self, NetworkHealth};
use tally_core::error::{BlockError, ChainError, TallyError};
use tally_core::mempool::Mempool;
use tally_core::merkle;
use tally_core::reward;
use tally_core::store::Store;
use tally_core::traits::{ChainView, CommitOutcome, ConsensusEngine};
use tally_core::types::{
    Amount, Block, BlockHeader, ChainTip, Hash256, TipStatus, Transaction, TxKind,
};
use tally_core::utxo::UtxoSet;
use tally_voting::{DirectVoting, ForkCandidate};

use crate::chain::Chain;

/// Engine tuning knobs.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    pub network: Network,
    /// Work margin a fork must exceed the active chain by to force a
    /// reorganization outright (the vote decision can trigger one below
    /// this margin).
    pub chain_decision_threshold: U256,
    pub max_reorg_depth: u64,
}

impl ConsensusConfig {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            chain_decision_threshold: U256::zero(),
            max_reorg_depth: MAX_REORG_DEPTH,
        }
    }
}

/// The hybrid PoW + voting validator and chain committer.
pub struct Consensus {
    chain: Arc<Chain>,
    utxos: Arc<UtxoSet>,
    mempool: Arc<Mutex<Mempool>>,
    voting: Arc<DirectVoting>,
    store: Arc<dyn Store>,
    crypto: Arc<dyn Crypto>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
    config: ConsensusConfig,
    /// Recent hashrate samples for the difficulty adjuster.
    hashrate: RwLock<VecDeque<f64>>,
    /// Latest network-health observation, if the node reports one.
    health: RwLock<Option<NetworkHealth>>,
    eligible_voters: AtomicUsize,
    /// Totally orders block additions and reorganizations.
    chain_lock: Mutex<()>,
}

impl fmt::Debug for Consensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consensus").finish_non_exhaustive()
    }
}

impl Consensus {
    /// Create an engine with the system clock (Unix milliseconds).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<Chain>,
        utxos: Arc<UtxoSet>,
        mempool: Arc<Mutex<Mempool>>,
        voting: Arc<DirectVoting>,
        store: Arc<dyn Store>,
        crypto: Arc<dyn Crypto>,
        config: ConsensusConfig,
    ) -> Self {
        Self::with_clock(chain, utxos, mempool, voting, store, crypto, config, || {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64
        })
    }

    /// Create an engine with an injected clock, for tests.
    #[allow(clippy::too_many_arguments)]
    pub fn with_clock(
        chain: Arc<Chain>,
        utxos: Arc<UtxoSet>,
        mempool: Arc<Mutex<Mempool>>,
        voting: Arc<DirectVoting>,
        store: Arc<dyn Store>,
        crypto: Arc<dyn Crypto>,
        config: ConsensusConfig,
        clock: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            chain,
            utxos,
            mempool,
            voting,
            store,
            crypto,
            clock: Box::new(clock),
            config,
            hashrate: RwLock::new(VecDeque::with_capacity(HASH_RATE_WINDOW)),
            health: RwLock::new(None),
            eligible_voters: AtomicUsize::new(0),
            chain_lock: Mutex::new(()),
        }
    }

    fn now_ms(&self) -> u64 {
        (self.clock)()
    }

    /// Connect the deterministic genesis block if the store is empty.
    pub fn init_genesis(&self) -> Result<Hash256, TallyError> {
        let _guard = self.chain_lock.lock();
        if !self.chain.is_empty() {
            return self.chain.tip_hash().map_err(TallyError::from);
        }
        let genesis = tally_core::genesis::genesis_block(self.config.network);
        let hash = genesis.header.hash();

        let diff = self.utxos.diff_for_block(&genesis)?;
        let mut ops = self.chain.commit_ops(&genesis)?;
        ops.extend(diff.batch_ops()?);
        self.store.batch(ops)?;

        self.chain.apply_committed(&genesis);
        self.utxos.note_applied(&diff);
        self.voting.open_period(
            0,
            self.now_ms(),
            tally_core::types::PeriodKind::NodeSelection,
        );
        info!(%hash, "consensus: genesis connected");
        Ok(hash)
    }

    /// Record a hashrate sample (hashes/sec) for the difficulty adjuster.
    pub fn record_hashrate_sample(&self, sample: f64) {
        let mut window = self.hashrate.write();
        if window.len() == HASH_RATE_WINDOW {
            window.pop_front();
        }
        window.push_back(sample);
    }

    /// Update the network-health inputs for the difficulty adjuster.
    pub fn set_network_health(&self, health: Option<NetworkHealth>) {
        *self.health.write() = health;
    }

    /// Set the eligible-voter count used for participation rates.
    pub fn set_eligible_voters(&self, count: usize) {
        self.eligible_voters.store(count, Ordering::Relaxed);
    }

    /// The difficulty required of the next block.
    pub fn expected_difficulty(&self) -> Result<u64, TallyError> {
        let context = self.next_context()?;
        Ok(context.expected_difficulty)
    }

    /// Validation context for a block extending the current tip.
    fn next_context(&self) -> Result<BlockContext, TallyError> {
        let tip_hash = self.chain.tip_hash()?;
        let parent = self
            .chain
            .header_of(&tip_hash)?
            .ok_or_else(|| ChainError::BlockNotFound(tip_hash.to_string()))?;
        let height = parent.height + 1;

        let timestamps = self.chain.timestamp_tail(WINDOW_SIZE + 1);
        let hashrate: Vec<f64> = self.hashrate.read().iter().copied().collect();
        let turnout = self.voting.turnout(
            DirectVoting::period_for_height(height),
            self.eligible_voters.load(Ordering::Relaxed),
        );
        let health = *self.health.read();

        Ok(BlockContext {
            height,
            prev_hash: tip_hash,
            median_time_past_ms: block_validation::median_time_past(
                &self.chain.timestamp_tail(MEDIAN_TIME_SPAN),
            ),
            expected_difficulty: difficulty::next_difficulty(
                height,
                parent.difficulty,
                &timestamps,
                &hashrate,
                turnout.as_ref(),
                health.as_ref(),
            ),
            current_time_ms: self.now_ms(),
            max_size: max_block_size(height),
        })
    }

    /// Full validation of a block extending the current tip, including the
    /// participation-reward stage.
    fn verify_at_tip(&self, block: &Block) -> Result<(), TallyError> {
        let context = self.next_context()?;
        block_validation::validate_block(
            block,
            &context,
            |op| self.utxos.get(&op.txid, op.index).ok().flatten(),
            self.crypto.as_ref(),
        )?;
        for tx in block.transactions.iter().skip(1) {
            if tx.kind == TxKind::VoteReward {
                self.voting
                    .validate_participation_reward(tx, block.header.height)?;
            }
        }
        Ok(())
    }

    /// Commit a tip-extending block: one store batch carrying the block,
    /// the height index, the chain-state record, and the UTXO diff; then
    /// the in-memory indexes, the mempool removals, and the voting clock.
    fn commit_to_tip(&self, block: &Block) -> Result<(), TallyError> {
        let diff = self.utxos.diff_for_block(block)?;
        let mut ops = self.chain.commit_ops(block)?;
        ops.extend(diff.batch_ops()?);
        self.store.batch(ops)?;

        self.chain.apply_committed(block);
        self.utxos.note_applied(&diff);
        // Mempool lock held only for the removal sweep.
        self.mempool.lock().remove_included(block);
        self.voting
            .on_block_committed(block.header.height, self.now_ms());
        Ok(())
    }

    /// Handle a block that does not extend the active tip: record it on a
    /// branch and reorganize if the branch now wins.
    fn submit_side_block(&self, block: Block) -> Result<CommitOutcome, TallyError> {
        let hash = block.header.hash();
        let parent_hash = block.header.previous_hash;
        let now = self.now_ms();

        // Linkage: the parent must be known, and not on a rejected branch.
        let parent_tip = self.chain.tip_record(&parent_hash);
        if let Some(tip) = &parent_tip {
            if tip.status == TipStatus::Invalid {
                return Err(BlockError::UnknownParent(parent_hash.to_string()).into());
            }
        } else if self.chain.header_of(&parent_hash)?.is_none() {
            return Err(BlockError::UnknownParent(parent_hash.to_string()).into());
        }

        // Contextual state for this branch is unknown until a
        // reorganization replays it, so only structural validity gates
        // storage.
        block_validation::validate_block_structure(
            &block,
            max_block_size(block.header.height),
            self.crypto.as_ref(),
        )?;

        let branch_len = parent_tip.as_ref().map(|t| t.branch_len + 1).unwrap_or(1);
        let first_block_hash = parent_tip
            .as_ref()
            .and_then(|t| t.first_block_hash)
            .or(Some(hash));
        let status = if branch_len > self.config.max_reorg_depth {
            TipStatus::Invalid
        } else {
            TipStatus::ValidFork
        };

        self.chain.store_side_block(&block)?;
        let tip = ChainTip {
            height: block.header.height,
            hash,
            branch_len,
            status,
            first_block_hash,
            last_validated_ms: now,
        };
        self.chain.upsert_tip(tip.clone(), &parent_hash);
        debug!(%hash, branch_len, ?status, "consensus: side block recorded");

        if status == TipStatus::Invalid {
            return Ok(CommitOutcome::SideChain { tip });
        }

        match self.try_reorganize(&tip)? {
            Some(outcome) => Ok(outcome),
            None => Ok(CommitOutcome::SideChain {
                tip: self.chain.tip_record(&hash).unwrap_or(tip),
            }),
        }
    }

    /// Reorganize onto `fork` if it out-works the active chain by the
    /// configured margin or wins the vote decision. Returns `None` when the
    /// active chain stands (including when the fork proves invalid).
    fn try_reorganize(&self, fork: &ChainTip) -> Result<Option<CommitOutcome>, TallyError> {
        let now = self.now_ms();

        let (ancestor_height, branch) =
            match self.chain.walk_branch(&fork.hash, self.config.max_reorg_depth) {
                Ok(found) => found,
                Err(ChainError::NoCommonAncestor(_)) => {
                    warn!(fork = %fork.hash, "consensus: no common ancestor within reorg bound");
                    self.chain.mark_tip_invalid(&fork.hash, now);
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };

        let active_height = self.chain.height()?;
        let revert_depth = active_height - ancestor_height;
        if revert_depth > self.config.max_reorg_depth {
            warn!(
                fork = %fork.hash,
                revert_depth,
                max = self.config.max_reorg_depth,
                "consensus: reorg depth exceeded"
            );
            self.chain.mark_tip_invalid(&fork.hash, now);
            return Ok(None);
        }

        let branch_work = branch
            .iter()
            .map(|b| b.header.work())
            .fold(U256::zero(), |acc, w| acc + w);
        let suffix_work = self.chain.suffix_work(ancestor_height);
        let prefix_work = self.chain.chain_work() - suffix_work;

        let out_worked = branch_work > suffix_work + self.config.chain_decision_threshold;
        // The vote decision is consulted only for a genuinely contested
        // fork: without chain votes, equal-work ties stand with the active
        // chain (first seen wins).
        let vote_selected = !out_worked
            && self
                .voting
                .has_chain_votes(&fork.hash, &self.chain.tip_hash()?)
            && self.voting.decide_fork(
                &ForkCandidate {
                    tip_hash: fork.hash,
                    cumulative_work: prefix_work + branch_work,
                },
                &ForkCandidate {
                    tip_hash: self.chain.tip_hash()?,
                    cumulative_work: self.chain.chain_work(),
                },
            ) == fork.hash;

        if !out_worked && !vote_selected {
            return Ok(None);
        }

        self.reorganize(fork, ancestor_height, branch).map(Some)
    }

    /// Replace the active suffix above `ancestor_height` with `branch`.
    ///
    /// Runs inside a store snapshot. Any failure rolls the store back,
    /// reloads the chain index, and marks the fork tip `Invalid`; the
    /// active chain is left exactly as it was.
    fn reorganize(
        &self,
        fork: &ChainTip,
        ancestor_height: u64,
        branch: Vec<Block>,
    ) -> Result<CommitOutcome, TallyError> {
        let now = self.now_ms();
        let old_tip = self.chain.tip_hash()?;
        let reverted_blocks = self.chain.suffix_blocks(ancestor_height)?;
        let reverted = reverted_blocks.len() as u64;
        let applied = branch.len() as u64;

        info!(
            fork = %fork.hash,
            ancestor_height,
            reverted,
            applied,
            "consensus: reorganizing"
        );

        let snapshot = self.store.snapshot()?;

        let result: Result<(), TallyError> = (|| {
            for block in &reverted_blocks {
                self.utxos.revert_block(block)?;
                let ops = self.chain.revert_ops(block)?;
                self.store.batch(ops)?;
                self.chain.apply_reverted(block);
            }
            for block in &branch {
                self.verify_at_tip(block)?;
                let diff = self.utxos.diff_for_block(block)?;
                let mut ops = self.chain.commit_ops(block)?;
                ops.extend(diff.batch_ops()?);
                self.store.batch(ops)?;
                self.chain.apply_committed(block);
                self.utxos.note_applied(&diff);
            }
            Ok(())
        })();

        if let Err(e) = result {
            warn!(fork = %fork.hash, error = %e, "consensus: reorg failed, rolling back");
            self.store.rollback_snapshot(snapshot)?;
            self.utxos.clear_cache();
            self.chain.load()?;
            self.chain.mark_tip_invalid(&fork.hash, now);
            return Err(e);
        }

        self.store.commit_snapshot(snapshot)?;

        // The displaced suffix becomes a valid fork of its own.
        self.chain.remove_tip(&fork.hash);
        if let Some(first) = reverted_blocks.last() {
            self.chain.upsert_tip(
                ChainTip {
                    height: ancestor_height + reverted,
                    hash: old_tip,
                    branch_len: reverted,
                    status: TipStatus::ValidFork,
                    first_block_hash: Some(first.header.hash()),
                    last_validated_ms: now,
                },
                &old_tip,
            );
        }

        let new_height = self.chain.height()?;
        {
            // Return displaced transactions to the pool where still valid,
            // then clear everything the new branch confirmed.
            let mut mempool = self.mempool.lock();
            for block in &reverted_blocks {
                for tx in &block.transactions {
                    if tx.kind.is_reward() {
                        continue;
                    }
                    if let Err(e) = mempool.readmit(
                        tx.clone(),
                        self.utxos.as_ref(),
                        self.crypto.as_ref(),
                        new_height,
                        now,
                    ) {
                        debug!(error = %e, "consensus: displaced tx not readmitted");
                    }
                }
            }
            for block in &branch {
                mempool.remove_included(block);
            }
        }
        self.voting.on_block_committed(new_height, now);

        info!(new_tip = %fork.hash, new_height, "consensus: reorganization complete");
        Ok(CommitOutcome::Reorganized {
            old_tip,
            new_tip: fork.hash,
            reverted,
            applied,
        })
    }

    /// Build an unsigned block template over the current tip, filling it
    /// with mempool transactions by descending fee rate.
    pub fn create_block_template(&self, miner: tally_core::address::Address) -> Result<Block, TallyError> {
        let _guard = self.chain_lock.lock();
        let context = self.next_context()?;
        let budget = context.max_size / 2;

        let (selected, total_fees) = {
            let mempool = self.mempool.lock();
            let mut txs: Vec<Transaction> = Vec::new();
            let mut fees = Amount::ZERO;
            for entry in mempool.select_transactions(budget) {
                fees = fees
                    .checked_add(entry.fee)
                    .ok_or_else(|| BlockError::InvalidReward {
                        got: "overflow".into(),
                        expected: "overflow".into(),
                    })?;
                txs.push(entry.tx.clone());
            }
            (txs, fees)
        };

        let coinbase_value = reward::block_reward(context.height)
            .checked_add(total_fees)
            .ok_or_else(|| BlockError::InvalidReward {
                got: "overflow".into(),
                expected: "overflow".into(),
            })?;
        let timestamp_ms = self
            .now_ms()
            .max(context.median_time_past_ms + 1);
        let coinbase = block_validation::coinbase_transaction(
            miner.clone(),
            coinbase_value,
            context.height,
            timestamp_ms,
        );

        let mut transactions = Vec::with_capacity(1 + selected.len());
        transactions.push(coinbase);
        transactions.extend(selected);

        let ids: Vec<Hash256> = transactions
            .iter()
            .enumerate()
            .map(|(i, tx)| {
                tx.id()
                    .map_err(|source| BlockError::Transaction { index: i, source })
            })
            .collect::<Result<_, _>>()?;

        Ok(Block {
            header: BlockHeader {
                version: 1,
                previous_hash: context.prev_hash,
                merkle_root: merkle::merkle_root(&ids),
                validator_root: Hash256::ZERO,
                timestamp_ms,
                difficulty: context.expected_difficulty,
                nonce: 0,
                height: context.height,
                miner_address: miner,
                miner_public_key: Vec::new(),
                signature: Vec::new(),
            },
            transactions,
            votes: Vec::new(),
            validators: Vec::new(),
        })
    }

    /// Attach the miner's key and signature to a mined template header.
    pub fn sign_block(&self, block: &mut Block, private_key: &[u8], public_key: &[u8]) -> Result<(), TallyError> {
        block.header.miner_public_key = public_key.to_vec();
        let base = block.header.header_base();
        block.header.signature = self
            .crypto
            .sign(&base, private_key)
            .map_err(TallyError::from)?;
        Ok(())
    }
}

impl ConsensusEngine for Consensus {
    fn submit_block(&self, block: Block) -> Result<CommitOutcome, TallyError> {
        let _guard = self.chain_lock.lock();
        let hash = block.header.hash();

        if self.chain.active_height_of(&hash).is_some() || self.chain.tip_record(&hash).is_some() {
            return Err(ChainError::DuplicateBlock(hash.to_string()).into());
        }

        let tip = self.chain.tip_hash()?;
        if block.header.previous_hash == tip {
            self.verify_at_tip(&block)?;
            self.commit_to_tip(&block)?;
            info!(%hash, height = block.header.height, "consensus: block accepted");
            return Ok(CommitOutcome::Extended {
                height: block.header.height,
                hash,
            });
        }

        self.submit_side_block(block)
    }

    fn verify_block(&self, block: &Block) -> Result<(), TallyError> {
        let _guard = self.chain_lock.lock();
        self.verify_at_tip(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tally_core::address::Address;
    use tally_core::constants::{COIN, INITIAL_REWARD};
    use tally_core::error::CryptoError;
    use tally_core::genesis::GENESIS_TIMESTAMP_MS;
    use tally_core::store::MemoryStore;
    use tally_core::types::{TxInput, TxOutput};

    struct PermissiveCrypto;

    impl Crypto for PermissiveCrypto {
        fn sign(&self, _m: &[u8], _k: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(vec![0xAB; 64])
        }

        fn verify(&self, _m: &[u8], signature: &[u8], _k: &[u8]) -> bool {
            !signature.is_empty()
        }

        fn derive_address(&self, public_key: &[u8]) -> Result<Address, CryptoError> {
            Ok(Address::from_pubkey_hash(
                Network::Devnet,
                &self.public_key_hash(public_key),
            ))
        }
    }

    fn pk(seed: u8) -> Vec<u8> {
        vec![seed; 32]
    }

    fn owned(seed: u8) -> Address {
        PermissiveCrypto.derive_address(&pk(seed)).unwrap()
    }

    const NOW_MS: u64 = GENESIS_TIMESTAMP_MS + 86_400_000;

    struct Fixture {
        consensus: Consensus,
        chain: Arc<Chain>,
        utxos: Arc<UtxoSet>,
        mempool: Arc<Mutex<Mempool>>,
    }

    fn fixture_with_depth(max_reorg_depth: u64) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let crypto: Arc<dyn Crypto> = Arc::new(PermissiveCrypto);
        let chain = Arc::new(Chain::new(store.clone()));
        let utxos = Arc::new(UtxoSet::new(store.clone()));
        let mempool = Arc::new(Mutex::new(Mempool::with_defaults()));
        let voting = Arc::new(DirectVoting::new(store.clone(), crypto.clone()));
        let mut config = ConsensusConfig::new(Network::Devnet);
        config.max_reorg_depth = max_reorg_depth;
        let consensus = Consensus::with_clock(
            chain.clone(),
            utxos.clone(),
            mempool.clone(),
            voting,
            store,
            crypto,
            config,
            || NOW_MS,
        );
        consensus.init_genesis().unwrap();
        Fixture { consensus, chain, utxos, mempool }
    }

    fn fixture() -> Fixture {
        fixture_with_depth(MAX_REORG_DEPTH)
    }

    /// Build a valid child of `parent` at difficulty 1, signed permissively.
    /// `seed` perturbs the nonce so sibling blocks get distinct hashes;
    /// `fees` must equal the total fees of `txs`.
    fn child_block(parent: &BlockHeader, seed: u8, txs: Vec<Transaction>, fees: u64) -> Block {
        let height = parent.height + 1;
        let coinbase_value = reward::block_reward(height)
            .checked_add(Amount::from_units(fees))
            .unwrap();
        let timestamp_ms = parent.timestamp_ms + 60_000;
        let coinbase = block_validation::coinbase_transaction(
            owned(0x01),
            coinbase_value,
            height,
            timestamp_ms,
        );
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

    /// Spend output 0 of `source` (owned by pk(0x01)).
    fn spend_coinbase(source: &Transaction, fee: u64, sequence: u32) -> Transaction {
        let value = source.outputs[0].amount;
        Transaction {
            version: 1,
            kind: TxKind::Standard,
            inputs: vec![TxInput {
                previous_tx: source.id().unwrap(),
                previous_index: 0,
                script_sig: vec![0xAB; 64],
                public_key: pk(0x01),
                sequence,
                claimed_amount: value,
            }],
            outputs: vec![TxOutput {
                address: owned(0x02),
                amount: value.checked_sub(Amount::from_units(fee)).unwrap(),
                script: vec![],
                index: 0,
            }],
            lock_time: 0,
            timestamp_ms: 1,
            signature: vec![0xAB; 64],
        }
    }

    #[test]
    fn genesis_bootstrap() {
        let f = fixture();
        assert_eq!(f.chain.height().unwrap(), 0);
        let genesis = tally_core::genesis::genesis_block(Network::Devnet);
        assert_eq!(f.chain.tip_hash().unwrap(), genesis.header.hash());
        assert_eq!(
            f.utxos.validate().unwrap(),
            Amount::from_units(INITIAL_REWARD)
        );
        // Idempotent: a second init returns the same tip.
        assert_eq!(f.consensus.init_genesis().unwrap(), genesis.header.hash());
    }

    #[test]
    fn extends_tip_with_valid_block() {
        let f = fixture();
        let parent = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();
        let block = child_block(&parent, 1, vec![], 0);
        let hash = block.header.hash();

        let outcome = f.consensus.submit_block(block).unwrap();
        assert_eq!(outcome, CommitOutcome::Extended { height: 1, hash });
        assert_eq!(f.chain.height().unwrap(), 1);
        assert_eq!(
            f.utxos.validate().unwrap(),
            Amount::from_units(2 * INITIAL_REWARD)
        );
    }

    #[test]
    fn rejects_reward_inflation() {
        let f = fixture();
        let parent = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();
        // Claim one extra unit of fees that no transaction paid.
        let block = child_block(&parent, 1, vec![], 1);
        let err = f.consensus.submit_block(block).unwrap_err();
        assert!(matches!(
            err,
            TallyError::Block(BlockError::InvalidReward { .. })
        ));
        assert_eq!(f.chain.height().unwrap(), 0);
    }

    #[test]
    fn rejects_unknown_parent() {
        let f = fixture();
        let mut parent = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();
        parent.nonce = 777; // orphan: a parent nobody has
        let block = child_block(&parent, 1, vec![], 0);
        let err = f.consensus.submit_block(block).unwrap_err();
        assert!(matches!(
            err,
            TallyError::Block(BlockError::UnknownParent(_))
        ));
    }

    #[test]
    fn rejects_duplicate_block() {
        let f = fixture();
        let parent = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();
        let block = child_block(&parent, 1, vec![], 0);
        f.consensus.submit_block(block.clone()).unwrap();
        let err = f.consensus.submit_block(block).unwrap_err();
        assert!(matches!(
            err,
            TallyError::Chain(ChainError::DuplicateBlock(_))
        ));
    }

    #[test]
    fn heavier_fork_reorganizes() {
        let f = fixture();
        let genesis_header = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();

        // Active: g -> a1.
        let a1 = child_block(&genesis_header, 1, vec![], 0);
        f.consensus.submit_block(a1.clone()).unwrap();

        // Fork: g -> b1 -> b2, more total work than the one-block suffix.
        let b1 = child_block(&genesis_header, 0x10, vec![], 0);
        let b2 = child_block(&b1.header, 0x11, vec![], 0);
        f.consensus.submit_block(b1.clone()).unwrap();
        f.consensus.submit_block(b2.clone()).unwrap();

        assert_eq!(f.chain.height().unwrap(), 2);
        assert_eq!(f.chain.tip_hash().unwrap(), b2.header.hash());

        // The displaced branch is tracked as a valid fork.
        let tips = f.chain.tips();
        assert!(tips.iter().any(|t| t.status == TipStatus::ValidFork));
        // UTXO state equals a fresh application of the new chain.
        assert_eq!(
            f.utxos.validate().unwrap(),
            Amount::from_units(3 * INITIAL_REWARD)
        );
    }

    #[test]
    fn too_deep_fork_is_invalid_and_active_chain_stands() {
        let f = fixture_with_depth(2);
        let genesis_header = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();

        // Active: g -> a1 -> a2. Divergence at genesis stays within the
        // depth bound; the fork's own branch length is what crosses it.
        let mut parent = genesis_header.clone();
        let mut active_tip = Hash256::ZERO;
        for i in 1..=2u8 {
            let block = child_block(&parent, i, vec![], 0);
            parent = block.header.clone();
            active_tip = block.header.hash();
            f.consensus.submit_block(block).unwrap();
        }

        // Fork from genesis; the third fork block exceeds the depth bound.
        // The first two never out-work the active chain, so they remain
        // side-chain tips.
        let c1 = child_block(&genesis_header, 0x20, vec![], 0);
        let c2 = child_block(&c1.header, 0x21, vec![], 0);
        let c3 = child_block(&c2.header, 0x22, vec![], 0);
        assert!(matches!(
            f.consensus.submit_block(c1).unwrap(),
            CommitOutcome::SideChain { .. }
        ));
        assert!(matches!(
            f.consensus.submit_block(c2).unwrap(),
            CommitOutcome::SideChain { .. }
        ));
        let outcome = f.consensus.submit_block(c3.clone()).unwrap();
        match outcome {
            CommitOutcome::SideChain { tip } => assert_eq!(tip.status, TipStatus::Invalid),
            other => panic!("expected invalid side chain, got {other:?}"),
        }

        // Extending an invalid tip is refused outright.
        let c4 = child_block(&c3.header, 0x23, vec![], 0);
        assert!(matches!(
            f.consensus.submit_block(c4).unwrap_err(),
            TallyError::Block(BlockError::UnknownParent(_))
        ));

        assert_eq!(f.chain.height().unwrap(), 2);
        assert_eq!(f.chain.tip_hash().unwrap(), active_tip);
    }

    #[test]
    fn reorg_returns_displaced_transactions_to_mempool() {
        let f = fixture();
        let mut parent = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();

        // Mine 101 blocks so block 1's coinbase matures.
        let mut mined_coinbase = None;
        for i in 1..=101u64 {
            let block = child_block(&parent, (i % 250) as u8, vec![], 0);
            if i == 1 {
                mined_coinbase = Some(block.transactions[0].clone());
            }
            parent = block.header.clone();
            f.consensus.submit_block(block).unwrap();
        }
        let fork_point = parent.clone(); // height 101

        // a102 confirms a spend of the matured coinbase.
        let spend = spend_coinbase(mined_coinbase.as_ref().unwrap(), 5_000, 1);
        let spend_id = spend.id().unwrap();
        let a102 = child_block(&parent, 0x7E, vec![spend], 5_000);
        f.consensus.submit_block(a102).unwrap();
        assert!(!f.mempool.lock().contains(&spend_id));

        // A heavier empty fork displaces a102.
        let c102 = child_block(&fork_point, 0x30, vec![], 0);
        let c103 = child_block(&c102.header, 0x31, vec![], 0);
        f.consensus.submit_block(c102).unwrap();
        let outcome = f.consensus.submit_block(c103.clone()).unwrap();
        assert!(matches!(outcome, CommitOutcome::Reorganized { .. }));

        assert_eq!(f.chain.tip_hash().unwrap(), c103.header.hash());
        // The displaced spend is back in the pool, still valid.
        assert!(f.mempool.lock().contains(&spend_id));
    }

    #[test]
    fn template_includes_mempool_transactions() {
        let f = fixture();
        let mut parent = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();

        let mut mined_coinbase = None;
        for i in 1..=101u64 {
            let block = child_block(&parent, (i % 250) as u8, vec![], 0);
            if i == 1 {
                mined_coinbase = Some(block.transactions[0].clone());
            }
            parent = block.header.clone();
            f.consensus.submit_block(block).unwrap();
        }

        let spend = spend_coinbase(mined_coinbase.as_ref().unwrap(), 5_000, 1);
        let spend_id = spend.id().unwrap();
        f.mempool
            .lock()
            .add(spend, f.utxos.as_ref(), &PermissiveCrypto, 101, NOW_MS)
            .unwrap();

        let mut template = f.consensus.create_block_template(owned(0x01)).unwrap();
        assert_eq!(template.header.height, 102);
        assert!(template
            .transactions
            .iter()
            .any(|tx| tx.id().unwrap() == spend_id));
        assert_eq!(
            template.transactions[0].total_output_amount().unwrap(),
            reward::block_reward(102)
                .checked_add(Amount::from_units(5_000))
                .unwrap()
        );

        // Sign, solve (difficulty 1), submit.
        f.consensus
            .sign_block(&mut template, &pk(0x01), &pk(0x01))
            .unwrap();
        assert!(crate::miner::mine_block(&mut template, 1_000));
        let outcome = f.consensus.submit_block(template).unwrap();
        assert!(matches!(outcome, CommitOutcome::Extended { height: 102, .. }));
        assert!(!f.mempool.lock().contains(&spend_id));
    }

    #[test]
    fn verify_block_does_not_commit() {
        let f = fixture();
        let parent = f.chain.header_of(&f.chain.tip_hash().unwrap()).unwrap().unwrap();
        let block = child_block(&parent, 1, vec![], 0);
        f.consensus.verify_block(&block).unwrap();
        assert_eq!(f.chain.height().unwrap(), 0);
    }
}
