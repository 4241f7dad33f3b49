//! Top-down node composition.
//!
//! The node owns the store, chain index, UTXO set, mempool, voting engine,
//! and consensus engine, wiring them together through their capability
//! traits; nothing holds a reference back to its owner. The network
//! service is wired externally: inbound messages arrive through
//! [`handle_message`](Node::handle_message), which returns the replies to
//! send.
//!
//! A health check counts consecutive store failures; after three, new
//! block acceptance is paused until the operator resumes.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use tally_consensus::{miner, Chain, Consensus, ConsensusConfig};
use tally_core::address::Address;
use tally_core::constants::HEADERS_BATCH_SIZE;
use tally_core::crypto::{Crypto, Ed25519Crypto};
use tally_core::error::{MempoolError, StoreError, TallyError};
use tally_core::mempool::Mempool;
use tally_core::store::{keys, Store};
use tally_core::traits::{ChainView, CommitOutcome, ConsensusEngine};
use tally_core::types::{Block, Hash256, Transaction, Utxo, Vote};
use tally_core::utxo::UtxoSet;
use tally_network::message::{InvItem, InvKind, Message};
use tally_voting::DirectVoting;

use crate::config::NodeConfig;

/// Store failures tolerated before the node pauses block acceptance.
const STORE_FAILURE_LIMIT: u32 = 3;

/// Snapshot of node health.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHealth {
    pub healthy: bool,
    pub paused: bool,
    pub height: Option<u64>,
    pub mempool_size: usize,
}

/// A composed full node.
pub struct Node {
    config: NodeConfig,
    store: Arc<dyn Store>,
    chain: Arc<Chain>,
    utxos: Arc<UtxoSet>,
    mempool: Arc<Mutex<Mempool>>,
    voting: Arc<DirectVoting>,
    consensus: Arc<Consensus>,
    crypto: Arc<dyn Crypto>,
    store_failures: AtomicU32,
    paused: AtomicBool,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Node {
    /// Open a node over a RocksDB store at the configured data directory.
    pub fn open(config: NodeConfig) -> Result<Self, TallyError> {
        let store: Arc<dyn Store> =
            Arc::new(crate::storage::RocksStore::open(Path::new(&config.data_dir))?);
        Self::with_store(config, store)
    }

    /// Compose a node over any store (tests use the in-memory one).
    pub fn with_store(config: NodeConfig, store: Arc<dyn Store>) -> Result<Self, TallyError> {
        let crypto: Arc<dyn Crypto> = Arc::new(Ed25519Crypto::new(config.network));
        let chain = Arc::new(Chain::new(store.clone()));
        let utxos = Arc::new(UtxoSet::new(store.clone()));
        let mempool = Arc::new(Mutex::new(Mempool::new(config.mempool_capacity)));
        let voting = Arc::new(DirectVoting::new(store.clone(), crypto.clone()));
        let consensus = Arc::new(Consensus::new(
            chain.clone(),
            utxos.clone(),
            mempool.clone(),
            voting.clone(),
            store.clone(),
            crypto.clone(),
            ConsensusConfig::new(config.network),
        ));

        chain.load()?;
        consensus.init_genesis()?;
        info!(height = chain.height()?, network = ?config.network, "node: started");

        Ok(Self {
            config,
            store,
            chain,
            utxos,
            mempool,
            voting,
            consensus,
            crypto,
            store_failures: AtomicU32::new(0),
            paused: AtomicBool::new(false),
        })
    }

    pub fn chain(&self) -> Arc<Chain> {
        self.chain.clone()
    }

    pub fn consensus(&self) -> Arc<Consensus> {
        self.consensus.clone()
    }

    pub fn utxos(&self) -> Arc<UtxoSet> {
        self.utxos.clone()
    }

    pub fn voting(&self) -> Arc<DirectVoting> {
        self.voting.clone()
    }

    /// Admit a transaction to the mempool.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash256, TallyError> {
        let height = self.chain.height()?;
        let txid = self.mempool.lock().add(
            tx,
            self.utxos.as_ref(),
            self.crypto.as_ref(),
            height,
            now_ms(),
        )?;
        Ok(txid)
    }

    /// Submit a block through consensus, honoring the health pause.
    pub fn submit_block(&self, block: Block) -> Result<CommitOutcome, TallyError> {
        if self.paused.load(Ordering::Relaxed) {
            return Err(StoreError::Unavailable("node paused by health check".into()).into());
        }
        match self.consensus.submit_block(block) {
            Ok(outcome) => {
                self.store_failures.store(0, Ordering::Relaxed);
                Ok(outcome)
            }
            Err(e) => {
                if matches!(e, TallyError::Store(_)) {
                    let failures = self.store_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= STORE_FAILURE_LIMIT {
                        warn!(failures, "node: pausing block acceptance, store unhealthy");
                        self.paused.store(true, Ordering::Relaxed);
                    }
                }
                Err(e)
            }
        }
    }

    /// Submit a vote; the voter's account age is derived from their oldest
    /// unspent output.
    pub fn submit_vote(&self, vote: Vote) -> Result<(), TallyError> {
        let age = self.account_age(&vote.voter)?;
        self.voting.submit(vote, age)?;
        Ok(())
    }

    /// Age in blocks of an address's oldest unspent output; zero for an
    /// address with none. Linear scan of the UTXO namespace.
    pub fn account_age(&self, address: &Address) -> Result<u64, TallyError> {
        let height = self.chain.height()?;
        let mut oldest: Option<u64> = None;
        for (_, value) in self.store.iterate(&keys::utxo_prefix())? {
            let utxo: Utxo = bincode::decode_from_slice(&value, bincode::config::standard())
                .map(|(u, _)| u)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            if utxo.address == *address {
                oldest = Some(oldest.map_or(utxo.block_height, |h| h.min(utxo.block_height)));
            }
        }
        Ok(oldest.map_or(0, |h| height.saturating_sub(h)))
    }

    /// Mine one block: template, nonce search, signature, submission.
    /// Returns `None` if the search was cancelled.
    pub fn mine_one(
        &self,
        private_key: &[u8],
        public_key: &[u8],
        cancel: &std::sync::atomic::AtomicBool,
    ) -> Result<Option<CommitOutcome>, TallyError> {
        let miner_address = self.crypto.derive_address(public_key)?;
        let mut block = self.consensus.create_block_template(miner_address)?;
        // The nonce search covers the pre-signature header, which includes
        // the miner key; set it before mining, sign after.
        block.header.miner_public_key = public_key.to_vec();

        let consensus = self.consensus.clone();
        let solved = miner::mine(block.header.clone(), cancel, |progress| {
            consensus.record_hashrate_sample(progress.hashes_per_sec);
        });
        let Some(header) = solved else {
            return Ok(None);
        };
        block.header = header;
        self.consensus.sign_block(&mut block, private_key, public_key)?;
        self.submit_block(block).map(Some)
    }

    /// Periodic upkeep: expire stale mempool entries and close elapsed
    /// voting periods.
    pub fn maintenance(&self) {
        let now = now_ms();
        let expired = self.mempool.lock().expire(now);
        if expired > 0 {
            info!(expired, "node: mempool entries expired");
        }
        if let Ok(height) = self.chain.height() {
            self.voting.on_block_committed(height, now);
        }
    }

    pub fn health(&self) -> NodeHealth {
        let paused = self.paused.load(Ordering::Relaxed);
        NodeHealth {
            healthy: !paused,
            paused,
            height: self.chain.height().ok(),
            mempool_size: self.mempool.lock().len(),
        }
    }

    /// Operator action: resume block acceptance after a pause.
    pub fn resume(&self) {
        self.store_failures.store(0, Ordering::Relaxed);
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Answer one peer message. Returns the replies to send back; relayed
    /// blocks and transactions produce no reply. Double-spends and full
    /// pools drop relayed transactions silently; other admission failures
    /// propagate so the caller can apply ban score.
    pub fn handle_message(&self, message: Message) -> Result<Vec<Message>, TallyError> {
        match message {
            Message::GetHeaders(request) => {
                let count = request.count.min(HEADERS_BATCH_SIZE);
                let mut headers = Vec::new();
                for height in request.start_height..request.start_height + count {
                    match self.chain.get_block_by_height(height)? {
                        Some(block) => headers.push(block.header),
                        None => break,
                    }
                }
                Ok(vec![Message::Headers(headers)])
            }
            Message::GetData(items) => {
                let mut replies = Vec::new();
                for item in items {
                    match item.kind {
                        InvKind::Block => {
                            if let Some(block) = self.chain.get_block(&item.hash)? {
                                replies.push(Message::Block(Box::new(block)));
                            }
                        }
                        InvKind::Tx => {
                            if let Some(entry) = self.mempool.lock().get(&item.hash) {
                                replies.push(Message::Tx(Box::new(entry.tx.clone())));
                            }
                        }
                        InvKind::Vote => {}
                    }
                }
                Ok(replies)
            }
            Message::GetBlocks(request) => {
                // First locator hash on our active chain anchors the reply.
                let start = request
                    .locator
                    .iter()
                    .find_map(|hash| self.chain.active_height_of(hash))
                    .unwrap_or(0);
                let tip = self.chain.height()?;
                let mut inventory = Vec::new();
                for height in (start + 1)..=tip.min(start + 500) {
                    if let Some(hash) = self.chain.hash_at(height) {
                        if hash == request.stop {
                            break;
                        }
                        inventory.push(InvItem { kind: InvKind::Block, hash });
                    }
                }
                Ok(vec![Message::Inv(inventory)])
            }
            Message::Block(block) => {
                self.submit_block(*block)?;
                Ok(Vec::new())
            }
            Message::Tx(tx) => match self.submit_transaction(*tx) {
                Ok(_) => Ok(Vec::new()),
                // Relay races are dropped silently.
                Err(TallyError::Mempool(
                    MempoolError::DoubleSpend { .. }
                    | MempoolError::AlreadyExists(_)
                    | MempoolError::PoolFull,
                )) => Ok(Vec::new()),
                Err(e) => Err(e),
            },
            Message::Mempool => {
                let inventory: Vec<InvItem> = self
                    .mempool
                    .lock()
                    .snapshot()
                    .map(|entry| InvItem { kind: InvKind::Tx, hash: entry.txid })
                    .collect();
                Ok(vec![Message::Inv(inventory)])
            }
            Message::GetVotes { period_id } => {
                let votes = self
                    .voting
                    .period(period_id)
                    .map(|p| p.votes)
                    .unwrap_or_default();
                Ok(vec![Message::Votes(votes)])
            }
            Message::Votes(votes) => {
                for vote in votes {
                    // Individually invalid relayed votes are dropped.
                    let _ = self.submit_vote(vote);
                }
                Ok(Vec::new())
            }
            Message::GetAddr => Ok(vec![Message::Addr(
                self.config
                    .network_config
                    .local_addresses
                    .iter()
                    .map(|addr| tally_network::message::PeerAddr {
                        addr: addr.clone(),
                        last_seen_ms: now_ms(),
                    })
                    .collect(),
            )]),
            // Handshake and keepalive traffic is the session's business.
            _ => Ok(Vec::new()),
        }
    }
}
