//! Headers-first chain synchronization.
//!
//! Three phases, one selected peer at a time:
//!
//! 1. **Selection** — from ready peers, keep those at least
//!    [`MIN_PEER_HEIGHT_DIFF`] blocks ahead, on the same currency, with
//!    adequate bandwidth; take the tallest, ties to the lowest latency.
//! 2. **Headers** — batches of [`HEADERS_BATCH_SIZE`], each validated for
//!    linkage, sequential heights, and strictly increasing timestamps.
//!    A bad batch rewinds up to [`MAX_HEADERS_REWIND`] stored headers and
//!    retries; three consecutive failures demote the peer.
//! 3. **Blocks** — bodies fetched in parallel batches of
//!    [`MAX_PARALLEL_BLOCKS`], each verified against its stored header
//!    hash before consensus validation, with three retries under
//!    exponential backoff and jitter.
//!
//! Cancellation is cooperative and takes effect within one batch in either
//! phase.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tally_core::constants::{
    BLOCK_RETRY_ATTEMPTS, BLOCK_RETRY_BACKOFF_MS, CURRENCY_SYMBOL, HEADERS_BATCH_SIZE,
    MAX_HEADERS_REWIND, MAX_PARALLEL_BLOCKS, MIN_PEER_BANDWIDTH_BPS, MIN_PEER_HEIGHT_DIFF,
    RETRY_JITTER_FRACTION,
};
use tally_core::error::{NetworkError, SyncError};
use tally_core::traits::{ChainView, ConsensusEngine};
use tally_core::types::{Block, BlockHeader, Hash256};

/// A ready peer as seen by the selector.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub height: u64,
    pub latency_ms: f64,
    pub bandwidth_bps: u64,
    pub currency_symbol: String,
}

/// Pick the sync peer: tallest eligible, ties to lowest latency.
pub fn select_peer<'a>(local_height: u64, peers: &'a [PeerSnapshot]) -> Option<&'a PeerSnapshot> {
    peers
        .iter()
        .filter(|p| p.height >= local_height + MIN_PEER_HEIGHT_DIFF)
        .filter(|p| p.currency_symbol == CURRENCY_SYMBOL)
        .filter(|p| p.bandwidth_bps >= MIN_PEER_BANDWIDTH_BPS)
        .max_by(|a, b| {
            a.height.cmp(&b.height).then_with(|| {
                b.latency_ms
                    .partial_cmp(&a.latency_ms)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        })
}

/// Validate one header batch against the last accepted header.
///
/// Rules: the first header links to `prev_hash`; heights are strictly
/// sequential from `prev_height`; every header links to its predecessor;
/// timestamps strictly increase.
pub fn validate_header_batch(
    prev_hash: Hash256,
    prev_height: u64,
    prev_timestamp_ms: u64,
    batch: &[BlockHeader],
) -> Result<(), SyncError> {
    let mut last_hash = prev_hash;
    let mut last_height = prev_height;
    let mut last_ts = prev_timestamp_ms;

    for (i, header) in batch.iter().enumerate() {
        if header.previous_hash != last_hash {
            return Err(SyncError::HeaderLinkage(i));
        }
        if header.height != last_height + 1 {
            return Err(SyncError::HeaderHeight(i));
        }
        if header.timestamp_ms <= last_ts {
            return Err(SyncError::HeaderTimestamp(i));
        }
        last_hash = header.hash();
        last_height = header.height;
        last_ts = header.timestamp_ms;
    }
    Ok(())
}

/// Network operations the synchronizer drives. Implemented over peer
/// sessions by the service layer; tests substitute an in-memory client.
#[async_trait]
pub trait SyncClient: Send + Sync {
    async fn request_headers(
        &self,
        peer: &str,
        start_height: u64,
        count: u64,
    ) -> Result<Vec<BlockHeader>, NetworkError>;

    async fn request_block(&self, peer: &str, hash: Hash256) -> Result<Block, NetworkError>;
}

/// Tuning knobs, defaulted from protocol constants. Tests shrink the
/// batches and backoff.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub headers_batch_size: u64,
    pub max_parallel_blocks: usize,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub max_headers_rewind: u64,
    /// Consecutive header-batch failures before the peer is demoted.
    pub header_failure_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            headers_batch_size: HEADERS_BATCH_SIZE,
            max_parallel_blocks: MAX_PARALLEL_BLOCKS,
            retry_attempts: BLOCK_RETRY_ATTEMPTS,
            retry_backoff_ms: BLOCK_RETRY_BACKOFF_MS,
            max_headers_rewind: MAX_HEADERS_REWIND,
            header_failure_limit: 3,
        }
    }
}

/// Progress of the running (or last) sync.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SyncProgress {
    pub current_height: u64,
    pub target_height: u64,
    pub blocks_per_second: f64,
    pub estimated_remaining_secs: f64,
}

/// Headers-first sync controller.
pub struct Synchronizer {
    consensus: Arc<dyn ConsensusEngine>,
    chain: Arc<dyn ChainView>,
    config: SyncConfig,
    cancel: Arc<AtomicBool>,
    progress: RwLock<SyncProgress>,
}

impl Synchronizer {
    pub fn new(
        consensus: Arc<dyn ConsensusEngine>,
        chain: Arc<dyn ChainView>,
        config: SyncConfig,
    ) -> Self {
        Self {
            consensus,
            chain,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: RwLock::new(SyncProgress::default()),
        }
    }

    /// Cooperative cancellation handle; setting it stops the sync within
    /// one batch.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn progress(&self) -> SyncProgress {
        *self.progress.read()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run one synchronization against the best eligible peer.
    ///
    /// Returns the local height reached. The run is `SYNCED` when that
    /// equals the target advertised at selection time.
    pub async fn synchronize(
        &self,
        client: Arc<dyn SyncClient>,
        peers: &[PeerSnapshot],
    ) -> Result<u64, SyncError> {
        let local_height = self.chain.height().map_err(|_| SyncError::NoSuitablePeer)?;
        let peer = select_peer(local_height, peers)
            .ok_or(SyncError::NoSuitablePeer)?
            .clone();
        let target = peer.height;
        info!(peer = %peer.peer_id, local_height, target, "sync: starting");
        *self.progress.write() = SyncProgress {
            current_height: local_height,
            target_height: target,
            ..SyncProgress::default()
        };

        let headers = self.headers_phase(client.as_ref(), &peer.peer_id, target).await?;
        self.blocks_phase(client, &peer.peer_id, headers, target).await?;

        let final_height = self.chain.height().map_err(|_| SyncError::NoSuitablePeer)?;
        info!(final_height, target, "sync: finished");
        Ok(final_height)
    }

    /// Phase 2: download and validate the header chain up to `target`.
    async fn headers_phase(
        &self,
        client: &dyn SyncClient,
        peer: &str,
        target: u64,
    ) -> Result<Vec<BlockHeader>, SyncError> {
        let tip_hash = self.chain.tip_hash().map_err(|_| SyncError::NoSuitablePeer)?;
        let tip_header = self
            .chain
            .get_header(&tip_hash)
            .ok()
            .flatten()
            .ok_or(SyncError::NoSuitablePeer)?;

        let mut headers: Vec<BlockHeader> = Vec::new();
        let mut failures = 0u32;

        loop {
            if self.cancelled() {
                return Err(SyncError::Cancelled);
            }

            let (prev_hash, prev_height, prev_ts) = match headers.last() {
                Some(h) => (h.hash(), h.height, h.timestamp_ms),
                None => (tip_header.hash(), tip_header.height, tip_header.timestamp_ms),
            };
            if prev_height >= target {
                break;
            }

            let count = self.config.headers_batch_size.min(target - prev_height);
            let batch = match client.request_headers(peer, prev_height + 1, count).await {
                Ok(batch) if !batch.is_empty() => batch,
                Ok(_) => {
                    failures += 1;
                    if failures >= self.config.header_failure_limit {
                        return Err(SyncError::PeerDemoted(failures));
                    }
                    continue;
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= self.config.header_failure_limit {
                        return Err(SyncError::PeerDemoted(failures));
                    }
                    continue;
                }
                Err(e) => return Err(SyncError::Network(e)),
            };

            match validate_header_batch(prev_hash, prev_height, prev_ts, &batch) {
                Ok(()) => {
                    debug!(count = batch.len(), up_to = batch.last().map(|h| h.height),
                        "sync: headers accepted");
                    headers.extend(batch);
                    failures = 0;
                }
                Err(e) => {
                    warn!(error = %e, failures, "sync: header batch rejected, rewinding");
                    let keep = headers
                        .len()
                        .saturating_sub(self.config.max_headers_rewind as usize);
                    headers.truncate(keep);
                    failures += 1;
                    if failures >= self.config.header_failure_limit {
                        return Err(SyncError::PeerDemoted(failures));
                    }
                }
            }
        }

        Ok(headers)
    }

    /// Phase 3: fetch bodies in parallel batches and feed them to
    /// consensus in height order.
    async fn blocks_phase(
        &self,
        client: Arc<dyn SyncClient>,
        peer: &str,
        headers: Vec<BlockHeader>,
        target: u64,
    ) -> Result<(), SyncError> {
        let started = std::time::Instant::now();
        let mut applied: u64 = 0;
        let total = headers.len() as u64;

        for chunk in headers.chunks(self.config.max_parallel_blocks) {
            if self.cancelled() {
                return Err(SyncError::Cancelled);
            }

            let mut set = tokio::task::JoinSet::new();
            for (i, header) in chunk.iter().enumerate() {
                let client = client.clone();
                let peer = peer.to_string();
                let header = header.clone();
                let config = self.config.clone();
                set.spawn(async move {
                    (i, fetch_block_with_retry(client, peer, header, config).await)
                });
            }

            let mut fetched: Vec<Option<Block>> = (0..chunk.len()).map(|_| None).collect();
            while let Some(joined) = set.join_next().await {
                let (i, result) =
                    joined.map_err(|e| SyncError::Network(NetworkError::Io(e.to_string())))?;
                fetched[i] = Some(result?);
            }

            for block in fetched.into_iter().flatten() {
                self.consensus
                    .submit_block(block)
                    .map_err(|e| SyncError::Consensus(e.to_string()))?;
                applied += 1;
            }

            let elapsed = started.elapsed().as_secs_f64();
            let bps = if elapsed > 0.0 { applied as f64 / elapsed } else { 0.0 };
            let remaining = total.saturating_sub(applied);
            *self.progress.write() = SyncProgress {
                current_height: self.chain.height().unwrap_or(0),
                target_height: target,
                blocks_per_second: bps,
                estimated_remaining_secs: if bps > 0.0 { remaining as f64 / bps } else { 0.0 },
            };
        }

        Ok(())
    }
}

/// Fetch one block, verifying it against the stored header hash, retrying
/// transient failures with exponential backoff and bounded jitter. After
/// the final attempt a transient failure becomes `PeerUnavailable`.
async fn fetch_block_with_retry(
    client: Arc<dyn SyncClient>,
    peer: String,
    header: BlockHeader,
    config: SyncConfig,
) -> Result<Block, SyncError> {
    let expected = header.hash();
    let mut attempt: u32 = 0;

    loop {
        match client.request_block(&peer, expected).await {
            Ok(block) => {
                if block.header.hash() != expected {
                    return Err(SyncError::HashMismatch { height: header.height });
                }
                return Ok(block);
            }
            Err(e) if e.is_transient() => {
                attempt += 1;
                if attempt >= config.retry_attempts {
                    return Err(SyncError::Network(NetworkError::PeerUnavailable(peer)));
                }
                let backoff = config.retry_backoff_ms << (attempt - 1);
                let jitter = (backoff as f64 * RETRY_JITTER_FRACTION * rand::random::<f64>()) as u64;
                debug!(height = header.height, attempt, backoff_ms = backoff + jitter,
                    "sync: retrying block fetch");
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
            Err(e) => return Err(SyncError::Network(e)),
        }
    }
}
