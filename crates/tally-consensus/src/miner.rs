//! Reference nonce search.
//!
//! Batched iteration over the header nonce with a cooperative cancellation
//! flag checked once per batch, so an external cancel takes effect within
//! one batch. Progress is reported at the same cadence. CPU-heavy callers
//! run this on a dedicated thread, away from the I/O executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::debug;

use tally_core::types::{Block, BlockHeader};

/// Nonces tried between cancellation checks and progress reports.
pub const NONCE_BATCH: u64 = 10_000;

/// Progress snapshot handed to the caller once per batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MineProgress {
    pub hashes_tried: u64,
    pub hashes_per_sec: f64,
    pub current_nonce: u64,
}

/// Search for a nonce satisfying the header's difficulty target.
///
/// Starts from `header.nonce` and walks upward. Returns the solved header,
/// or `None` on cancellation or nonce-space exhaustion. `progress` is
/// invoked once per [`NONCE_BATCH`] nonces.
pub fn mine(
    mut header: BlockHeader,
    cancel: &AtomicBool,
    mut progress: impl FnMut(MineProgress),
) -> Option<BlockHeader> {
    let started = Instant::now();
    let mut tried: u64 = 0;
    let mut nonce = header.nonce;

    loop {
        let batch_end = nonce.checked_add(NONCE_BATCH);
        let end = batch_end.unwrap_or(u64::MAX);

        while nonce < end {
            header.nonce = nonce;
            if header.meets_target() {
                debug!(nonce, tried, "miner: solution found");
                return Some(header);
            }
            nonce += 1;
            tried += 1;
        }

        let elapsed = started.elapsed().as_secs_f64();
        progress(MineProgress {
            hashes_tried: tried,
            hashes_per_sec: if elapsed > 0.0 { tried as f64 / elapsed } else { 0.0 },
            current_nonce: nonce,
        });

        if cancel.load(Ordering::Relaxed) {
            debug!(tried, "miner: cancelled");
            return None;
        }
        if batch_end.is_none() {
            // Nonce space exhausted; the caller must refresh the template.
            return None;
        }
    }
}

/// Convenience search for tests and block builders: try nonces in
/// `[0, max_nonce]` in place, returning whether a solution was found.
pub fn mine_block(block: &mut Block, max_nonce: u64) -> bool {
    for nonce in 0..=max_nonce {
        block.header.nonce = nonce;
        if block.header.meets_target() {
            return true;
        }
    }
    false
}
