//! Ban-score accounting.
//!
//! Misbehaviour adds points per the error taxonomy (structural 20,
//! signature 50, consensus 100, rate-limit breach 1); a peer reaching
//! [`MAX_BAN_SCORE`](tally_core::constants::MAX_BAN_SCORE) is banned for
//! [`BAN_DURATION_MS`](tally_core::constants::BAN_DURATION_MS).
//! Whitelisted peers accumulate score but are never banned.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use tally_core::constants::{BAN_DURATION_MS, MAX_BAN_SCORE};

#[derive(Debug, Clone, Default)]
struct PeerRecord {
    score: u32,
    banned_until_ms: Option<u64>,
}

/// Scores and bans for all known peers, keyed by peer id.
#[derive(Default)]
pub struct BanScoreBoard {
    peers: HashMap<String, PeerRecord>,
    whitelist: HashSet<String>,
}

impl BanScoreBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peers that are never banned regardless of score.
    pub fn whitelist(&mut self, peer: &str) {
        self.whitelist.insert(peer.to_string());
    }

    /// Add `points` to a peer's score. Returns `true` if this crossed the
    /// ban threshold and the peer is now banned.
    pub fn add_score(&mut self, peer: &str, points: u32, now_ms: u64) -> bool {
        let record = self.peers.entry(peer.to_string()).or_default();
        record.score = record.score.saturating_add(points);
        debug!(peer, score = record.score, points, "peer_score: penalty");

        if record.score >= MAX_BAN_SCORE
            && record.banned_until_ms.is_none()
            && !self.whitelist.contains(peer)
        {
            record.banned_until_ms = Some(now_ms + BAN_DURATION_MS);
            warn!(peer, score = record.score, "peer_score: peer banned");
            return true;
        }
        false
    }

    /// Ban a peer outright, regardless of score.
    pub fn ban(&mut self, peer: &str, now_ms: u64) {
        if self.whitelist.contains(peer) {
            return;
        }
        let record = self.peers.entry(peer.to_string()).or_default();
        record.score = record.score.max(MAX_BAN_SCORE);
        record.banned_until_ms = Some(now_ms + BAN_DURATION_MS);
    }

    pub fn is_banned(&self, peer: &str, now_ms: u64) -> bool {
        self.peers
            .get(peer)
            .and_then(|r| r.banned_until_ms)
            .is_some_and(|until| now_ms < until)
    }

    pub fn score(&self, peer: &str) -> u32 {
        self.peers.get(peer).map(|r| r.score).unwrap_or(0)
    }

    /// Lift expired bans and reset their scores.
    pub fn unban_expired(&mut self, now_ms: u64) {
        for (peer, record) in self.peers.iter_mut() {
            if record.banned_until_ms.is_some_and(|until| now_ms >= until) {
                debug!(peer, "peer_score: ban expired");
                record.banned_until_ms = None;
                record.score = 0;
            }
        }
    }
}
