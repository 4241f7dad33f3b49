//! Hybrid difficulty adjustment.
//!
//! The retarget combines three signals into one multiplier on the compact
//! difficulty:
//!
//! 1. **Block time** — expected window timespan over actual, with the actual
//!    clamped to `[expected/4, expected*4]`, dampened by a hashrate-EMA
//!    ratio passed through the logistic curve `σ(x) = 2/(1+e^(-4x)) - 1`.
//! 2. **Votes** — when participation reaches
//!    [`MIN_VOTES_WEIGHT`](crate::constants::MIN_VOTES_WEIGHT), approval
//!    above 50 % pushes difficulty up and below 50 % pulls it down.
//! 3. **Network health** — a factor in `[0.9, 1.1]` from orphan rate,
//!    propagation time, peer count, and latency (weights 0.4/0.3/0.2/0.1).
//!
//! The combined multiplier is clamped to `[1 - ADJUSTMENT_FACTOR,
//! 1 + ADJUSTMENT_FACTOR]` and applied to the difficulty with fixed-point
//! arithmetic. Floating point never touches amounts; it lives only in this
//! statistical layer. Retargets occur every
//! [`DIFFICULTY_ADJUSTMENT_INTERVAL`](crate::constants::DIFFICULTY_ADJUSTMENT_INTERVAL)
//! blocks; between boundaries the previous difficulty carries forward.

use crate::constants::{
    ADJUSTMENT_FACTOR, DIFFICULTY_ADJUSTMENT_INTERVAL, MAX_DIFFICULTY, MIN_DIFFICULTY,
    MIN_VOTES_WEIGHT, TARGET_BLOCK_TIME_MS, VOTE_INFLUENCE, VOTE_POWER_CAP,
};

/// Gain applied to the logistic hashrate damping term. Keeps the damping
/// contribution well inside the final ±25 % clamp.
const HASHRATE_DAMPING_GAIN: f64 = 0.25;

/// Fixed-point scale for applying the float multiplier to the difficulty.
const ADJUSTMENT_PRECISION: u128 = 1_000_000;

/// Voter statistics for the current retarget window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoterTurnout {
    /// Voters over eligible voters, in `[0, 1]`.
    pub participation: f64,
    /// Approving power over total power, in `[0, 1]`.
    pub approval_rate: f64,
}

/// Network health inputs for the current window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkHealth {
    /// Fraction of recent blocks orphaned, in `[0, 1]`.
    pub orphan_rate: f64,
    /// Mean block propagation time in milliseconds.
    pub propagation_ms: f64,
    /// Connected peer count.
    pub peer_count: usize,
    /// Mean peer latency in milliseconds.
    pub latency_ms: f64,
}

/// Logistic damping curve: `σ(x) = 2/(1+e^(-4x)) - 1`, odd, bounded in (-1, 1).
pub fn logistic_damping(x: f64) -> f64 {
    2.0 / (1.0 + (-4.0 * x).exp()) - 1.0
}

/// Exponential moving average with `alpha = 2 / (n + 1)`.
fn ema(samples: &[f64]) -> f64 {
    let alpha = 2.0 / (samples.len() as f64 + 1.0);
    let mut acc = samples[0];
    for s in &samples[1..] {
        acc = alpha * s + (1.0 - alpha) * acc;
    }
    acc
}

/// Block-time difficulty multiplier from window timestamps, dampened by the
/// hashrate-EMA ratio.
///
/// `timestamps_ms` is the window of recent block times, oldest first.
/// Returns 1.0 when fewer than two timestamps are available.
pub fn pow_adjustment(timestamps_ms: &[u64], hashrate_samples: &[f64]) -> f64 {
    if timestamps_ms.len() < 2 {
        return 1.0;
    }
    let intervals = (timestamps_ms.len() - 1) as u64;
    let expected = intervals * TARGET_BLOCK_TIME_MS;
    let actual = timestamps_ms[timestamps_ms.len() - 1].saturating_sub(timestamps_ms[0]);

    // Clamp the observed timespan to prevent extreme retargets from
    // timestamp manipulation.
    let clamped = actual.clamp(expected / 4, expected.saturating_mul(4)).max(1);
    let mut adjustment = expected as f64 / clamped as f64;

    // Damp with the hashrate trend: a rising hashrate (latest sample above
    // its EMA) nudges difficulty further up, a falling one down.
    if hashrate_samples.len() >= 2 {
        let average = ema(hashrate_samples);
        if average > 0.0 {
            let ratio = hashrate_samples[hashrate_samples.len() - 1] / average;
            adjustment *= 1.0 + HASHRATE_DAMPING_GAIN * logistic_damping(ratio - 1.0);
        }
    }

    adjustment
}

/// Vote-signal multiplier.
///
/// Below the participation threshold the signal is unused (1.0). Otherwise
/// approval above 50 % raises difficulty, below 50 % lowers it, scaled by
/// capped participation.
pub fn vote_adjustment(turnout: &VoterTurnout) -> f64 {
    if turnout.participation < MIN_VOTES_WEIGHT {
        return 1.0;
    }
    let weight = turnout.participation.min(VOTE_POWER_CAP) / MIN_VOTES_WEIGHT;
    1.0 + weight * (turnout.approval_rate - 0.5) * ADJUSTMENT_FACTOR
}

/// Network-health multiplier in `[0.9, 1.1]`.
///
/// Each input is normalized to a `[0, 1]` score, combined with fixed
/// weights 0.4 (orphans), 0.3 (propagation), 0.2 (peers), 0.1 (latency).
pub fn health_factor(health: Option<&NetworkHealth>) -> f64 {
    let Some(h) = health else {
        return 1.0;
    };
    let orphan_score = 1.0 - h.orphan_rate.clamp(0.0, 1.0);
    let propagation_score = 1.0 - (h.propagation_ms / 10_000.0).clamp(0.0, 1.0);
    let peer_score = (h.peer_count as f64 / 50.0).clamp(0.0, 1.0);
    let latency_score = 1.0 - (h.latency_ms / 1_000.0).clamp(0.0, 1.0);

    let score = 0.4 * orphan_score + 0.3 * propagation_score + 0.2 * peer_score + 0.1 * latency_score;
    0.9 + 0.2 * score
}

/// Combine the three signals into the final clamped multiplier.
pub fn combined_adjustment(
    timestamps_ms: &[u64],
    hashrate_samples: &[f64],
    turnout: Option<&VoterTurnout>,
    health: Option<&NetworkHealth>,
) -> f64 {
    let pow = pow_adjustment(timestamps_ms, hashrate_samples);
    let vote = turnout.map(vote_adjustment).unwrap_or(1.0);
    let blended = pow * (1.0 - VOTE_INFLUENCE) + vote * VOTE_INFLUENCE;
    let adjusted = blended * health_factor(health);
    adjusted.clamp(1.0 - ADJUSTMENT_FACTOR, 1.0 + ADJUSTMENT_FACTOR)
}

/// The compact difficulty for the block at `height`.
///
/// Off retarget boundaries this is `current_difficulty` unchanged. On a
/// boundary the combined multiplier is applied with fixed-point arithmetic
/// and the result clamped to `[MIN_DIFFICULTY, MAX_DIFFICULTY]`.
pub fn next_difficulty(
    height: u64,
    current_difficulty: u64,
    timestamps_ms: &[u64],
    hashrate_samples: &[f64],
    turnout: Option<&VoterTurnout>,
    health: Option<&NetworkHealth>,
) -> u64 {
    if height == 0 || height % DIFFICULTY_ADJUSTMENT_INTERVAL != 0 {
        return current_difficulty.clamp(MIN_DIFFICULTY, MAX_DIFFICULTY);
    }

    let adjustment = combined_adjustment(timestamps_ms, hashrate_samples, turnout, health);
    let adjustment_fp = (adjustment * ADJUSTMENT_PRECISION as f64) as u128;
    let scaled = (current_difficulty as u128).saturating_mul(adjustment_fp) / ADJUSTMENT_PRECISION;

    (scaled.min(MAX_DIFFICULTY as u128) as u64).clamp(MIN_DIFFICULTY, MAX_DIFFICULTY)
}
