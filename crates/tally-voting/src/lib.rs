//! # tally-voting — the direct-voting layer.
//!
//! Collects quadratic-power votes into height- and wall-clock-bounded
//! periods, tallies them for the difficulty adjuster, decides contested
//! forks, and validates participation rewards.

pub mod engine;
pub mod power;

pub use engine::{DirectVoting, ForkCandidate, TallyResult};
pub use power::voting_power;
