//! # tally-consensus
//! Hybrid proof-of-work + direct-voting consensus: block validation,
//! atomic commits, fork resolution, and the reference nonce search.

pub mod chain;
pub mod engine;
pub mod miner;

pub use chain::Chain;
pub use engine::{Consensus, ConsensusConfig};
pub use miner::{mine, mine_block, MineProgress};
