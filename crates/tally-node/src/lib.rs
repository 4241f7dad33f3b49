//! # tally-node
//! Full-node composition: the persistent RocksDB store, top-down wiring of
//! the chain, UTXO set, mempool, voting, and consensus components, and the
//! node-level health check.

pub mod config;
pub mod node;
pub mod storage;

pub use config::NodeConfig;
pub use node::{Node, NodeHealth};
pub use storage::RocksStore;
