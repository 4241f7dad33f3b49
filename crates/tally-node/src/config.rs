//! Node configuration.

use std::path::PathBuf;

use tally_core::address::Network;
use tally_core::constants::MAX_MEMPOOL_SIZE;
use tally_network::NetworkConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub network: Network,
    /// RocksDB data directory.
    pub data_dir: PathBuf,
    pub mempool_capacity: usize,
    pub network_config: NetworkConfig,
}

impl NodeConfig {
    pub fn new(network: Network, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            network,
            data_dir: data_dir.into(),
            mempool_capacity: MAX_MEMPOOL_SIZE,
            network_config: NetworkConfig::from_env(network),
        }
    }

    pub fn devnet(data_dir: impl Into<PathBuf>) -> Self {
        Self::new(Network::Devnet, data_dir)
    }
}

/// Install the global tracing subscriber with env-filter support.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devnet_config_defaults() {
        let config = NodeConfig::devnet("/tmp/tally-test");
        assert_eq!(config.network, Network::Devnet);
        assert_eq!(config.mempool_capacity, MAX_MEMPOOL_SIZE);
        assert_eq!(config.network_config.network, Network::Devnet);
    }
}
