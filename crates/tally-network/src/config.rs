//! Network configuration.
//!
//! A plain struct with per-network presets, overlaid with the environment
//! variables the node consumes (`SEED_DOMAINS`, `WHITELISTED_PEERS`,
//! `BLACKLISTED_PEERS`, `PROXY_IPV4`, `PROXY_IPV6`, `LOCAL_ADDRESSES`,
//! `LATEST_VERSION`). Unknown environment keys are ignored; list-valued
//! variables are comma-separated.

use tally_core::address::Network;
use tally_core::constants::MESSAGE_TIMEOUT_MS;

/// Default P2P port.
pub const DEFAULT_P2P_PORT: u16 = 18_440;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,
    pub listen_addr: String,
    pub listen_port: u16,
    pub max_peers: usize,
    pub message_timeout_ms: u64,
    /// DNS seed domains queried for bootstrap peers.
    pub seed_domains: Vec<String>,
    /// Peers exempt from banning.
    pub whitelisted_peers: Vec<String>,
    /// Peers refused outright.
    pub blacklisted_peers: Vec<String>,
    pub proxy_ipv4: Option<String>,
    pub proxy_ipv6: Option<String>,
    /// Addresses advertised to peers.
    pub local_addresses: Vec<String>,
    /// Latest released version string, advertised for upgrade hints.
    pub latest_version: Option<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_P2P_PORT,
            max_peers: 50,
            message_timeout_ms: MESSAGE_TIMEOUT_MS,
            seed_domains: Vec::new(),
            whitelisted_peers: Vec::new(),
            blacklisted_peers: Vec::new(),
            proxy_ipv4: None,
            proxy_ipv6: None,
            local_addresses: Vec::new(),
            latest_version: None,
        }
    }
}

impl NetworkConfig {
    pub fn mainnet() -> Self {
        Self::default()
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            listen_port: DEFAULT_P2P_PORT + 1,
            ..Self::default()
        }
    }

    pub fn devnet() -> Self {
        Self {
            network: Network::Devnet,
            listen_port: DEFAULT_P2P_PORT + 2,
            ..Self::default()
        }
    }

    /// Overlay the specified environment variables onto this config.
    /// Unset variables leave the current values; unknown keys are ignored.
    pub fn apply_env(&mut self) {
        if let Some(domains) = env_list("SEED_DOMAINS") {
            self.seed_domains = domains;
        }
        if let Some(peers) = env_list("WHITELISTED_PEERS") {
            self.whitelisted_peers = peers;
        }
        if let Some(peers) = env_list("BLACKLISTED_PEERS") {
            self.blacklisted_peers = peers;
        }
        if let Ok(proxy) = std::env::var("PROXY_IPV4") {
            if !proxy.is_empty() {
                self.proxy_ipv4 = Some(proxy);
            }
        }
        if let Ok(proxy) = std::env::var("PROXY_IPV6") {
            if !proxy.is_empty() {
                self.proxy_ipv6 = Some(proxy);
            }
        }
        if let Some(addrs) = env_list("LOCAL_ADDRESSES") {
            self.local_addresses = addrs;
        }
        if let Ok(version) = std::env::var("LATEST_VERSION") {
            if !version.is_empty() {
                self.latest_version = Some(version);
            }
        }
    }

    /// A preset with the environment applied.
    pub fn from_env(network: Network) -> Self {
        let mut config = match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Devnet => Self::devnet(),
        };
        config.apply_env();
        config
    }

    /// The socket address string to bind.
    pub fn listen_socket(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_use_distinct_ports() {
        assert_ne!(NetworkConfig::mainnet().listen_port, NetworkConfig::testnet().listen_port);
        assert_ne!(NetworkConfig::testnet().listen_port, NetworkConfig::devnet().listen_port);
    }

    #[test]
    fn default_is_mainnet() {
        let config = NetworkConfig::default();
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.seed_domains.is_empty());
        assert!(config.proxy_ipv4.is_none());
    }

    #[test]
    fn listen_socket_format() {
        let config = NetworkConfig {
            listen_addr: "127.0.0.1".into(),
            listen_port: 9_000,
            ..NetworkConfig::default()
        };
        assert_eq!(config.listen_socket(), "127.0.0.1:9000");
    }

    #[test]
    fn env_overlay_parses_lists() {
        // Environment access is process-global; use unique keys via a lock
        // on the variables this test owns.
        unsafe {
            std::env::set_var("SEED_DOMAINS", "seed1.tally.example, seed2.tally.example");
            std::env::set_var("WHITELISTED_PEERS", "10.0.0.1:18440");
            std::env::set_var("LATEST_VERSION", "0.2.0");
            std::env::remove_var("BLACKLISTED_PEERS");
            std::env::remove_var("PROXY_IPV4");
        }

        let mut config = NetworkConfig::devnet();
        config.apply_env();
        assert_eq!(
            config.seed_domains,
            vec!["seed1.tally.example".to_string(), "seed2.tally.example".to_string()]
        );
        assert_eq!(config.whitelisted_peers, vec!["10.0.0.1:18440".to_string()]);
        assert_eq!(config.latest_version.as_deref(), Some("0.2.0"));
        assert!(config.proxy_ipv4.is_none());

        unsafe {
            std::env::remove_var("SEED_DOMAINS");
            std::env::remove_var("WHITELISTED_PEERS");
            std::env::remove_var("LATEST_VERSION");
        }
    }
}
