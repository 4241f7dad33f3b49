//! Textual addresses with a 3-character network prefix.
//!
//! An address is `<prefix><base58(version || pubkey_hash || checksum)>`
//! where the prefix identifies the network (`tly` mainnet, `tte` testnet,
//! `tde` devnet), `version` is a single byte, `pubkey_hash` is the 32-byte
//! hash of the owner's public key, and `checksum` is the first four bytes
//! of double SHA-256 over `version || pubkey_hash`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::AddressError;
use crate::types::Hash256;

/// Address version byte.
const ADDRESS_VERSION: u8 = 0x01;

/// Checksum length in bytes.
const CHECKSUM_LEN: usize = 4;

/// Network an address belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Devnet,
}

impl Network {
    /// The 3-character address prefix.
    pub fn prefix(&self) -> &'static str {
        match self {
            Network::Mainnet => "tly",
            Network::Testnet => "tte",
            Network::Devnet => "tde",
        }
    }

    /// Wire-frame magic identifying this network.
    pub fn magic(&self) -> u32 {
        match self {
            Network::Mainnet => 0x544C_5900,
            Network::Testnet => 0x544C_5901,
            Network::Devnet => 0x544C_5902,
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "tly" => Some(Network::Mainnet),
            "tte" => Some(Network::Testnet),
            "tde" => Some(Network::Devnet),
            _ => None,
        }
    }
}

/// A validated textual address.
///
/// Construction via [`from_pubkey_hash`](Self::from_pubkey_hash) or
/// [`parse`](Self::parse) guarantees the checksum is sound.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct Address(String);

impl Address {
    /// Encode a public-key hash as an address on the given network.
    pub fn from_pubkey_hash(network: Network, pubkey_hash: &Hash256) -> Self {
        let mut payload = Vec::with_capacity(1 + 32 + CHECKSUM_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(pubkey_hash.as_bytes());
        let check = checksum(&payload);
        payload.extend_from_slice(&check);
        Self(format!("{}{}", network.prefix(), bs58::encode(payload).into_string()))
    }

    /// Parse and validate an address string.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let (network, hash) = decode(s)?;
        // Re-encode to canonicalize; a valid input round-trips exactly.
        let canonical = Self::from_pubkey_hash(network, &hash);
        if canonical.0 != s {
            return Err(AddressError::InvalidPayload);
        }
        Ok(canonical)
    }

    /// The network this address belongs to.
    pub fn network(&self) -> Result<Network, AddressError> {
        decode(&self.0).map(|(n, _)| n)
    }

    /// The public-key hash this address encodes.
    pub fn pubkey_hash(&self) -> Result<Hash256, AddressError> {
        decode(&self.0).map(|(_, h)| h)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// First four bytes of double SHA-256.
fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

fn decode(s: &str) -> Result<(Network, Hash256), AddressError> {
    if s.len() < 4 {
        return Err(AddressError::InvalidLength(s.len()));
    }
    let (prefix, rest) = s.split_at(3);
    let network = Network::from_prefix(prefix)
        .ok_or_else(|| AddressError::UnknownPrefix(prefix.to_string()))?;

    let payload = bs58::decode(rest)
        .into_vec()
        .map_err(|_| AddressError::InvalidPayload)?;
    if payload.len() != 1 + 32 + CHECKSUM_LEN {
        return Err(AddressError::InvalidLength(payload.len()));
    }

    let (body, check) = payload.split_at(1 + 32);
    if checksum(body) != check {
        return Err(AddressError::InvalidChecksum);
    }
    if body[0] != ADDRESS_VERSION {
        return Err(AddressError::InvalidPayload);
    }

    let mut hash = [0u8; 32];
    hash.copy_from_slice(&body[1..]);
    Ok((network, Hash256(hash)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(seed: u8) -> Hash256 {
        Hash256([seed; 32])
    }

    #[test]
    fn round_trip_all_networks() {
        for network in [Network::Mainnet, Network::Testnet, Network::Devnet] {
            let addr = Address::from_pubkey_hash(network, &h(0x42));
            let parsed = Address::parse(addr.as_str()).unwrap();
            assert_eq!(parsed, addr);
            assert_eq!(parsed.network().unwrap(), network);
            assert_eq!(parsed.pubkey_hash().unwrap(), h(0x42));
        }
    }

    #[test]
    fn prefix_is_three_chars() {
        for network in [Network::Mainnet, Network::Testnet, Network::Devnet] {
            assert_eq!(network.prefix().len(), 3);
            let addr = Address::from_pubkey_hash(network, &h(1));
            assert!(addr.as_str().starts_with(network.prefix()));
        }
    }

    #[test]
    fn rejects_unknown_prefix() {
        let addr = Address::from_pubkey_hash(Network::Mainnet, &h(1));
        let mangled = format!("xxx{}", &addr.as_str()[3..]);
        assert_eq!(
            Address::parse(&mangled).unwrap_err(),
            AddressError::UnknownPrefix("xxx".into())
        );
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let addr = Address::from_pubkey_hash(Network::Mainnet, &h(1));
        // Flip a character late in the base58 body; either the payload fails
        // to decode or the checksum no longer matches.
        let mut chars: Vec<char> = addr.as_str().chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == '2' { '3' } else { '2' };
        let mangled: String = chars.into_iter().collect();
        assert!(Address::parse(&mangled).is_err());
    }

    #[test]
    fn rejects_truncated() {
        assert!(matches!(
            Address::parse("tl"),
            Err(AddressError::InvalidLength(_))
        ));
        assert!(Address::parse("tly").is_err());
    }

    #[test]
    fn distinct_hashes_distinct_addresses() {
        let a = Address::from_pubkey_hash(Network::Mainnet, &h(1));
        let b = Address::from_pubkey_hash(Network::Mainnet, &h(2));
        assert_ne!(a, b);
    }

    #[test]
    fn network_magics_distinct() {
        assert_ne!(Network::Mainnet.magic(), Network::Testnet.magic());
        assert_ne!(Network::Testnet.magic(), Network::Devnet.magic());
    }

    #[test]
    fn bincode_round_trip() {
        let addr = Address::from_pubkey_hash(Network::Devnet, &h(9));
        let encoded = bincode::encode_to_vec(&addr, bincode::config::standard()).unwrap();
        let (decoded, _): (Address, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(addr, decoded);
    }
}
