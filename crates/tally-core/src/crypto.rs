//! Cryptographic capability consumed by the core.
//!
//! The core never fixes the signature algorithm; it consumes the [`Crypto`]
//! trait and only requires 32-byte digests and deterministic verification.
//! [`Ed25519Crypto`] is the default implementation (Ed25519 signatures,
//! BLAKE3 single hash, double SHA-256). Tests may substitute a permissive
//! implementation to exercise validation logic without real keys.

use sha2::{Digest, Sha256};

use crate::address::{Address, Network};
use crate::error::CryptoError;
use crate::types::Hash256;

/// BLAKE3 hash of arbitrary bytes. The canonical single-hash of the protocol.
pub fn blake3_hash(data: &[u8]) -> Hash256 {
    Hash256(blake3::hash(data).into())
}

/// Double SHA-256. Used for block header hashes, address checksums, and
/// wire-frame payload checksums.
pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Hash256(Sha256::digest(first).into())
}

/// Abstract cryptographic primitives.
///
/// Implementations must produce 32-byte digests and a `verify` that is a
/// pure function of its inputs.
pub trait Crypto: Send + Sync {
    /// Single hash of `data`.
    fn hash(&self, data: &[u8]) -> Hash256 {
        blake3_hash(data)
    }

    /// Double hash of `data`.
    fn double_hash(&self, data: &[u8]) -> Hash256 {
        double_sha256(data)
    }

    /// Sign `message` with a raw private key.
    fn sign(&self, message: &[u8], private_key: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verify `signature` over `message` under `public_key`.
    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool;

    /// Derive the textual address owned by `public_key`.
    fn derive_address(&self, public_key: &[u8]) -> Result<Address, CryptoError>;

    /// Hash of a public key (the payload an address encodes).
    fn public_key_hash(&self, public_key: &[u8]) -> Hash256 {
        blake3_hash(public_key)
    }
}

/// Default [`Crypto`] implementation: Ed25519 over BLAKE3 pubkey hashing.
pub struct Ed25519Crypto {
    network: Network,
}

impl Ed25519Crypto {
    pub fn new(network: Network) -> Self {
        Self { network }
    }

    /// Generate a fresh keypair as `(private_key, public_key)` raw bytes.
    pub fn generate_keypair() -> (Vec<u8>, Vec<u8>) {
        use ed25519_dalek::SigningKey;
        use rand::rngs::OsRng;
        let sk = SigningKey::generate(&mut OsRng);
        (sk.to_bytes().to_vec(), sk.verifying_key().to_bytes().to_vec())
    }
}

impl Crypto for Ed25519Crypto {
    fn sign(&self, message: &[u8], private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
        use ed25519_dalek::{Signer, SigningKey};
        let bytes: [u8; 32] = private_key
            .try_into()
            .map_err(|_| CryptoError::InvalidPrivateKey)?;
        let sk = SigningKey::from_bytes(&bytes);
        Ok(sk.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};
        let Ok(pk_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(vk) = VerifyingKey::from_bytes(&pk_bytes) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        vk.verify(message, &sig).is_ok()
    }

    fn derive_address(&self, public_key: &[u8]) -> Result<Address, CryptoError> {
        if public_key.len() != 32 {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(Address::from_pubkey_hash(
            self.network,
            &self.public_key_hash(public_key),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_is_deterministic() {
        assert_eq!(blake3_hash(b"tally"), blake3_hash(b"tally"));
        assert_ne!(blake3_hash(b"tally"), blake3_hash(b"sally"));
    }

    #[test]
    fn double_sha256_differs_from_single() {
        let single = Hash256(Sha256::digest(b"tally").into());
        assert_ne!(double_sha256(b"tally"), single);
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let crypto = Ed25519Crypto::new(Network::Devnet);
        let (sk, pk) = Ed25519Crypto::generate_keypair();
        let sig = crypto.sign(b"message", &sk).unwrap();
        assert!(crypto.verify(b"message", &sig, &pk));
        assert!(!crypto.verify(b"other", &sig, &pk));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let crypto = Ed25519Crypto::new(Network::Devnet);
        let (sk, _) = Ed25519Crypto::generate_keypair();
        let (_, other_pk) = Ed25519Crypto::generate_keypair();
        let sig = crypto.sign(b"message", &sk).unwrap();
        assert!(!crypto.verify(b"message", &sig, &other_pk));
    }

    #[test]
    fn verify_rejects_malformed_inputs() {
        let crypto = Ed25519Crypto::new(Network::Devnet);
        assert!(!crypto.verify(b"m", &[0u8; 10], &[0u8; 32]));
        assert!(!crypto.verify(b"m", &[0u8; 64], &[0u8; 5]));
    }

    #[test]
    fn sign_rejects_bad_private_key() {
        let crypto = Ed25519Crypto::new(Network::Devnet);
        assert_eq!(
            crypto.sign(b"m", &[0u8; 7]).unwrap_err(),
            CryptoError::InvalidPrivateKey
        );
    }

    #[test]
    fn derive_address_uses_network_prefix() {
        let crypto = Ed25519Crypto::new(Network::Testnet);
        let (_, pk) = Ed25519Crypto::generate_keypair();
        let addr = crypto.derive_address(&pk).unwrap();
        assert!(addr.as_str().starts_with("tte"));
        assert_eq!(addr.pubkey_hash().unwrap(), crypto.public_key_hash(&pk));
    }

    #[test]
    fn derive_address_rejects_bad_key() {
        let crypto = Ed25519Crypto::new(Network::Mainnet);
        assert_eq!(
            crypto.derive_address(&[0u8; 3]).unwrap_err(),
            CryptoError::InvalidPublicKey
        );
    }
}
