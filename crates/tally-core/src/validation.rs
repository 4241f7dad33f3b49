//! Transaction validation.
//!
//! Two levels, as with blocks: structural checks are context-free;
//! contextual checks resolve inputs against a UTXO snapshot and verify
//! signatures through the [`Crypto`] capability.

use std::collections::HashSet;

use crate::constants::{MAX_FEE, MAX_TX_SIZE, MIN_FEE};
use crate::crypto::Crypto;
use crate::error::TransactionError;
use crate::types::{Amount, OutPoint, Transaction, TxKind, Utxo};

/// Summary of a successfully validated transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedTransaction {
    /// `input_total - output_total`. Zero for reward transactions.
    pub fee: Amount,
    pub input_total: Amount,
    pub output_total: Amount,
}

/// Context-free transaction checks.
///
/// - reward kinds carry no inputs; everything else needs at least one
/// - at least one output
/// - no duplicate `(previous_tx, previous_index)` pair
/// - output `index` fields are their positions
/// - serialized size within [`MAX_TX_SIZE`]
pub fn validate_transaction_structure(tx: &Transaction) -> Result<(), TransactionError> {
    if tx.kind.is_reward() {
        if !tx.inputs.is_empty() {
            return Err(TransactionError::CoinbaseHasInputs);
        }
    } else if tx.inputs.is_empty() {
        return Err(TransactionError::EmptyInputs);
    }

    if tx.outputs.is_empty() {
        return Err(TransactionError::EmptyOutputs);
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        let outpoint = input.outpoint();
        if !seen.insert(outpoint.clone()) {
            return Err(TransactionError::DuplicateOutpoint(outpoint.to_string()));
        }
    }

    for (position, output) in tx.outputs.iter().enumerate() {
        if output.index as usize != position {
            return Err(TransactionError::OutputIndexMismatch {
                position,
                got: output.index,
            });
        }
    }

    let size = tx.serialized_size()?;
    if size > MAX_TX_SIZE {
        return Err(TransactionError::Oversized { size, max: MAX_TX_SIZE });
    }

    Ok(())
}

/// Full contextual validation against a UTXO snapshot.
///
/// `get_utxo` resolves outpoints in the state this transaction would be
/// applied to; a missing entry is a double-spend. Every input must be
/// mature, carry a truthful claimed amount (the recorded amount is
/// authoritative), be signed over the transaction's signing payload, and
/// be owned by the presented public key. The fee must land in
/// `[MIN_FEE, MAX_FEE]`.
///
/// Reward transactions skip input resolution; their payout rules are
/// enforced by the block validator and the voting engine.
pub fn validate_transaction<F>(
    tx: &Transaction,
    get_utxo: F,
    crypto: &dyn Crypto,
    height: u64,
) -> Result<ValidatedTransaction, TransactionError>
where
    F: Fn(&OutPoint) -> Option<Utxo>,
{
    validate_transaction_structure(tx)?;

    if tx.kind.is_reward() {
        let output_total = tx.total_output_amount().ok_or(TransactionError::ValueOverflow)?;
        return Ok(ValidatedTransaction {
            fee: Amount::ZERO,
            input_total: Amount::ZERO,
            output_total,
        });
    }

    let payload = tx.signing_payload()?;
    let mut input_total = Amount::ZERO;

    for (index, input) in tx.inputs.iter().enumerate() {
        let outpoint = input.outpoint();
        let utxo = get_utxo(&outpoint)
            .ok_or_else(|| TransactionError::UnknownUtxo(outpoint.to_string()))?;

        if utxo.amount != input.claimed_amount {
            return Err(TransactionError::AmountMismatch {
                outpoint: outpoint.to_string(),
                claimed: input.claimed_amount.to_string(),
                recorded: utxo.amount.to_string(),
            });
        }

        if !utxo.is_mature(height) {
            return Err(TransactionError::ImmatureCoinbase { index });
        }

        if !crypto.verify(&payload, &input.script_sig, &input.public_key) {
            return Err(TransactionError::InvalidSignature { index });
        }

        let owner = crypto.public_key_hash(&input.public_key);
        if utxo.address.pubkey_hash().ok() != Some(owner) {
            return Err(TransactionError::KeyMismatch { index });
        }

        input_total = input_total
            .checked_add(utxo.amount)
            .ok_or(TransactionError::ValueOverflow)?;
    }

    let output_total = tx.total_output_amount().ok_or(TransactionError::ValueOverflow)?;
    if output_total > input_total {
        return Err(TransactionError::OutputsExceedInputs {
            inputs: input_total.to_string(),
            outputs: output_total.to_string(),
        });
    }

    let fee = input_total.saturating_sub(output_total);
    let min_fee = Amount::from_units(MIN_FEE);
    let max_fee = Amount::from_units(MAX_FEE);
    if fee < min_fee {
        return Err(TransactionError::FeeTooLow {
            fee: fee.to_string(),
            minimum: min_fee.to_string(),
        });
    }
    if fee > max_fee {
        return Err(TransactionError::FeeTooHigh {
            fee: fee.to_string(),
            maximum: max_fee.to_string(),
        });
    }

    Ok(ValidatedTransaction { fee, input_total, output_total })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::address::Address;
    use crate::error::CryptoError;
    use crate::types::Hash256;

    /// Crypto that accepts any non-empty signature. For exercising
    /// validation logic without real keys.
    pub struct PermissiveCrypto;

    impl Crypto for PermissiveCrypto {
        fn sign(&self, _message: &[u8], _private_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
            Ok(vec![0xAB; 64])
        }

        fn verify(&self, _message: &[u8], signature: &[u8], _public_key: &[u8]) -> bool {
            !signature.is_empty()
        }

        fn derive_address(&self, public_key: &[u8]) -> Result<Address, CryptoError> {
            Ok(Address::from_pubkey_hash(
                crate::address::Network::Devnet,
                &self.public_key_hash(public_key),
            ))
        }
    }

    /// Address owned by the given public key under [`PermissiveCrypto`].
    pub fn owned_address(public_key: &[u8]) -> Address {
        PermissiveCrypto.derive_address(public_key).unwrap()
    }

    /// A UTXO paying `units` to the owner of `public_key`.
    pub fn utxo_for(public_key: &[u8], txid: Hash256, index: u32, units: u64) -> Utxo {
        Utxo {
            tx_id: txid,
            output_index: index,
            amount: Amount::from_units(units),
            address: owned_address(public_key),
            script: vec![],
            timestamp_ms: 0,
            block_height: 0,
            coinbase: false,
            spent: false,
        }
    }
}
