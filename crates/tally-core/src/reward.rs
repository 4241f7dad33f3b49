//! Block reward schedule.
//!
//! The subsidy starts at [`INITIAL_REWARD`](crate::constants::INITIAL_REWARD)
//! and halves every [`HALVING_INTERVAL`](crate::constants::HALVING_INTERVAL)
//! blocks, with the shift capped at
//! [`MAX_HALVINGS`](crate::constants::MAX_HALVINGS) and the result floored at
//! [`MIN_REWARD`](crate::constants::MIN_REWARD) (perpetual tail emission of
//! one base unit).

use crate::constants::{HALVING_INTERVAL, INITIAL_REWARD, MAX_HALVINGS, MIN_REWARD};
use crate::error::BlockError;
use crate::types::{Amount, Transaction};

/// Which halving epoch a block height falls in, capped at `MAX_HALVINGS`.
pub fn halving_epoch(height: u64) -> u64 {
    (height / HALVING_INTERVAL).min(MAX_HALVINGS)
}

/// The block subsidy (in base units) for a given height.
pub fn block_reward(height: u64) -> Amount {
    let epoch = halving_epoch(height);
    let shifted = if epoch >= 64 { 0 } else { INITIAL_REWARD >> epoch };
    Amount::from_units(shifted.max(MIN_REWARD))
}

/// The height of the next halving after `height`, or `None` once the shift
/// is capped and only tail emission remains.
pub fn next_halving_height(height: u64) -> Option<u64> {
    let epoch = height / HALVING_INTERVAL;
    if epoch >= MAX_HALVINGS {
        return None;
    }
    Some((epoch + 1).saturating_mul(HALVING_INTERVAL))
}

/// Validate a coinbase transaction's total payout.
///
/// The coinbase outputs must sum to exactly
/// `block_reward(height) + total_fees`.
pub fn validate_reward(
    coinbase: &Transaction,
    height: u64,
    total_fees: Amount,
) -> Result<(), BlockError> {
    let expected = block_reward(height)
        .checked_add(total_fees)
        .ok_or_else(|| BlockError::InvalidReward {
            got: "overflow".into(),
            expected: "overflow".into(),
        })?;
    let got = coinbase
        .total_output_amount()
        .ok_or_else(|| BlockError::InvalidReward {
            got: "overflow".into(),
            expected: expected.to_string(),
        })?;
    if got != expected {
        return Err(BlockError::InvalidReward {
            got: got.to_string(),
            expected: expected.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Network};
    use crate::constants::COIN;
    use crate::types::{Hash256, TxKind, TxOutput};

    fn coinbase_paying(units: u64) -> Transaction {
        Transaction {
            version: 1,
            kind: TxKind::Coinbase,
            inputs: vec![],
            outputs: vec![TxOutput {
                address: Address::from_pubkey_hash(Network::Devnet, &Hash256([1; 32])),
                amount: Amount::from_units(units),
                script: vec![],
                index: 0,
            }],
            lock_time: 0,
            timestamp_ms: 0,
            signature: vec![],
        }
    }

    #[test]
    fn epoch_zero_pays_initial_reward() {
        assert_eq!(block_reward(0), Amount::from_units(INITIAL_REWARD));
        assert_eq!(
            block_reward(HALVING_INTERVAL - 1),
            Amount::from_units(INITIAL_REWARD)
        );
    }

    #[test]
    fn reward_halves_each_epoch() {
        assert_eq!(
            block_reward(HALVING_INTERVAL),
            Amount::from_units(INITIAL_REWARD / 2)
        );
        assert_eq!(
            block_reward(2 * HALVING_INTERVAL),
            Amount::from_units(INITIAL_REWARD / 4)
        );
    }

    #[test]
    fn tail_emission_floor() {
        // Far beyond every halving, the reward is MIN_REWARD, never zero.
        let far = HALVING_INTERVAL * (MAX_HALVINGS + 10);
        assert_eq!(block_reward(far), Amount::from_units(MIN_REWARD));
        assert!(!block_reward(u64::MAX).is_zero());
    }

    #[test]
    fn epoch_is_capped() {
        assert_eq!(halving_epoch(HALVING_INTERVAL * (MAX_HALVINGS + 5)), MAX_HALVINGS);
    }

    #[test]
    fn next_halving_progression() {
        assert_eq!(next_halving_height(0), Some(HALVING_INTERVAL));
        assert_eq!(next_halving_height(HALVING_INTERVAL), Some(2 * HALVING_INTERVAL));
        assert_eq!(next_halving_height(HALVING_INTERVAL * MAX_HALVINGS), None);
    }

    #[test]
    fn validate_reward_exact_match() {
        let cb = coinbase_paying(50 * COIN + 1_000);
        assert!(validate_reward(&cb, 0, Amount::from_units(1_000)).is_ok());
    }

    #[test]
    fn validate_reward_rejects_inflation() {
        let cb = coinbase_paying(50 * COIN + 1);
        let err = validate_reward(&cb, 0, Amount::ZERO).unwrap_err();
        assert!(matches!(err, BlockError::InvalidReward { .. }));
    }

    #[test]
    fn validate_reward_rejects_underpayment() {
        // Underpaying is also invalid: the coinbase must claim exactly the sum.
        let cb = coinbase_paying(50 * COIN - 1);
        assert!(validate_reward(&cb, 0, Amount::ZERO).is_err());
    }
}
