//! Quadratic voting power.
//!
//! `voting_power(balance) = floor(sqrt(balance))`, computed on 256-bit
//! integers. Square-rooting balances rate-limits whale influence: ten
//! thousand times the balance buys only a hundred times the power.

use primitive_types::U256;
use tally_core::types::Amount;

/// `floor(sqrt(balance))` as an [`Amount`].
pub fn voting_power(balance: Amount) -> Amount {
    Amount(balance.0.integer_sqrt())
}

/// Whether a claimed power matches the quadratic rule for `balance`.
pub fn power_matches(balance: Amount, claimed: Amount) -> bool {
    voting_power(balance) == claimed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: u64) -> Amount {
        Amount::from_units(n)
    }

    #[test]
    fn perfect_squares() {
        assert_eq!(voting_power(units(0)), units(0));
        assert_eq!(voting_power(units(1)), units(1));
        assert_eq!(voting_power(units(4)), units(2));
        assert_eq!(voting_power(units(10_000)), units(100));
    }

    #[test]
    fn floors_between_squares() {
        assert_eq!(voting_power(units(2)), units(1));
        assert_eq!(voting_power(units(3)), units(1));
        assert_eq!(voting_power(units(99)), units(9));
        assert_eq!(voting_power(units(101)), units(10));
    }

    #[test]
    fn large_balances() {
        let balance = Amount(U256::from(u128::MAX));
        let power = voting_power(balance);
        // p^2 <= balance < (p+1)^2
        assert!(power.0 * power.0 <= balance.0);
        let next = power.0 + U256::one();
        assert!(next * next > balance.0);
    }

    #[test]
    fn power_matches_checks() {
        assert!(power_matches(units(100), units(10)));
        assert!(!power_matches(units(100), units(11)));
    }

    #[test]
    fn monotonic() {
        let mut last = voting_power(units(0));
        for n in 1..200u64 {
            let p = voting_power(units(n));
            assert!(p >= last);
            last = p;
        }
    }
}
