//! Fee selection and replacement bumping

use crate::chain::FeeParams;

use ethers::types::U256;
use tracing::debug;

/// Fee policy for replacement transactions
#[derive(Debug, Clone, Copy)]
pub struct GasEstimator {
    /// Percentage added on each replacement (e.g., 10 = 10%)
    fee_bump_percent: u64,
}

impl GasEstimator {
    pub fn new(fee_bump_percent: u64) -> Self {
        Self { fee_bump_percent }
    }

    /// Fees for a replacement of a transaction sent with `previous`.
    ///
    /// Tip and base are each taken as the larger of the previous and the
    /// current suggestion, then raised by the bump percentage plus one wei.
    /// The cap is base + tip, so neither value can go down and nodes accept
    /// the result as a replacement.
    pub fn bump(&self, previous: FeeParams, suggested: Option<FeeParams>) -> FeeParams {
        let suggested = suggested.unwrap_or(previous);

        let tip = self.raise(std::cmp::max(
            previous.max_priority_fee_per_gas,
            suggested.max_priority_fee_per_gas,
        ));
        let base = self.raise(std::cmp::max(base_part(&previous), base_part(&suggested)));

        let bumped = FeeParams {
            max_priority_fee_per_gas: tip,
            max_fee_per_gas: base.saturating_add(tip),
        };

        debug!("Bumped fees {:?} -> {:?}", previous, bumped);
        bumped
    }

    fn raise(&self, value: U256) -> U256 {
        value
            .saturating_mul(U256::from(100 + self.fee_bump_percent))
            / U256::from(100)
            + U256::one()
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new(10)
    }
}

fn base_part(fees: &FeeParams) -> U256 {
    fees.max_fee_per_gas
        .saturating_sub(fees.max_priority_fee_per_gas)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fees(tip: u64, cap: u64) -> FeeParams {
        FeeParams {
            max_priority_fee_per_gas: U256::from(tip),
            max_fee_per_gas: U256::from(cap),
        }
    }

    #[test]
    fn test_bump_adds_percentage() {
        let bumped = GasEstimator::new(10).bump(fees(100, 300), None);
        assert_eq!(bumped.max_priority_fee_per_gas, U256::from(111));
        // base 200 -> 221, cap = 221 + 111
        assert_eq!(bumped.max_fee_per_gas, U256::from(332));
    }

    #[test]
    fn test_fees_never_decrease_when_market_drops() {
        let estimator = GasEstimator::default();
        let mut current = fees(2_000, 50_000);

        for _ in 0..10 {
            let next = estimator.bump(current, Some(fees(1, 2)));
            assert!(next.max_priority_fee_per_gas > current.max_priority_fee_per_gas);
            assert!(next.max_fee_per_gas > current.max_fee_per_gas);
            current = next;
        }
    }

    #[test]
    fn test_bump_follows_higher_suggestion() {
        let bumped = GasEstimator::new(10).bump(fees(100, 300), Some(fees(1_000, 5_000)));
        assert_eq!(bumped.max_priority_fee_per_gas, U256::from(1_101));
        assert_eq!(bumped.max_fee_per_gas, U256::from(4_401 + 1_101));
    }
}
