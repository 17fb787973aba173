//! Multi-level commission arithmetic.
//!
//! Everything here is pure: the caller supplies the buyer's ancestors and the
//! rate table, and gets back the entries to post. Amounts are paisa, rates are
//! basis points.

use serde::Serialize;

use crate::error::EngineError;
use crate::hierarchy::{Ancestor, MAX_DEPTH};

/// 100% in basis points.
pub const BPS_DENOMINATOR: u32 = 10_000;

/// Per-level commission rates in basis points; index 0 is level 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelRates(Vec<u32>);

impl LevelRates {
    pub fn new(rates: Vec<u32>) -> Result<Self, EngineError> {
        if rates.len() > MAX_DEPTH as usize {
            return Err(EngineError::InvalidRates(format!(
                "{} levels configured, at most {} allowed",
                rates.len(),
                MAX_DEPTH
            )));
        }
        let total: u64 = rates.iter().map(|r| u64::from(*r)).sum();
        if total > u64::from(BPS_DENOMINATOR) {
            return Err(EngineError::InvalidRates(format!(
                "rates sum to {total} bps, more than the order value"
            )));
        }
        Ok(Self(rates))
    }

    /// Rate for a 1-based level, if one is configured.
    pub fn rate(&self, level: u8) -> Option<u32> {
        let idx = usize::from(level.checked_sub(1)?);
        self.0.get(idx).copied()
    }

    pub fn levels(&self) -> usize {
        self.0.len()
    }

    pub fn total_bps(&self) -> u32 {
        self.0.iter().sum()
    }
}

/// `amount * bps / 10_000`, floored.
pub fn bps_of(amount: i64, bps: u32) -> i64 {
    ((amount as i128 * bps as i128) / BPS_DENOMINATOR as i128) as i64
}

/// A commission owed to one ancestor for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommissionEntry {
    pub beneficiary_id: i64,
    pub level: u8,
    pub amount: i64,
}

/// Commissions for an order of `order_value` paisa.
///
/// Inactive ancestors forfeit their level; their share is not passed up.
pub fn compute(order_value: i64, ancestors: &[Ancestor], rates: &LevelRates) -> Vec<CommissionEntry> {
    if order_value <= 0 {
        return Vec::new();
    }

    ancestors
        .iter()
        .filter(|a| a.is_active && a.depth >= 1 && a.depth <= MAX_DEPTH)
        .filter_map(|a| {
            let amount = bps_of(order_value, rates.rate(a.depth)?);
            (amount > 0).then_some(CommissionEntry {
                beneficiary_id: a.user_id,
                level: a.depth,
                amount,
            })
        })
        .collect()
}

/// Splits `total` into `recipients` equal shares.
/// Returns `(share, remainder)`; the remainder is what could not be split.
pub fn split_evenly(total: i64, recipients: usize) -> (i64, i64) {
    if recipients == 0 || total <= 0 {
        return (0, total.max(0));
    }
    let n = recipients as i64;
    (total / n, total % n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(active: &[bool]) -> Vec<Ancestor> {
        active
            .iter()
            .enumerate()
            .map(|(i, is_active)| Ancestor {
                user_id: 100 + i as i64,
                depth: (i + 1) as u8,
                is_active: *is_active,
            })
            .collect()
    }

    fn rates() -> LevelRates {
        LevelRates::new(vec![1000, 500, 300, 200, 100]).unwrap()
    }

    #[test]
    fn pays_every_active_level() {
        let entries = compute(100_000, &chain(&[true; 5]), &rates());
        let amounts: Vec<i64> = entries.iter().map(|e| e.amount).collect();
        assert_eq!(amounts, vec![10_000, 5_000, 3_000, 2_000, 1_000]);
        assert_eq!(entries[0].beneficiary_id, 100);
        assert_eq!(entries[4].level, 5);
    }

    #[test]
    fn inactive_ancestors_are_skipped_without_compression() {
        let entries = compute(100_000, &chain(&[true, false, true]), &rates());
        assert_eq!(
            entries,
            vec![
                CommissionEntry { beneficiary_id: 100, level: 1, amount: 10_000 },
                CommissionEntry { beneficiary_id: 102, level: 3, amount: 3_000 },
            ]
        );
    }

    #[test]
    fn levels_without_a_rate_earn_nothing() {
        let short = LevelRates::new(vec![1000, 500]).unwrap();
        let entries = compute(100_000, &chain(&[true; 5]), &short);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn amounts_are_floored_and_zero_shares_dropped() {
        // 1% of 199 paisa is 1.99 -> 1; 0.5% of 199 is 0.995 -> dropped
        let r = LevelRates::new(vec![100, 50]).unwrap();
        let entries = compute(199, &chain(&[true, true]), &r);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].amount, 1);
    }

    #[test]
    fn total_never_exceeds_order_value() {
        let r = LevelRates::new(vec![5000, 2500, 1500, 500, 500]).unwrap();
        for value in [1, 7, 999, 123_457, 10_000_001] {
            let paid: i64 = compute(value, &chain(&[true; 5]), &r)
                .iter()
                .map(|e| e.amount)
                .sum();
            assert!(paid <= value, "{paid} > {value}");
        }
    }

    #[test]
    fn non_positive_orders_pay_nothing() {
        assert!(compute(0, &chain(&[true]), &rates()).is_empty());
        assert!(compute(-5, &chain(&[true]), &rates()).is_empty());
    }

    #[test]
    fn ancestors_beyond_max_depth_are_ignored() {
        let deep = vec![Ancestor { user_id: 7, depth: 6, is_active: true }];
        assert!(compute(100_000, &deep, &rates()).is_empty());
    }

    #[test]
    fn rate_tables_are_validated() {
        assert!(matches!(
            LevelRates::new(vec![1; 6]),
            Err(EngineError::InvalidRates(_))
        ));
        assert!(matches!(
            LevelRates::new(vec![9000, 1001]),
            Err(EngineError::InvalidRates(_))
        ));
        let ok = LevelRates::new(vec![9000, 1000]).unwrap();
        assert_eq!(ok.total_bps(), 10_000);
        assert_eq!(ok.rate(0), None);
        assert_eq!(ok.rate(2), Some(1000));
        assert_eq!(ok.rate(3), None);
    }

    #[test]
    fn bps_of_handles_large_amounts() {
        assert_eq!(bps_of(i64::MAX, 10_000), i64::MAX);
        assert_eq!(bps_of(1_000_000, 250), 25_000);
    }

    #[test]
    fn split_keeps_the_remainder() {
        assert_eq!(split_evenly(100, 3), (33, 1));
        assert_eq!(split_evenly(100, 0), (0, 100));
        assert_eq!(split_evenly(0, 4), (0, 0));
    }
}
