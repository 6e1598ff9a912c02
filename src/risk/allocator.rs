//! Target collateral allocation.
//!
//! Splits the account's total collateral budget across open positions
//! proportionally to notional weighted by risk weight. This is the
//! "simulated cross-margin" view: the budget behaves as if pooled.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

use crate::exchange::Position;

/// Computes per-symbol target margins from a budget and risk weights.
pub struct TargetAllocator;

impl TargetAllocator {
    pub fn new() -> Self {
        Self
    }

    /// Target margin per symbol. The result sums to `budget` (within
    /// rounding), every target is non-negative, and position order does
    /// not matter.
    ///
    /// Missing weights default to 1. A degenerate all-zero weighting
    /// splits the budget equally.
    pub fn allocate(
        &self,
        positions: &[Position],
        budget: Decimal,
        weights: &HashMap<String, Decimal>,
    ) -> HashMap<String, Decimal> {
        if positions.is_empty() {
            return HashMap::new();
        }

        let weighted: Vec<(String, Decimal)> = positions
            .iter()
            .map(|pos| {
                let weight = weights.get(&pos.symbol).copied().unwrap_or(Decimal::ONE);
                (pos.symbol.clone(), pos.notional() * weight)
            })
            .collect();

        let total: Decimal = weighted.iter().map(|(_, w)| *w).sum();

        if total == Decimal::ZERO {
            let share = budget / Decimal::from(positions.len());
            debug!(%budget, positions = positions.len(), "degenerate weights, splitting equally");
            return weighted.into_iter().map(|(symbol, _)| (symbol, share)).collect();
        }

        weighted
            .into_iter()
            .map(|(symbol, w)| (symbol, budget * w / total))
            .collect()
    }
}

impl Default for TargetAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PositionSide;
    use rust_decimal_macros::dec;

    fn position(symbol: &str, quantity: Decimal, price: Decimal, margin: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity,
            entry_price: price,
            current_price: price,
            margin,
            leverage: 10,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    fn two_positions() -> Vec<Position> {
        vec![
            position("BTC", dec!(0.5), dec!(50000), dec!(400)),
            position("ETH", dec!(10), dec!(3000), dec!(400)),
        ]
    }

    #[test]
    fn test_targets_sum_to_budget() {
        let allocator = TargetAllocator::new();
        let weights = HashMap::from([
            ("BTC".to_string(), dec!(1.0)),
            ("ETH".to_string(), dec!(1.2)),
        ]);

        let targets = allocator.allocate(&two_positions(), dec!(800), &weights);

        let sum: Decimal = targets.values().copied().sum();
        assert!((sum - dec!(800)).abs() < dec!(0.0001));
        assert!(targets.values().all(|t| *t >= Decimal::ZERO));
    }

    #[test]
    fn test_weighted_split_known_values() {
        let allocator = TargetAllocator::new();
        let weights = HashMap::from([
            ("BTC".to_string(), dec!(1.0)),
            ("ETH".to_string(), dec!(1.2)),
        ]);

        // wBTC = 25000, wETH = 36000, sum = 61000
        let targets = allocator.allocate(&two_positions(), dec!(800), &weights);

        assert!((targets["BTC"] - dec!(327.87)).abs() < dec!(0.01));
        assert!((targets["ETH"] - dec!(472.13)).abs() < dec!(0.01));
    }

    #[test]
    fn test_order_independent() {
        let allocator = TargetAllocator::new();
        let weights = HashMap::from([
            ("BTC".to_string(), dec!(1.0)),
            ("ETH".to_string(), dec!(1.2)),
        ]);

        let mut reversed = two_positions();
        reversed.reverse();

        let forward = allocator.allocate(&two_positions(), dec!(800), &weights);
        let backward = allocator.allocate(&reversed, dec!(800), &weights);

        assert_eq!(forward, backward);
    }

    #[test]
    fn test_empty_positions_empty_targets() {
        let allocator = TargetAllocator::new();
        let targets = allocator.allocate(&[], dec!(800), &HashMap::new());
        assert!(targets.is_empty());
    }

    #[test]
    fn test_zero_notional_splits_equally() {
        let allocator = TargetAllocator::new();
        let positions = vec![
            position("BTC", Decimal::ZERO, dec!(50000), dec!(100)),
            position("ETH", Decimal::ZERO, dec!(3000), dec!(100)),
        ];

        let targets = allocator.allocate(&positions, dec!(800), &HashMap::new());

        assert_eq!(targets["BTC"], dec!(400));
        assert_eq!(targets["ETH"], dec!(400));
    }

    #[test]
    fn test_missing_weight_defaults_to_one() {
        let allocator = TargetAllocator::new();
        let weights = HashMap::from([("BTC".to_string(), dec!(1.0))]);

        // ETH has no weight entry: wBTC = 25000, wETH = 30000
        let targets = allocator.allocate(&two_positions(), dec!(550), &weights);

        assert_eq!(targets["BTC"], dec!(250));
        assert_eq!(targets["ETH"], dec!(300));
    }

    #[test]
    fn test_weight_increase_is_monotone() {
        let allocator = TargetAllocator::new();
        let base = HashMap::from([
            ("BTC".to_string(), dec!(1.0)),
            ("ETH".to_string(), dec!(1.0)),
        ]);
        let bumped = HashMap::from([
            ("BTC".to_string(), dec!(1.0)),
            ("ETH".to_string(), dec!(1.5)),
        ]);

        let before = allocator.allocate(&two_positions(), dec!(800), &base);
        let after = allocator.allocate(&two_positions(), dec!(800), &bumped);

        assert!(after["ETH"] > before["ETH"]);
        assert!(after["BTC"] < before["BTC"]);
    }
}
