//! Decimal arithmetic utilities for collateral calculations.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Signed percentage change from `from` to `to`.
///
/// Returns zero when `from` is zero (no meaningful baseline).
pub fn pct_change(from: Decimal, to: Decimal) -> Decimal {
    if from == Decimal::ZERO {
        return Decimal::ZERO;
    }
    (to - from) / from * dec!(100)
}

/// Express `part` as a percentage of `whole`; zero when `whole` is zero.
pub fn as_pct_of(part: Decimal, whole: Decimal) -> Decimal {
    safe_div(part, whole) * dec!(100)
}
