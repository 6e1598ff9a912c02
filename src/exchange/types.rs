//! Core data model shared by the control loop and the adapters.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::decimal::safe_div;

/// Direction of a derivative holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// A live derivative holding, snapshotted once per tick.
///
/// `quantity` is always positive; direction lives in `side`. Signed
/// amounts exist only on the wire.
#[derive(Debug, Clone)]
pub struct Position {
    /// Short base identifier, e.g. "BTC"
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    /// Isolated collateral currently attached to this position
    pub margin: Decimal,
    pub leverage: u32,
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// Position value at the current price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.current_price
    }

    /// Collateral as a percentage of notional; zero when notional is zero.
    pub fn margin_rate(&self) -> Decimal {
        safe_div(self.margin, self.notional()) * dec!(100)
    }
}

/// Strip a derivative pair back to its short base identifier:
/// "tBTCF0:USTF0" -> "BTC". Unknown shapes pass through unchanged.
pub fn short_symbol(full: &str) -> String {
    full.strip_prefix('t')
        .and_then(|s| s.strip_suffix("F0:USTF0"))
        .unwrap_or(full)
        .to_string()
}

/// Signal raised by the event detector and handled by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum EmergencySignal {
    /// A position's margin rate fell below the emergency threshold.
    PositionBelowThreshold { symbol: String },
    /// Consecutive price observations moved more than the spike threshold.
    PriceSpike {
        symbol: String,
        from: Decimal,
        to: Decimal,
    },
    /// Account equity over total margin fell below the warning ratio.
    AccountBelowWarning { rate: Decimal },
}
