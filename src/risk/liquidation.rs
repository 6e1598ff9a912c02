//! Deficit detection and partial-close planning.
//!
//! When the pooled collateral cannot keep every position above its
//! safety buffer, positions are partially closed in configured priority
//! order until the estimated released margin covers the gap.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::LiquidationConfig;
use crate::exchange::{Position, PositionSide};

/// Intent to partially close one position.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialClose {
    pub symbol: String,
    pub side: PositionSide,
    pub close_quantity: Decimal,
    pub estimated_released: Decimal,
}

/// Outcome of a liquidation evaluation. Everything short of `Planned`
/// is a structured no-op with its reason.
#[derive(Debug, Clone, PartialEq)]
pub enum LiquidationAssessment {
    /// Master switch is off.
    Disabled,
    /// A liquidation ran recently; wait out the remainder.
    InCooldown { remaining: Duration },
    /// Collateral covers every safety buffer.
    NoGap,
    /// Deficit found; plans are sized and ordered, ready to execute.
    Planned {
        gap: Decimal,
        plans: Vec<PartialClose>,
    },
}

/// Plans partial closes against a collateral deficit.
pub struct LiquidationPlanner {
    settings: LiquidationConfig,
}

impl LiquidationPlanner {
    pub fn new(settings: LiquidationConfig) -> Self {
        Self { settings }
    }

    /// `max(0, Σ min_safe − Σ margin − available)` where `min_safe` is
    /// `notional * maintenance_rate * safety_multiplier`.
    pub fn collateral_gap(&self, positions: &[Position], available: Decimal) -> Decimal {
        let min_safe: Decimal = positions
            .iter()
            .map(|p| {
                p.notional()
                    * self.settings.maintenance_margin_rate
                    * self.settings.safety_margin_multiplier
            })
            .sum();
        let current: Decimal = positions.iter().map(|p| p.margin).sum();

        (min_safe - current - available).max(Decimal::ZERO)
    }

    /// Gate checks, then deficit sizing.
    ///
    /// `since_last` is the time elapsed since the last successful
    /// liquidation, `None` if there has never been one.
    pub fn assess(
        &self,
        positions: &[Position],
        available: Decimal,
        since_last: Option<Duration>,
    ) -> LiquidationAssessment {
        if !self.settings.enabled {
            return LiquidationAssessment::Disabled;
        }

        let cooldown = Duration::from_secs(self.settings.cooldown_seconds);
        if let Some(elapsed) = since_last {
            if elapsed < cooldown {
                return LiquidationAssessment::InCooldown {
                    remaining: cooldown - elapsed,
                };
            }
        }

        let gap = self.collateral_gap(positions, available);
        if gap == Decimal::ZERO {
            return LiquidationAssessment::NoGap;
        }

        let plans = self.plan(positions, gap);
        if plans.is_empty() {
            warn!(%gap, "collateral gap found but nothing closable");
            return LiquidationAssessment::NoGap;
        }

        LiquidationAssessment::Planned { gap, plans }
    }

    /// Walk positions lowest-priority first, sizing each close to the
    /// remaining gap and clamping to the single-close cap.
    fn plan(&self, positions: &[Position], gap: Decimal) -> Vec<PartialClose> {
        let mut ordered: Vec<&Position> =
            positions.iter().filter(|p| p.quantity > Decimal::ZERO).collect();
        ordered.sort_by(|a, b| {
            self.priority_of(&a.symbol)
                .cmp(&self.priority_of(&b.symbol))
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let mut plans = Vec::new();
        let mut remaining = gap;

        for position in ordered {
            if remaining <= Decimal::ZERO {
                break;
            }

            let max_close_qty =
                position.quantity * self.settings.max_single_close_pct / dec!(100);
            let qty_for_release = if position.margin == Decimal::ZERO {
                max_close_qty
            } else {
                remaining / position.margin * position.quantity
            };
            let close_quantity = qty_for_release.min(max_close_qty);
            if close_quantity <= Decimal::ZERO {
                continue;
            }

            let estimated_released = close_quantity / position.quantity * position.margin;

            debug!(
                symbol = %position.symbol,
                %close_quantity,
                %estimated_released,
                %remaining,
                "partial close planned"
            );

            plans.push(PartialClose {
                symbol: position.symbol.clone(),
                side: position.side,
                close_quantity,
                estimated_released,
            });

            remaining -= estimated_released;
        }

        plans
    }

    fn priority_of(&self, symbol: &str) -> i32 {
        self.settings
            .priority
            .get(symbol)
            .or_else(|| self.settings.priority.get("default"))
            .copied()
            .unwrap_or(i32::MAX)
    }
}
