//! Rebalance planning and execution.
//!
//! Turns current-vs-target margins into a filtered, ordered list of
//! signed adjustments, then pushes them through the exchange adapter
//! one at a time. A failed adjustment never aborts the rest of the
//! plan.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::RebalanceConfig;
use crate::exchange::{ExchangeAdapter, Position};
use crate::history::{AdjustmentRecord, HistorySink};

/// Intent to move one position's margin by a signed delta.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginAdjustment {
    pub symbol: String,
    pub delta: Decimal,
}

impl MarginAdjustment {
    pub fn is_decrease(&self) -> bool {
        self.delta < Decimal::ZERO
    }
}

/// What happened when a plan was executed.
#[derive(Debug)]
pub struct RebalanceOutcome {
    pub success_count: u32,
    pub fail_count: u32,
    pub total_moved: Decimal,
    pub records: Vec<AdjustmentRecord>,
}

impl RebalanceOutcome {
    fn empty() -> Self {
        Self {
            success_count: 0,
            fail_count: 0,
            total_moved: Decimal::ZERO,
            records: Vec::new(),
        }
    }
}

/// Plans and executes margin redistribution.
pub struct RebalancePlanner {
    settings: RebalanceConfig,
}

impl RebalancePlanner {
    pub fn new(settings: RebalanceConfig) -> Self {
        Self { settings }
    }

    /// Filtered, ordered adjustments.
    ///
    /// A delta survives only if it clears the absolute threshold AND,
    /// for positions that already carry margin, the relative one.
    /// Decreases come first (largest first) so freed collateral is on
    /// the account before any increase draws on it; increases run
    /// cheapest first.
    pub fn plan(
        &self,
        positions: &[Position],
        targets: &HashMap<String, Decimal>,
    ) -> Vec<MarginAdjustment> {
        let mut decreases = Vec::new();
        let mut increases = Vec::new();

        for position in positions {
            let Some(&target) = targets.get(&position.symbol) else {
                continue;
            };
            let delta = target - position.margin;

            if delta.abs() < self.settings.min_adjustment_usdt {
                continue;
            }
            if position.margin > Decimal::ZERO {
                let deviation = delta.abs() / position.margin * dec!(100);
                if deviation < self.settings.min_deviation_pct {
                    continue;
                }
            }

            let adjustment = MarginAdjustment {
                symbol: position.symbol.clone(),
                delta,
            };
            if adjustment.is_decrease() {
                decreases.push(adjustment);
            } else {
                increases.push(adjustment);
            }
        }

        decreases.sort_by(|a, b| b.delta.abs().cmp(&a.delta.abs()));
        increases.sort_by(|a, b| a.delta.cmp(&b.delta));

        decreases.extend(increases);
        decreases
    }

    /// Execute a plan in order, isolating per-adjustment failures.
    ///
    /// Every successful adjustment is appended to the history sink; a
    /// sink failure is logged and ignored.
    pub async fn execute(
        &self,
        exchange: &dyn ExchangeAdapter,
        history: &dyn HistorySink,
        positions: &[Position],
        plans: &[MarginAdjustment],
    ) -> RebalanceOutcome {
        let mut outcome = RebalanceOutcome::empty();
        let margins: HashMap<&str, Decimal> = positions
            .iter()
            .map(|p| (p.symbol.as_str(), p.margin))
            .collect();

        for plan in plans {
            let full_symbol = exchange.full_symbol(&plan.symbol);
            let ok = exchange.adjust_margin(&full_symbol, plan.delta).await;

            if !ok {
                warn!(symbol = %plan.symbol, delta = %plan.delta, "margin adjustment failed");
                outcome.fail_count += 1;
                continue;
            }

            info!(symbol = %plan.symbol, delta = %plan.delta, "margin adjusted");
            outcome.success_count += 1;
            outcome.total_moved += plan.delta.abs();

            let margin_before = margins.get(plan.symbol.as_str()).copied().unwrap_or_default();
            let record = AdjustmentRecord {
                timestamp: Utc::now(),
                symbol: plan.symbol.clone(),
                delta: plan.delta,
                margin_after: margin_before + plan.delta,
            };
            if let Err(e) = history.record_adjustment(&record) {
                warn!(error = %e, "history sink rejected adjustment record");
            }
            outcome.records.push(record);
        }

        outcome
    }
}
