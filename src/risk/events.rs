//! Emergency detection.
//!
//! Two inputs: the per-tick position snapshot and the streaming price
//! feed. Both produce `EmergencySignal`s that the controller handles
//! serially; nothing here touches the exchange.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::debug;

use crate::config::EmergencyConfig;
use crate::exchange::{EmergencySignal, Position};
use crate::utils::decimal::{as_pct_of, pct_change};

/// Inspects snapshots and price updates for emergencies.
pub struct EventDetector {
    settings: EmergencyConfig,
    last_prices: Mutex<HashMap<String, Decimal>>,
}

impl EventDetector {
    pub fn new(settings: EmergencyConfig) -> Self {
        Self {
            settings,
            last_prices: Mutex::new(HashMap::new()),
        }
    }

    /// Flag positions below the emergency margin rate and, when the
    /// account-wide equity/margin ratio is below the warning line, the
    /// account itself.
    pub fn scan_snapshot(
        &self,
        positions: &[Position],
        available: Decimal,
    ) -> Vec<EmergencySignal> {
        let mut signals = Vec::new();

        for position in positions {
            if position.margin_rate() < self.settings.emergency_margin_rate {
                signals.push(EmergencySignal::PositionBelowThreshold {
                    symbol: position.symbol.clone(),
                });
            }
        }

        let total_margin: Decimal = positions.iter().map(|p| p.margin).sum();
        if total_margin > Decimal::ZERO {
            let total_equity: Decimal = positions
                .iter()
                .map(|p| p.margin + p.unrealized_pnl)
                .sum::<Decimal>()
                + available;
            let rate = as_pct_of(total_equity, total_margin);
            if rate < self.settings.account_margin_rate_warning {
                signals.push(EmergencySignal::AccountBelowWarning { rate });
            }
        }

        signals
    }

    /// Track the last observed price per symbol; emit a spike when the
    /// change from the previous observation crosses the threshold. The
    /// first observation for a symbol only records the baseline.
    pub fn observe_price(&self, symbol: &str, price: Decimal) -> Option<EmergencySignal> {
        let previous = self
            .last_prices
            .lock()
            .expect("price table poisoned")
            .insert(symbol.to_string(), price)?;

        let change = pct_change(previous, price);
        if change.abs() >= self.settings.price_spike_pct {
            debug!(%symbol, %previous, %price, %change, "price spike");
            return Some(EmergencySignal::PriceSpike {
                symbol: symbol.to_string(),
                from: previous,
                to: price,
            });
        }

        None
    }

    /// Symbols worth watching on the stream: margin rate under twice
    /// the emergency threshold.
    pub fn high_risk(&self, positions: &[Position]) -> BTreeSet<String> {
        positions
            .iter()
            .filter(|p| p.margin_rate() < self.settings.emergency_margin_rate * dec!(2))
            .map(|p| p.symbol.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PositionSide;

    fn settings() -> EmergencyConfig {
        EmergencyConfig {
            emergency_margin_rate: dec!(2),
            price_spike_pct: dec!(5),
            account_margin_rate_warning: dec!(150),
        }
    }

    fn position(symbol: &str, margin: Decimal, upnl: Decimal) -> Position {
        Position {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: dec!(1),
            entry_price: dec!(50000),
            current_price: dec!(50000),
            margin,
            leverage: 10,
            unrealized_pnl: upnl,
        }
    }

    #[test]
    fn test_flags_position_below_threshold() {
        let detector = EventDetector::new(settings());
        // margin rate = 500/50000 = 1% < 2%
        let positions = vec![position("BTC", dec!(500), Decimal::ZERO)];

        let signals = detector.scan_snapshot(&positions, dec!(10000));
        assert!(signals.contains(&EmergencySignal::PositionBelowThreshold {
            symbol: "BTC".to_string()
        }));
    }

    #[test]
    fn test_healthy_position_not_flagged() {
        let detector = EventDetector::new(settings());
        // margin rate = 2500/50000 = 5%
        let positions = vec![position("BTC", dec!(2500), Decimal::ZERO)];

        let signals = detector.scan_snapshot(&positions, dec!(10000));
        assert!(signals.is_empty());
    }

    #[test]
    fn test_account_warning() {
        let detector = EventDetector::new(settings());
        // equity = 2500 - 1200 + 0 = 1300; 1300/2500 = 52% < 150%
        let positions = vec![position("BTC", dec!(2500), dec!(-1200))];

        let signals = detector.scan_snapshot(&positions, Decimal::ZERO);
        assert!(signals
            .iter()
            .any(|s| matches!(s, EmergencySignal::AccountBelowWarning { .. })));
    }

    #[test]
    fn test_first_price_records_baseline_only() {
        let detector = EventDetector::new(settings());
        assert!(detector.observe_price("BTC", dec!(50000)).is_none());
    }

    #[test]
    fn test_spike_detected() {
        let detector = EventDetector::new(settings());
        detector.observe_price("BTC", dec!(50000));

        let signal = detector.observe_price("BTC", dec!(47000));
        assert_eq!(
            signal,
            Some(EmergencySignal::PriceSpike {
                symbol: "BTC".to_string(),
                from: dec!(50000),
                to: dec!(47000),
            })
        );
    }

    #[test]
    fn test_small_move_is_not_a_spike() {
        let detector = EventDetector::new(settings());
        detector.observe_price("BTC", dec!(50000));
        assert!(detector.observe_price("BTC", dec!(50100)).is_none());
    }

    #[test]
    fn test_spike_baseline_advances() {
        let detector = EventDetector::new(settings());
        detector.observe_price("BTC", dec!(50000));
        detector.observe_price("BTC", dec!(50100));

        // 4% from 50100 -- below threshold relative to the new baseline
        assert!(detector.observe_price("BTC", dec!(52100)).is_none());
    }

    #[test]
    fn test_high_risk_set() {
        let detector = EventDetector::new(settings());
        let positions = vec![
            position("BTC", dec!(1500), Decimal::ZERO), // 3% < 4%
            position("ETH", dec!(2500), Decimal::ZERO), // 5% >= 4%
        ];

        let set = detector.high_risk(&positions);
        assert!(set.contains("BTC"));
        assert!(!set.contains("ETH"));
    }
}
