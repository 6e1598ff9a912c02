//! Volatility-based risk weights.
//!
//! A symbol's weight is its recent daily-return volatility normalized
//! against the reference symbol (BTC). The weight is a policy signal,
//! not an accounting number, so the math runs in binary floating point
//! while everything downstream stays in `Decimal`.

use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::VolatilityConfig;
use crate::exchange::ExchangeAdapter;

const REFERENCE_SYMBOL: &str = "BTC";
const CANDLE_TIMEFRAME: &str = "1D";
const VOLATILITY_FLOOR: f64 = 0.001;
const FALLBACK_WEIGHT: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
struct CachedValue {
    value: f64,
    computed_at: Instant,
}

/// Computes and caches per-symbol risk weights.
///
/// Weights come from a pinned override when configured, otherwise from
/// candle history. Any fetch problem degrades to a neutral 1.0 so the
/// control loop never blocks on market data.
pub struct RiskEstimator {
    exchange: Arc<dyn ExchangeAdapter>,
    overrides: HashMap<String, f64>,
    lookback: u32,
    normal_window: Duration,
    spike_window: Duration,
    weights: Mutex<HashMap<String, CachedValue>>,
    reference_vol: Mutex<Option<CachedValue>>,
    last_spike: Mutex<Option<Instant>>,
}

impl RiskEstimator {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, settings: &VolatilityConfig) -> Self {
        Self {
            exchange,
            overrides: settings.weight_overrides.clone(),
            lookback: settings.lookback_days,
            normal_window: Duration::from_secs(settings.refresh_hours * 3600),
            spike_window: Duration::from_secs(settings.spike_refresh_minutes * 60),
            weights: Mutex::new(HashMap::new()),
            reference_vol: Mutex::new(None),
            last_spike: Mutex::new(None),
        }
    }

    /// Risk weight for a symbol. Deterministic given cache contents and
    /// the override table; never fails.
    pub async fn weight(&self, symbol: &str) -> f64 {
        if let Some(&pinned) = self.overrides.get(symbol) {
            return pinned;
        }

        let ttl = self.effective_ttl();
        {
            let cache = self.weights.lock().expect("weight cache poisoned");
            if let Some(entry) = cache.get(symbol) {
                if entry.computed_at.elapsed() < ttl {
                    return entry.value;
                }
            }
        }

        let own_vol = self.volatility(symbol).await;
        let reference_vol = self.reference_volatility(ttl).await;

        let weight = match (own_vol, reference_vol) {
            (Some(own), Some(reference)) => own / reference,
            _ => {
                debug!(%symbol, "candle data missing, assuming neutral weight");
                return FALLBACK_WEIGHT;
            }
        };

        self.weights
            .lock()
            .expect("weight cache poisoned")
            .insert(
                symbol.to_string(),
                CachedValue {
                    value: weight,
                    computed_at: Instant::now(),
                },
            );

        debug!(%symbol, weight, "risk weight computed");
        weight
    }

    /// Shorten the refresh window after a detected price spike.
    pub fn note_spike(&self) {
        *self.last_spike.lock().expect("spike state poisoned") = Some(Instant::now());
    }

    /// Drop all cached weights, including the reference volatility.
    pub fn clear_cache(&self) {
        self.weights.lock().expect("weight cache poisoned").clear();
        *self.reference_vol.lock().expect("reference poisoned") = None;
    }

    /// Spike observations keep the short window active until a full
    /// normal window has passed without one.
    fn effective_ttl(&self) -> Duration {
        let last_spike = *self.last_spike.lock().expect("spike state poisoned");
        match last_spike {
            Some(at) if at.elapsed() < self.normal_window => self.spike_window,
            _ => self.normal_window,
        }
    }

    async fn reference_volatility(&self, ttl: Duration) -> Option<f64> {
        {
            let cached = *self.reference_vol.lock().expect("reference poisoned");
            if let Some(entry) = cached {
                if entry.computed_at.elapsed() < ttl {
                    return Some(entry.value);
                }
            }
        }

        let vol = self.volatility(REFERENCE_SYMBOL).await?;
        *self.reference_vol.lock().expect("reference poisoned") = Some(CachedValue {
            value: vol,
            computed_at: Instant::now(),
        });
        Some(vol)
    }

    async fn volatility(&self, symbol: &str) -> Option<f64> {
        let closes = match self
            .exchange
            .candles(symbol, CANDLE_TIMEFRAME, self.lookback)
            .await
        {
            Ok(closes) => closes,
            Err(e) => {
                warn!(%symbol, error = %e, "candle fetch failed");
                return None;
            }
        };

        let closes: Vec<f64> = closes.iter().filter_map(|c| c.to_f64()).collect();
        realized_volatility(&closes)
    }
}

/// Population standard deviation of simple returns, floored so a flat
/// series still yields a usable divisor.
fn realized_volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }

    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return None;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;

    Some(variance.sqrt().max(VOLATILITY_FLOOR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockExchange;
    use rust_decimal_macros::dec;

    fn estimator_with(
        mock: Arc<MockExchange>,
        overrides: HashMap<String, f64>,
    ) -> RiskEstimator {
        let settings = VolatilityConfig {
            lookback_days: 7,
            refresh_hours: 6,
            spike_refresh_minutes: 10,
            weight_overrides: overrides,
        };
        RiskEstimator::new(mock, &settings)
    }

    #[test]
    fn test_realized_volatility_flat_series_floors() {
        let vol = realized_volatility(&[100.0, 100.0, 100.0]).unwrap();
        assert_eq!(vol, VOLATILITY_FLOOR);
    }

    #[test]
    fn test_realized_volatility_short_series() {
        assert!(realized_volatility(&[100.0]).is_none());
        assert!(realized_volatility(&[]).is_none());
    }

    #[test]
    fn test_realized_volatility_known_value() {
        // Returns: +10%, -10% -> mean 0, variance 0.01, stddev 0.1
        let vol = realized_volatility(&[100.0, 110.0, 99.0]).unwrap();
        assert!((vol - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_override_bypasses_candles() {
        let mock = Arc::new(MockExchange::new());
        let estimator = estimator_with(
            mock.clone(),
            HashMap::from([("ETH".to_string(), 1.2)]),
        );

        let weight = estimator.weight("ETH").await;
        assert_eq!(weight, 1.2);
        assert_eq!(mock.candle_fetches("ETH"), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_returns_neutral() {
        let mock = Arc::new(MockExchange::new());
        mock.set_fail_candles(true);
        let estimator = estimator_with(mock.clone(), HashMap::new());

        assert_eq!(estimator.weight("ETH").await, 1.0);
    }

    #[tokio::test]
    async fn test_missing_candles_returns_neutral() {
        let mock = Arc::new(MockExchange::new());
        let estimator = estimator_with(mock, HashMap::new());

        // No candles scripted at all
        assert_eq!(estimator.weight("ETH").await, 1.0);
    }

    #[tokio::test]
    async fn test_weight_is_btc_normalized() {
        let mock = Arc::new(MockExchange::new());
        // BTC swings +/-10%, ETH +/-20%
        mock.set_candles("BTC", vec![dec!(100), dec!(110), dec!(99)]);
        mock.set_candles("ETH", vec![dec!(100), dec!(120), dec!(96)]);
        let estimator = estimator_with(mock, HashMap::new());

        let weight = estimator.weight("ETH").await;
        assert!((weight - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_cache_avoids_refetch_until_cleared() {
        let mock = Arc::new(MockExchange::new());
        mock.set_candles("BTC", vec![dec!(100), dec!(110), dec!(99)]);
        mock.set_candles("ETH", vec![dec!(100), dec!(120), dec!(96)]);
        let estimator = estimator_with(mock.clone(), HashMap::new());

        let _ = estimator.weight("ETH").await;
        let _ = estimator.weight("ETH").await;
        assert_eq!(mock.candle_fetches("ETH"), 1);

        estimator.clear_cache();
        let _ = estimator.weight("ETH").await;
        assert_eq!(mock.candle_fetches("ETH"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spike_shortens_refresh_window() {
        let mock = Arc::new(MockExchange::new());
        mock.set_candles("BTC", vec![dec!(100), dec!(110), dec!(99)]);
        mock.set_candles("ETH", vec![dec!(100), dec!(120), dec!(96)]);
        let estimator = estimator_with(mock.clone(), HashMap::new());

        let _ = estimator.weight("ETH").await;
        assert_eq!(mock.candle_fetches("ETH"), 1);

        // 20 minutes later the cache would normally still be warm...
        estimator.note_spike();
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        let _ = estimator.weight("ETH").await;

        // ...but the spike collapsed the window to 10 minutes.
        assert_eq!(mock.candle_fetches("ETH"), 2);
    }
}
