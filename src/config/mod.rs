//! Configuration management for the margin allocator.
//!
//! Loads settings from a YAML file and environment variables.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bitfinex API credentials
    pub exchange: ExchangeConfig,
    /// Control loop timing
    #[serde(default)]
    pub schedule: ScheduleConfig,
    /// Volatility-based risk weighting
    #[serde(default)]
    pub volatility: VolatilityConfig,
    /// Rebalance thresholds
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// Emergency detection thresholds
    #[serde(default)]
    pub emergency: EmergencyConfig,
    /// Partial-close behavior when collateral is in deficit
    #[serde(default)]
    pub liquidation: LiquidationConfig,
    /// History sink location
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    pub api_key: String,
    /// Secret key for signing requests
    pub api_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between rebalance ticks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolatilityConfig {
    /// Daily closes used for the volatility estimate
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Normal weight-cache refresh window in hours
    #[serde(default = "default_refresh_hours")]
    pub refresh_hours: u64,
    /// Shortened refresh window (minutes) while a price spike is active
    #[serde(default = "default_spike_refresh_minutes")]
    pub spike_refresh_minutes: u64,
    /// Manually pinned weights, bypassing the volatility estimate
    #[serde(default)]
    pub weight_overrides: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceConfig {
    /// Minimum absolute margin move worth executing (USDt)
    #[serde(default = "default_min_adjustment_usdt")]
    pub min_adjustment_usdt: Decimal,
    /// Minimum move relative to current margin (percent)
    #[serde(default = "default_min_deviation_pct")]
    pub min_deviation_pct: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyConfig {
    /// Per-position margin rate (percent) below which a top-up preempts the schedule
    #[serde(default = "default_emergency_margin_rate")]
    pub emergency_margin_rate: Decimal,
    /// Price change between consecutive observations (percent) treated as a spike
    #[serde(default = "default_price_spike_pct")]
    pub price_spike_pct: Decimal,
    /// Account-level equity/margin ratio (percent) that triggers a warning
    #[serde(default = "default_account_margin_rate_warning")]
    pub account_margin_rate_warning: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiquidationConfig {
    /// Master switch for partial closes
    #[serde(default)]
    pub enabled: bool,
    /// Plan but never execute
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Cap on a single partial close, as percent of position quantity
    #[serde(default = "default_max_single_close_pct")]
    pub max_single_close_pct: Decimal,
    /// Seconds to wait after a successful liquidation before another
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Headroom factor applied to the maintenance margin rate
    #[serde(default = "default_safety_margin_multiplier")]
    pub safety_margin_multiplier: Decimal,
    /// Exchange maintenance margin rate (fraction, not percent)
    #[serde(default = "default_maintenance_margin_rate")]
    pub maintenance_margin_rate: Decimal,
    /// Close priority per symbol; lower closes first. `default` fills unlisted symbols.
    #[serde(default = "default_priority")]
    pub priority: HashMap<String, i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// SQLite database path for the append-only history
    #[serde(default = "default_history_db")]
    pub db_path: String,
}

// Default value functions
fn default_poll_interval_secs() -> u64 {
    60
}

fn default_lookback_days() -> u32 {
    7
}

fn default_refresh_hours() -> u64 {
    6
}

fn default_spike_refresh_minutes() -> u64 {
    10
}

fn default_min_adjustment_usdt() -> Decimal {
    Decimal::new(50, 0) // 50 USDt
}

fn default_min_deviation_pct() -> Decimal {
    Decimal::new(5, 0) // 5%
}

fn default_emergency_margin_rate() -> Decimal {
    Decimal::new(2, 0) // 2%
}

fn default_price_spike_pct() -> Decimal {
    Decimal::new(5, 0) // 5%
}

fn default_account_margin_rate_warning() -> Decimal {
    Decimal::new(150, 0) // 150%
}

fn default_true() -> bool {
    true
}

fn default_max_single_close_pct() -> Decimal {
    Decimal::new(25, 0) // 25%
}

fn default_cooldown_seconds() -> u64 {
    300
}

fn default_safety_margin_multiplier() -> Decimal {
    Decimal::new(3, 0) // 3x
}

fn default_maintenance_margin_rate() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_priority() -> HashMap<String, i32> {
    HashMap::from([("default".to_string(), 100)])
}

fn default_history_db() -> String {
    "data/history.db".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            refresh_hours: default_refresh_hours(),
            spike_refresh_minutes: default_spike_refresh_minutes(),
            weight_overrides: HashMap::new(),
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            min_adjustment_usdt: default_min_adjustment_usdt(),
            min_deviation_pct: default_min_deviation_pct(),
        }
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            emergency_margin_rate: default_emergency_margin_rate(),
            price_spike_pct: default_price_spike_pct(),
            account_margin_rate_warning: default_account_margin_rate_warning(),
        }
    }
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dry_run: default_true(),
            max_single_close_pct: default_max_single_close_pct(),
            cooldown_seconds: default_cooldown_seconds(),
            safety_margin_multiplier: default_safety_margin_multiplier(),
            maintenance_margin_rate: default_maintenance_margin_rate(),
            priority: default_priority(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_history_db(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file plus `MARGIN__`-prefixed
    /// environment variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("MARGIN"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.schedule.poll_interval_secs >= 1,
            "poll_interval_secs must be at least 1"
        );

        anyhow::ensure!(
            self.volatility.lookback_days >= 2,
            "lookback_days must be at least 2 to compute returns"
        );

        anyhow::ensure!(
            self.rebalance.min_adjustment_usdt >= Decimal::ZERO,
            "min_adjustment_usdt must not be negative"
        );

        anyhow::ensure!(
            self.rebalance.min_deviation_pct >= Decimal::ZERO,
            "min_deviation_pct must not be negative"
        );

        anyhow::ensure!(
            self.liquidation.max_single_close_pct > Decimal::ZERO
                && self.liquidation.max_single_close_pct <= Decimal::ONE_HUNDRED,
            "max_single_close_pct must be between 0 and 100"
        );

        anyhow::ensure!(
            self.liquidation.maintenance_margin_rate > Decimal::ZERO
                && self.liquidation.maintenance_margin_rate < Decimal::ONE,
            "maintenance_margin_rate must be a fraction between 0 and 1"
        );

        anyhow::ensure!(
            self.liquidation.safety_margin_multiplier >= Decimal::ONE,
            "safety_margin_multiplier must be at least 1"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig {
                api_key: String::new(),
                api_secret: String::new(),
            },
            schedule: ScheduleConfig::default(),
            volatility: VolatilityConfig::default(),
            rebalance: RebalanceConfig::default(),
            emergency: EmergencyConfig::default(),
            liquidation: LiquidationConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}
