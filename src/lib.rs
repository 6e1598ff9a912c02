//! # Margin Allocator
//!
//! A daemon that simulates cross-margin on an exchange offering only
//! isolated per-position collateral. Collateral is continuously
//! redistributed toward volatility-weighted targets, and positions are
//! partially closed in priority order when the pool cannot keep every
//! position above its safety buffer.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `exchange`: Bitfinex adapter (REST + WebSocket) and test double
//! - `risk`: Weights, targets, rebalance and liquidation planning,
//!   emergency detection
//! - `control`: The single-writer controller and the tick scheduler
//! - `history`: Append-only SQLite record of outcomes
//! - `notify`: Structured operator alerts
//! - `utils`: Shared decimal arithmetic

pub mod config;
pub mod control;
pub mod exchange;
pub mod history;
pub mod notify;
pub mod risk;
pub mod utils;

pub use config::Config;
