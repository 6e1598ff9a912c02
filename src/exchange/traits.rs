//! Adapter traits the control loop depends on.
//!
//! The controller never talks to Bitfinex directly; it consumes these
//! interfaces so the REST client, the streaming feed, and the test
//! doubles are interchangeable.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use thiserror::Error;

use super::types::{Position, PositionSide};

/// Failure taxonomy for exchange fetches.
///
/// Write endpoints never surface errors; they return `false` after the
/// adapter's retry budget is exhausted.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Network or 5xx-class failure that survived the retry budget.
    #[error("transient exchange failure: {0}")]
    Transient(String),
    /// Credentials rejected; writes must stay disabled until a fetch succeeds.
    #[error("authentication failure: {0}")]
    Auth(String),
    /// Response arrived but did not match the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// REST surface of the derivatives exchange.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Active holdings only; flat symbols are not returned.
    async fn list_positions(&self) -> Result<Vec<Position>, ExchangeError>;

    /// Collateral in the derivatives wallet not attached to any position.
    async fn available_derivatives_balance(&self) -> Result<Decimal, ExchangeError>;

    /// Most recent close prices, oldest first.
    async fn candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Decimal>, ExchangeError>;

    /// Move isolated collateral on a position. Positive deltas add,
    /// negative subtract. Returns false on failure instead of raising.
    async fn adjust_margin(&self, full_symbol: &str, delta: Decimal) -> bool;

    /// Partially close a position with a market order opposite its side.
    async fn close_position(
        &self,
        full_symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> bool;

    /// Map a short symbol ("BTC") to the exchange's derivative pair
    /// ("tBTCF0:USTF0"). Opaque to the control loop.
    fn full_symbol(&self, short: &str) -> String;
}

/// Write half of the streaming adapter: the controller publishes the
/// symbols it wants ticker updates for.
#[async_trait]
pub trait SubscriptionSink: Send + Sync {
    /// Replace the subscription set atomically with the given set.
    async fn subscribe(&self, symbols: BTreeSet<String>);
}
