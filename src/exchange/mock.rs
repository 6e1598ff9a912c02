//! Scriptable exchange double for tests and paper runs.
//!
//! Holds positions and balances in memory, applies margin moves and
//! partial closes to its own state, and keeps a call log so tests can
//! assert ordering and side effects.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::traits::{ExchangeAdapter, ExchangeError};
use super::types::{short_symbol, Position, PositionSide};

/// One call observed by the mock, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    ListPositions,
    AvailableBalance,
    Candles { symbol: String },
    AdjustMargin { full_symbol: String, delta: Decimal },
    ClosePosition {
        full_symbol: String,
        side: PositionSide,
        quantity: Decimal,
    },
}

/// In-memory exchange with scriptable state and failure injection.
#[derive(Default)]
pub struct MockExchange {
    positions: Mutex<Vec<Position>>,
    available: Mutex<Decimal>,
    candles: Mutex<HashMap<String, Vec<Decimal>>>,
    calls: Mutex<Vec<RecordedCall>>,
    fail_adjust: Mutex<HashSet<String>>,
    fail_close: Mutex<HashSet<String>>,
    fail_positions: AtomicBool,
    fail_balance: AtomicBool,
    fail_candles: AtomicBool,
    /// Artificial latency on writes, to widen race windows in tests
    write_latency: Mutex<Duration>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_positions(&self, positions: Vec<Position>) {
        *self.positions.lock().expect("lock poisoned") = positions;
    }

    pub fn set_available(&self, available: Decimal) {
        *self.available.lock().expect("lock poisoned") = available;
    }

    pub fn set_candles(&self, symbol: &str, closes: Vec<Decimal>) {
        self.candles
            .lock()
            .expect("lock poisoned")
            .insert(symbol.to_string(), closes);
    }

    pub fn fail_adjust_for(&self, full_symbol: &str) {
        self.fail_adjust
            .lock()
            .expect("lock poisoned")
            .insert(full_symbol.to_string());
    }

    pub fn fail_close_for(&self, full_symbol: &str) {
        self.fail_close
            .lock()
            .expect("lock poisoned")
            .insert(full_symbol.to_string());
    }

    pub fn set_fail_positions(&self, fail: bool) {
        self.fail_positions.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_balance(&self, fail: bool) {
        self.fail_balance.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_candles(&self, fail: bool) {
        self.fail_candles.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_latency(&self, latency: Duration) {
        *self.write_latency.lock().expect("lock poisoned") = latency;
    }

    /// Snapshot of the call log.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    /// How many candle fetches were observed for a symbol.
    pub fn candle_fetches(&self, symbol: &str) -> usize {
        self.calls
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|call| matches!(call, RecordedCall::Candles { symbol: s } if s == symbol))
            .count()
    }

    pub fn position(&self, symbol: &str) -> Option<Position> {
        self.positions
            .lock()
            .expect("lock poisoned")
            .iter()
            .find(|p| p.symbol == symbol)
            .cloned()
    }

    pub fn available(&self) -> Decimal {
        *self.available.lock().expect("lock poisoned")
    }

    fn record(&self, call: RecordedCall) {
        self.calls.lock().expect("lock poisoned").push(call);
    }

    async fn simulate_latency(&self) {
        let latency = *self.write_latency.lock().expect("lock poisoned");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn list_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        self.record(RecordedCall::ListPositions);
        if self.fail_positions.load(Ordering::SeqCst) {
            return Err(ExchangeError::Transient("scripted failure".to_string()));
        }
        Ok(self.positions.lock().expect("lock poisoned").clone())
    }

    async fn available_derivatives_balance(&self) -> Result<Decimal, ExchangeError> {
        self.record(RecordedCall::AvailableBalance);
        if self.fail_balance.load(Ordering::SeqCst) {
            return Err(ExchangeError::Transient("scripted failure".to_string()));
        }
        Ok(*self.available.lock().expect("lock poisoned"))
    }

    async fn candles(
        &self,
        symbol: &str,
        _timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Decimal>, ExchangeError> {
        self.record(RecordedCall::Candles {
            symbol: symbol.to_string(),
        });
        if self.fail_candles.load(Ordering::SeqCst) {
            return Err(ExchangeError::Transient("scripted failure".to_string()));
        }
        let candles = self.candles.lock().expect("lock poisoned");
        let closes = candles.get(symbol).cloned().unwrap_or_default();
        let keep = closes.len().min(limit as usize);
        Ok(closes[closes.len() - keep..].to_vec())
    }

    async fn adjust_margin(&self, full_symbol: &str, delta: Decimal) -> bool {
        self.simulate_latency().await;
        self.record(RecordedCall::AdjustMargin {
            full_symbol: full_symbol.to_string(),
            delta,
        });
        if self
            .fail_adjust
            .lock()
            .expect("lock poisoned")
            .contains(full_symbol)
        {
            return false;
        }

        let short = short_symbol(full_symbol);
        let mut positions = self.positions.lock().expect("lock poisoned");
        let Some(position) = positions.iter_mut().find(|p| p.symbol == short) else {
            return false;
        };
        position.margin += delta;
        drop(positions);

        *self.available.lock().expect("lock poisoned") -= delta;
        true
    }

    async fn close_position(
        &self,
        full_symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> bool {
        self.simulate_latency().await;
        self.record(RecordedCall::ClosePosition {
            full_symbol: full_symbol.to_string(),
            side,
            quantity,
        });
        if self
            .fail_close
            .lock()
            .expect("lock poisoned")
            .contains(full_symbol)
        {
            return false;
        }

        let short = short_symbol(full_symbol);
        let mut positions = self.positions.lock().expect("lock poisoned");
        let Some(position) = positions.iter_mut().find(|p| p.symbol == short) else {
            return false;
        };

        let close_qty = quantity.min(position.quantity);
        if position.quantity == Decimal::ZERO {
            return false;
        }
        let released = close_qty / position.quantity * position.margin;
        position.quantity -= close_qty;
        position.margin -= released;
        drop(positions);

        *self.available.lock().expect("lock poisoned") += released;
        true
    }

    fn full_symbol(&self, short: &str) -> String {
        format!("t{}F0:USTF0", short)
    }
}
