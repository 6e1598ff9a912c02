//! Bitfinex exchange integration.
//!
//! Provides both REST and WebSocket connectivity for:
//! - Account snapshots (positions, derivatives wallet balance)
//! - Collateral moves and partial-close market orders
//! - Candle history for volatility estimation
//! - Streaming ticker prices for the subscribed symbol set

mod bitfinex;
pub mod mock;
mod traits;
mod types;
mod websocket;

pub use bitfinex::BitfinexClient;
pub use mock::{MockExchange, RecordedCall};
pub use traits::{ExchangeAdapter, ExchangeError, SubscriptionSink};
pub use types::{short_symbol, EmergencySignal, Position, PositionSide};
pub use websocket::{FeedHandle, PriceFeed, StreamEvent, DEFAULT_WS_URL};
