//! Bitfinex public WebSocket feed for derivative ticker prices.
//!
//! One long-lived task owns the connection. The controller replaces the
//! subscription set through a [`FeedHandle`]; price updates flow out on
//! an mpsc channel and are drained serially. Reconnection backs off
//! exponentially; when the attempt budget is exhausted the feed emits a
//! final event and the daemon continues on polling only.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::traits::SubscriptionSink;
use super::types::short_symbol;

pub const DEFAULT_WS_URL: &str = "wss://api-pub.bitfinex.com/ws/2";

const MAX_RECONNECT_ATTEMPTS: u32 = 8;
const RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Events delivered to the stream consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Disconnected,
    /// Last-price update for a subscribed symbol
    Price { symbol: String, price: Decimal },
    /// Reconnect budget exhausted; feed has stopped
    RetriesExhausted,
}

/// Cloneable write half: replaces the feed's subscription set.
#[derive(Clone)]
pub struct FeedHandle {
    commands: mpsc::UnboundedSender<BTreeSet<String>>,
}

#[async_trait]
impl SubscriptionSink for FeedHandle {
    async fn subscribe(&self, symbols: BTreeSet<String>) {
        // Feed task gone means we are shutting down; nothing to do.
        let _ = self.commands.send(symbols);
    }
}

/// Owns the WebSocket connection and the subscription state.
pub struct PriceFeed {
    ws_url: String,
    events: mpsc::Sender<StreamEvent>,
    commands: mpsc::UnboundedReceiver<BTreeSet<String>>,
    /// Short symbols we want subscribed
    wanted: BTreeSet<String>,
}

enum SessionEnd {
    /// Command channel closed; the daemon is draining
    Shutdown,
    /// Never connected
    ConnectionLost,
    /// Connected, then lost
    Established,
}

impl PriceFeed {
    pub fn new(ws_url: &str, events: mpsc::Sender<StreamEvent>) -> (Self, FeedHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                ws_url: ws_url.to_string(),
                events,
                commands: rx,
                wanted: BTreeSet::new(),
            },
            FeedHandle { commands: tx },
        )
    }

    /// Connect-and-consume loop. Returns when the command channel
    /// closes (shutdown) or the reconnect budget runs out.
    pub async fn run(mut self) {
        let mut attempts = 0u32;

        loop {
            match self.session().await {
                SessionEnd::Shutdown => {
                    info!("price feed shutting down");
                    return;
                }
                SessionEnd::ConnectionLost => {
                    let _ = self.events.send(StreamEvent::Disconnected).await;
                    attempts += 1;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        error!("websocket reconnect budget exhausted");
                        let _ = self.events.send(StreamEvent::RetriesExhausted).await;
                        return;
                    }
                    let delay =
                        Duration::from_millis(RECONNECT_BASE_DELAY_MS << attempts.min(6));
                    warn!(?delay, attempts, "websocket reconnecting");
                    tokio::time::sleep(delay).await;
                }
                SessionEnd::Established => {
                    // A session that got as far as connecting resets
                    // the backoff.
                    attempts = 0;
                    let _ = self.events.send(StreamEvent::Disconnected).await;
                    tokio::time::sleep(Duration::from_millis(RECONNECT_BASE_DELAY_MS)).await;
                }
            }
        }
    }

    async fn session(&mut self) -> SessionEnd {
        // Field-precise borrows: the select below holds `commands`
        // while its handlers touch `wanted` and `events`.
        let Self {
            ws_url,
            events,
            commands,
            wanted,
        } = self;

        let (ws, _) = match connect_async(ws_url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(error = %e, "websocket connect failed");
                return SessionEnd::ConnectionLost;
            }
        };
        info!(url = %ws_url, "websocket connected");
        let _ = events.send(StreamEvent::Connected).await;

        let (mut write, mut read) = ws.split();

        // chanId -> short symbol, filled by subscription confirmations
        let mut channels: HashMap<i64, String> = HashMap::new();
        // short symbol -> chanId, for unsubscribes on replacement
        let mut subscribed: HashMap<String, i64> = HashMap::new();

        for symbol in wanted.iter() {
            if send_subscribe(&mut write, symbol).await.is_err() {
                return SessionEnd::Established;
            }
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(next) = command else {
                        return SessionEnd::Shutdown;
                    };
                    if apply_subscription(
                        &mut write,
                        wanted,
                        next,
                        &mut subscribed,
                        &mut channels,
                    )
                    .await
                    .is_err()
                    {
                        return SessionEnd::Established;
                    }
                }
                message = read.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            handle_text(events, &text, &mut channels, &mut subscribed).await;
                        }
                        Some(Ok(Message::Ping(_))) => {
                            debug!("ping received");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("websocket closed by server");
                            return SessionEnd::Established;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "websocket error");
                            return SessionEnd::Established;
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

/// Diff the wanted set against the live subscriptions.
async fn apply_subscription<W>(
    write: &mut W,
    wanted: &mut BTreeSet<String>,
    next: BTreeSet<String>,
    subscribed: &mut HashMap<String, i64>,
    channels: &mut HashMap<i64, String>,
) -> Result<(), tungstenite::Error>
where
    W: SinkExt<Message, Error = tungstenite::Error> + Unpin,
{
    let dropped: Vec<String> = subscribed
        .keys()
        .filter(|s| !next.contains(*s))
        .cloned()
        .collect();
    for symbol in dropped {
        if let Some(chan_id) = subscribed.remove(&symbol) {
            channels.remove(&chan_id);
            let message = json!({ "event": "unsubscribe", "chanId": chan_id });
            write.send(Message::Text(message.to_string().into())).await?;
        }
    }

    for symbol in next.iter() {
        if !subscribed.contains_key(symbol) {
            send_subscribe(write, symbol).await?;
        }
    }

    debug!(symbols = ?next, "subscription set replaced");
    *wanted = next;
    Ok(())
}

async fn send_subscribe<W>(write: &mut W, symbol: &str) -> Result<(), tungstenite::Error>
where
    W: SinkExt<Message, Error = tungstenite::Error> + Unpin,
{
    let message = json!({
        "event": "subscribe",
        "channel": "ticker",
        "symbol": format!("t{}F0:USTF0", symbol),
    });
    write.send(Message::Text(message.to_string().into())).await
}

async fn handle_text(
    events: &mpsc::Sender<StreamEvent>,
    text: &str,
    channels: &mut HashMap<i64, String>,
    subscribed: &mut HashMap<String, i64>,
) {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return;
    };

    if value.is_object() {
        match value.get("event").and_then(Value::as_str) {
            Some("subscribed") => {
                let (Some(chan_id), Some(pair)) = (
                    value.get("chanId").and_then(Value::as_i64),
                    value.get("symbol").and_then(Value::as_str),
                ) else {
                    return;
                };
                let symbol = short_symbol(pair);
                debug!(%symbol, chan_id, "ticker subscribed");
                subscribed.insert(symbol.clone(), chan_id);
                channels.insert(chan_id, symbol);
            }
            Some("error") => {
                warn!(message = %text, "websocket error event");
            }
            _ => {}
        }
        return;
    }

    if let Some(event) = parse_ticker_update(&value, channels) {
        if events.send(event).await.is_err() {
            warn!("stream consumer dropped");
        }
    }
}

/// Channel frame: `[chanId, [BID, BID_SIZE, ASK, ASK_SIZE,
/// DAILY_CHANGE, DAILY_CHANGE_REL, LAST_PRICE, VOLUME, HIGH, LOW]]`.
/// Heartbeats (`[chanId, "hb"]`) are ignored.
fn parse_ticker_update(
    value: &Value,
    channels: &HashMap<i64, String>,
) -> Option<StreamEvent> {
    let frame = value.as_array()?;
    let chan_id = frame.first()?.as_i64()?;
    let payload = frame.get(1)?.as_array()?;
    let price = payload.get(6)?.as_f64().and_then(Decimal::from_f64)?;

    let symbol = channels.get(&chan_id)?.clone();
    Some(StreamEvent::Price { symbol, price })
}
