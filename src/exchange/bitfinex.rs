//! Bitfinex v2 REST client.
//!
//! Derivative pairs ("tBTCF0:USTF0") only. Authenticated endpoints are
//! signed with HMAC-SHA384 over `/api/<path><nonce><body>`. Fetches
//! propagate an [`ExchangeError`] after the retry budget; writes map
//! any failure to `false` per the adapter contract.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use sha2::Sha384;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::config::ExchangeConfig;

use super::traits::{ExchangeAdapter, ExchangeError};
use super::types::{short_symbol, Position, PositionSide};

const API_BASE_URL: &str = "https://api.bitfinex.com";
const PUBLIC_API_BASE_URL: &str = "https://api-pub.bitfinex.com";

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;

/// Bitfinex API client for derivatives accounts.
pub struct BitfinexClient {
    http: Client,
    api_key: String,
    api_secret: String,
    base_url: String,
    public_url: String,
    /// Last-seen collateral per derivative pair. The collateral-set
    /// endpoint takes an absolute value, so signed deltas are applied
    /// against this snapshot, refreshed on every position fetch.
    collateral: Mutex<HashMap<String, Decimal>>,
}

impl BitfinexClient {
    /// Create a new client from configuration.
    pub fn new(config: &ExchangeConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            base_url: API_BASE_URL.to_string(),
            public_url: PUBLIC_API_BASE_URL.to_string(),
            collateral: Mutex::new(HashMap::new()),
        })
    }

    /// Microsecond nonce; Bitfinex requires strictly increasing values.
    fn nonce() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_micros()
            .to_string()
    }

    /// HMAC-SHA384 signature over `/api/<path><nonce><body>`.
    fn sign(&self, path: &str, nonce: &str, body: &str) -> String {
        let payload = format!("/api/{}{}{}", path, nonce, body);
        let mut mac = Hmac::<Sha384>::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn auth_post(&self, path: &str, body: Value) -> Result<Value, ExchangeError> {
        let body_text = body.to_string();
        let url = format!("{}/{}", self.base_url, path);

        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(
                    BACKOFF_BASE_MS << (attempt - 1),
                ))
                .await;
            }

            let nonce = Self::nonce();
            let signature = self.sign(path, &nonce, &body_text);

            let response = self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .header("bfx-nonce", &nonce)
                .header("bfx-apikey", &self.api_key)
                .header("bfx-signature", signature)
                .body(body_text.clone())
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status == reqwest::StatusCode::UNAUTHORIZED
                        || status == reqwest::StatusCode::FORBIDDEN
                    {
                        return Err(ExchangeError::Auth(format!(
                            "{} rejected with {}",
                            path, status
                        )));
                    }
                    if status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    {
                        last_error = format!("{} returned {}", path, status);
                        continue;
                    }
                    if !status.is_success() {
                        return Err(ExchangeError::Protocol(format!(
                            "{} returned {}",
                            path, status
                        )));
                    }
                    return response.json().await.map_err(|e| {
                        ExchangeError::Protocol(format!("{}: {}", path, e))
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        Err(ExchangeError::Transient(last_error))
    }

    async fn public_get(&self, path: &str) -> Result<Value, ExchangeError> {
        let url = format!("{}/{}", self.public_url, path);

        let mut last_error = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(
                    BACKOFF_BASE_MS << (attempt - 1),
                ))
                .await;
            }

            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error()
                        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    {
                        last_error = format!("{} returned {}", path, status);
                        continue;
                    }
                    if !status.is_success() {
                        return Err(ExchangeError::Protocol(format!(
                            "{} returned {}",
                            path, status
                        )));
                    }
                    return response.json().await.map_err(|e| {
                        ExchangeError::Protocol(format!("{}: {}", path, e))
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        Err(ExchangeError::Transient(last_error))
    }

    /// Last prices per derivative pair, from the public tickers endpoint.
    async fn last_prices(
        &self,
        pairs: &[String],
    ) -> Result<HashMap<String, Decimal>, ExchangeError> {
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }

        let path = format!("v2/tickers?symbols={}", pairs.join(","));
        let payload = self.public_get(&path).await?;
        let rows = payload
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("tickers: expected array".to_string()))?;

        let mut prices = HashMap::new();
        for row in rows {
            let Some(fields) = row.as_array() else { continue };
            // Trading ticker: [SYMBOL, BID, BID_SIZE, ASK, ASK_SIZE,
            // DAILY_CHANGE, DAILY_CHANGE_REL, LAST_PRICE, ...]
            let (Some(symbol), Some(last)) = (
                fields.first().and_then(Value::as_str),
                fields.get(7).and_then(value_to_decimal),
            ) else {
                continue;
            };
            prices.insert(symbol.to_string(), last);
        }

        Ok(prices)
    }
}

#[async_trait]
impl ExchangeAdapter for BitfinexClient {
    #[instrument(skip(self))]
    async fn list_positions(&self) -> Result<Vec<Position>, ExchangeError> {
        let payload = self
            .auth_post("v2/auth/r/positions", json!({}))
            .await?;
        let rows = payload
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("positions: expected array".to_string()))?;

        let active: Vec<&Vec<Value>> = rows
            .iter()
            .filter_map(Value::as_array)
            .filter(|row| {
                row.get(1).and_then(Value::as_str) == Some("ACTIVE")
            })
            .collect();

        let pairs: Vec<String> = active
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        let prices = self.last_prices(&pairs).await?;

        let mut positions = Vec::new();
        let mut collateral_seen = HashMap::new();

        for row in active {
            let Some(position) = parse_position(row, &prices) else {
                warn!("unparseable position row skipped");
                continue;
            };
            if let Some(pair) = row.first().and_then(Value::as_str) {
                collateral_seen.insert(pair.to_string(), position.margin);
            }
            positions.push(position);
        }

        *self.collateral.lock().expect("collateral cache poisoned") = collateral_seen;

        debug!(count = positions.len(), "positions fetched");
        Ok(positions)
    }

    #[instrument(skip(self))]
    async fn available_derivatives_balance(&self) -> Result<Decimal, ExchangeError> {
        let payload = self.auth_post("v2/auth/r/wallets", json!({})).await?;
        let rows = payload
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("wallets: expected array".to_string()))?;

        // Wallet row: [WALLET_TYPE, CURRENCY, BALANCE, UNSETTLED_INTEREST,
        // AVAILABLE_BALANCE, ...]
        for row in rows.iter().filter_map(Value::as_array) {
            let wallet_type = row.first().and_then(Value::as_str);
            let currency = row.get(1).and_then(Value::as_str);
            if wallet_type == Some("margin") && currency == Some("USTF0") {
                let available = row
                    .get(4)
                    .and_then(value_to_decimal)
                    .or_else(|| row.get(2).and_then(value_to_decimal))
                    .unwrap_or(Decimal::ZERO);
                return Ok(available.max(Decimal::ZERO));
            }
        }

        Ok(Decimal::ZERO)
    }

    #[instrument(skip(self))]
    async fn candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Decimal>, ExchangeError> {
        let path = format!(
            "v2/candles/trade:{}:{}/hist?limit={}",
            timeframe,
            self.full_symbol(symbol),
            limit
        );
        let payload = self.public_get(&path).await?;
        let rows = payload
            .as_array()
            .ok_or_else(|| ExchangeError::Protocol("candles: expected array".to_string()))?;

        // Candle row: [MTS, OPEN, CLOSE, HIGH, LOW, VOLUME], newest first
        let mut closes: Vec<Decimal> = rows
            .iter()
            .filter_map(Value::as_array)
            .filter_map(|row| row.get(2).and_then(value_to_decimal))
            .collect();
        closes.reverse();

        Ok(closes)
    }

    #[instrument(skip(self))]
    async fn adjust_margin(&self, full_symbol: &str, delta: Decimal) -> bool {
        let current = self
            .collateral
            .lock()
            .expect("collateral cache poisoned")
            .get(full_symbol)
            .copied();
        let Some(current) = current else {
            warn!(%full_symbol, "no collateral snapshot, refusing to adjust");
            return false;
        };

        let target = (current + delta).max(Decimal::ZERO);
        let body = json!({ "symbol": full_symbol, "collateral": target });

        match self.auth_post("v2/auth/w/deriv/collateral/set", body).await {
            Ok(_) => {
                self.collateral
                    .lock()
                    .expect("collateral cache poisoned")
                    .insert(full_symbol.to_string(), target);
                debug!(%full_symbol, %delta, %target, "collateral set");
                true
            }
            Err(e) => {
                warn!(%full_symbol, %delta, error = %e, "collateral set failed");
                false
            }
        }
    }

    #[instrument(skip(self))]
    async fn close_position(
        &self,
        full_symbol: &str,
        side: PositionSide,
        quantity: Decimal,
    ) -> bool {
        // Market order opposite the position: sell to shrink a long,
        // buy to shrink a short.
        let amount = match side {
            PositionSide::Long => -quantity,
            PositionSide::Short => quantity,
        };
        let body = json!({
            "type": "MARKET",
            "symbol": full_symbol,
            "amount": amount.to_string(),
        });

        match self.auth_post("v2/auth/w/order/submit", body).await {
            Ok(_) => {
                debug!(%full_symbol, %amount, "market close submitted");
                true
            }
            Err(e) => {
                warn!(%full_symbol, %amount, error = %e, "market close failed");
                false
            }
        }
    }

    fn full_symbol(&self, short: &str) -> String {
        format!("t{}F0:USTF0", short)
    }
}

fn value_to_decimal(value: &Value) -> Option<Decimal> {
    // Bitfinex sends plain JSON numbers; f64 precision is what the
    // wire gives us.
    value.as_f64().and_then(Decimal::from_f64)
}

/// Position row: [SYMBOL, STATUS, AMOUNT, BASE_PRICE, FUNDING,
/// FUNDING_TYPE, PL, PL_PERC, PRICE_LIQ, LEVERAGE, ..., COLLATERAL at
/// index 17].
fn parse_position(row: &[Value], prices: &HashMap<String, Decimal>) -> Option<Position> {
    let pair = row.first()?.as_str()?;
    let amount = row.get(2).and_then(value_to_decimal)?;
    if amount == Decimal::ZERO {
        return None;
    }

    let entry_price = row.get(3).and_then(value_to_decimal)?;
    let unrealized_pnl = row.get(6).and_then(value_to_decimal).unwrap_or(Decimal::ZERO);
    let leverage = row
        .get(9)
        .and_then(Value::as_f64)
        .map(|l| l.round().max(1.0) as u32)
        .unwrap_or(1);
    let margin = row
        .get(17)
        .and_then(value_to_decimal)
        .unwrap_or(Decimal::ZERO);
    let current_price = prices.get(pair).copied().unwrap_or(entry_price);

    let side = if amount > Decimal::ZERO {
        PositionSide::Long
    } else {
        PositionSide::Short
    };

    Some(Position {
        symbol: short_symbol(pair),
        side,
        quantity: amount.abs(),
        entry_price,
        current_price,
        margin,
        leverage,
        unrealized_pnl,
    })
}
