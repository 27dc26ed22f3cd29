// =============================================================================
// Aster adapter — perpetuals over a signed-query REST API
// =============================================================================
//
// Signed requests append timestamp + recvWindow to the query string and sign
// the whole string with HMAC-SHA256; the API key travels in the X-API-KEY
// header. Symbols are {ASSET}-PERP. Precision tables come from the
// exchangeInfo endpoint at connect time.
//
// SECURITY: the secret key is never logged or serialized.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, warn};

use super::{
    round_to_decimals, Balance, Candle, ExchangeAdapter, ExchangeConfig, ExchangeType, MarketData,
    OrderParams, OrderResult, OrderSide, OrderType, Position, PrecisionTable, SymbolPrecision,
};
use crate::types::Direction;

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.asterdex.com";
const TESTNET_URL: &str = "https://testnet-api.asterdex.com";

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

struct Inner {
    connected: bool,
    precision: PrecisionTable,
}

pub struct AsterAdapter {
    config: ExchangeConfig,
    client: reqwest::Client,
    state: RwLock<Inner>,
}

impl AsterAdapter {
    pub fn new(config: ExchangeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            config,
            client,
            state: RwLock::new(Inner {
                connected: false,
                precision: HashMap::new(),
            }),
        }
    }

    fn base_url(&self) -> &'static str {
        if self.config.testnet {
            TESTNET_URL
        } else {
            MAINNET_URL
        }
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, secret: &str, params: &str) -> String {
        let ts = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(base.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("{base}&signature={sig}")
    }

    async fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> Option<Value> {
        let (api_key, secret) = match (self.config.api_key(), self.config.api_secret()) {
            (Some(k), Some(s)) => (k, s),
            _ => return None,
        };

        let qs = self.signed_query(&secret, params);
        let url = format!("{}{}?{}", self.base_url(), path, qs);

        let resp = match self
            .client
            .request(method, &url)
            .header("X-API-KEY", &api_key)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, path, "aster signed request failed");
                return None;
            }
        };

        let status = resp.status();
        let value: Value = resp.json().await.ok()?;
        if !status.is_success() {
            warn!(status = %status, body = %value, "aster returned error status");
            return None;
        }
        Some(value)
    }

    async fn public_get(&self, path: &str, query: &str) -> Option<Value> {
        let url = if query.is_empty() {
            format!("{}{}", self.base_url(), path)
        } else {
            format!("{}{}?{}", self.base_url(), path, query)
        };
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, path, "aster public request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<Value>().await.ok()
    }

    async fn load_exchange_info(&self) -> bool {
        let resp = match self.public_get("/api/v1/exchangeInfo", "").await {
            Some(r) => r,
            None => return false,
        };

        let mut precision = HashMap::new();
        for entry in resp["symbols"].as_array().cloned().unwrap_or_default() {
            let symbol = entry["symbol"].as_str().unwrap_or_default().to_string();
            if symbol.is_empty() {
                continue;
            }
            precision.insert(
                symbol,
                SymbolPrecision {
                    size_decimals: entry["quantityPrecision"].as_u64().unwrap_or(3) as u32,
                    price_decimals: entry["pricePrecision"].as_u64().unwrap_or(1) as u32,
                    min_size: entry["minQty"]
                        .as_str()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.001),
                },
            );
        }

        if precision.is_empty() {
            return false;
        }

        debug!(symbols = precision.len(), "aster exchange info loaded");
        self.state.write().precision = precision;
        true
    }
}

fn parse_f64(value: &Value) -> Option<f64> {
    if let Some(s) = value.as_str() {
        s.parse().ok()
    } else {
        value.as_f64()
    }
}

#[async_trait]
impl ExchangeAdapter for AsterAdapter {
    fn exchange_type(&self) -> ExchangeType {
        ExchangeType::Aster
    }

    fn is_configured(&self) -> bool {
        self.config.api_key().is_some() && self.config.api_secret().is_some()
    }

    fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    async fn connect(&self) -> bool {
        if !self.load_exchange_info().await {
            warn!("aster connect failed: exchangeInfo unavailable");
            return false;
        }
        self.state.write().connected = true;
        debug!(testnet = self.config.testnet, "aster connected");
        true
    }

    async fn disconnect(&self) {
        self.state.write().connected = false;
    }

    async fn get_balance(&self) -> Option<Balance> {
        let resp = self
            .signed_request(reqwest::Method::GET, "/api/v1/account", "")
            .await?;

        Some(Balance {
            total_equity: parse_f64(&resp["totalEquity"])?,
            available_balance: parse_f64(&resp["availableBalance"]).unwrap_or(0.0),
            margin_used: parse_f64(&resp["totalMarginUsed"]).unwrap_or(0.0),
            maintenance_margin: parse_f64(&resp["totalMaintenanceMargin"]).unwrap_or(0.0),
            unrealized_pnl: parse_f64(&resp["totalUnrealizedPnl"]).unwrap_or(0.0),
            currency: "USDT".to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn get_positions(&self) -> Vec<Position> {
        let resp = match self
            .signed_request(reqwest::Method::GET, "/api/v1/positions", "")
            .await
        {
            Some(r) => r,
            None => return Vec::new(),
        };

        let mut positions = Vec::new();
        for entry in resp.as_array().cloned().unwrap_or_default() {
            let size = parse_f64(&entry["positionAmt"]).unwrap_or(0.0);
            if size.abs() < 1e-12 {
                continue;
            }
            let symbol = entry["symbol"]
                .as_str()
                .unwrap_or_default()
                .trim_end_matches("-PERP")
                .to_string();

            positions.push(Position {
                symbol,
                direction: if size > 0.0 {
                    Direction::Long
                } else {
                    Direction::Short
                },
                size: size.abs(),
                entry_price: parse_f64(&entry["entryPrice"]).unwrap_or(0.0),
                mark_price: parse_f64(&entry["markPrice"]).unwrap_or(0.0),
                liquidation_price: parse_f64(&entry["liquidationPrice"]),
                unrealized_pnl: parse_f64(&entry["unRealizedProfit"]).unwrap_or(0.0),
                leverage: parse_f64(&entry["leverage"]).unwrap_or(1.0) as u32,
                margin_used: parse_f64(&entry["isolatedMargin"]).unwrap_or(0.0),
            });
        }
        positions
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        let canonical = symbol.to_uppercase().replace("-PERP", "");
        self.get_positions()
            .await
            .into_iter()
            .find(|p| p.symbol == canonical)
    }

    async fn get_market_price(&self, symbol: &str) -> Option<f64> {
        self.get_market_data(symbol).await.map(|md| md.mid_price())
    }

    async fn get_market_data(&self, symbol: &str) -> Option<MarketData> {
        let formatted = self.format_symbol(symbol);
        let query = format!("symbol={formatted}");
        let ticker = self.public_get("/api/v1/ticker", &query).await?;

        let bid = parse_f64(&ticker["bidPrice"])?;
        let ask = parse_f64(&ticker["askPrice"])?;

        Some(MarketData {
            symbol: formatted,
            bid,
            ask,
            last: parse_f64(&ticker["lastPrice"]).unwrap_or((bid + ask) / 2.0),
            mark_price: parse_f64(&ticker["markPrice"]).unwrap_or((bid + ask) / 2.0),
            funding_rate: parse_f64(&ticker["fundingRate"]),
            timestamp: Utc::now(),
        })
    }

    async fn get_candles(&self, symbol: &str, count: usize) -> Vec<Candle> {
        let formatted = self.format_symbol(symbol);
        let query = format!("symbol={formatted}&interval=1m&limit={}", count.min(1000));
        let resp = match self.public_get("/api/v1/klines", &query).await {
            Some(r) => r,
            None => return Vec::new(),
        };

        // Kline rows: [openTime, open, high, low, close, volume, closeTime].
        let mut candles = Vec::new();
        for row in resp.as_array().cloned().unwrap_or_default() {
            let arr = match row.as_array() {
                Some(a) if a.len() >= 5 => a.clone(),
                _ => continue,
            };
            let ts_ms = arr[0].as_i64().unwrap_or(0);
            let (open, high, low, close) = match (
                parse_f64(&arr[1]),
                parse_f64(&arr[2]),
                parse_f64(&arr[3]),
                parse_f64(&arr[4]),
            ) {
                (Some(o), Some(h), Some(l), Some(c)) => (o, h, l, c),
                _ => continue,
            };
            let ts = match Utc.timestamp_millis_opt(ts_ms).single() {
                Some(t) => t,
                None => continue,
            };
            candles.push(Candle {
                ts,
                open,
                high,
                low,
                close,
            });
        }
        candles.sort_by_key(|c| c.ts);
        candles
    }

    async fn place_order(&self, params: &OrderParams) -> OrderResult {
        let symbol = self.format_symbol(&params.symbol);
        let qty = self.format_quantity(&symbol, params.size);
        if qty <= 0.0 {
            return OrderResult::failure("order size rounds to zero");
        }

        let side = match params.side {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        };
        let order_type = match params.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };

        let mut query = format!("symbol={symbol}&side={side}&type={order_type}&quantity={qty}");
        if let Some(price) = params.price {
            let px = self.format_price(&symbol, price);
            query.push_str(&format!("&price={px}&timeInForce=GTC"));
        }
        if params.reduce_only {
            query.push_str("&reduceOnly=true");
        }

        debug!(symbol = %symbol, side, qty, "aster placing order");
        match self
            .signed_request(reqwest::Method::POST, "/api/v1/order", &query)
            .await
        {
            Some(resp) => {
                if let Some(err) = resp["msg"].as_str().filter(|m| !m.is_empty()) {
                    return OrderResult::failure(err.to_string());
                }
                let order_id = resp["orderId"].as_u64().map(|o| o.to_string());
                let fill_price = parse_f64(&resp["avgPrice"]).or(params.price);
                let fill_size = parse_f64(&resp["executedQty"]).unwrap_or(qty);
                OrderResult {
                    success: true,
                    order_id,
                    fill_price,
                    fill_size: Some(fill_size),
                    status: "filled".to_string(),
                    slippage_actual: None,
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            None => OrderResult::failure("aster order rejected"),
        }
    }

    async fn close_position(&self, symbol: &str, size: Option<f64>) -> OrderResult {
        let position = match self.get_position(symbol).await {
            Some(p) => p,
            None => return OrderResult::failure(format!("no open position in {symbol}")),
        };

        let close_size = size.unwrap_or(position.size).min(position.size);
        let side = match position.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };

        let mut params = OrderParams::market(symbol, side, close_size);
        params.reduce_only = true;
        self.place_order(&params).await
    }

    async fn get_order_status(&self, order_id: &str) -> Option<serde_json::Value> {
        let query = format!("orderId={order_id}");
        self.signed_request(reqwest::Method::GET, "/api/v1/order", &query)
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> bool {
        let query = format!("symbol={}&orderId={order_id}", self.format_symbol(symbol));
        self.signed_request(reqwest::Method::DELETE, "/api/v1/order", &query)
            .await
            .is_some()
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        let query = match symbol {
            Some(s) => format!("symbol={}", self.format_symbol(s)),
            None => String::new(),
        };
        match self
            .signed_request(reqwest::Method::DELETE, "/api/v1/allOpenOrders", &query)
            .await
        {
            Some(resp) => resp["cancelled"].as_u64().unwrap_or(0) as usize,
            None => 0,
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> bool {
        let query = format!(
            "symbol={}&leverage={leverage}",
            self.format_symbol(symbol)
        );
        self.signed_request(reqwest::Method::POST, "/api/v1/leverage", &query)
            .await
            .is_some()
    }

    async fn set_stop_loss(&self, symbol: &str, stop_price: f64, size: Option<f64>) -> OrderResult {
        let position = match self.get_position(symbol).await {
            Some(p) => p,
            None => return OrderResult::failure(format!("no open position in {symbol}")),
        };
        let formatted = self.format_symbol(symbol);
        let px = self.format_price(&formatted, stop_price);
        let qty = self.format_quantity(&formatted, size.unwrap_or(position.size));
        let side = match position.direction {
            Direction::Long => "SELL",
            Direction::Short => "BUY",
        };

        let query = format!(
            "symbol={formatted}&side={side}&type=STOP_MARKET&stopPrice={px}&quantity={qty}&reduceOnly=true"
        );
        match self
            .signed_request(reqwest::Method::POST, "/api/v1/order", &query)
            .await
        {
            Some(resp) => {
                let mut r = OrderResult::skipped();
                r.status = "pending".to_string();
                r.order_id = resp["orderId"].as_u64().map(|o| o.to_string());
                r
            }
            None => OrderResult::failure("aster stop order rejected"),
        }
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        take_profit_price: f64,
        size: Option<f64>,
    ) -> OrderResult {
        let position = match self.get_position(symbol).await {
            Some(p) => p,
            None => return OrderResult::failure(format!("no open position in {symbol}")),
        };
        let formatted = self.format_symbol(symbol);
        let px = self.format_price(&formatted, take_profit_price);
        let qty = self.format_quantity(&formatted, size.unwrap_or(position.size));
        let side = match position.direction {
            Direction::Long => "SELL",
            Direction::Short => "BUY",
        };

        let query = format!(
            "symbol={formatted}&side={side}&type=TAKE_PROFIT_MARKET&stopPrice={px}&quantity={qty}&reduceOnly=true"
        );
        match self
            .signed_request(reqwest::Method::POST, "/api/v1/order", &query)
            .await
        {
            Some(resp) => {
                let mut r = OrderResult::skipped();
                r.status = "pending".to_string();
                r.order_id = resp["orderId"].as_u64().map(|o| o.to_string());
                r
            }
            None => OrderResult::failure("aster take-profit order rejected"),
        }
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> usize {
        let formatted = self.format_symbol(symbol);
        let query = format!("symbol={formatted}");
        let open = match self
            .signed_request(reqwest::Method::GET, "/api/v1/openOrders", &query)
            .await
        {
            Some(o) => o,
            None => return 0,
        };

        let mut cancelled = 0;
        for order in open.as_array().cloned().unwrap_or_default() {
            let order_type = order["type"].as_str().unwrap_or_default();
            if order_type != "STOP_MARKET" && order_type != "TAKE_PROFIT_MARKET" {
                continue;
            }
            if let Some(oid) = order["orderId"].as_u64() {
                if self.cancel_order(&formatted, &oid.to_string()).await {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    fn format_symbol(&self, symbol: &str) -> String {
        let upper = symbol.to_uppercase();
        if upper.ends_with("-PERP") {
            upper
        } else {
            format!("{upper}-PERP")
        }
    }

    fn format_quantity(&self, symbol: &str, quantity: f64) -> f64 {
        let decimals = self
            .state
            .read()
            .precision
            .get(&self.format_symbol(symbol))
            .map(|p| p.size_decimals)
            .unwrap_or(3);
        round_to_decimals(quantity, decimals)
    }

    fn format_price(&self, symbol: &str, price: f64) -> f64 {
        let decimals = self
            .state
            .read()
            .precision
            .get(&self.format_symbol(symbol))
            .map(|p| p.price_decimals)
            .unwrap_or(1);
        round_to_decimals(price, decimals)
    }
}

impl std::fmt::Debug for AsterAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsterAdapter")
            .field("api_key", &"<redacted>")
            .field("testnet", &self.config.testnet)
            .field("connected", &self.is_connected())
            .finish()
    }
}
