// =============================================================================
// Bybit adapter — USDT-linear perpetuals over the v5 REST API
// =============================================================================
//
// Signed requests use HMAC-SHA256 over timestamp + api_key + recv_window +
// payload with the X-BAPI-* header scheme. A recvWindow of 5 000 ms tolerates
// minor clock drift between the bot and Bybit servers.
//
// Symbols are {ASSET}USDT. Price and size precision come from the per-symbol
// tick/lot tables loaded from instruments-info at connect time.
//
// SECURITY: the secret key is never logged or serialized.
// =============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{
    round_to_decimals, Balance, Candle, ExchangeAdapter, ExchangeConfig, ExchangeType, MarketData,
    OrderParams, OrderResult, OrderSide, OrderType, Position, PrecisionTable, SymbolPrecision,
};
use crate::types::Direction;

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: &str = "5000";

struct Inner {
    connected: bool,
    precision: PrecisionTable,
}

pub struct BybitAdapter {
    config: ExchangeConfig,
    client: reqwest::Client,
    state: RwLock<Inner>,
}

impl BybitAdapter {
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

    /// Produce the v5 signature: HMAC-SHA256(ts + key + recvWindow + payload).
    fn sign(&self, secret: &str, timestamp: &str, api_key: &str, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(timestamp.as_bytes());
        mac.update(api_key.as_bytes());
        mac.update(RECV_WINDOW.as_bytes());
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signed GET. `query` must already be the canonical query string.
    async fn signed_get(&self, path: &str, query: &str) -> Option<Value> {
        let (api_key, secret) = match (self.config.api_key(), self.config.api_secret()) {
            (Some(k), Some(s)) => (k, s),
            _ => return None,
        };

        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&secret, &timestamp, &api_key, query);
        let url = format!("{}{}?{}", self.base_url(), path, query);

        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .send()
            .await
            .ok()?;

        self.parse_v5_response(resp).await
    }

    /// Signed POST with a JSON body.
    async fn signed_post(&self, path: &str, body: &Value) -> Option<Value> {
        let (api_key, secret) = match (self.config.api_key(), self.config.api_secret()) {
            (Some(k), Some(s)) => (k, s),
            _ => return None,
        };

        let body_str = body.to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = self.sign(&secret, &timestamp, &api_key, &body_str);
        let url = format!("{}{}", self.base_url(), path);

        let resp = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &api_key)
            .header("X-BAPI-TIMESTAMP", &timestamp)
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW)
            .header("X-BAPI-SIGN", &signature)
            .header("Content-Type", "application/json")
            .body(body_str)
            .send()
            .await
            .ok()?;

        self.parse_v5_response(resp).await
    }

    /// Public (unsigned) GET.
    async fn public_get(&self, path: &str, query: &str) -> Option<Value> {
        let url = format!("{}{}?{}", self.base_url(), path, query);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, path, "bybit public request failed");
                return None;
            }
        };
        self.parse_v5_response(resp).await
    }

    /// Every v5 response carries retCode; nonzero means rejection.
    async fn parse_v5_response(&self, resp: reqwest::Response) -> Option<Value> {
        let status = resp.status();
        let value: Value = resp.json().await.ok()?;
        if !status.is_success() {
            warn!(status = %status, body = %value, "bybit returned error status");
            return None;
        }
        if value["retCode"].as_i64() != Some(0) {
            warn!(
                ret_code = value["retCode"].as_i64().unwrap_or(-1),
                ret_msg = value["retMsg"].as_str().unwrap_or(""),
                "bybit request rejected"
            );
            return None;
        }
        Some(value)
    }

    async fn load_symbol_info(&self, symbols: &[String]) -> bool {
        let mut precision = HashMap::new();

        for asset in symbols {
            let symbol = format!("{}USDT", asset.to_uppercase());
            let query = format!("category=linear&symbol={symbol}");
            let resp = match self.public_get("/v5/market/instruments-info", &query).await {
                Some(r) => r,
                None => continue,
            };

            let list = resp["result"]["list"].as_array().cloned().unwrap_or_default();
            let Some(info) = list.first() else { continue };

            let qty_step = info["lotSizeFilter"]["qtyStep"].as_str().unwrap_or("0.001");
            let tick_size = info["priceFilter"]["tickSize"].as_str().unwrap_or("0.1");
            let min_qty = info["lotSizeFilter"]["minOrderQty"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.001);

            precision.insert(
                symbol,
                SymbolPrecision {
                    size_decimals: decimals_from_step(qty_step),
                    price_decimals: decimals_from_step(tick_size),
                    min_size: min_qty,
                },
            );
        }

        if precision.is_empty() {
            return false;
        }

        debug!(symbols = precision.len(), "bybit symbol info loaded");
        self.state.write().precision = precision;
        true
    }

    fn order_result_from_create(&self, resp: Option<Value>, params: &OrderParams) -> OrderResult {
        match resp {
            Some(value) => {
                let order_id = value["result"]["orderId"].as_str().map(String::from);
                OrderResult {
                    success: true,
                    order_id,
                    // Market fills report through order status; price/size here
                    // reflect the request.
                    fill_price: params.price,
                    fill_size: Some(params.size),
                    status: "filled".to_string(),
                    slippage_actual: None,
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            None => OrderResult::failure("bybit order create rejected"),
        }
    }
}

/// Decimal places implied by a step string like "0.001".
fn decimals_from_step(step: &str) -> u32 {
    match step.split('.').nth(1) {
        Some(frac) => frac.trim_end_matches('0').len() as u32,
        None => 0,
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
impl ExchangeAdapter for BybitAdapter {
    fn exchange_type(&self) -> ExchangeType {
        ExchangeType::Bybit
    }

    fn is_configured(&self) -> bool {
        self.config.api_key().is_some() && self.config.api_secret().is_some()
    }

    fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    async fn connect(&self) -> bool {
        // BTC and ETH are always loaded; other symbols resolve lazily to the
        // default precision until requested.
        if !self.load_symbol_info(&["BTC".to_string(), "ETH".to_string()]).await {
            warn!("bybit connect failed: instruments-info unavailable");
            return false;
        }
        self.state.write().connected = true;
        debug!(testnet = self.config.testnet, "bybit connected");
        true
    }

    async fn disconnect(&self) {
        self.state.write().connected = false;
    }

    async fn get_balance(&self) -> Option<Balance> {
        let resp = self
            .signed_get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;

        let account = resp["result"]["list"].as_array()?.first()?.clone();
        let total_equity = parse_f64(&account["totalEquity"])?;
        let available = parse_f64(&account["totalAvailableBalance"]).unwrap_or(0.0);
        let margin_used = parse_f64(&account["totalInitialMargin"]).unwrap_or(0.0);
        let maintenance = parse_f64(&account["totalMaintenanceMargin"]).unwrap_or(0.0);
        let unrealized = parse_f64(&account["totalPerpUPL"]).unwrap_or(0.0);

        Some(Balance {
            total_equity,
            available_balance: available,
            margin_used,
            maintenance_margin: maintenance,
            unrealized_pnl: unrealized,
            currency: "USDT".to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn get_positions(&self) -> Vec<Position> {
        let resp = match self
            .signed_get("/v5/position/list", "category=linear&settleCoin=USDT")
            .await
        {
            Some(r) => r,
            None => return Vec::new(),
        };

        let mut positions = Vec::new();
        for entry in resp["result"]["list"].as_array().cloned().unwrap_or_default() {
            let size = parse_f64(&entry["size"]).unwrap_or(0.0);
            if size.abs() < 1e-12 {
                continue;
            }
            let symbol = entry["symbol"]
                .as_str()
                .unwrap_or_default()
                .trim_end_matches("USDT")
                .to_string();
            let direction = match entry["side"].as_str() {
                Some("Buy") => Direction::Long,
                _ => Direction::Short,
            };

            positions.push(Position {
                symbol,
                direction,
                size: size.abs(),
                entry_price: parse_f64(&entry["avgPrice"]).unwrap_or(0.0),
                mark_price: parse_f64(&entry["markPrice"]).unwrap_or(0.0),
                liquidation_price: parse_f64(&entry["liqPrice"]),
                unrealized_pnl: parse_f64(&entry["unrealisedPnl"]).unwrap_or(0.0),
                leverage: parse_f64(&entry["leverage"]).unwrap_or(1.0) as u32,
                margin_used: parse_f64(&entry["positionIM"]).unwrap_or(0.0),
            });
        }
        positions
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        let canonical = symbol.to_uppercase().replace("USDT", "");
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
        let query = format!("category=linear&symbol={formatted}");
        let resp = self.public_get("/v5/market/tickers", &query).await?;

        let ticker = resp["result"]["list"].as_array()?.first()?.clone();
        let bid = parse_f64(&ticker["bid1Price"])?;
        let ask = parse_f64(&ticker["ask1Price"])?;

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
        let query = format!(
            "category=linear&symbol={formatted}&interval=1&limit={}",
            count.min(1000)
        );
        let resp = match self.public_get("/v5/market/kline", &query).await {
            Some(r) => r,
            None => return Vec::new(),
        };

        // Kline rows: [startTime, open, high, low, close, volume, turnover],
        // newest first.
        let mut candles = Vec::new();
        for row in resp["result"]["list"].as_array().cloned().unwrap_or_default() {
            let arr = match row.as_array() {
                Some(a) if a.len() >= 5 => a.clone(),
                _ => continue,
            };
            let ts_ms: i64 = match arr[0].as_str().and_then(|s| s.parse().ok()) {
                Some(t) => t,
                None => continue,
            };
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
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        };

        let mut body = json!({
            "category": "linear",
            "symbol": symbol,
            "side": side,
            "orderType": match params.order_type {
                OrderType::Market => "Market",
                OrderType::Limit => "Limit",
            },
            "qty": qty.to_string(),
        });

        if let Some(price) = params.price {
            body["price"] = json!(self.format_price(&symbol, price).to_string());
        }
        if params.reduce_only {
            body["reduceOnly"] = json!(true);
        }
        if let Some(sl) = params.stop_loss {
            body["stopLoss"] = json!(self.format_price(&symbol, sl).to_string());
        }
        if let Some(tp) = params.take_profit {
            body["takeProfit"] = json!(self.format_price(&symbol, tp).to_string());
        }

        debug!(symbol = %symbol, side, qty, "bybit placing order");
        let resp = self.signed_post("/v5/order/create", &body).await;
        self.order_result_from_create(resp, params)
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
        let query = format!("category=linear&orderId={order_id}");
        let resp = self.signed_get("/v5/order/realtime", &query).await?;
        resp["result"]["list"].as_array()?.first().cloned()
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> bool {
        let body = json!({
            "category": "linear",
            "symbol": self.format_symbol(symbol),
            "orderId": order_id,
        });
        self.signed_post("/v5/order/cancel", &body).await.is_some()
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        let mut body = json!({"category": "linear"});
        match symbol {
            Some(s) => body["symbol"] = json!(self.format_symbol(s)),
            None => body["settleCoin"] = json!("USDT"),
        }

        match self.signed_post("/v5/order/cancel-all", &body).await {
            Some(resp) => resp["result"]["list"]
                .as_array()
                .map(|l| l.len())
                .unwrap_or(0),
            None => 0,
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> bool {
        let body = json!({
            "category": "linear",
            "symbol": self.format_symbol(symbol),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        self.signed_post("/v5/position/set-leverage", &body).await.is_some()
    }

    async fn set_stop_loss(&self, symbol: &str, stop_price: f64, _size: Option<f64>) -> OrderResult {
        let formatted = self.format_symbol(symbol);
        let body = json!({
            "category": "linear",
            "symbol": formatted,
            "stopLoss": self.format_price(&formatted, stop_price).to_string(),
            "positionIdx": 0,
        });
        match self.signed_post("/v5/position/trading-stop", &body).await {
            Some(_) => {
                let mut r = OrderResult::skipped();
                r.status = "pending".to_string();
                r
            }
            None => OrderResult::failure("bybit trading-stop rejected"),
        }
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        take_profit_price: f64,
        _size: Option<f64>,
    ) -> OrderResult {
        let formatted = self.format_symbol(symbol);
        let body = json!({
            "category": "linear",
            "symbol": formatted,
            "takeProfit": self.format_price(&formatted, take_profit_price).to_string(),
            "positionIdx": 0,
        });
        match self.signed_post("/v5/position/trading-stop", &body).await {
            Some(_) => {
                let mut r = OrderResult::skipped();
                r.status = "pending".to_string();
                r
            }
            None => OrderResult::failure("bybit trading-stop rejected"),
        }
    }

    /// Bybit's trading-stop endpoint takes both legs in one call, so the
    /// bracket really is atomic here.
    async fn set_stop_loss_take_profit(
        &self,
        symbol: &str,
        stop_price: Option<f64>,
        take_profit_price: Option<f64>,
        _size: Option<f64>,
    ) -> (OrderResult, OrderResult) {
        if stop_price.is_none() && take_profit_price.is_none() {
            return (OrderResult::skipped(), OrderResult::skipped());
        }

        let formatted = self.format_symbol(symbol);
        let mut body = json!({
            "category": "linear",
            "symbol": formatted,
            "positionIdx": 0,
        });
        if let Some(sl) = stop_price {
            body["stopLoss"] = json!(self.format_price(&formatted, sl).to_string());
        }
        if let Some(tp) = take_profit_price {
            body["takeProfit"] = json!(self.format_price(&formatted, tp).to_string());
        }

        match self.signed_post("/v5/position/trading-stop", &body).await {
            Some(_) => {
                let mut sl = OrderResult::skipped();
                sl.status = "pending".to_string();
                let tp = sl.clone();
                (sl, tp)
            }
            None => {
                let failed = OrderResult::failure("bybit trading-stop rejected");
                (failed.clone(), failed)
            }
        }
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> usize {
        // Clearing the trading-stop levels cancels the venue-side bracket.
        let formatted = self.format_symbol(symbol);
        let body = json!({
            "category": "linear",
            "symbol": formatted,
            "stopLoss": "0",
            "takeProfit": "0",
            "positionIdx": 0,
        });
        match self.signed_post("/v5/position/trading-stop", &body).await {
            Some(_) => 2,
            None => 0,
        }
    }

    fn format_symbol(&self, symbol: &str) -> String {
        let upper = symbol.to_uppercase();
        if upper.ends_with("USDT") {
            upper
        } else {
            format!("{upper}USDT")
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

impl std::fmt::Debug for BybitAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitAdapter")
            .field("api_key", &"<redacted>")
            .field("testnet", &self.config.testnet)
            .field("connected", &self.is_connected())
            .finish()
    }
}
