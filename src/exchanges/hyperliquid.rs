// =============================================================================
// Hyperliquid adapter — DEX perpetuals over the /info and /exchange REST API
// =============================================================================
//
// Symbols are bare uppercase asset codes (BTC, ETH). Prices are rounded to
// 5 significant figures, sizes to the per-asset szDecimals loaded from the
// venue metadata at connect time.
//
// SECURITY: the wallet private key is resolved from the environment by name
// and never logged or serialized.
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

const MAINNET_URL: &str = "https://api.hyperliquid.xyz";
const TESTNET_URL: &str = "https://api.hyperliquid-testnet.xyz";

/// Price precision rule on Hyperliquid: 5 significant figures.
const PRICE_SIG_FIGS: i32 = 5;

struct Inner {
    connected: bool,
    precision: PrecisionTable,
}

pub struct HyperliquidAdapter {
    config: ExchangeConfig,
    client: reqwest::Client,
    state: RwLock<Inner>,
}

impl HyperliquidAdapter {
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

    /// POST to the /info endpoint. Returns None on any transport or status
    /// failure; callers degrade to typed outcomes.
    async fn info(&self, payload: Value) -> Option<Value> {
        let url = format!("{}/info", self.base_url());
        let resp = match self.client.post(&url).json(&payload).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "hyperliquid /info request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "hyperliquid /info returned error status");
            return None;
        }
        resp.json::<Value>().await.ok()
    }

    /// Signature over the serialized action, keyed by the wallet secret.
    /// The venue-specific wallet scheme lives entirely behind this seam.
    fn sign_action(&self, action: &Value, nonce: u64) -> Option<String> {
        let key = self.config.private_key()?;
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).expect("HMAC accepts any key size");
        mac.update(action.to_string().as_bytes());
        mac.update(&nonce.to_be_bytes());
        Some(hex::encode(mac.finalize().into_bytes()))
    }

    /// POST a signed action to the /exchange endpoint.
    async fn exchange_action(&self, action: Value) -> OrderResult {
        let nonce = Utc::now().timestamp_millis() as u64;
        let signature = match self.sign_action(&action, nonce) {
            Some(sig) => sig,
            None => return OrderResult::failure("hyperliquid wallet key not configured"),
        };

        let url = format!("{}/exchange", self.base_url());
        let body = json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
        });

        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => return OrderResult::failure(format!("hyperliquid /exchange failed: {e}")),
        };
        let status = resp.status();
        let value: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => return OrderResult::failure(format!("hyperliquid response parse: {e}")),
        };

        if !status.is_success() || value["status"].as_str() == Some("err") {
            return OrderResult::failure(format!("hyperliquid rejected action: {value}"));
        }

        Self::parse_order_statuses(&value)
    }

    /// Extract fill details from an /exchange order response.
    fn parse_order_statuses(value: &Value) -> OrderResult {
        let statuses = value["response"]["data"]["statuses"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        for status in &statuses {
            if let Some(filled) = status.get("filled") {
                let px = parse_f64(&filled["avgPx"]).unwrap_or(0.0);
                let sz = parse_f64(&filled["totalSz"]).unwrap_or(0.0);
                let oid = filled["oid"].as_u64().map(|o| o.to_string());
                return OrderResult::filled(oid, px, sz);
            }
            if let Some(resting) = status.get("resting") {
                let oid = resting["oid"].as_u64().map(|o| o.to_string());
                let mut result = OrderResult::skipped();
                result.order_id = oid;
                result.status = "pending".to_string();
                return result;
            }
            if let Some(err) = status.get("error").and_then(Value::as_str) {
                return OrderResult::failure(err.to_string());
            }
        }

        OrderResult::failure(format!("unrecognized order response: {value}"))
    }

    async fn load_metadata(&self) -> bool {
        let meta = match self.info(json!({"type": "meta"})).await {
            Some(m) => m,
            None => return false,
        };

        let universe = meta["universe"].as_array().cloned().unwrap_or_default();
        if universe.is_empty() {
            return false;
        }

        let mut precision = HashMap::new();
        for entry in &universe {
            let name = entry["name"].as_str().unwrap_or_default().to_string();
            let sz_decimals = entry["szDecimals"].as_u64().unwrap_or(3) as u32;
            if !name.is_empty() {
                precision.insert(
                    name,
                    SymbolPrecision {
                        size_decimals: sz_decimals,
                        price_decimals: 0,
                        min_size: 10f64.powi(-(sz_decimals as i32)),
                    },
                );
            }
        }

        debug!(assets = precision.len(), "hyperliquid metadata loaded");
        self.state.write().precision = precision;
        true
    }

    fn account_address(&self) -> Option<String> {
        self.config.account_address()
    }
}

/// Round to 5 significant figures (venue price rule).
pub fn round_to_sig_figs(price: f64, sig_figs: i32) -> f64 {
    if price <= 0.0 || !price.is_finite() {
        return price;
    }
    let magnitude = price.abs().log10().floor() as i32;
    let factor = 10f64.powi(sig_figs - magnitude - 1);
    (price * factor).round() / factor
}

fn parse_f64(value: &Value) -> Option<f64> {
    if let Some(s) = value.as_str() {
        s.parse().ok()
    } else {
        value.as_f64()
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn exchange_type(&self) -> ExchangeType {
        ExchangeType::Hyperliquid
    }

    fn is_configured(&self) -> bool {
        // Reads only need the account address; trading needs the wallet key.
        self.config.account_address().is_some() || self.config.private_key().is_some()
    }

    fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    async fn connect(&self) -> bool {
        if !self.load_metadata().await {
            warn!("hyperliquid connect failed: metadata unavailable");
            return false;
        }
        self.state.write().connected = true;
        debug!(testnet = self.config.testnet, "hyperliquid connected");
        true
    }

    async fn disconnect(&self) {
        self.state.write().connected = false;
    }

    async fn get_balance(&self) -> Option<Balance> {
        let address = self.account_address()?;
        let state = self
            .info(json!({"type": "clearinghouseState", "user": address}))
            .await?;

        let margin = &state["marginSummary"];
        let account_value = parse_f64(&margin["accountValue"])?;
        let margin_used = parse_f64(&margin["totalMarginUsed"]).unwrap_or(0.0);
        let maintenance = parse_f64(&state["crossMaintenanceMarginUsed"]).unwrap_or(0.0);
        let withdrawable = parse_f64(&state["withdrawable"]).unwrap_or(0.0);

        let unrealized: f64 = state["assetPositions"]
            .as_array()
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|ap| parse_f64(&ap["position"]["unrealizedPnl"]))
                    .sum()
            })
            .unwrap_or(0.0);

        Some(Balance {
            total_equity: account_value,
            available_balance: withdrawable,
            margin_used,
            maintenance_margin: maintenance,
            unrealized_pnl: unrealized,
            currency: "USD".to_string(),
            timestamp: Utc::now(),
        })
    }

    async fn get_positions(&self) -> Vec<Position> {
        let address = match self.account_address() {
            Some(a) => a,
            None => return Vec::new(),
        };
        let state = match self
            .info(json!({"type": "clearinghouseState", "user": address}))
            .await
        {
            Some(s) => s,
            None => return Vec::new(),
        };

        let mut positions = Vec::new();
        for ap in state["assetPositions"].as_array().cloned().unwrap_or_default() {
            let pos = &ap["position"];
            let szi = parse_f64(&pos["szi"]).unwrap_or(0.0);
            if szi.abs() < 1e-12 {
                continue;
            }
            let entry_px = parse_f64(&pos["entryPx"]).unwrap_or(0.0);
            let position_value = parse_f64(&pos["positionValue"]).unwrap_or(0.0);
            let mark_px = if szi.abs() > 0.0 && position_value > 0.0 {
                position_value / szi.abs()
            } else {
                entry_px
            };

            positions.push(Position {
                symbol: pos["coin"].as_str().unwrap_or_default().to_string(),
                direction: if szi > 0.0 {
                    Direction::Long
                } else {
                    Direction::Short
                },
                size: szi.abs(),
                entry_price: entry_px,
                mark_price: mark_px,
                liquidation_price: parse_f64(&pos["liquidationPx"]),
                unrealized_pnl: parse_f64(&pos["unrealizedPnl"]).unwrap_or(0.0),
                leverage: pos["leverage"]["value"].as_u64().unwrap_or(1) as u32,
                margin_used: parse_f64(&pos["marginUsed"]).unwrap_or(0.0),
            });
        }
        positions
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        let target = self.format_symbol(symbol);
        self.get_positions()
            .await
            .into_iter()
            .find(|p| p.symbol == target)
    }

    async fn get_market_price(&self, symbol: &str) -> Option<f64> {
        let mids = self.info(json!({"type": "allMids"})).await?;
        let target = self.format_symbol(symbol);
        parse_f64(&mids[&target]).filter(|px| *px > 0.0)
    }

    async fn get_market_data(&self, symbol: &str) -> Option<MarketData> {
        let target = self.format_symbol(symbol);
        let book = self
            .info(json!({"type": "l2Book", "coin": target}))
            .await?;

        let levels = book["levels"].as_array()?;
        if levels.len() < 2 {
            return None;
        }
        let best_bid = parse_f64(&levels[0].as_array()?.first()?["px"])?;
        let best_ask = parse_f64(&levels[1].as_array()?.first()?["px"])?;

        // Funding and mark come from the asset contexts.
        let (mark, funding) = match self.info(json!({"type": "metaAndAssetCtxs"})).await {
            Some(ctx) => {
                let universe = ctx[0]["universe"].as_array().cloned().unwrap_or_default();
                let ctxs = ctx[1].as_array().cloned().unwrap_or_default();
                let idx = universe
                    .iter()
                    .position(|u| u["name"].as_str() == Some(target.as_str()));
                match idx.and_then(|i| ctxs.get(i).cloned()) {
                    Some(asset_ctx) => (
                        parse_f64(&asset_ctx["markPx"]),
                        parse_f64(&asset_ctx["funding"]),
                    ),
                    None => (None, None),
                }
            }
            None => (None, None),
        };

        let mid = (best_bid + best_ask) / 2.0;
        Some(MarketData {
            symbol: target,
            bid: best_bid,
            ask: best_ask,
            last: mid,
            mark_price: mark.unwrap_or(mid),
            funding_rate: funding,
            timestamp: Utc::now(),
        })
    }

    async fn get_candles(&self, symbol: &str, count: usize) -> Vec<Candle> {
        let target = self.format_symbol(symbol);
        let end = Utc::now().timestamp_millis();
        let start = end - (count as i64) * 60_000;

        let resp = match self
            .info(json!({
                "type": "candleSnapshot",
                "req": {"coin": target, "interval": "1m", "startTime": start, "endTime": end},
            }))
            .await
        {
            Some(r) => r,
            None => return Vec::new(),
        };

        let mut candles = Vec::new();
        for entry in resp.as_array().cloned().unwrap_or_default() {
            let ts_ms = entry["t"].as_i64().unwrap_or(0);
            let (open, high, low, close) = match (
                parse_f64(&entry["o"]),
                parse_f64(&entry["h"]),
                parse_f64(&entry["l"]),
                parse_f64(&entry["c"]),
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
        let size = self.format_quantity(&symbol, params.size);
        if size <= 0.0 {
            return OrderResult::failure("order size rounds to zero");
        }

        // Market orders are expressed as aggressive IOC limits at a price
        // band around the mid, per venue convention.
        let limit_px = match params.order_type {
            OrderType::Limit => match params.price {
                Some(px) => self.format_price(&symbol, px),
                None => return OrderResult::failure("limit order requires a price"),
            },
            OrderType::Market => {
                let mid = match self.get_market_price(&params.symbol).await {
                    Some(px) => px,
                    None => return OrderResult::failure("no mid price for market order"),
                };
                let band = params.slippage_pct / 100.0;
                let px = match params.side {
                    OrderSide::Buy => mid * (1.0 + band),
                    OrderSide::Sell => mid * (1.0 - band),
                };
                self.format_price(&symbol, px)
            }
        };

        let order_type = match params.order_type {
            OrderType::Market => json!({"limit": {"tif": "Ioc"}}),
            OrderType::Limit => json!({"limit": {"tif": "Gtc"}}),
        };

        let action = json!({
            "type": "order",
            "orders": [{
                "a": symbol,
                "b": params.side == OrderSide::Buy,
                "p": limit_px.to_string(),
                "s": size.to_string(),
                "r": params.reduce_only,
                "t": order_type,
            }],
            "grouping": "na",
        });

        debug!(symbol = %symbol, side = %params.side, size, limit_px, "hyperliquid placing order");
        self.exchange_action(action).await
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
        params.slippage_pct = self.config.default_slippage_pct;
        self.place_order(&params).await
    }

    async fn get_order_status(&self, order_id: &str) -> Option<serde_json::Value> {
        let address = self.account_address()?;
        let oid: u64 = order_id.parse().ok()?;
        self.info(json!({"type": "orderStatus", "user": address, "oid": oid}))
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> bool {
        let oid: u64 = match order_id.parse() {
            Ok(o) => o,
            Err(_) => return false,
        };
        let action = json!({
            "type": "cancel",
            "cancels": [{"a": self.format_symbol(symbol), "o": oid}],
        });
        self.exchange_action(action).await.success
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize {
        let address = match self.account_address() {
            Some(a) => a,
            None => return 0,
        };
        let open = match self.info(json!({"type": "openOrders", "user": address})).await {
            Some(o) => o,
            None => return 0,
        };

        let target = symbol.map(|s| self.format_symbol(s));
        let mut cancelled = 0;
        for order in open.as_array().cloned().unwrap_or_default() {
            let coin = order["coin"].as_str().unwrap_or_default();
            if let Some(t) = &target {
                if coin != t {
                    continue;
                }
            }
            if let Some(oid) = order["oid"].as_u64() {
                if self.cancel_order(coin, &oid.to_string()).await {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> bool {
        let action = json!({
            "type": "updateLeverage",
            "asset": self.format_symbol(symbol),
            "isCross": true,
            "leverage": leverage,
        });
        self.exchange_action(action).await.success
    }

    async fn set_stop_loss(&self, symbol: &str, stop_price: f64, size: Option<f64>) -> OrderResult {
        let position = match self.get_position(symbol).await {
            Some(p) => p,
            None => return OrderResult::failure(format!("no open position in {symbol}")),
        };
        let formatted = self.format_symbol(symbol);
        let trigger_px = self.format_price(&formatted, stop_price);
        let order_size = self.format_quantity(&formatted, size.unwrap_or(position.size));
        let is_buy = position.direction == Direction::Short;

        let action = json!({
            "type": "order",
            "orders": [{
                "a": formatted,
                "b": is_buy,
                "p": trigger_px.to_string(),
                "s": order_size.to_string(),
                "r": true,
                "t": {"trigger": {"isMarket": true, "triggerPx": trigger_px.to_string(), "tpsl": "sl"}},
            }],
            "grouping": "positionTpsl",
        });
        self.exchange_action(action).await
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
        let trigger_px = self.format_price(&formatted, take_profit_price);
        let order_size = self.format_quantity(&formatted, size.unwrap_or(position.size));
        let is_buy = position.direction == Direction::Short;

        let action = json!({
            "type": "order",
            "orders": [{
                "a": formatted,
                "b": is_buy,
                "p": trigger_px.to_string(),
                "s": order_size.to_string(),
                "r": true,
                "t": {"trigger": {"isMarket": true, "triggerPx": trigger_px.to_string(), "tpsl": "tp"}},
            }],
            "grouping": "positionTpsl",
        });
        self.exchange_action(action).await
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> usize {
        let address = match self.account_address() {
            Some(a) => a,
            None => return 0,
        };
        let open = match self.info(json!({"type": "openOrders", "user": address})).await {
            Some(o) => o,
            None => return 0,
        };

        let target = self.format_symbol(symbol);
        let mut cancelled = 0;
        for order in open.as_array().cloned().unwrap_or_default() {
            if order["coin"].as_str() != Some(target.as_str()) {
                continue;
            }
            // Trigger orders carry a triggerPx; plain resting orders do not.
            if order.get("triggerPx").is_none() && order["orderType"].as_str() != Some("trigger") {
                continue;
            }
            if let Some(oid) = order["oid"].as_u64() {
                if self.cancel_order(&target, &oid.to_string()).await {
                    cancelled += 1;
                }
            }
        }
        cancelled
    }

    fn format_symbol(&self, symbol: &str) -> String {
        symbol.to_uppercase()
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

    fn format_price(&self, _symbol: &str, price: f64) -> f64 {
        round_to_sig_figs(price, PRICE_SIG_FIGS)
    }
}

impl std::fmt::Debug for HyperliquidAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperliquidAdapter")
            .field("testnet", &self.config.testnet)
            .field("connected", &self.is_connected())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_sig_fig_rounding() {
        assert!((round_to_sig_figs(100_234.56, 5) - 100_230.0).abs() < 1e-6);
        assert!((round_to_sig_figs(0.001234567, 5) - 0.0012346).abs() < 1e-12);
        assert!((round_to_sig_figs(99_999.4, 5) - 99_999.0).abs() < 1e-6);
        assert!((round_to_sig_figs(1.0, 5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sig_fig_rounding_ignores_non_positive() {
        assert_eq!(round_to_sig_figs(0.0, 5), 0.0);
        assert_eq!(round_to_sig_figs(-5.0, 5), -5.0);
    }

    #[test]
    fn symbol_format_is_bare_uppercase() {
        let adapter = HyperliquidAdapter::new(ExchangeConfig::new(ExchangeType::Hyperliquid, true));
        assert_eq!(adapter.format_symbol("btc"), "BTC");
        assert_eq!(adapter.format_symbol("ETH"), "ETH");
    }

    #[test]
    fn quantity_defaults_to_three_decimals_without_metadata() {
        let adapter = HyperliquidAdapter::new(ExchangeConfig::new(ExchangeType::Hyperliquid, true));
        assert!((adapter.format_quantity("BTC", 0.12349) - 0.123).abs() < 1e-12);
    }

    #[test]
    fn parse_order_statuses_filled() {
        let value = serde_json::json!({
            "status": "ok",
            "response": {"data": {"statuses": [
                {"filled": {"avgPx": "100012.0", "totalSz": "0.5", "oid": 77}}
            ]}}
        });
        let result = HyperliquidAdapter::parse_order_statuses(&value);
        assert!(result.success);
        assert_eq!(result.fill_price, Some(100_012.0));
        assert_eq!(result.fill_size, Some(0.5));
        assert_eq!(result.order_id.as_deref(), Some("77"));
    }

    #[test]
    fn parse_order_statuses_error() {
        let value = serde_json::json!({
            "status": "ok",
            "response": {"data": {"statuses": [{"error": "Insufficient margin"}]}}
        });
        let result = HyperliquidAdapter::parse_order_statuses(&value);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Insufficient margin"));
    }
}
