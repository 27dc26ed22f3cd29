// =============================================================================
// Exchange abstraction — one contract over every connected venue
// =============================================================================
//
// Fail semantics: no adapter method panics or propagates transport errors
// across this boundary. Reads return Option/Vec, order operations return a
// structured OrderResult whose `success` flag and `error` field carry the
// outcome.
// =============================================================================

pub mod aster;
pub mod bybit;
pub mod hyperliquid;
pub mod manager;

#[cfg(test)]
pub mod mock;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Direction;

// ---------------------------------------------------------------------------
// Venue identity
// ---------------------------------------------------------------------------

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Hyperliquid,
    Aster,
    Bybit,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hyperliquid => "hyperliquid",
            Self::Aster => "aster",
            Self::Bybit => "bybit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hyperliquid" => Some(Self::Hyperliquid),
            "aster" => Some(Self::Aster),
            "bybit" => Some(Self::Bybit),
            _ => None,
        }
    }
}

impl Default for ExchangeType {
    fn default() -> Self {
        Self::Hyperliquid
    }
}

impl std::fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

/// Fee structure for a venue, in basis points (1 bps = 0.01%).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeSchedule {
    pub maker_fee_bps: f64,
    pub taker_fee_bps: f64,
}

impl FeeSchedule {
    /// Round-trip fee cost in bps. Market orders are taker on both legs.
    pub fn round_trip_cost_bps(&self) -> f64 {
        self.taker_fee_bps * 2.0
    }

    /// Round-trip cost as a fraction of notional (0.001 = 10 bps).
    pub fn round_trip_cost_pct(&self) -> f64 {
        self.round_trip_cost_bps() / 10_000.0
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            maker_fee_bps: 2.5,
            taker_fee_bps: 5.0,
        }
    }
}

/// Static fee table used when a live tier lookup is unavailable.
pub fn static_fee_schedule(exchange: ExchangeType) -> FeeSchedule {
    match exchange {
        ExchangeType::Hyperliquid => FeeSchedule {
            maker_fee_bps: 2.5,
            taker_fee_bps: 5.0,
        },
        ExchangeType::Aster => FeeSchedule {
            maker_fee_bps: 2.5,
            taker_fee_bps: 5.0,
        },
        // VIP0 rates
        ExchangeType::Bybit => FeeSchedule {
            maker_fee_bps: 10.0,
            taker_fee_bps: 6.0,
        },
    }
}

// ---------------------------------------------------------------------------
// Adapter configuration
// ---------------------------------------------------------------------------

/// Connection configuration for an adapter.
///
/// Credential fields hold environment variable NAMES, never values. The
/// adapter resolves them at connect time and the secrets live only inside its
/// HTTP client.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub exchange_type: ExchangeType,
    pub testnet: bool,
    pub private_key_env: String,
    pub api_key_env: String,
    pub api_secret_env: String,
    pub account_address_env: String,
    pub default_leverage: u32,
    pub default_slippage_pct: f64,
}

impl ExchangeConfig {
    pub fn new(exchange_type: ExchangeType, testnet: bool) -> Self {
        let prefix = match exchange_type {
            ExchangeType::Hyperliquid => "HL",
            ExchangeType::Aster => "ASTER",
            ExchangeType::Bybit => "BYBIT",
        };
        Self {
            exchange_type,
            testnet,
            private_key_env: format!("{prefix}_PRIVATE_KEY"),
            api_key_env: format!("{prefix}_API_KEY"),
            api_secret_env: format!("{prefix}_API_SECRET"),
            account_address_env: format!("{prefix}_ACCOUNT_ADDRESS"),
            default_leverage: 1,
            default_slippage_pct: 0.5,
        }
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|v| !v.is_empty())
    }

    pub fn api_secret(&self) -> Option<String> {
        std::env::var(&self.api_secret_env).ok().filter(|v| !v.is_empty())
    }

    pub fn private_key(&self) -> Option<String> {
        std::env::var(&self.private_key_env).ok().filter(|v| !v.is_empty())
    }

    pub fn account_address(&self) -> Option<String> {
        std::env::var(&self.account_address_env)
            .ok()
            .filter(|v| !v.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn from_direction(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::Buy,
            Direction::Short => Self::Sell,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// Parameters for placing an order. `symbol` is the canonical asset code;
/// adapters apply their own formatting.
#[derive(Debug, Clone)]
pub struct OrderParams {
    pub symbol: String,
    pub side: OrderSide,
    /// Size in base currency units.
    pub size: f64,
    pub order_type: OrderType,
    /// Required for limit orders.
    pub price: Option<f64>,
    pub reduce_only: bool,
    pub slippage_pct: f64,
    pub leverage: Option<u32>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl OrderParams {
    pub fn market(symbol: impl Into<String>, side: OrderSide, size: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            size,
            order_type: OrderType::Market,
            price: None,
            reduce_only: false,
            slippage_pct: 0.5,
            leverage: None,
            stop_loss: None,
            take_profit: None,
        }
    }
}

/// Structured result of an order operation. Never a panic, never an Err.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub fill_price: Option<f64>,
    pub fill_size: Option<f64>,
    /// filled, partial, pending, cancelled, rejected, skipped
    pub status: String,
    pub slippage_actual: Option<f64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    pub fn filled(order_id: Option<String>, fill_price: f64, fill_size: f64) -> Self {
        Self {
            success: true,
            order_id,
            fill_price: Some(fill_price),
            fill_size: Some(fill_size),
            status: "filled".to_string(),
            slippage_actual: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            order_id: None,
            fill_price: None,
            fill_size: None,
            status: "rejected".to_string(),
            slippage_actual: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn skipped() -> Self {
        Self {
            success: true,
            order_id: None,
            fill_price: None,
            fill_size: None,
            status: "skipped".to_string(),
            slippage_actual: None,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

/// Account balance snapshot from one venue, in that venue's quote currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub total_equity: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    pub maintenance_margin: f64,
    pub unrealized_pnl: f64,
    /// Quote currency of the figures above (USD for HL, USDT for Bybit).
    pub currency: String,
    pub timestamp: DateTime<Utc>,
}

/// A live position on a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Canonical asset code (BTC, ETH).
    pub symbol: String,
    pub direction: Direction,
    /// Always positive; sign is carried by `direction`.
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub liquidation_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub leverage: u32,
    pub margin_used: f64,
}

impl Position {
    pub fn notional_value(&self) -> f64 {
        self.size * self.mark_price
    }
}

/// Market price snapshot for one symbol on one venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub mark_price: f64,
    pub funding_rate: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl MarketData {
    pub fn mid_price(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid_price();
        if mid <= 0.0 {
            return 0.0;
        }
        (self.ask - self.bid) / mid * 10_000.0
    }
}

/// One OHLC bar, venue-native resolution (1 minute for all adapters here).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// Per-symbol precision metadata loaded at connect time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolPrecision {
    /// Decimal places for order size.
    pub size_decimals: u32,
    /// Decimal places for price (ignored by venues with sig-fig rules).
    pub price_decimals: u32,
    pub min_size: f64,
}

pub type PrecisionTable = HashMap<String, SymbolPrecision>;

// ---------------------------------------------------------------------------
// The adapter contract
// ---------------------------------------------------------------------------

/// Uniform contract every venue adapter implements.
///
/// Adapters own their interior state (connected flag, precision tables,
/// HTTP client) behind locks, so all methods take `&self` and the manager can
/// share adapters freely across tasks.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_type(&self) -> ExchangeType;

    /// True when the credentials this adapter needs are present in the
    /// environment.
    fn is_configured(&self) -> bool;

    fn is_connected(&self) -> bool;

    /// Connect and load instrument metadata. Returns false on failure.
    async fn connect(&self) -> bool;

    async fn disconnect(&self);

    // -- account ------------------------------------------------------------

    async fn get_balance(&self) -> Option<Balance>;

    async fn get_positions(&self) -> Vec<Position>;

    async fn get_position(&self, symbol: &str) -> Option<Position>;

    // -- market data ---------------------------------------------------------

    async fn get_market_price(&self, symbol: &str) -> Option<f64>;

    async fn get_market_data(&self, symbol: &str) -> Option<MarketData>;

    /// 1-minute OHLC bars, oldest first.
    async fn get_candles(&self, symbol: &str, count: usize) -> Vec<Candle>;

    // -- trading -------------------------------------------------------------

    async fn place_order(&self, params: &OrderParams) -> OrderResult;

    async fn open_position(&self, params: &OrderParams) -> OrderResult {
        self.place_order(params).await
    }

    /// Close a position partially (`size`) or fully (`None`).
    async fn close_position(&self, symbol: &str, size: Option<f64>) -> OrderResult;

    async fn get_order_status(&self, order_id: &str) -> Option<serde_json::Value>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> bool;

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> usize;

    // -- risk / stops --------------------------------------------------------

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> bool;

    async fn set_stop_loss(&self, symbol: &str, stop_price: f64, size: Option<f64>)
        -> OrderResult;

    async fn set_take_profit(
        &self,
        symbol: &str,
        take_profit_price: f64,
        size: Option<f64>,
    ) -> OrderResult;

    /// Set both legs as a bracket. The default body calls the two halves;
    /// venues with an atomic bracket endpoint override it.
    async fn set_stop_loss_take_profit(
        &self,
        symbol: &str,
        stop_price: Option<f64>,
        take_profit_price: Option<f64>,
        size: Option<f64>,
    ) -> (OrderResult, OrderResult) {
        let sl = match stop_price {
            Some(px) => self.set_stop_loss(symbol, px, size).await,
            None => OrderResult::skipped(),
        };
        let tp = match take_profit_price {
            Some(px) => self.set_take_profit(symbol, px, size).await,
            None => OrderResult::skipped(),
        };
        (sl, tp)
    }

    /// Cancel all resting stop/take-profit orders for a symbol. Returns the
    /// number cancelled.
    async fn cancel_stop_orders(&self, symbol: &str) -> usize;

    /// Whether this venue executes SL/TP server-side.
    fn supports_native_stops(&self) -> bool {
        true
    }

    // -- formatting ----------------------------------------------------------

    /// Canonical asset code to venue symbol (BTC -> BTC / BTCUSDT / BTC-PERP).
    fn format_symbol(&self, symbol: &str) -> String;

    /// Round a quantity to the venue's size precision.
    fn format_quantity(&self, symbol: &str, quantity: f64) -> f64;

    /// Round a price to the venue's tick or significant-figure rule.
    fn format_price(&self, symbol: &str, price: f64) -> f64;
}

/// Round to `decimals` decimal places.
pub(crate) fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
