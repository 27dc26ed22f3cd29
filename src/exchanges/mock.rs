// =============================================================================
// Scriptable fake adapter for manager / executor / stop-manager tests
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{
    Balance, Candle, ExchangeAdapter, ExchangeType, MarketData, OrderParams, OrderResult,
    Position,
};

pub struct MockExchange {
    exchange_type: ExchangeType,
    native_stops: bool,
    pub connected: AtomicBool,
    /// When true, get_balance returns None (simulates a failing probe).
    pub fail_balance: AtomicBool,
    pub connect_attempts: AtomicUsize,
    pub balance: RwLock<Option<Balance>>,
    pub positions: RwLock<Vec<Position>>,
    pub prices: RwLock<HashMap<String, f64>>,
    pub funding_rates: RwLock<HashMap<String, f64>>,
    pub candles: RwLock<Vec<Candle>>,
    /// Every order routed through this adapter, in arrival order.
    pub placed_orders: RwLock<Vec<OrderParams>>,
    pub closed_symbols: RwLock<Vec<String>>,
    pub cancelled_stop_symbols: RwLock<Vec<String>>,
    pub bracket_calls: RwLock<Vec<(String, Option<f64>, Option<f64>)>>,
}

impl MockExchange {
    pub fn new(exchange_type: ExchangeType) -> Self {
        Self {
            exchange_type,
            native_stops: true,
            connected: AtomicBool::new(true),
            fail_balance: AtomicBool::new(false),
            connect_attempts: AtomicUsize::new(0),
            balance: RwLock::new(Some(default_balance())),
            positions: RwLock::new(Vec::new()),
            prices: RwLock::new(HashMap::new()),
            funding_rates: RwLock::new(HashMap::new()),
            candles: RwLock::new(Vec::new()),
            placed_orders: RwLock::new(Vec::new()),
            closed_symbols: RwLock::new(Vec::new()),
            cancelled_stop_symbols: RwLock::new(Vec::new()),
            bracket_calls: RwLock::new(Vec::new()),
        }
    }

    pub fn without_native_stops(exchange_type: ExchangeType) -> Self {
        let mut mock = Self::new(exchange_type);
        mock.native_stops = false;
        mock
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().insert(symbol.to_uppercase(), price);
    }

    pub fn set_equity(&self, equity: f64) {
        *self.balance.write() = Some(Balance {
            total_equity: equity,
            ..default_balance()
        });
    }
}

fn default_balance() -> Balance {
    Balance {
        total_equity: 100_000.0,
        available_balance: 90_000.0,
        margin_used: 10_000.0,
        maintenance_margin: 1_000.0,
        unrealized_pnl: 0.0,
        currency: "USD".to_string(),
        timestamp: Utc::now(),
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    fn exchange_type(&self) -> ExchangeType {
        self.exchange_type
    }

    fn is_configured(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> bool {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        self.fail_balance.store(false, Ordering::SeqCst);
        true
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn get_balance(&self) -> Option<Balance> {
        if self.fail_balance.load(Ordering::SeqCst) {
            return None;
        }
        self.balance.read().clone()
    }

    async fn get_positions(&self) -> Vec<Position> {
        self.positions.read().clone()
    }

    async fn get_position(&self, symbol: &str) -> Option<Position> {
        let upper = symbol.to_uppercase();
        self.positions
            .read()
            .iter()
            .find(|p| p.symbol == upper)
            .cloned()
    }

    async fn get_market_price(&self, symbol: &str) -> Option<f64> {
        self.prices.read().get(&symbol.to_uppercase()).copied()
    }

    async fn get_market_data(&self, symbol: &str) -> Option<MarketData> {
        let upper = symbol.to_uppercase();
        let mid = *self.prices.read().get(&upper)?;
        Some(MarketData {
            symbol: upper.clone(),
            bid: mid * 0.9999,
            ask: mid * 1.0001,
            last: mid,
            mark_price: mid,
            funding_rate: self.funding_rates.read().get(&upper).copied(),
            timestamp: Utc::now(),
        })
    }

    async fn get_candles(&self, _symbol: &str, count: usize) -> Vec<Candle> {
        let candles = self.candles.read().clone();
        let start = candles.len().saturating_sub(count);
        candles[start..].to_vec()
    }

    async fn place_order(&self, params: &OrderParams) -> OrderResult {
        self.placed_orders.write().push(params.clone());
        let price = params
            .price
            .or_else(|| self.prices.read().get(&params.symbol.to_uppercase()).copied())
            .unwrap_or(0.0);
        OrderResult::filled(Some(format!("mock-{}", params.symbol)), price, params.size)
    }

    async fn close_position(&self, symbol: &str, size: Option<f64>) -> OrderResult {
        let upper = symbol.to_uppercase();
        self.closed_symbols.write().push(upper.clone());
        let price = self.prices.read().get(&upper).copied().unwrap_or(0.0);
        let closed = {
            let mut positions = self.positions.write();
            match positions.iter().position(|p| p.symbol == upper) {
                Some(idx) => {
                    let existing = positions[idx].clone();
                    let close_size = size.unwrap_or(existing.size).min(existing.size);
                    if close_size >= existing.size {
                        positions.remove(idx);
                    } else {
                        positions[idx].size -= close_size;
                    }
                    Some(close_size)
                }
                None => None,
            }
        };
        match closed {
            Some(sz) => OrderResult::filled(Some(format!("mock-close-{upper}")), price, sz),
            None => OrderResult::failure(format!("no open position in {upper}")),
        }
    }

    async fn get_order_status(&self, _order_id: &str) -> Option<serde_json::Value> {
        None
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> bool {
        true
    }

    async fn cancel_all_orders(&self, _symbol: Option<&str>) -> usize {
        0
    }

    async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> bool {
        true
    }

    async fn set_stop_loss(&self, symbol: &str, stop_price: f64, _size: Option<f64>) -> OrderResult {
        self.bracket_calls
            .write()
            .push((symbol.to_uppercase(), Some(stop_price), None));
        OrderResult::skipped()
    }

    async fn set_take_profit(
        &self,
        symbol: &str,
        take_profit_price: f64,
        _size: Option<f64>,
    ) -> OrderResult {
        self.bracket_calls
            .write()
            .push((symbol.to_uppercase(), None, Some(take_profit_price)));
        OrderResult::skipped()
    }

    async fn set_stop_loss_take_profit(
        &self,
        symbol: &str,
        stop_price: Option<f64>,
        take_profit_price: Option<f64>,
        _size: Option<f64>,
    ) -> (OrderResult, OrderResult) {
        self.bracket_calls
            .write()
            .push((symbol.to_uppercase(), stop_price, take_profit_price));
        (OrderResult::skipped(), OrderResult::skipped())
    }

    async fn cancel_stop_orders(&self, symbol: &str) -> usize {
        self.cancelled_stop_symbols
            .write()
            .push(symbol.to_uppercase());
        1
    }

    fn supports_native_stops(&self) -> bool {
        self.native_stops
    }

    fn format_symbol(&self, symbol: &str) -> String {
        symbol.to_uppercase()
    }

    fn format_quantity(&self, _symbol: &str, quantity: f64) -> f64 {
        quantity
    }

    fn format_price(&self, _symbol: &str, price: f64) -> f64 {
        price
    }
}
