// =============================================================================
// Exchange Manager — registry of connected venue adapters
// =============================================================================
//
// Routes order/market-data requests to the right adapter, aggregates account
// state across venues (USD-normalized), and runs the rate-limited health
// check that probes and reconnects venues. Connection status and balance
// observations persist best-effort on every pass.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use super::{Balance, ExchangeAdapter, ExchangeType, MarketData, OrderParams, OrderResult, Position};
use crate::db::Store;
use crate::normalizer::normalize_balance;

/// Balance aggregated across all connected venues, USD-normalized, with the
/// per-venue originals preserved for audit.
#[derive(Debug, Clone)]
pub struct AggregatedBalance {
    pub total_equity: f64,
    pub available_balance: f64,
    pub margin_used: f64,
    pub maintenance_margin: f64,
    pub unrealized_pnl: f64,
    pub per_exchange: HashMap<String, Balance>,
    pub timestamp: DateTime<Utc>,
}

/// Positions aggregated across all connected venues.
#[derive(Debug, Clone)]
pub struct AggregatedPositions {
    pub positions: Vec<Position>,
    pub per_exchange: HashMap<String, Vec<Position>>,
    pub total_notional: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-venue outcome of one health-check pass.
#[derive(Debug, Clone, Default)]
pub struct VenueHealth {
    pub connected: bool,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Result of one full health-check pass.
#[derive(Debug, Clone, Default)]
pub struct HealthReport {
    pub venues: HashMap<String, VenueHealth>,
    pub reconnected: Vec<String>,
}

pub struct ExchangeManager {
    exchanges: RwLock<HashMap<ExchangeType, Arc<dyn ExchangeAdapter>>>,
    default_exchange: RwLock<Option<ExchangeType>>,
    store: Option<Arc<Store>>,
    /// Inter-probe delay per venue during health checks, milliseconds.
    rate_limit_delays_ms: HashMap<String, u64>,
    testnet: bool,
}

impl ExchangeManager {
    pub fn new(
        store: Option<Arc<Store>>,
        rate_limit_delays_ms: HashMap<String, u64>,
        testnet: bool,
    ) -> Self {
        Self {
            exchanges: RwLock::new(HashMap::new()),
            default_exchange: RwLock::new(None),
            store,
            rate_limit_delays_ms,
            testnet,
        }
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Register an adapter and attempt its initial connect. The first venue
    /// to register becomes the default unless `set_as_default` overrides.
    pub async fn connect_exchange(
        &self,
        adapter: Arc<dyn ExchangeAdapter>,
        set_as_default: bool,
    ) -> bool {
        let ex_type = adapter.exchange_type();

        if !adapter.is_configured() {
            warn!(exchange = %ex_type, "exchange not configured (missing credentials)");
            self.persist_connection(ex_type, false, Some("Not configured"));
            return false;
        }

        let connected = adapter.connect().await;
        if connected {
            self.exchanges.write().insert(ex_type, adapter);
            let mut default = self.default_exchange.write();
            if set_as_default || default.is_none() {
                *default = Some(ex_type);
            }
            info!(exchange = %ex_type, "exchange connected");
            self.persist_connection(ex_type, true, None);
        } else {
            warn!(exchange = %ex_type, "exchange connection failed");
            self.persist_connection(ex_type, false, Some("Connection failed"));
        }
        connected
    }

    pub async fn disconnect_exchange(&self, exchange_type: ExchangeType) {
        let removed = self.exchanges.write().remove(&exchange_type);
        if let Some(adapter) = removed {
            adapter.disconnect().await;

            let mut default = self.default_exchange.write();
            if *default == Some(exchange_type) {
                *default = self.exchanges.read().keys().next().copied();
            }
            drop(default);

            self.persist_connection(exchange_type, false, Some("Disconnected"));
            info!(exchange = %exchange_type, "exchange disconnected");
        }
    }

    pub async fn disconnect_all(&self) {
        let types: Vec<ExchangeType> = self.exchanges.read().keys().copied().collect();
        for ex_type in types {
            self.disconnect_exchange(ex_type).await;
        }
    }

    pub fn get_exchange(&self, exchange_type: ExchangeType) -> Option<Arc<dyn ExchangeAdapter>> {
        self.exchanges.read().get(&exchange_type).cloned()
    }

    pub fn connected_exchanges(&self) -> Vec<ExchangeType> {
        self.exchanges
            .read()
            .iter()
            .filter(|(_, adapter)| adapter.is_connected())
            .map(|(ex_type, _)| *ex_type)
            .collect()
    }

    pub fn default_exchange(&self) -> Option<ExchangeType> {
        *self.default_exchange.read()
    }

    fn snapshot(&self) -> Vec<(ExchangeType, Arc<dyn ExchangeAdapter>)> {
        self.exchanges
            .read()
            .iter()
            .map(|(ex_type, adapter)| (*ex_type, Arc::clone(adapter)))
            .collect()
    }

    fn resolve(&self, exchange_type: Option<ExchangeType>) -> Option<Arc<dyn ExchangeAdapter>> {
        let target = exchange_type.or_else(|| self.default_exchange())?;
        self.get_exchange(target).filter(|a| a.is_connected())
    }

    // -------------------------------------------------------------------------
    // Account state
    // -------------------------------------------------------------------------

    pub async fn get_balance(&self, exchange_type: ExchangeType) -> Option<Balance> {
        let adapter = self.resolve(Some(exchange_type))?;
        adapter.get_balance().await
    }

    /// USD-normalized totals across every connected venue. Per-venue
    /// originals ride along for audit.
    pub async fn get_aggregated_balance(&self) -> Option<AggregatedBalance> {
        let adapters = self.snapshot();
        if adapters.is_empty() {
            return None;
        }

        let mut per_exchange = HashMap::new();
        let mut total_equity = 0.0;
        let mut available_balance = 0.0;
        let mut margin_used = 0.0;
        let mut maintenance_margin = 0.0;
        let mut unrealized_pnl = 0.0;

        for (ex_type, adapter) in adapters {
            if !adapter.is_connected() {
                continue;
            }
            let Some(balance) = adapter.get_balance().await else {
                continue;
            };

            let normalized = normalize_balance(&balance);
            total_equity += normalized.total_equity_usd;
            available_balance += normalized.available_balance_usd;
            margin_used += normalized.margin_used_usd;
            maintenance_margin += normalized.maintenance_margin_usd;
            unrealized_pnl += normalized.unrealized_pnl_usd;

            per_exchange.insert(ex_type.as_str().to_string(), balance);
        }

        if per_exchange.is_empty() {
            return None;
        }

        Some(AggregatedBalance {
            total_equity,
            available_balance,
            margin_used,
            maintenance_margin,
            unrealized_pnl,
            per_exchange,
            timestamp: Utc::now(),
        })
    }

    pub async fn get_positions(&self, exchange_type: ExchangeType) -> Vec<Position> {
        match self.resolve(Some(exchange_type)) {
            Some(adapter) => adapter.get_positions().await,
            None => Vec::new(),
        }
    }

    pub async fn get_all_positions(&self) -> AggregatedPositions {
        let adapters = self.snapshot();
        let mut all_positions = Vec::new();
        let mut per_exchange = HashMap::new();
        let mut total_notional = 0.0;

        for (ex_type, adapter) in adapters {
            if !adapter.is_connected() {
                continue;
            }
            let positions = adapter.get_positions().await;
            total_notional += positions.iter().map(Position::notional_value).sum::<f64>();
            all_positions.extend(positions.iter().cloned());
            per_exchange.insert(ex_type.as_str().to_string(), positions);
        }

        AggregatedPositions {
            positions: all_positions,
            per_exchange,
            total_notional,
            timestamp: Utc::now(),
        }
    }

    pub async fn get_position(
        &self,
        symbol: &str,
        exchange_type: Option<ExchangeType>,
    ) -> Option<Position> {
        if let Some(ex_type) = exchange_type {
            return self.resolve(Some(ex_type))?.get_position(symbol).await;
        }

        for (_, adapter) in self.snapshot() {
            if !adapter.is_connected() {
                continue;
            }
            if let Some(position) = adapter.get_position(symbol).await {
                return Some(position);
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // Market data
    // -------------------------------------------------------------------------

    pub async fn get_market_price(
        &self,
        symbol: &str,
        exchange_type: Option<ExchangeType>,
    ) -> Option<f64> {
        let adapter = self.resolve(exchange_type)?;
        adapter.get_market_price(symbol).await
    }

    pub async fn get_market_data(
        &self,
        symbol: &str,
        exchange_type: Option<ExchangeType>,
    ) -> Option<MarketData> {
        let adapter = self.resolve(exchange_type)?;
        adapter.get_market_data(symbol).await
    }

    // -------------------------------------------------------------------------
    // Execution routing
    // -------------------------------------------------------------------------

    pub async fn open_position(
        &self,
        exchange_type: Option<ExchangeType>,
        params: &OrderParams,
    ) -> OrderResult {
        match self.resolve(exchange_type) {
            Some(adapter) => adapter.open_position(params).await,
            None => OrderResult::failure("no connected exchange for order routing"),
        }
    }

    pub async fn close_position(
        &self,
        symbol: &str,
        exchange_type: Option<ExchangeType>,
        size: Option<f64>,
    ) -> OrderResult {
        match self.resolve(exchange_type) {
            Some(adapter) => adapter.close_position(symbol, size).await,
            None => OrderResult::failure("no connected exchange for close"),
        }
    }

    // -------------------------------------------------------------------------
    // Health check
    // -------------------------------------------------------------------------

    /// Probe every registered venue with a lightweight balance fetch,
    /// reconnecting any that are down or stale. Probes are spaced by the
    /// per-venue rate-limit delay.
    pub async fn health_check(&self) -> HealthReport {
        let mut report = HealthReport::default();
        let adapters = self.snapshot();

        for (i, (ex_type, adapter)) in adapters.iter().enumerate() {
            if i > 0 {
                let delay_ms = self
                    .rate_limit_delays_ms
                    .get(ex_type.as_str())
                    .copied()
                    .unwrap_or(500);
                if delay_ms > 0 {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }

            let mut status = VenueHealth {
                connected: adapter.is_connected(),
                healthy: false,
                error: None,
            };

            if !status.connected {
                info!(exchange = %ex_type, "health check: disconnected, attempting reconnect");
                if adapter.connect().await {
                    status.connected = true;
                    report.reconnected.push(ex_type.as_str().to_string());
                    info!(exchange = %ex_type, "health check: reconnected");
                } else {
                    status.error = Some("Reconnection failed".to_string());
                }
            }

            if status.connected {
                match adapter.get_balance().await {
                    Some(balance) => {
                        status.healthy = true;
                        if let Some(store) = &self.store {
                            if let Err(e) = store.record_balance(ex_type.as_str(), &balance) {
                                warn!(error = %e, "failed to persist balance");
                            }
                        }
                    }
                    None => {
                        status.error = Some("Balance probe failed".to_string());
                        warn!(exchange = %ex_type, "health check: probe failed, reconnecting");

                        // Stale connection: tear down and retry once.
                        adapter.disconnect().await;
                        if adapter.connect().await {
                            report.reconnected.push(ex_type.as_str().to_string());
                            status.connected = true;
                            status.healthy = true;
                            status.error = None;
                            info!(exchange = %ex_type, "health check: reconnected after stale connection");
                        } else {
                            status.connected = false;
                            status.error = Some("Reconnection failed".to_string());
                        }
                    }
                }
            }

            self.persist_connection(*ex_type, status.healthy, status.error.as_deref());
            report.venues.insert(ex_type.as_str().to_string(), status);
        }

        report
    }

    fn persist_connection(&self, exchange_type: ExchangeType, connected: bool, error: Option<&str>) {
        if let Some(store) = &self.store {
            if let Err(e) =
                store.record_connection(exchange_type.as_str(), self.testnet, connected, error)
            {
                warn!(error = %e, "failed to persist connection status");
            }
        }
    }
}

impl std::fmt::Debug for ExchangeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeManager")
            .field("connected", &self.connected_exchanges())
            .field("default", &self.default_exchange())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::mock::MockExchange;
    use std::sync::atomic::Ordering;

    fn manager() -> ExchangeManager {
        ExchangeManager::new(
            Some(Arc::new(Store::open_in_memory().unwrap())),
            HashMap::from([
                ("hyperliquid".to_string(), 0),
                ("bybit".to_string(), 0),
            ]),
            true,
        )
    }

    #[tokio::test]
    async fn first_registered_exchange_becomes_default() {
        let mgr = manager();
        let hl = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        let bybit = Arc::new(MockExchange::new(ExchangeType::Bybit));

        assert!(mgr.connect_exchange(hl, false).await);
        assert!(mgr.connect_exchange(bybit, false).await);

        assert_eq!(mgr.default_exchange(), Some(ExchangeType::Hyperliquid));
        let mut connected = mgr.connected_exchanges();
        connected.sort_by_key(|e| e.as_str());
        assert_eq!(connected, vec![ExchangeType::Bybit, ExchangeType::Hyperliquid]);
    }

    #[tokio::test]
    async fn aggregated_balance_sums_usd_normalized_venues() {
        let mgr = manager();
        let hl = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        hl.set_equity(60_000.0);
        let bybit = Arc::new(MockExchange::new(ExchangeType::Bybit));
        bybit.set_equity(40_000.0);

        mgr.connect_exchange(hl, false).await;
        mgr.connect_exchange(bybit, false).await;

        let agg = mgr.get_aggregated_balance().await.unwrap();
        assert!((agg.total_equity - 100_000.0).abs() < 1e-9);
        assert_eq!(agg.per_exchange.len(), 2);
        assert!(agg.per_exchange.contains_key("hyperliquid"));
        assert!(agg.per_exchange.contains_key("bybit"));
    }

    #[tokio::test]
    async fn health_check_reconnects_failed_probe() {
        // Nonzero per-venue delays so the inter-probe spacing is observable.
        let mgr = ExchangeManager::new(
            Some(Arc::new(Store::open_in_memory().unwrap())),
            HashMap::from([
                ("hyperliquid".to_string(), 30),
                ("bybit".to_string(), 30),
            ]),
            true,
        );
        let hl = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        let bybit = Arc::new(MockExchange::new(ExchangeType::Bybit));
        mgr.connect_exchange(Arc::clone(&hl) as Arc<dyn ExchangeAdapter>, false).await;
        mgr.connect_exchange(Arc::clone(&bybit) as Arc<dyn ExchangeAdapter>, false).await;

        // B's probe fails; connect() clears the fault.
        bybit.fail_balance.store(true, Ordering::SeqCst);
        let before_attempts = bybit.connect_attempts.load(Ordering::SeqCst);

        let started = std::time::Instant::now();
        let report = mgr.health_check().await;
        // The second probe waited its venue's rate-limit delay.
        assert!(started.elapsed() >= std::time::Duration::from_millis(30));

        assert!(report.reconnected.contains(&"bybit".to_string()));
        let bybit_status = &report.venues["bybit"];
        assert!(bybit_status.healthy);
        assert!(bybit_status.connected);
        assert!(report.venues["hyperliquid"].healthy);
        assert!(bybit.connect_attempts.load(Ordering::SeqCst) > before_attempts);
    }

    #[tokio::test]
    async fn orders_route_to_named_venue() {
        let mgr = manager();
        let hl = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        let bybit = Arc::new(MockExchange::new(ExchangeType::Bybit));
        bybit.set_price("BTC", 100_000.0);
        mgr.connect_exchange(Arc::clone(&hl) as Arc<dyn ExchangeAdapter>, false).await;
        mgr.connect_exchange(Arc::clone(&bybit) as Arc<dyn ExchangeAdapter>, false).await;

        let params = crate::exchanges::OrderParams::market(
            "BTC",
            crate::exchanges::OrderSide::Buy,
            0.1,
        );
        let result = mgr.open_position(Some(ExchangeType::Bybit), &params).await;
        assert!(result.success);
        assert_eq!(bybit.placed_orders.read().len(), 1);
        assert!(hl.placed_orders.read().is_empty());
    }

    #[tokio::test]
    async fn missing_venue_fails_closed() {
        let mgr = manager();
        let params = crate::exchanges::OrderParams::market(
            "BTC",
            crate::exchanges::OrderSide::Buy,
            0.1,
        );
        let result = mgr.open_position(Some(ExchangeType::Aster), &params).await;
        assert!(!result.success);
    }
}
