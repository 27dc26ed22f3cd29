// =============================================================================
// Executor — one consensus signal in, one fail-closed execution attempt out
// =============================================================================
//
// Sequence (every step fails closed):
//   1.  read execution config; abort when disabled
//   2.  resolve the target venue (signal's choice, else the default)
//   3.  kill-switch short circuit
//   4.  account state with retry (3 attempts, 500ms -> 1s -> 2s backoff)
//   5.  governor position counts from that same snapshot
//   6.  exposure pre-check
//   7.  mid price; abort when unavailable
//   8.  position sizing (consensus Kelly when enabled)
//   9.  EV re-check with slippage at the actual sized notional
//   10. governor re-check with the proposed USD size
//   11. circuit breakers
//   12. dry-run simulation or live placement + stop registration
//   13. one execution-log row on every path
//
// The account snapshot from step 4 is reused through step 11; no re-fetch in
// between, so every gate sees the same state.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::consensus::{calculate_ev, CostBreakdown};
use crate::costs::fees::FeeProvider;
use crate::costs::funding::FundingProvider;
use crate::costs::hold_time::HoldTimeEstimator;
use crate::costs::slippage::SlippageProvider;
use crate::db::{ExecutionLogRow, Store};
use crate::exchanges::{
    manager::ExchangeManager, Balance, ExchangeType, OrderParams, OrderSide, Position,
};
use crate::kelly::{consensus_kelly_size, KellyResult, SizingMethod};
use crate::regime::RegimeDetector;
use crate::risk::RiskGovernor;
use crate::stops::StopManager;
use crate::types::Direction;

const ACCOUNT_STATE_MAX_RETRIES: u32 = 3;
const ACCOUNT_STATE_BASE_DELAY_MS: u64 = 500;

/// In-process counters for safety blocks, keyed by guard.
#[derive(Debug, Default)]
pub struct SafetyCounters {
    pub kill_switch: AtomicU64,
    pub account_state: AtomicU64,
    pub risk_governor: AtomicU64,
    pub circuit_breaker: AtomicU64,
}

impl SafetyCounters {
    fn bump(&self, guard: &str) {
        let counter = match guard {
            "kill_switch" => &self.kill_switch,
            "account_state" => &self.account_state,
            "risk_governor" => &self.risk_governor,
            _ => &self.circuit_breaker,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Filled,
    Rejected,
    Failed,
    Simulated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filled => "filled",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
            Self::Simulated => "simulated",
        }
    }
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exchange: ExchangeType,
    pub fill_price: Option<f64>,
    pub fill_size: Option<f64>,
    pub error_message: Option<String>,
    pub exposure_before: Option<f64>,
    pub exposure_after: Option<f64>,
    pub position_pct: Option<f64>,
    pub kelly: Option<KellyResult>,
}

impl ExecutionResult {
    fn rejected(exchange: ExchangeType, reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Rejected,
            exchange,
            fill_price: None,
            fill_size: None,
            error_message: Some(reason.into()),
            exposure_before: None,
            exposure_after: None,
            position_pct: None,
            kelly: None,
        }
    }
}

/// One snapshot of venue account state, fetched once and reused through
/// every gate.
struct AccountSnapshot {
    balance: Balance,
    positions: Vec<Position>,
}

impl AccountSnapshot {
    fn equity(&self) -> f64 {
        crate::normalizer::normalize_balance(&self.balance).total_equity_usd
    }

    fn total_exposure(&self) -> f64 {
        self.positions
            .iter()
            .map(Position::notional_value)
            .sum()
    }
}

pub struct Executor {
    config: Arc<RwLock<RuntimeConfig>>,
    manager: Arc<ExchangeManager>,
    governor: Arc<RiskGovernor>,
    stops: Arc<StopManager>,
    store: Option<Arc<Store>>,
    fees: Arc<FeeProvider>,
    slippage: Arc<SlippageProvider>,
    funding: Arc<FundingProvider>,
    hold_time: Arc<HoldTimeEstimator>,
    regime: Arc<RegimeDetector>,
    pub safety: Arc<SafetyCounters>,
}

#[allow(clippy::too_many_arguments)]
impl Executor {
    pub fn new(
        config: Arc<RwLock<RuntimeConfig>>,
        manager: Arc<ExchangeManager>,
        governor: Arc<RiskGovernor>,
        stops: Arc<StopManager>,
        store: Option<Arc<Store>>,
        fees: Arc<FeeProvider>,
        slippage: Arc<SlippageProvider>,
        funding: Arc<FundingProvider>,
        hold_time: Arc<HoldTimeEstimator>,
        regime: Arc<RegimeDetector>,
    ) -> Self {
        Self {
            config,
            manager,
            governor,
            stops,
            store,
            fees,
            slippage,
            funding,
            hold_time,
            regime,
            safety: Arc::new(SafetyCounters::default()),
        }
    }

    /// Main entry point: run one signal through validation, sizing, and
    /// placement. Returns None when execution is disabled outright.
    pub async fn maybe_execute_signal(
        &self,
        decision_id: &str,
        symbol: &str,
        direction: Direction,
        trigger_addresses: &[String],
        stop_distance_pct: f64,
        target_exchange: Option<ExchangeType>,
    ) -> Option<ExecutionResult> {
        // Step 1: master switch.
        let (enabled, real_execution, default_exchange, min_ev_r, kelly_config, max_exposure_pct) = {
            let config = self.config.read();
            (
                config.execution.enabled,
                config.execution.real_execution_enabled,
                config.execution.default_exchange,
                config.consensus.min_ev_r,
                config.kelly.clone(),
                config.risk.max_total_exposure_pct,
            )
        };
        if !enabled {
            return None;
        }

        // Step 2: venue resolution.
        let exchange = target_exchange.unwrap_or(default_exchange);
        let now = Utc::now();

        // Step 3: kill-switch short circuit.
        if self.governor.is_kill_switch_active(now) {
            self.safety.bump("kill_switch");
            let result = ExecutionResult::rejected(exchange, "Risk governor: kill switch active");
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        // Step 4: account snapshot with retry; fail-closed on exhaustion.
        let snapshot = match self.fetch_account_with_retry(exchange).await {
            Some(snapshot) => snapshot,
            None => {
                self.safety.bump("account_state");
                self.governor.report_api_error(now);
                let result = ExecutionResult::rejected(
                    exchange,
                    format!("Account state unavailable on {exchange} after retries"),
                );
                self.log_execution(decision_id, symbol, direction, &result);
                return Some(result);
            }
        };
        self.governor.report_api_success();

        let account_value = snapshot.equity();
        if account_value <= 0.0 {
            let result =
                ExecutionResult::rejected(exchange, format!("No account value on {exchange}"));
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        // Step 5: governor sees the same snapshot.
        self.governor
            .update_positions_for_exchange(exchange.as_str(), &snapshot.positions);

        // Step 6: exposure pre-check.
        let exposure_before = snapshot.total_exposure() / account_value;
        if exposure_before >= max_exposure_pct {
            let result = ExecutionResult::rejected(
                exchange,
                format!(
                    "Exposure {:.1}% >= {:.1}% limit on {exchange}",
                    exposure_before * 100.0,
                    max_exposure_pct * 100.0
                ),
            );
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        // Step 7: mid price.
        let Some(mid_price) = self.manager.get_market_price(symbol, Some(exchange)).await
        else {
            let result = ExecutionResult::rejected(
                exchange,
                format!("Could not get price for {symbol} on {exchange}"),
            );
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        };

        // Step 8: position sizing.
        let regime_analysis = self.regime.detect_regime(symbol, Some(exchange)).await;
        let round_trip_fee_pct = self.fees.get_fees_bps(exchange, false).await / 10_000.0;

        let kelly = if kelly_config.enabled && !trigger_addresses.is_empty() {
            consensus_kelly_size(
                self.store.as_ref(),
                trigger_addresses,
                account_value,
                mid_price,
                stop_distance_pct,
                round_trip_fee_pct,
                &kelly_config,
                regime_analysis.params.kelly_multiplier,
            )
        } else {
            // Fixed-fraction sizing when Kelly is off.
            let position_pct = kelly_config.fallback_pct;
            let size_usd = account_value * position_pct;
            KellyResult {
                full_kelly: 0.0,
                fractional_kelly: 0.0,
                position_pct,
                position_size_usd: size_usd,
                position_size_coin: size_usd / mid_price,
                method: SizingMethod::FallbackInsufficientData,
                reasoning: "Fixed-fraction sizing (Kelly disabled)".to_string(),
                capped: false,
            }
        };

        let size_usd = kelly.position_size_usd;
        let size_coin = kelly.position_size_coin;
        let position_pct = kelly.position_pct;

        if size_coin <= 0.0 {
            let result = ExecutionResult {
                kelly: Some(kelly.clone()),
                ..ExecutionResult::rejected(exchange, "Sized to zero")
            };
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        // Step 9: re-check EV with slippage at the actual notional. The
        // consensus pass priced a nominal $10k order; a materially larger
        // position may walk deeper through the book.
        let actual_slippage = self
            .slippage
            .estimate_slippage(
                symbol,
                exchange,
                size_usd,
                direction == Direction::Long,
                false,
            )
            .await;
        let hold_hours = self
            .hold_time
            .estimate_hold_hours(symbol, Some(regime_analysis.regime));
        let funding_bps = self
            .funding
            .get_funding_bps(symbol, exchange, hold_hours, direction)
            .await;
        let fees_bps = round_trip_fee_pct * 10_000.0;

        let costs = CostBreakdown {
            fees_bps,
            slippage_bps: actual_slippage.estimated_slippage_bps,
            funding_bps,
            hold_hours,
        };

        let stop_price = StopManager::stop_price(mid_price, direction, stop_distance_pct);
        let p_win = if kelly.full_kelly > 0.0 {
            (0.50 + kelly.full_kelly * 0.5).min(0.70)
        } else {
            0.55
        };
        let ev = calculate_ev(
            p_win,
            mid_price,
            stop_price,
            crate::consensus::DEFAULT_AVG_WIN_R,
            crate::consensus::DEFAULT_AVG_LOSS_R,
            costs.total_bps(),
        );
        if ev.net_r < min_ev_r {
            let result = ExecutionResult {
                kelly: Some(kelly.clone()),
                exposure_before: Some(exposure_before),
                ..ExecutionResult::rejected(
                    exchange,
                    format!(
                        "EV {:.3}R < minimum {min_ev_r:.3}R after sizing (slippage={:.1}bps)",
                        ev.net_r, actual_slippage.estimated_slippage_bps
                    ),
                )
            };
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        // Step 10: exposure with the proposed size, then the full governor
        // pass against the same snapshot.
        let exposure_after = exposure_before + size_usd / account_value;
        if exposure_after > max_exposure_pct {
            let result = ExecutionResult {
                kelly: Some(kelly.clone()),
                exposure_before: Some(exposure_before),
                ..ExecutionResult::rejected(
                    exchange,
                    format!(
                        "Trade would exceed exposure limit ({:.1}% > {:.1}%)",
                        exposure_after * 100.0,
                        max_exposure_pct * 100.0
                    ),
                )
            };
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        let balance_norm = crate::normalizer::normalize_balance(&snapshot.balance);
        let risk_verdict = self.governor.run_all_checks(
            account_value,
            balance_norm.margin_used_usd,
            balance_norm.maintenance_margin_usd,
            snapshot.total_exposure(),
            size_usd,
            now,
        );
        if !risk_verdict.allowed {
            self.safety.bump("risk_governor");
            let result = ExecutionResult {
                kelly: Some(kelly.clone()),
                exposure_before: Some(exposure_before),
                ..ExecutionResult::rejected(
                    exchange,
                    format!("Risk governor: {}", risk_verdict.reason),
                )
            };
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        // Step 11: circuit breakers.
        let breaker_verdict = self.governor.run_circuit_breaker_checks(symbol, now);
        if !breaker_verdict.allowed {
            self.safety.bump("circuit_breaker");
            let result = ExecutionResult {
                kelly: Some(kelly.clone()),
                exposure_before: Some(exposure_before),
                ..ExecutionResult::rejected(
                    exchange,
                    format!("Circuit breaker: {}", breaker_verdict.reason),
                )
            };
            self.log_execution(decision_id, symbol, direction, &result);
            return Some(result);
        }

        // Step 12: simulate or place.
        let result = if real_execution {
            self.execute_live(
                decision_id,
                symbol,
                direction,
                exchange,
                size_coin,
                mid_price,
                stop_distance_pct,
                exposure_before,
                exposure_after,
                position_pct,
                kelly,
                now,
            )
            .await
        } else {
            info!(
                decision_id,
                symbol,
                direction = %direction,
                exchange = %exchange,
                size_coin,
                mid_price,
                exposure_before,
                exposure_after,
                "dry run: simulated fill"
            );
            ExecutionResult {
                status: ExecutionStatus::Simulated,
                exchange,
                fill_price: Some(mid_price),
                fill_size: Some(size_coin),
                error_message: Some("Dry run - real execution disabled".to_string()),
                exposure_before: Some(exposure_before),
                exposure_after: Some(exposure_after),
                position_pct: Some(position_pct),
                kelly: Some(kelly),
            }
        };

        // Step 13: one row, every path.
        self.log_execution(decision_id, symbol, direction, &result);
        Some(result)
    }

    async fn fetch_account_with_retry(&self, exchange: ExchangeType) -> Option<AccountSnapshot> {
        for attempt in 0..ACCOUNT_STATE_MAX_RETRIES {
            if let Some(balance) = self.manager.get_balance(exchange).await {
                let positions = self.manager.get_positions(exchange).await;
                return Some(AccountSnapshot { balance, positions });
            }

            if attempt + 1 < ACCOUNT_STATE_MAX_RETRIES {
                let delay_ms = ACCOUNT_STATE_BASE_DELAY_MS * 2u64.pow(attempt);
                warn!(
                    exchange = %exchange,
                    attempt = attempt + 1,
                    delay_ms,
                    "account state fetch failed, retrying"
                );
                sleep(Duration::from_millis(delay_ms)).await;
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_live(
        &self,
        decision_id: &str,
        symbol: &str,
        direction: Direction,
        exchange: ExchangeType,
        size_coin: f64,
        mid_price: f64,
        stop_distance_pct: f64,
        exposure_before: f64,
        exposure_after: f64,
        position_pct: f64,
        kelly: KellyResult,
        now: chrono::DateTime<Utc>,
    ) -> ExecutionResult {
        let stop_price = StopManager::stop_price(mid_price, direction, stop_distance_pct);
        let take_profit =
            StopManager::take_profit_price(mid_price, stop_price, direction, 2.0);

        let mut params = OrderParams::market(symbol, OrderSide::from_direction(direction), size_coin);
        params.stop_loss = Some(stop_price);
        params.take_profit = take_profit;

        let order = self.manager.open_position(Some(exchange), &params).await;

        if order.success {
            let fill_price = order.fill_price.unwrap_or(mid_price);
            let fill_size = order.fill_size.unwrap_or(size_coin);

            self.stops
                .register_stop(
                    decision_id,
                    symbol,
                    direction,
                    fill_price,
                    fill_size,
                    stop_distance_pct,
                    exchange,
                    now,
                )
                .await;
            self.governor.adjust_position_count(symbol, 1);

            info!(
                decision_id,
                symbol,
                direction = %direction,
                exchange = %exchange,
                fill_price,
                fill_size,
                "live order FILLED"
            );

            ExecutionResult {
                status: ExecutionStatus::Filled,
                exchange,
                fill_price: Some(fill_price),
                fill_size: Some(fill_size),
                error_message: None,
                exposure_before: Some(exposure_before),
                exposure_after: Some(exposure_after),
                position_pct: Some(position_pct),
                kelly: Some(kelly),
            }
        } else {
            warn!(
                decision_id,
                symbol,
                exchange = %exchange,
                error = ?order.error,
                "live order FAILED"
            );
            self.governor.report_api_error(now);

            ExecutionResult {
                status: ExecutionStatus::Failed,
                exchange,
                fill_price: None,
                fill_size: None,
                error_message: order.error,
                exposure_before: Some(exposure_before),
                exposure_after: None,
                position_pct: Some(position_pct),
                kelly: Some(kelly),
            }
        }
    }

    fn log_execution(
        &self,
        decision_id: &str,
        symbol: &str,
        direction: Direction,
        result: &ExecutionResult,
    ) {
        let Some(store) = &self.store else { return };

        let kelly = result.kelly.as_ref();
        let row = ExecutionLogRow {
            decision_id: decision_id.to_string(),
            exchange: result.exchange.as_str().to_string(),
            symbol: symbol.to_uppercase(),
            side: match direction {
                Direction::Long => "buy".to_string(),
                Direction::Short => "sell".to_string(),
            },
            size: result.fill_size.unwrap_or(0.0),
            leverage: 1,
            status: result.status.as_str().to_string(),
            fill_price: result.fill_price,
            fill_size: result.fill_size,
            error_message: result.error_message.clone(),
            account_value: None,
            position_pct: result.position_pct,
            exposure_before: result.exposure_before,
            exposure_after: result.exposure_after,
            kelly_full: kelly.map(|k| k.full_kelly),
            kelly_fraction_used: kelly.map(|k| k.fractional_kelly),
            kelly_position_pct: kelly.map(|k| k.position_pct),
            kelly_method: kelly.map(|k| k.method.as_str().to_string()),
            kelly_reasoning: kelly.map(|k| k.reasoning.clone()),
            kelly_capped: kelly.map(|k| k.capped).unwrap_or(false),
        };

        if let Err(e) = store.insert_execution(&row) {
            warn!(error = %e, decision_id, "failed to log execution");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StopConfig;
    use crate::costs::slippage::{BookLevel, OrderbookSnapshot};
    use crate::exchanges::mock::MockExchange;
    use crate::exchanges::ExchangeAdapter;
    use std::collections::HashMap;
    use std::sync::atomic::Ordering as AtomicOrdering;

    struct Fixture {
        executor: Executor,
        mock: Arc<MockExchange>,
        store: Arc<Store>,
        governor: Arc<RiskGovernor>,
        config: Arc<RwLock<RuntimeConfig>>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut runtime = RuntimeConfig::default();
        runtime.kelly.enabled = true;
        let config = Arc::new(RwLock::new(runtime));

        let manager = Arc::new(ExchangeManager::new(
            None,
            HashMap::from([("hyperliquid".to_string(), 0)]),
            true,
        ));
        let mock = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        mock.set_price("BTC", 100_000.0);
        manager
            .connect_exchange(Arc::clone(&mock) as Arc<dyn ExchangeAdapter>, true)
            .await;

        let governor = Arc::new(RiskGovernor::new(
            config.read().risk.clone(),
            Some(Arc::clone(&store)),
        ));
        let stops = Arc::new(StopManager::new(
            StopConfig::default(),
            Some(Arc::clone(&store)),
            Arc::clone(&manager),
        ));
        let funding = Arc::new(FundingProvider::new(Arc::clone(&manager)));
        let regime = Arc::new(RegimeDetector::new(
            Arc::clone(&manager),
            ExchangeType::Hyperliquid,
        ));

        // Seeded book keeps slippage math deterministic in tests.
        let slippage = Arc::new(SlippageProvider::new(true));
        slippage.prime_book(OrderbookSnapshot {
            asset: "BTC".to_string(),
            exchange: ExchangeType::Hyperliquid,
            bids: vec![BookLevel { price: 99_995.0, size: 5.0 }],
            asks: vec![BookLevel { price: 100_005.0, size: 5.0 }],
            mid_price: 100_000.0,
            spread_bps: 1.0,
        });

        let executor = Executor::new(
            Arc::clone(&config),
            Arc::clone(&manager),
            Arc::clone(&governor),
            stops,
            Some(Arc::clone(&store)),
            Arc::new(FeeProvider::new()),
            slippage,
            funding,
            Arc::new(HoldTimeEstimator::new(None)),
            regime,
        );

        Fixture {
            executor,
            mock,
            store,
            governor,
            config,
        }
    }

    fn seed_trader(store: &Store, address: &str, win_rate: f64, episodes: u32) {
        store
            .conn_for_tests()
            .execute(
                "INSERT INTO trader_performance
                 (address, win_rate, avg_win_r, avg_loss_r, episode_count)
                 VALUES (?1, ?2, 1.0, 0.5, ?3)",
                rusqlite::params![address, win_rate, episodes],
            )
            .unwrap();
    }

    fn addresses() -> Vec<String> {
        vec!["0xaaa".to_string(), "0xbbb".to_string(), "0xccc".to_string()]
    }

    #[tokio::test]
    async fn disabled_execution_returns_none() {
        let f = fixture().await;
        f.config.write().execution.enabled = false;
        let result = f
            .executor
            .maybe_execute_signal("d1", "BTC", Direction::Long, &addresses(), 0.02, None)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn dry_run_simulates_at_mid_and_logs() {
        let f = fixture().await;
        for addr in ["0xaaa", "0xbbb", "0xccc"] {
            seed_trader(&f.store, addr, 0.62, 80);
        }

        let result = f
            .executor
            .maybe_execute_signal(
                "d1",
                "BTC",
                Direction::Long,
                &addresses(),
                0.02,
                Some(ExchangeType::Hyperliquid),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Simulated);
        assert_eq!(result.fill_price, Some(100_000.0));
        assert!(result.fill_size.unwrap() > 0.0);
        let kelly = result.kelly.unwrap();
        assert_eq!(kelly.method, SizingMethod::KellyConsensus);

        // No order reached the venue.
        assert!(f.mock.placed_orders.read().is_empty());
    }

    #[tokio::test]
    async fn kill_switch_blocks_before_anything_else() {
        let f = fixture().await;
        f.governor.trigger_kill_switch("test", Utc::now());

        let result = f
            .executor
            .maybe_execute_signal("d1", "BTC", Direction::Long, &addresses(), 0.02, None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(result.error_message.unwrap().contains("kill switch"));
        assert_eq!(f.executor.safety.kill_switch.load(AtomicOrdering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unavailable_account_state_fails_closed() {
        let f = fixture().await;
        f.mock.fail_balance.store(true, AtomicOrdering::SeqCst);

        let result = f
            .executor
            .maybe_execute_signal("d1", "BTC", Direction::Long, &addresses(), 0.02, None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(result.error_message.unwrap().contains("Account state unavailable"));
        assert_eq!(
            f.executor.safety.account_state.load(AtomicOrdering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn missing_price_rejects() {
        let f = fixture().await;
        f.mock.prices.write().clear();

        let result = f
            .executor
            .maybe_execute_signal("d1", "BTC", Direction::Long, &addresses(), 0.02, None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(result.error_message.unwrap().contains("price"));
    }

    #[tokio::test]
    async fn live_mode_places_order_and_registers_stop() {
        let f = fixture().await;
        f.config.write().execution.real_execution_enabled = true;
        for addr in ["0xaaa", "0xbbb", "0xccc"] {
            seed_trader(&f.store, addr, 0.62, 80);
        }

        let result = f
            .executor
            .maybe_execute_signal(
                "d1",
                "BTC",
                Direction::Long,
                &addresses(),
                0.02,
                Some(ExchangeType::Hyperliquid),
            )
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Filled);
        assert_eq!(f.mock.placed_orders.read().len(), 1);

        // The stop row is live with the fill's parameters.
        let stops = f.store.active_stops().unwrap();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].decision_id, "d1");
        assert_eq!(stops[0].exchange, "hyperliquid");
    }

    #[tokio::test]
    async fn signal_venue_overrides_default() {
        let f = fixture().await;
        // The default venue is hyperliquid; nothing is registered for bybit,
        // so routing there fails closed at the account-state step.
        let result = f
            .executor
            .maybe_execute_signal(
                "d1",
                "BTC",
                Direction::Long,
                &addresses(),
                0.02,
                Some(ExchangeType::Bybit),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(result.error_message.unwrap().contains("bybit"));
    }

    #[tokio::test]
    async fn per_symbol_breaker_rejects_duplicate_position() {
        let f = fixture().await;
        for addr in ["0xaaa", "0xbbb", "0xccc"] {
            seed_trader(&f.store, addr, 0.62, 80);
        }
        // An existing BTC position on the venue trips the per-symbol cap.
        f.mock.positions.write().push(Position {
            symbol: "BTC".to_string(),
            direction: Direction::Long,
            size: 0.01,
            entry_price: 100_000.0,
            mark_price: 100_000.0,
            liquidation_price: None,
            unrealized_pnl: 0.0,
            leverage: 1,
            margin_used: 0.0,
        });

        let result = f
            .executor
            .maybe_execute_signal("d1", "BTC", Direction::Long, &addresses(), 0.02, None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Rejected);
        assert!(result.error_message.unwrap().contains("Circuit breaker"));
        assert_eq!(
            f.executor.safety.circuit_breaker.load(AtomicOrdering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn every_path_writes_an_execution_row() {
        let f = fixture().await;
        f.governor.trigger_kill_switch("test", Utc::now());
        f.executor
            .maybe_execute_signal("d1", "BTC", Direction::Long, &addresses(), 0.02, None)
            .await;

        let count: i64 = f
            .store
            .conn_for_tests()
            .query_row("SELECT COUNT(*) FROM execution_logs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
