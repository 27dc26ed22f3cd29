// =============================================================================
// Stop manager — SL/TP/timeout exits for every open position
// =============================================================================
//
// Two modes per position:
//   - Native: SL/TP placed on the venue at registration; the exchange
//     executes server-side. The poll loop only watches for timeout and for
//     the position disappearing (native stop fired).
//   - Polling: the loop compares the mid against the stop and take-profit
//     levels every tick and sends a market close on a cross. Required for
//     trailing stops and for venues without native stop support.
//
// The loop runs as one background task. A stop signal lets the current tick
// finish, then exits. Tick errors are logged and the loop continues.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::StopConfig;
use crate::db::{ActiveStopRow, Store};
use crate::exchanges::{manager::ExchangeManager, ExchangeType, OrderResult};
use crate::types::Direction;

/// Result of one triggered stop, carrying enough of the position for
/// outcome attribution downstream.
#[derive(Debug, Clone)]
pub struct StopTriggerResult {
    pub decision_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_size: f64,
    pub stop_distance_pct: f64,
    /// stop_loss, take_profit, timeout, native_stop
    pub trigger_reason: String,
    pub trigger_price: f64,
    pub order_result: Option<OrderResult>,
}

/// What one per-position check decided.
enum TickAction {
    None,
    Trigger { reason: String, price: f64 },
    Trail { new_stop: f64 },
}

pub struct StopManager {
    config: StopConfig,
    store: Option<Arc<Store>>,
    manager: Arc<ExchangeManager>,
}

impl StopManager {
    pub fn new(config: StopConfig, store: Option<Arc<Store>>, manager: Arc<ExchangeManager>) -> Self {
        Self {
            config,
            store,
            manager,
        }
    }

    /// Stop price at `stop_distance_pct` away from entry, against the
    /// position.
    pub fn stop_price(entry_price: f64, direction: Direction, stop_distance_pct: f64) -> f64 {
        match direction {
            Direction::Long => entry_price * (1.0 - stop_distance_pct),
            Direction::Short => entry_price * (1.0 + stop_distance_pct),
        }
    }

    /// Take-profit price at `rr_ratio` times the stop distance, with the
    /// position.
    pub fn take_profit_price(
        entry_price: f64,
        stop_price: f64,
        direction: Direction,
        rr_ratio: f64,
    ) -> Option<f64> {
        if rr_ratio <= 0.0 {
            return None;
        }
        let profit_distance = (entry_price - stop_price).abs() * rr_ratio;
        Some(match direction {
            Direction::Long => entry_price + profit_distance,
            Direction::Short => entry_price - profit_distance,
        })
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    /// Register exits for a newly opened position. Attempts native SL/TP
    /// placement when the venue supports it and the stop is not trailing;
    /// otherwise the poll loop covers the levels.
    pub async fn register_stop(
        &self,
        decision_id: &str,
        symbol: &str,
        direction: Direction,
        entry_price: f64,
        entry_size: f64,
        stop_distance_pct: f64,
        exchange: ExchangeType,
        now: DateTime<Utc>,
    ) -> ActiveStopRow {
        let stop_price = Self::stop_price(entry_price, direction, stop_distance_pct);
        let take_profit_price =
            Self::take_profit_price(entry_price, stop_price, direction, self.config.default_rr);
        let timeout_at = now + Duration::hours(self.config.max_hold_h);
        let trailing = self.config.trailing_enabled;

        let mut native_stop_placed = false;
        if self.config.use_native_stops && !trailing {
            native_stop_placed = self
                .place_native_stops(symbol, stop_price, take_profit_price, entry_size, exchange)
                .await;
        }

        let row = ActiveStopRow {
            decision_id: decision_id.to_string(),
            symbol: symbol.to_uppercase(),
            direction,
            entry_price,
            entry_size,
            stop_price,
            take_profit_price,
            trailing_enabled: trailing,
            trail_distance_pct: stop_distance_pct,
            timeout_at: Some(timeout_at),
            exchange: exchange.as_str().to_string(),
            native_stop_placed,
            created_at: now,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save_stop(&row) {
                warn!(error = %e, decision_id, "failed to persist stop");
            }
        }

        info!(
            decision_id,
            symbol = %row.symbol,
            direction = %direction,
            exchange = %exchange,
            mode = if native_stop_placed { "NATIVE" } else { "POLLING" },
            entry = entry_price,
            stop = stop_price,
            tp = ?take_profit_price,
            "stop registered"
        );

        row
    }

    async fn place_native_stops(
        &self,
        symbol: &str,
        stop_price: f64,
        take_profit_price: Option<f64>,
        entry_size: f64,
        exchange: ExchangeType,
    ) -> bool {
        let Some(adapter) = self.manager.get_exchange(exchange) else {
            debug!(exchange = %exchange, "native stops unavailable: venue not registered");
            return false;
        };
        if !adapter.is_connected() {
            debug!(exchange = %exchange, "native stops unavailable: venue disconnected");
            return false;
        }
        if !adapter.supports_native_stops() {
            debug!(exchange = %exchange, "venue has no native stop support, polling instead");
            return false;
        }

        let (sl_result, tp_result) = adapter
            .set_stop_loss_take_profit(symbol, Some(stop_price), take_profit_price, Some(entry_size))
            .await;

        if !sl_result.success {
            warn!(
                symbol,
                exchange = %exchange,
                error = ?sl_result.error,
                "native stop-loss placement failed, falling back to polling"
            );
            return false;
        }
        if take_profit_price.is_some() && !tp_result.success {
            // The stop leg is live on the venue; the profit leg polls.
            warn!(
                symbol,
                exchange = %exchange,
                error = ?tp_result.error,
                "native take-profit failed; stop leg placed"
            );
        }
        true
    }

    // -------------------------------------------------------------------------
    // Poll loop
    // -------------------------------------------------------------------------

    /// Background loop. Each tick evaluates every active stop; the `stop_rx`
    /// signal ends the loop after the in-flight tick completes. Triggered
    /// stops flow out over `trigger_tx` for outcome attribution.
    pub async fn run_loop(
        self: Arc<Self>,
        mut stop_rx: watch::Receiver<bool>,
        trigger_tx: Option<tokio::sync::mpsc::UnboundedSender<StopTriggerResult>>,
    ) {
        info!(
            poll_interval_s = self.config.poll_interval_s,
            "stop manager started"
        );
        let mut ticker = interval(std::time::Duration::from_secs(self.config.poll_interval_s));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let triggered = self.check_stops(Utc::now()).await;
                    if !triggered.is_empty() {
                        info!(count = triggered.len(), "stops triggered this tick");
                    }
                    if let Some(tx) = &trigger_tx {
                        for result in triggered {
                            let _ = tx.send(result);
                        }
                    }
                }
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        info!("stop manager received shutdown signal, exiting");
                        break;
                    }
                }
            }
        }
    }

    /// Evaluate every active stop once. Per-position checks run
    /// concurrently; each row is then mutated by exactly one path.
    pub async fn check_stops(&self, now: DateTime<Utc>) -> Vec<StopTriggerResult> {
        let stops = match &self.store {
            Some(store) => match store.active_stops() {
                Ok(stops) => stops,
                Err(e) => {
                    error!(error = %e, "failed to load active stops");
                    return Vec::new();
                }
            },
            None => return Vec::new(),
        };

        if stops.is_empty() {
            return Vec::new();
        }

        // One price fetch per (exchange, symbol) that actually needs polling.
        let mut prices: HashMap<(String, String), f64> = HashMap::new();
        for stop in &stops {
            if stop.native_stop_placed && !stop.trailing_enabled {
                continue;
            }
            let key = (stop.exchange.clone(), stop.symbol.clone());
            if prices.contains_key(&key) {
                continue;
            }
            let exchange = ExchangeType::parse(&stop.exchange);
            if let Some(price) = self.manager.get_market_price(&stop.symbol, exchange).await {
                prices.insert(key, price);
            }
        }

        let checks = stops.iter().map(|stop| {
            let price = prices
                .get(&(stop.exchange.clone(), stop.symbol.clone()))
                .copied();
            self.evaluate_stop(stop, price, now)
        });
        let actions: Vec<TickAction> = join_all(checks).await;

        let mut triggered = Vec::new();
        for (stop, action) in stops.iter().zip(actions) {
            match action {
                TickAction::None => {}
                TickAction::Trail { new_stop } => {
                    if let Some(store) = &self.store {
                        if let Err(e) =
                            store.update_stop_price(&stop.decision_id, &stop.symbol, new_stop)
                        {
                            warn!(error = %e, "failed to persist trailing stop");
                            continue;
                        }
                    }
                    info!(
                        symbol = %stop.symbol,
                        direction = %stop.direction,
                        old_stop = stop.stop_price,
                        new_stop,
                        "trailing stop advanced"
                    );
                }
                TickAction::Trigger { reason, price } => {
                    let result = self.trigger_stop(stop, &reason, price).await;
                    triggered.push(result);
                }
            }
        }

        triggered
    }

    /// Decide what one stop needs this tick.
    async fn evaluate_stop(
        &self,
        stop: &ActiveStopRow,
        current_price: Option<f64>,
        now: DateTime<Utc>,
    ) -> TickAction {
        // Timeout applies to every mode.
        if let Some(timeout_at) = stop.timeout_at {
            if now >= timeout_at {
                if stop.native_stop_placed {
                    self.cancel_native_stops(stop).await;
                }
                return TickAction::Trigger {
                    reason: "timeout".to_string(),
                    price: current_price.unwrap_or(0.0),
                };
            }
        }

        // Native stops execute on the venue; watch only for the position
        // vanishing.
        if stop.native_stop_placed && !stop.trailing_enabled {
            if self.position_closed(stop).await {
                let price = match current_price {
                    Some(p) => p,
                    None => self
                        .manager
                        .get_market_price(&stop.symbol, ExchangeType::parse(&stop.exchange))
                        .await
                        .unwrap_or(0.0),
                };
                return TickAction::Trigger {
                    reason: "native_stop".to_string(),
                    price,
                };
            }
            return TickAction::None;
        }

        let Some(price) = current_price else {
            debug!(symbol = %stop.symbol, "no price this tick, skipping stop evaluation");
            return TickAction::None;
        };

        if Self::is_stop_hit(stop, price) {
            return TickAction::Trigger {
                reason: "stop_loss".to_string(),
                price,
            };
        }
        if Self::is_take_profit_hit(stop, price) {
            return TickAction::Trigger {
                reason: "take_profit".to_string(),
                price,
            };
        }

        if stop.trailing_enabled {
            let candidate = Self::stop_price(price, stop.direction, stop.trail_distance_pct);
            let favorable = match stop.direction {
                Direction::Long => candidate > stop.stop_price,
                Direction::Short => candidate < stop.stop_price,
            };
            if favorable {
                return TickAction::Trail {
                    new_stop: candidate,
                };
            }
        }

        TickAction::None
    }

    fn is_stop_hit(stop: &ActiveStopRow, price: f64) -> bool {
        match stop.direction {
            Direction::Long => price <= stop.stop_price,
            Direction::Short => price >= stop.stop_price,
        }
    }

    fn is_take_profit_hit(stop: &ActiveStopRow, price: f64) -> bool {
        let Some(tp) = stop.take_profit_price else {
            return false;
        };
        match stop.direction {
            Direction::Long => price >= tp,
            Direction::Short => price <= tp,
        }
    }

    async fn position_closed(&self, stop: &ActiveStopRow) -> bool {
        let exchange = ExchangeType::parse(&stop.exchange);
        match self.manager.get_position(&stop.symbol, exchange).await {
            Some(position) => position.size.abs() < 1e-12,
            None => true,
        }
    }

    async fn cancel_native_stops(&self, stop: &ActiveStopRow) {
        let Some(exchange) = ExchangeType::parse(&stop.exchange) else {
            return;
        };
        let Some(adapter) = self.manager.get_exchange(exchange) else {
            return;
        };
        if adapter.is_connected() {
            let cancelled = adapter.cancel_stop_orders(&stop.symbol).await;
            if cancelled > 0 {
                debug!(
                    symbol = %stop.symbol,
                    exchange = %exchange,
                    cancelled,
                    "native stops cancelled before close"
                );
            }
        }
    }

    /// Execute the exit: market-close on the owning venue, then record the
    /// trigger on the row.
    async fn trigger_stop(
        &self,
        stop: &ActiveStopRow,
        reason: &str,
        trigger_price: f64,
    ) -> StopTriggerResult {
        warn!(
            symbol = %stop.symbol,
            direction = %stop.direction,
            exchange = %stop.exchange,
            reason,
            price = trigger_price,
            "STOP TRIGGERED"
        );

        // Native stops already closed the position on the venue.
        let order_result = if reason == "native_stop" {
            None
        } else {
            let exchange = ExchangeType::parse(&stop.exchange);
            Some(self.manager.close_position(&stop.symbol, exchange, None).await)
        };

        if let Some(store) = &self.store {
            if let Err(e) =
                store.mark_stop_triggered(&stop.decision_id, &stop.symbol, trigger_price, reason)
            {
                warn!(error = %e, "failed to record stop trigger");
            }
        }

        StopTriggerResult {
            decision_id: stop.decision_id.clone(),
            symbol: stop.symbol.clone(),
            direction: stop.direction,
            entry_price: stop.entry_price,
            entry_size: stop.entry_size,
            stop_distance_pct: stop.trail_distance_pct,
            trigger_reason: reason.to_string(),
            trigger_price,
            order_result,
        }
    }

    /// Explicit cancel (position closed manually). No market order is sent.
    pub fn cancel_stop(&self, decision_id: &str, symbol: &str) -> bool {
        match &self.store {
            Some(store) => store
                .mark_stop_cancelled(decision_id, symbol)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "failed to cancel stop");
                    false
                }),
            None => false,
        }
    }
}
