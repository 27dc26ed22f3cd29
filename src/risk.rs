// =============================================================================
// Risk Governor — hard safety limits that cannot be overridden
// =============================================================================
//
// The last line of defense before capital destruction:
//   1. Kill switch        — daily drawdown past the threshold halts all
//                           trading for a cooldown, then auto-clears.
//   2. Equity floor       — no trading below an absolute minimum equity.
//   3. Liquidation guard  — equity / maintenance margin must stay above the
//                           minimum ratio.
//   4. Size and exposure  — single-position and total-notional ceilings.
//   5. Circuit breakers   — concurrent positions, per-symbol positions,
//                           API-error streaks, loss streaks.
//
// Check order: kill switch first, then equity floor, liquidation distance,
// daily drawdown, position size, total exposure; circuit breakers run as
// their own pass. The first failing gate is the verdict; warnings from
// passing gates accumulate alongside.
//
// All time-dependent checks take `now` as a parameter. State persists
// best-effort on every change.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::RiskConfig;
use crate::db::Store;
use crate::exchanges::Position;

/// Snapshot of account risk metrics, USD-normalized by the caller.
#[derive(Debug, Clone)]
pub struct RiskState {
    pub timestamp: DateTime<Utc>,
    pub account_value: f64,
    pub margin_used: f64,
    pub maintenance_margin: f64,
    pub total_exposure: f64,
    /// equity / maintenance margin; infinity with no margin in use.
    pub margin_ratio: f64,
    pub daily_pnl: f64,
    pub daily_starting_equity: f64,
    pub daily_drawdown_pct: f64,
}

/// Verdict of one gate or one full pass.
#[derive(Debug, Clone)]
pub struct RiskCheckResult {
    pub allowed: bool,
    pub name: &'static str,
    pub reason: String,
    pub warnings: Vec<String>,
}

impl RiskCheckResult {
    fn allow(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            name,
            reason: reason.into(),
            warnings: Vec::new(),
        }
    }

    fn allow_with(name: &'static str, reason: impl Into<String>, warnings: Vec<String>) -> Self {
        Self {
            allowed: true,
            name,
            reason: reason.into(),
            warnings,
        }
    }

    fn block(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            name,
            reason: reason.into(),
            warnings: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Inner {
    kill_switch_active: bool,
    kill_switch_triggered_at: Option<DateTime<Utc>>,
    daily_starting_equity: Option<f64>,
    daily_start_date: Option<String>,

    consecutive_api_errors: u32,
    api_pause_until: Option<DateTime<Utc>>,
    consecutive_losses: u32,
    loss_streak_pause_until: Option<DateTime<Utc>>,

    positions_by_exchange: HashMap<String, HashMap<String, usize>>,
    positions_by_symbol: HashMap<String, usize>,
    position_count: usize,
}

pub struct RiskGovernor {
    config: RiskConfig,
    store: Option<Arc<Store>>,
    state: RwLock<Inner>,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig, store: Option<Arc<Store>>) -> Self {
        Self {
            config,
            store,
            state: RwLock::new(Inner::default()),
        }
    }

    /// Restore kill-switch state persisted by a previous run.
    pub fn load_state(&self) {
        let Some(store) = &self.store else { return };

        let active = store
            .load_governor_state("kill_switch_active")
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(false);
        let triggered_at = store
            .load_governor_state("kill_switch_triggered_at")
            .ok()
            .flatten()
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc));

        let mut state = self.state.write();
        state.kill_switch_active = active;
        state.kill_switch_triggered_at = triggered_at;
        if active {
            warn!(?triggered_at, "kill switch restored active from persisted state");
        }
    }

    fn persist_kill_switch(&self, active: bool, triggered_at: Option<DateTime<Utc>>) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.save_governor_state("kill_switch_active", &active.to_string()) {
            warn!(error = %e, "failed to persist kill switch flag");
        }
        let at = triggered_at.map(|t| t.to_rfc3339()).unwrap_or_default();
        if let Err(e) = store.save_governor_state("kill_switch_triggered_at", &at) {
            warn!(error = %e, "failed to persist kill switch timestamp");
        }
    }

    // -------------------------------------------------------------------------
    // Kill switch
    // -------------------------------------------------------------------------

    /// Lightweight early-bailout check. Does not mutate cooldown state.
    pub fn is_kill_switch_active(&self, now: DateTime<Utc>) -> bool {
        let state = self.state.read();
        if !state.kill_switch_active {
            return false;
        }
        match state.kill_switch_triggered_at {
            Some(at) => {
                let elapsed = (now - at).num_seconds();
                elapsed < self.config.kill_switch_cooldown_s as i64
            }
            None => true,
        }
    }

    /// Full check: expires the cooldown when due and reports the remaining
    /// time otherwise.
    pub fn check_kill_switch(&self, now: DateTime<Utc>) -> RiskCheckResult {
        let mut state = self.state.write();
        if !state.kill_switch_active {
            return RiskCheckResult::allow("kill_switch", "Kill switch clear");
        }

        if let Some(at) = state.kill_switch_triggered_at {
            let elapsed = (now - at).num_seconds();
            if elapsed >= self.config.kill_switch_cooldown_s as i64 {
                state.kill_switch_active = false;
                state.kill_switch_triggered_at = None;
                drop(state);
                info!("kill switch cooldown expired, auto-cleared");
                self.persist_kill_switch(false, None);
                return RiskCheckResult::allow("kill_switch", "Kill switch cooldown expired");
            }
            let remaining_h =
                (self.config.kill_switch_cooldown_s as i64 - elapsed) as f64 / 3_600.0;
            return RiskCheckResult::block(
                "kill_switch",
                format!("KILL SWITCH active, {remaining_h:.1}h remaining"),
            );
        }

        RiskCheckResult::block("kill_switch", "KILL SWITCH active")
    }

    pub fn trigger_kill_switch(&self, reason: &str, now: DateTime<Utc>) {
        {
            let mut state = self.state.write();
            state.kill_switch_active = true;
            state.kill_switch_triggered_at = Some(now);
        }
        warn!(reason, "KILL SWITCH TRIGGERED");
        self.persist_kill_switch(true, Some(now));
    }

    /// Operator-initiated reset, for use after human review only.
    pub fn reset_kill_switch(&self) {
        {
            let mut state = self.state.write();
            state.kill_switch_active = false;
            state.kill_switch_triggered_at = None;
        }
        info!("kill switch reset by operator");
        self.persist_kill_switch(false, None);
    }

    // -------------------------------------------------------------------------
    // Daily equity tracking
    // -------------------------------------------------------------------------

    /// Record an equity observation. The first observation of a UTC date
    /// fixes that day's starting equity. Returns (starting_equity,
    /// daily_pnl).
    pub fn observe_equity(&self, equity: f64, now: DateTime<Utc>) -> (f64, f64) {
        let today = now.format("%Y-%m-%d").to_string();

        // Durable record first, when a store is attached.
        let persisted_start = self
            .store
            .as_ref()
            .and_then(|store| store.upsert_daily_equity(&today, equity).ok());

        let mut state = self.state.write();
        if state.daily_start_date.as_deref() != Some(today.as_str()) {
            state.daily_start_date = Some(today);
            state.daily_starting_equity = Some(persisted_start.unwrap_or(equity));
        } else if let Some(start) = persisted_start {
            state.daily_starting_equity = Some(start);
        }

        let starting = state.daily_starting_equity.unwrap_or(equity);
        (starting, equity - starting)
    }

    /// Build a risk snapshot from raw (USD-normalized) account numbers.
    pub fn compute_risk_state(
        &self,
        account_value: f64,
        margin_used: f64,
        maintenance_margin: f64,
        total_exposure: f64,
        now: DateTime<Utc>,
    ) -> RiskState {
        let (starting, daily_pnl) = self.observe_equity(account_value, now);

        let margin_ratio = if maintenance_margin > 0.0 {
            account_value / maintenance_margin
        } else {
            f64::INFINITY
        };

        let daily_drawdown_pct = if starting > 0.0 && daily_pnl < 0.0 {
            -daily_pnl / starting
        } else {
            0.0
        };

        RiskState {
            timestamp: now,
            account_value,
            margin_used,
            maintenance_margin,
            total_exposure,
            margin_ratio,
            daily_pnl,
            daily_starting_equity: starting,
            daily_drawdown_pct,
        }
    }

    // -------------------------------------------------------------------------
    // Hard gates
    // -------------------------------------------------------------------------

    pub fn check_equity_floor(&self, state: &RiskState) -> RiskCheckResult {
        if state.account_value < self.config.min_equity_floor {
            return RiskCheckResult::block(
                "equity_floor",
                format!(
                    "Account value ${:.0} < ${:.0} floor",
                    state.account_value, self.config.min_equity_floor
                ),
            );
        }
        RiskCheckResult::allow("equity_floor", "Equity floor OK")
    }

    pub fn check_liquidation_distance(&self, state: &RiskState) -> RiskCheckResult {
        let min_ratio = self.config.liquidation_distance_min;
        if state.margin_ratio < min_ratio {
            return RiskCheckResult::block(
                "liquidation_distance",
                format!(
                    "Margin ratio {:.2} < {min_ratio} (too close to liquidation)",
                    state.margin_ratio
                ),
            );
        }

        let mut warnings = Vec::new();
        if state.margin_ratio < min_ratio * 1.5 {
            warnings.push(format!(
                "Margin ratio {:.2} approaching limit",
                state.margin_ratio
            ));
        }
        RiskCheckResult::allow_with("liquidation_distance", "Liquidation distance OK", warnings)
    }

    /// Daily drawdown gate. Crossing the threshold trips the kill switch.
    pub fn check_daily_drawdown(&self, state: &RiskState, now: DateTime<Utc>) -> RiskCheckResult {
        let threshold = self.config.daily_drawdown_kill_pct;
        if state.daily_drawdown_pct >= threshold {
            let reason = format!(
                "KILL SWITCH: Daily drawdown {:.1}% >= {:.1}%",
                state.daily_drawdown_pct * 100.0,
                threshold * 100.0
            );
            self.trigger_kill_switch(&reason, now);
            return RiskCheckResult::block("daily_drawdown", reason);
        }

        let mut warnings = Vec::new();
        if state.daily_drawdown_pct >= threshold * 0.5 {
            warnings.push(format!(
                "Daily drawdown {:.1}% at {:.0}% of kill threshold",
                state.daily_drawdown_pct * 100.0,
                state.daily_drawdown_pct / threshold * 100.0
            ));
        }
        RiskCheckResult::allow_with("daily_drawdown", "Daily drawdown OK", warnings)
    }

    pub fn check_position_size(&self, state: &RiskState, proposed_size_usd: f64) -> RiskCheckResult {
        let max_size = state.account_value * self.config.max_position_size_pct;
        if proposed_size_usd > max_size {
            return RiskCheckResult::block(
                "position_size",
                format!(
                    "Position size ${proposed_size_usd:.0} > ${max_size:.0} max ({:.0}% of equity)",
                    self.config.max_position_size_pct * 100.0
                ),
            );
        }
        RiskCheckResult::allow("position_size", "Position size OK")
    }

    pub fn check_total_exposure(
        &self,
        state: &RiskState,
        proposed_additional_exposure: f64,
    ) -> RiskCheckResult {
        let new_exposure = state.total_exposure + proposed_additional_exposure;
        let max_exposure = state.account_value * self.config.max_total_exposure_pct;
        if new_exposure > max_exposure {
            return RiskCheckResult::block(
                "total_exposure",
                format!(
                    "Total exposure ${new_exposure:.0} > ${max_exposure:.0} max ({:.0}% of equity)",
                    self.config.max_total_exposure_pct * 100.0
                ),
            );
        }
        RiskCheckResult::allow("total_exposure", "Total exposure OK")
    }

    /// Full hard-gate pass. The first failing gate is the verdict; warnings
    /// from passing gates accumulate.
    pub fn run_all_checks(
        &self,
        account_value: f64,
        margin_used: f64,
        maintenance_margin: f64,
        total_exposure: f64,
        proposed_size_usd: f64,
        now: DateTime<Utc>,
    ) -> RiskCheckResult {
        let kill = self.check_kill_switch(now);
        if !kill.allowed {
            return kill;
        }

        let state = self.compute_risk_state(
            account_value,
            margin_used,
            maintenance_margin,
            total_exposure,
            now,
        );

        let mut warnings = Vec::new();

        let equity = self.check_equity_floor(&state);
        if !equity.allowed {
            return equity;
        }
        warnings.extend(equity.warnings);

        let liquidation = self.check_liquidation_distance(&state);
        if !liquidation.allowed {
            return liquidation;
        }
        warnings.extend(liquidation.warnings);

        let drawdown = self.check_daily_drawdown(&state, now);
        if !drawdown.allowed {
            return drawdown;
        }
        warnings.extend(drawdown.warnings);

        if proposed_size_usd > 0.0 {
            let size = self.check_position_size(&state, proposed_size_usd);
            if !size.allowed {
                return size;
            }
            warnings.extend(size.warnings);
        }

        let exposure = self.check_total_exposure(&state, proposed_size_usd);
        if !exposure.allowed {
            return exposure;
        }
        warnings.extend(exposure.warnings);

        RiskCheckResult::allow_with("all_checks", "All risk checks passed", warnings)
    }

    // -------------------------------------------------------------------------
    // Circuit breakers
    // -------------------------------------------------------------------------

    pub fn report_api_error(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        state.consecutive_api_errors += 1;
        if state.consecutive_api_errors >= self.config.api_error_threshold {
            let until = now + chrono::Duration::seconds(self.config.api_error_pause_s as i64);
            state.api_pause_until = Some(until);
            warn!(
                errors = state.consecutive_api_errors,
                until = %until,
                "API error pause triggered"
            );
        }
    }

    pub fn report_api_success(&self) {
        self.state.write().consecutive_api_errors = 0;
    }

    pub fn check_api_pause(&self, now: DateTime<Utc>) -> RiskCheckResult {
        let mut state = self.state.write();
        if let Some(until) = state.api_pause_until {
            if now < until {
                let remaining = (until - now).num_seconds();
                return RiskCheckResult::block(
                    "api_pause",
                    format!("API error pause, {remaining}s remaining"),
                );
            }
            state.api_pause_until = None;
            state.consecutive_api_errors = 0;
        }
        RiskCheckResult::allow("api_pause", "No API pause")
    }

    pub fn report_trade_result(&self, is_win: bool, now: DateTime<Utc>) {
        let mut state = self.state.write();
        if is_win {
            state.consecutive_losses = 0;
            return;
        }
        state.consecutive_losses += 1;
        if state.consecutive_losses >= self.config.max_consecutive_losses {
            let until = now + chrono::Duration::seconds(self.config.loss_streak_pause_s as i64);
            state.loss_streak_pause_until = Some(until);
            warn!(
                losses = state.consecutive_losses,
                until = %until,
                "loss streak pause triggered"
            );
        }
    }

    pub fn check_loss_streak_pause(&self, now: DateTime<Utc>) -> RiskCheckResult {
        let mut state = self.state.write();
        if let Some(until) = state.loss_streak_pause_until {
            if now < until {
                let remaining = (until - now).num_seconds();
                return RiskCheckResult::block(
                    "loss_streak",
                    format!(
                        "Loss streak pause ({} losses), {remaining}s remaining",
                        state.consecutive_losses
                    ),
                );
            }
            state.loss_streak_pause_until = None;
            state.consecutive_losses = 0;
        }
        RiskCheckResult::allow("loss_streak", "No loss streak pause")
    }

    pub fn check_concurrent_positions(&self) -> RiskCheckResult {
        let count = self.state.read().position_count;
        let max = self.config.max_concurrent_positions;
        if count >= max {
            return RiskCheckResult::block(
                "concurrent_positions",
                format!("At max concurrent positions ({count}/{max})"),
            );
        }
        let mut warnings = Vec::new();
        if count + 1 >= max {
            warnings.push(format!("Near position limit ({count}/{max})"));
        }
        RiskCheckResult::allow_with("concurrent_positions", "Concurrent positions OK", warnings)
    }

    pub fn check_symbol_position(&self, symbol: &str) -> RiskCheckResult {
        let count = self.symbol_position_count(symbol);
        if count >= self.config.max_position_per_symbol {
            return RiskCheckResult::block(
                "symbol_position",
                format!("Already have position in {symbol}"),
            );
        }
        RiskCheckResult::allow("symbol_position", "Symbol position OK")
    }

    /// All circuit breakers in order: API pause, loss streak, concurrent
    /// positions, per-symbol positions.
    pub fn run_circuit_breaker_checks(&self, symbol: &str, now: DateTime<Utc>) -> RiskCheckResult {
        let api = self.check_api_pause(now);
        if !api.allowed {
            return api;
        }

        let losses = self.check_loss_streak_pause(now);
        if !losses.allowed {
            return losses;
        }

        let mut warnings = Vec::new();
        let concurrent = self.check_concurrent_positions();
        if !concurrent.allowed {
            return concurrent;
        }
        warnings.extend(concurrent.warnings);

        let symbol_check = self.check_symbol_position(symbol);
        if !symbol_check.allowed {
            return symbol_check;
        }

        RiskCheckResult::allow_with("circuit_breakers", "Circuit breaker checks passed", warnings)
    }

    // -------------------------------------------------------------------------
    // Position tracking
    // -------------------------------------------------------------------------

    /// Replace one venue's position counts from its live positions, then
    /// re-aggregate across venues.
    pub fn update_positions_for_exchange(&self, exchange: &str, positions: &[Position]) {
        let mut by_symbol: HashMap<String, usize> = HashMap::new();
        for position in positions {
            if position.size.abs() > 0.0 {
                *by_symbol.entry(position.symbol.to_uppercase()).or_default() += 1;
            }
        }

        let mut state = self.state.write();
        state
            .positions_by_exchange
            .insert(exchange.to_string(), by_symbol);

        let mut aggregated: HashMap<String, usize> = HashMap::new();
        for venue_positions in state.positions_by_exchange.values() {
            for (symbol, count) in venue_positions {
                *aggregated.entry(symbol.clone()).or_default() += count;
            }
        }
        state.position_count = aggregated.values().sum();
        state.positions_by_symbol = aggregated;
    }

    /// Incremental adjustment for freshly opened/closed positions between
    /// account-state refreshes.
    pub fn adjust_position_count(&self, symbol: &str, delta: i64) {
        let mut state = self.state.write();
        let count = state.position_count as i64 + delta;
        state.position_count = count.max(0) as usize;

        let entry = state
            .positions_by_symbol
            .entry(symbol.to_uppercase())
            .or_default();
        let adjusted = *entry as i64 + delta;
        *entry = adjusted.max(0) as usize;
    }

    pub fn position_count(&self) -> usize {
        self.state.read().position_count
    }

    pub fn symbol_position_count(&self, symbol: &str) -> usize {
        self.state
            .read()
            .positions_by_symbol
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for RiskGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("RiskGovernor")
            .field("kill_switch_active", &state.kill_switch_active)
            .field("position_count", &state.position_count)
            .field("consecutive_losses", &state.consecutive_losses)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;
    use chrono::Duration;

    fn governor() -> RiskGovernor {
        RiskGovernor::new(RiskConfig::default(), None)
    }

    fn position(symbol: &str, size: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            direction: Direction::Long,
            size,
            entry_price: 100.0,
            mark_price: 100.0,
            liquidation_price: None,
            unrealized_pnl: 0.0,
            leverage: 1,
            margin_used: 0.0,
        }
    }

    /// Scenario: $100k at the UTC open, $94k now. 6% drawdown trips the
    /// kill switch; even a healthy trade is then blocked for the cooldown
    /// with a reason beginning "KILL SWITCH".
    #[test]
    fn drawdown_trips_kill_switch_for_cooldown() {
        let gov = governor();
        let t0 = Utc::now();

        // First observation of the day pins starting equity.
        gov.observe_equity(100_000.0, t0);

        let result = gov.run_all_checks(94_000.0, 1_000.0, 100.0, 0.0, 0.0, t0);
        assert!(!result.allowed);
        assert!(result.reason.starts_with("KILL SWITCH"));

        // A healthy proposal is still blocked.
        let blocked = gov.run_all_checks(100_000.0, 0.0, 0.0, 0.0, 5_000.0, t0);
        assert!(!blocked.allowed);
        assert!(blocked.reason.starts_with("KILL SWITCH"));
        assert!(gov.is_kill_switch_active(t0));

        // Still blocked 23h later; auto-clears after the 24h cooldown.
        assert!(gov.is_kill_switch_active(t0 + Duration::hours(23)));
        let after = gov.check_kill_switch(t0 + Duration::hours(25));
        assert!(after.allowed);
        assert!(!gov.is_kill_switch_active(t0 + Duration::hours(25)));
    }

    #[test]
    fn equity_floor_blocks_small_accounts() {
        let gov = governor();
        let result = gov.run_all_checks(5_000.0, 0.0, 0.0, 0.0, 0.0, Utc::now());
        assert!(!result.allowed);
        assert_eq!(result.name, "equity_floor");
        assert!(result.reason.contains("floor"));
    }

    #[test]
    fn liquidation_distance_blocks_thin_margin() {
        let gov = governor();
        // ratio = 100k / 80k = 1.25 < 1.5
        let state = gov.compute_risk_state(100_000.0, 90_000.0, 80_000.0, 0.0, Utc::now());
        let result = gov.check_liquidation_distance(&state);
        assert!(!result.allowed);

        // 1.5..2.25 passes with a warning.
        let state = gov.compute_risk_state(100_000.0, 60_000.0, 50_000.0, 0.0, Utc::now());
        let result = gov.check_liquidation_distance(&state);
        assert!(result.allowed);
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn position_size_and_exposure_caps() {
        let gov = governor();
        let now = Utc::now();
        let state = gov.compute_risk_state(100_000.0, 0.0, 0.0, 45_000.0, now);

        // 10% cap on a single position.
        assert!(gov.check_position_size(&state, 9_000.0).allowed);
        assert!(!gov.check_position_size(&state, 11_000.0).allowed);

        // 50% cap on total exposure: 45k existing + 6k proposed > 50k.
        assert!(!gov.check_total_exposure(&state, 6_000.0).allowed);
        assert!(gov.check_total_exposure(&state, 4_000.0).allowed);
    }

    #[test]
    fn ordering_reports_first_failure() {
        let gov = governor();
        // Below floor AND thin margin: the floor reports first.
        let result = gov.run_all_checks(5_000.0, 4_900.0, 4_000.0, 0.0, 0.0, Utc::now());
        assert_eq!(result.name, "equity_floor");
    }

    #[test]
    fn concurrent_position_breaker() {
        let gov = governor();
        gov.update_positions_for_exchange(
            "hyperliquid",
            &[position("BTC", 1.0), position("ETH", 1.0)],
        );
        gov.update_positions_for_exchange("bybit", &[position("SOL", 1.0)]);
        assert_eq!(gov.position_count(), 3);

        let result = gov.run_circuit_breaker_checks("DOGE", Utc::now());
        assert!(!result.allowed);
        assert_eq!(result.name, "concurrent_positions");
    }

    #[test]
    fn adjust_position_count_clamps_at_zero() {
        let gov = governor();
        gov.adjust_position_count("BTC", 1);
        assert_eq!(gov.position_count(), 1);
        assert_eq!(gov.symbol_position_count("btc"), 1);
        gov.adjust_position_count("BTC", -3);
        assert_eq!(gov.position_count(), 0);
        assert_eq!(gov.symbol_position_count("BTC"), 0);
    }

    #[test]
    fn per_symbol_breaker_blocks_duplicates() {
        let gov = governor();
        gov.update_positions_for_exchange("hyperliquid", &[position("BTC", 1.0)]);
        let result = gov.run_circuit_breaker_checks("BTC", Utc::now());
        assert!(!result.allowed);
        assert_eq!(result.name, "symbol_position");

        assert!(gov.run_circuit_breaker_checks("ETH", Utc::now()).allowed);
    }

    #[test]
    fn api_error_streak_pauses_and_recovers() {
        let gov = governor();
        let now = Utc::now();
        for _ in 0..3 {
            gov.report_api_error(now);
        }
        let paused = gov.check_api_pause(now);
        assert!(!paused.allowed);
        assert!(paused.reason.contains("API error pause"));

        // Pause expires after the configured window.
        let later = now + Duration::seconds(301);
        assert!(gov.check_api_pause(later).allowed);

        // Success resets the counter.
        gov.report_api_error(later);
        gov.report_api_success();
        assert!(gov.check_api_pause(later).allowed);
    }

    #[test]
    fn loss_streak_pauses() {
        let gov = governor();
        let now = Utc::now();
        for _ in 0..5 {
            gov.report_trade_result(false, now);
        }
        let paused = gov.check_loss_streak_pause(now);
        assert!(!paused.allowed);

        assert!(gov.check_loss_streak_pause(now + Duration::seconds(3_601)).allowed);

        // A win resets the streak.
        gov.report_trade_result(false, now);
        gov.report_trade_result(true, now);
        for _ in 0..4 {
            gov.report_trade_result(false, now);
        }
        assert!(gov.check_loss_streak_pause(now).allowed);
    }

    #[test]
    fn daily_starting_equity_pins_first_observation() {
        let gov = governor();
        let t0 = Utc::now();
        let (start, pnl) = gov.observe_equity(100_000.0, t0);
        assert_eq!(start, 100_000.0);
        assert_eq!(pnl, 0.0);

        let (start, pnl) = gov.observe_equity(97_000.0, t0 + Duration::minutes(5));
        assert_eq!(start, 100_000.0);
        assert_eq!(pnl, -3_000.0);

        // New UTC date resets the baseline.
        let (start, _) = gov.observe_equity(97_000.0, t0 + Duration::days(2));
        assert_eq!(start, 97_000.0);
    }

    #[test]
    fn kill_switch_state_persists_and_restores() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let now = Utc::now();
        {
            let gov = RiskGovernor::new(RiskConfig::default(), Some(Arc::clone(&store)));
            gov.trigger_kill_switch("test", now);
        }
        let restored = RiskGovernor::new(RiskConfig::default(), Some(store));
        restored.load_state();
        assert!(restored.is_kill_switch_active(now));
    }
}
