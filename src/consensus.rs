// =============================================================================
// Consensus detection — one vote per trader, gated to a tradeable signal
// =============================================================================
//
// Sliding windows per asset collect fills from the alpha pool. On every fill
// the window is collapsed to one vote per trader and run through the gates,
// in this order:
//
//   1. min_traders       enough distinct voters
//   2. supermajority     majority count and fraction thresholds
//   3. effective_k       correlation-adjusted independent-trader count
//   4. freshness         oldest agreeing vote within window × factor
//   5. price_band        current mid near the median voter entry
//   6. atr_validity      stop distance backed by fresh volatility data
//   7. ev_gate           best per-venue net EV above the floor
//
// A failing gate short-circuits: later gates are not evaluated, no signal is
// emitted, and the evaluation records every gate computed so far. On a pass
// the window is cleared and the signal carries the chosen venue plus its
// cost breakdown.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ConsensusConfig;
use crate::decision_log::GateResult;
use crate::exchanges::ExchangeType;
use crate::types::{Direction, Fill};

/// EV defaults used until per-trader posteriors say otherwise.
pub const DEFAULT_AVG_WIN_R: f64 = 0.5;
pub const DEFAULT_AVG_LOSS_R: f64 = 0.3;

/// Stop fraction when no ATR-driven distance is available.
pub const DEFAULT_STOP_FRACTION: f64 = 0.02;

// ---------------------------------------------------------------------------
// Votes and windows
// ---------------------------------------------------------------------------

/// One trader's net contribution to a consensus window.
#[derive(Debug, Clone, PartialEq)]
pub struct Vote {
    pub address: String,
    pub direction: Direction,
    /// min(|net delta| / cap, 1.0)
    pub weight: f64,
    /// Size-weighted average price of the trader's fills.
    pub price: f64,
    /// Latest fill timestamp.
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Window {
    started_at: DateTime<Utc>,
    window_s: u64,
    fills: Vec<Fill>,
}

impl Window {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.started_at).num_seconds() > self.window_s as i64
    }
}

// ---------------------------------------------------------------------------
// Costs and EV
// ---------------------------------------------------------------------------

/// Per-venue execution cost components, all in bps of notional.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub fees_bps: f64,
    pub slippage_bps: f64,
    /// Signed: positive is paid, negative is received.
    pub funding_bps: f64,
    pub hold_hours: f64,
}

impl CostBreakdown {
    pub fn total_bps(&self) -> f64 {
        self.fees_bps + self.slippage_bps + self.funding_bps
    }
}

/// A venue together with its quoted costs for this signal.
#[derive(Debug, Clone, Copy)]
pub struct VenueQuote {
    pub exchange: ExchangeType,
    pub costs: CostBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvResult {
    pub gross_r: f64,
    pub cost_r: f64,
    pub net_r: f64,
}

/// Convert a bps cost to R-units against the stop distance.
pub fn bps_to_r(entry_px: f64, stop_px: f64, bps: f64) -> f64 {
    if entry_px <= 0.0 {
        return 0.0;
    }
    let stop_bps = (entry_px - stop_px).abs() / entry_px * 10_000.0;
    bps / stop_bps.max(1.0)
}

/// Expected value per trade in R-multiples, net of venue costs.
pub fn calculate_ev(
    p_win: f64,
    entry_px: f64,
    stop_px: f64,
    avg_win_r: f64,
    avg_loss_r: f64,
    total_cost_bps: f64,
) -> EvResult {
    let gross_r = p_win * avg_win_r - (1.0 - p_win) * avg_loss_r.abs();
    let cost_r = bps_to_r(entry_px, stop_px, total_cost_bps);
    EvResult {
        gross_r,
        cost_r,
        net_r: gross_r - cost_r,
    }
}

/// Compare net EV across venues and pick the best. Returns None only for an
/// empty venue list; otherwise ties and losses still name a venue (callers
/// gate on the EV floor separately).
pub fn select_best_venue(
    p_win: f64,
    entry_px: f64,
    stop_px: f64,
    avg_win_r: f64,
    avg_loss_r: f64,
    venues: &[VenueQuote],
) -> Option<(ExchangeType, EvResult, CostBreakdown)> {
    let mut best: Option<(ExchangeType, EvResult, CostBreakdown)> = None;
    for quote in venues {
        let ev = calculate_ev(
            p_win,
            entry_px,
            stop_px,
            avg_win_r,
            avg_loss_r,
            quote.costs.total_bps(),
        );
        let better = match &best {
            Some((_, best_ev, _)) => ev.net_r > best_ev.net_r,
            None => true,
        };
        if better {
            best = Some((quote.exchange, ev, quote.costs));
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Output of a passing consensus evaluation. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSignal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Median of agreeing voters' prices.
    pub entry_price: f64,
    pub stop_price: f64,
    pub stop_distance_pct: f64,
    pub n_traders: u32,
    pub n_agreeing: u32,
    pub eff_k: f64,
    pub dispersion: f64,
    pub p_win: f64,
    pub ev_gross_r: f64,
    pub ev_cost_r: f64,
    pub ev_net_r: f64,
    pub latency_ms: i64,
    pub mid_delta_bps: f64,
    pub created_at: DateTime<Utc>,
    pub trigger_addresses: Vec<String>,
    pub target_exchange: ExchangeType,
    pub costs: CostBreakdown,
}

/// One consensus evaluation: the gate trail plus the signal when all passed.
#[derive(Debug, Clone)]
pub struct ConsensusEvaluation {
    pub symbol: String,
    pub direction: Option<Direction>,
    pub trader_count: u32,
    pub agreement_pct: f64,
    pub effective_k: f64,
    pub p_win: Option<f64>,
    pub ev_net_r: Option<f64>,
    pub price: Option<f64>,
    pub gates: Vec<GateResult>,
    pub signal: Option<ConsensusSignal>,
}

impl ConsensusEvaluation {
    pub fn decision_type(&self) -> &'static str {
        if self.signal.is_some() {
            "signal"
        } else {
            "skip"
        }
    }
}

/// External inputs one evaluation needs: the stop distance, data-quality
/// verdict, and per-venue cost quotes, all resolved by the caller before the
/// synchronous gate walk.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    /// ATR-driven stop fraction (already regime-multiplied); None falls back
    /// to the default.
    pub stop_fraction: Option<f64>,
    /// Strict-mode data-quality block from the ATR layer.
    pub atr_block_reason: Option<String>,
    /// Funding in each quote is priced for the LONG side; a short majority
    /// flips its sign during the EV comparison.
    pub venues: Vec<VenueQuote>,
    pub avg_win_r: f64,
    pub avg_loss_r: f64,
    pub now: DateTime<Utc>,
}

impl EvaluationContext {
    pub fn basic(venues: Vec<VenueQuote>) -> Self {
        Self {
            stop_fraction: None,
            atr_block_reason: None,
            venues,
            avg_win_r: DEFAULT_AVG_WIN_R,
            avg_loss_r: DEFAULT_AVG_LOSS_R,
            now: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Collapse a window's fills to at most one vote per trader. Zero-net
/// traders drop out; order of fills does not matter.
pub fn collapse_to_votes(fills: &[Fill], weight_cap: f64) -> Vec<Vote> {
    let mut by_trader: HashMap<String, Vec<&Fill>> = HashMap::new();
    for fill in fills {
        by_trader
            .entry(fill.address.to_lowercase())
            .or_default()
            .push(fill);
    }

    let mut votes = Vec::with_capacity(by_trader.len());
    for (address, trader_fills) in by_trader {
        let net_delta: f64 = trader_fills.iter().map(|f| f.signed_size()).sum();
        if net_delta.abs() < 1e-9 {
            continue;
        }

        let direction = if net_delta > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        let weight = (net_delta.abs() / weight_cap).min(1.0);

        let total_size: f64 = trader_fills.iter().map(|f| f.size.abs()).sum();
        let price = if total_size > 0.0 {
            trader_fills
                .iter()
                .map(|f| f.price * f.size.abs())
                .sum::<f64>()
                / total_size
        } else {
            trader_fills.last().map(|f| f.price).unwrap_or(0.0)
        };

        let ts = trader_fills
            .iter()
            .map(|f| f.ts)
            .max()
            .unwrap_or_else(Utc::now);

        votes.push(Vote {
            address,
            direction,
            weight,
            price,
            ts,
        });
    }

    // Deterministic ordering for downstream math.
    votes.sort_by(|a, b| a.address.cmp(&b.address));
    votes
}

/// effK = (Σ wᵢ)² / Σᵢ Σⱼ wᵢ wⱼ ρᵢⱼ with ρᵢᵢ = 1 and pair ρ from `rho`.
pub fn effective_k<F>(votes: &[Vote], rho: F) -> f64
where
    F: Fn(&str, &str) -> f64,
{
    if votes.len() <= 1 {
        return votes.len() as f64;
    }

    let num: f64 = votes.iter().map(|v| v.weight).sum::<f64>().powi(2);
    let mut den = 0.0;
    for a in votes {
        for b in votes {
            let pair_rho = if a.address == b.address {
                1.0
            } else {
                rho(&a.address, &b.address).clamp(0.0, 1.0)
            };
            den += a.weight * b.weight * pair_rho;
        }
    }
    num / den.max(1e-9)
}

/// Median of a value set (average of middles for even counts).
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// Window duration as a function of the volatility percentile: quick windows
/// in quiet markets, longer gathering when ranges widen. Clamped to
/// [60, 360] seconds.
pub fn adaptive_window_seconds(base_window_s: u64, atr_percentile: f64) -> u64 {
    const LO: u64 = 60;
    const HI: u64 = 360;
    if atr_percentile < 0.3 {
        base_window_s.max(LO)
    } else if atr_percentile < 0.7 {
        (base_window_s * 2).min(HI)
    } else {
        (base_window_s * 3).min(HI)
    }
}

/// Calibrated win probability from agreement strength and diversity.
pub fn calibrated_p_win(total_weight: f64, eff_k: f64) -> f64 {
    let k_bonus = ((eff_k - 1.0) * 0.05).min(0.15);
    let weight_bonus = (total_weight * 0.02).min(0.10);
    (0.5 + k_bonus + weight_bonus).clamp(0.30, 0.80)
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct ConsensusDetector {
    config: ConsensusConfig,
    windows: RwLock<HashMap<String, Window>>,
    correlation_matrix: RwLock<HashMap<(String, String), f64>>,
    default_rho: RwLock<f64>,
    current_prices: RwLock<HashMap<String, f64>>,
}

impl ConsensusDetector {
    pub fn new(config: ConsensusConfig) -> Self {
        let default_rho = 0.3;
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
            correlation_matrix: RwLock::new(HashMap::new()),
            default_rho: RwLock::new(default_rho),
            current_prices: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_current_price(&self, symbol: &str, price: f64) {
        self.current_prices
            .write()
            .insert(symbol.to_uppercase(), price);
    }

    pub fn current_mid(&self, symbol: &str) -> f64 {
        self.current_prices
            .read()
            .get(&symbol.to_uppercase())
            .copied()
            .unwrap_or(0.0)
    }

    /// Store a pairwise correlation under its sorted lowercase key.
    pub fn update_correlation(&self, addr_a: &str, addr_b: &str, rho: f64) {
        let key = crate::correlation::pair_key(addr_a, addr_b);
        self.correlation_matrix
            .write()
            .insert(key, rho.clamp(0.0, 1.0));
    }

    /// Default ρ for pairs the matrix does not cover (venue-aware, set at
    /// hydration time).
    pub fn set_default_rho(&self, rho: f64) {
        *self.default_rho.write() = rho;
    }

    fn rho(&self, addr_a: &str, addr_b: &str) -> f64 {
        let key = crate::correlation::pair_key(addr_a, addr_b);
        self.correlation_matrix
            .read()
            .get(&key)
            .copied()
            .unwrap_or(*self.default_rho.read())
    }

    /// Ingest one fill: window it, refresh the cached mid, and evaluate.
    /// Returns None for untracked symbols or a still-empty evaluation.
    pub fn process_fill(
        &self,
        fill: &Fill,
        atr_percentile: f64,
        ctx: &EvaluationContext,
    ) -> Option<ConsensusEvaluation> {
        let symbol = fill.asset.to_uppercase();
        if !self.config.symbols.iter().any(|s| s.eq_ignore_ascii_case(&symbol)) {
            return None;
        }

        let window_s = adaptive_window_seconds(self.config.base_window_s, atr_percentile);
        {
            let mut windows = self.windows.write();
            let needs_new = windows
                .get(&symbol)
                .map(|w| w.is_expired(ctx.now))
                .unwrap_or(true);
            if needs_new {
                windows.insert(
                    symbol.clone(),
                    Window {
                        started_at: ctx.now,
                        window_s,
                        fills: Vec::new(),
                    },
                );
            }
            if let Some(window) = windows.get_mut(&symbol) {
                window.fills.push(fill.clone());
            }
        }

        self.set_current_price(&symbol, fill.price);
        self.check_consensus(&symbol, ctx)
    }

    /// Run the full gate sequence against the current window.
    pub fn check_consensus(
        &self,
        symbol: &str,
        ctx: &EvaluationContext,
    ) -> Option<ConsensusEvaluation> {
        let symbol = symbol.to_uppercase();
        let (fills, window_s) = {
            let windows = self.windows.read();
            let window = windows.get(&symbol)?;
            if window.fills.is_empty() {
                return None;
            }
            (window.fills.clone(), window.window_s)
        };

        let votes = collapse_to_votes(&fills, self.config.weight_cap);
        if votes.is_empty() {
            return None;
        }

        let mut gates: Vec<GateResult> = Vec::new();
        let n = votes.len();

        // Gate 1: enough distinct traders.
        let min_traders_pass = n >= self.config.min_traders;
        gates.push(GateResult::new(
            "min_traders",
            min_traders_pass,
            n as f64,
            self.config.min_traders as f64,
        ));
        if !min_traders_pass {
            return Some(self.skip(&symbol, &votes, 0.0, 0.0, gates));
        }

        // Gate 2: supermajority. Tie breaks long.
        let long_count = votes
            .iter()
            .filter(|v| v.direction == Direction::Long)
            .count();
        let short_count = n - long_count;
        let (majority_dir, majority_count) = if long_count >= short_count {
            (Direction::Long, long_count)
        } else {
            (Direction::Short, short_count)
        };
        let agreement_pct = majority_count as f64 / n as f64;
        let supermajority_pass =
            majority_count >= self.config.min_agreeing && agreement_pct >= self.config.min_pct;
        gates.push(
            GateResult::new(
                "supermajority",
                supermajority_pass,
                agreement_pct,
                self.config.min_pct,
            )
            .with_detail(format!("{majority_count}/{n} {majority_dir}")),
        );
        if !supermajority_pass {
            return Some(self.skip(&symbol, &votes, agreement_pct, 0.0, gates));
        }

        let agreeing: Vec<Vote> = votes
            .iter()
            .filter(|v| v.direction == majority_dir)
            .cloned()
            .collect();

        // Gate 3: correlation-adjusted effective K.
        let eff_k = effective_k(&agreeing, |a, b| self.rho(a, b));
        let eff_k_pass = eff_k >= self.config.min_effective_k;
        gates.push(GateResult::new(
            "effective_k",
            eff_k_pass,
            eff_k,
            self.config.min_effective_k,
        ));
        if !eff_k_pass {
            return Some(self.skip(&symbol, &votes, agreement_pct, eff_k, gates));
        }

        // Gate 4: freshness of the oldest agreeing vote.
        let oldest_ts = agreeing
            .iter()
            .map(|v| v.ts)
            .min()
            .unwrap_or(ctx.now);
        let staleness_s = (ctx.now - oldest_ts).num_milliseconds() as f64 / 1_000.0;
        let max_staleness = window_s as f64 * self.config.max_staleness_factor;
        let fresh = staleness_s <= max_staleness;
        gates.push(GateResult::new(
            "freshness",
            fresh,
            staleness_s,
            max_staleness,
        ));
        if !fresh {
            return Some(self.skip(&symbol, &votes, agreement_pct, eff_k, gates));
        }

        // Gate 5: price band between current mid and median voter entry.
        let median_entry = median(&agreeing.iter().map(|v| v.price).collect::<Vec<_>>());
        let mid_price = self.current_mid(&symbol);
        let band_bps = if median_entry > 0.0 && mid_price > 0.0 {
            (mid_price - median_entry).abs() / median_entry * 10_000.0
        } else {
            f64::INFINITY
        };
        let band_pass = band_bps <= self.config.max_price_band_bps;
        gates.push(GateResult::new(
            "price_band",
            band_pass,
            band_bps,
            self.config.max_price_band_bps,
        ));
        if !band_pass {
            return Some(self.skip(&symbol, &votes, agreement_pct, eff_k, gates));
        }

        // Gate 6: volatility data quality.
        let atr_valid = ctx.atr_block_reason.is_none();
        gates.push(
            GateResult::new("atr_validity", atr_valid, if atr_valid { 1.0 } else { 0.0 }, 1.0)
                .with_detail(ctx.atr_block_reason.clone().unwrap_or_default()),
        );
        if !atr_valid {
            return Some(self.skip(&symbol, &votes, agreement_pct, eff_k, gates));
        }

        // Stop price from the supplied fraction.
        let stop_fraction = ctx.stop_fraction.unwrap_or(DEFAULT_STOP_FRACTION);
        let stop_price = match majority_dir {
            Direction::Long => median_entry * (1.0 - stop_fraction),
            Direction::Short => median_entry * (1.0 + stop_fraction),
        };

        // Gate 7: per-venue EV comparison against the floor. Quotes price
        // funding for the long side; a short majority receives what longs
        // pay and vice versa.
        let total_weight: f64 = agreeing.iter().map(|v| v.weight).sum();
        let p_win = calibrated_p_win(total_weight, eff_k);

        let directed_venues: Vec<VenueQuote> = ctx
            .venues
            .iter()
            .map(|quote| {
                let mut costs = quote.costs;
                if majority_dir == Direction::Short {
                    costs.funding_bps = -costs.funding_bps;
                }
                VenueQuote {
                    exchange: quote.exchange,
                    costs,
                }
            })
            .collect();

        let Some((target_exchange, ev, costs)) = select_best_venue(
            p_win,
            median_entry,
            stop_price,
            ctx.avg_win_r,
            ctx.avg_loss_r,
            &directed_venues,
        ) else {
            gates.push(
                GateResult::new("ev_gate", false, 0.0, self.config.min_ev_r)
                    .with_detail("no venues quoted".to_string()),
            );
            return Some(self.skip(&symbol, &votes, agreement_pct, eff_k, gates));
        };

        let ev_pass = ev.net_r >= self.config.min_ev_r;
        gates.push(
            GateResult::new("ev_gate", ev_pass, ev.net_r, self.config.min_ev_r)
                .with_detail(format!("best venue {target_exchange}")),
        );
        if !ev_pass {
            let mut eval = self.skip(&symbol, &votes, agreement_pct, eff_k, gates);
            eval.p_win = Some(p_win);
            eval.ev_net_r = Some(ev.net_r);
            return Some(eval);
        }

        // All gates passed: build the signal and clear the window.
        let dispersion = stdev(
            &votes
                .iter()
                .map(|v| v.direction.sign() * v.weight)
                .collect::<Vec<_>>(),
        );
        let latency_ms = (ctx.now - oldest_ts).num_milliseconds();
        let mid_delta_bps = if median_entry > 0.0 {
            (mid_price - median_entry).abs() / median_entry * 10_000.0
        } else {
            0.0
        };

        let signal = ConsensusSignal {
            id: Uuid::new_v4().to_string(),
            symbol: symbol.clone(),
            direction: majority_dir,
            entry_price: median_entry,
            stop_price,
            stop_distance_pct: stop_fraction,
            n_traders: n as u32,
            n_agreeing: agreeing.len() as u32,
            eff_k,
            dispersion,
            p_win,
            ev_gross_r: ev.gross_r,
            ev_cost_r: ev.cost_r,
            ev_net_r: ev.net_r,
            latency_ms,
            mid_delta_bps,
            created_at: ctx.now,
            trigger_addresses: agreeing.iter().map(|v| v.address.clone()).collect(),
            target_exchange,
            costs,
        };

        info!(
            symbol = %signal.symbol,
            direction = %signal.direction,
            eff_k = signal.eff_k,
            p_win = signal.p_win,
            ev_net_r = signal.ev_net_r,
            venue = %signal.target_exchange,
            "consensus signal emitted"
        );

        self.windows.write().remove(&symbol);

        Some(ConsensusEvaluation {
            symbol,
            direction: Some(majority_dir),
            trader_count: n as u32,
            agreement_pct,
            effective_k: eff_k,
            p_win: Some(p_win),
            ev_net_r: Some(ev.net_r),
            price: Some(mid_price),
            gates,
            signal: Some(signal),
        })
    }

    fn skip(
        &self,
        symbol: &str,
        votes: &[Vote],
        agreement_pct: f64,
        eff_k: f64,
        gates: Vec<GateResult>,
    ) -> ConsensusEvaluation {
        debug!(
            symbol,
            traders = votes.len(),
            failed_gate = gates.iter().find(|g| !g.passed).map(|g| g.name.as_str()),
            "consensus skip"
        );
        let majority_dir = (!votes.is_empty()).then(|| {
            let longs = votes
                .iter()
                .filter(|v| v.direction == Direction::Long)
                .count();
            if longs * 2 >= votes.len() {
                Direction::Long
            } else {
                Direction::Short
            }
        });

        ConsensusEvaluation {
            symbol: symbol.to_string(),
            direction: majority_dir,
            trader_count: votes.len() as u32,
            agreement_pct,
            effective_k: eff_k,
            p_win: None,
            ev_net_r: None,
            price: Some(self.current_mid(symbol)),
            gates,
            signal: None,
        }
    }

    /// Drop the window for a symbol (used after manual intervention).
    pub fn clear_window(&self, symbol: &str) {
        self.windows.write().remove(&symbol.to_uppercase());
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn fill(address: &str, direction: Direction, size: f64, price: f64, age_s: i64) -> Fill {
        Fill {
            fill_id: format!("{address}-{price}-{size}"),
            address: address.to_string(),
            asset: "BTC".to_string(),
            direction,
            size,
            price,
            ts: Utc::now() - Duration::seconds(age_s),
        }
    }

    fn detector() -> ConsensusDetector {
        ConsensusDetector::new(ConsensusConfig::default())
    }

    fn quote(exchange: ExchangeType, fees: f64, slip: f64, funding: f64) -> VenueQuote {
        VenueQuote {
            exchange,
            costs: CostBreakdown {
                fees_bps: fees,
                slippage_bps: slip,
                funding_bps: funding,
                hold_hours: 24.0,
            },
        }
    }

    // -- vote collapse --------------------------------------------------------

    #[test]
    fn vote_count_bounded_by_distinct_traders() {
        let fills = vec![
            fill("0xA", Direction::Long, 1.0, 100.0, 10),
            fill("0xa", Direction::Long, 2.0, 101.0, 5),
            fill("0xB", Direction::Short, 1.0, 100.0, 8),
        ];
        let votes = collapse_to_votes(&fills, 1.0);
        assert_eq!(votes.len(), 2);
    }

    #[test]
    fn collapse_is_order_independent() {
        let mut fills = vec![
            fill("0xa", Direction::Long, 1.0, 100.0, 10),
            fill("0xa", Direction::Short, 0.4, 102.0, 5),
            fill("0xb", Direction::Short, 2.0, 101.0, 8),
        ];
        let votes_fwd = collapse_to_votes(&fills, 1.0);
        fills.reverse();
        let votes_rev = collapse_to_votes(&fills, 1.0);
        assert_eq!(votes_fwd, votes_rev);
    }

    #[test]
    fn zero_net_traders_never_vote() {
        let fills = vec![
            fill("0xa", Direction::Long, 1.0, 100.0, 10),
            fill("0xa", Direction::Short, 1.0, 101.0, 5),
            fill("0xb", Direction::Long, 0.5, 100.0, 8),
        ];
        let votes = collapse_to_votes(&fills, 1.0);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].address, "0xb");
    }

    #[test]
    fn vote_price_is_size_weighted_and_ts_is_latest() {
        let t0 = Utc::now() - Duration::seconds(30);
        let mut f1 = fill("0xa", Direction::Long, 1.0, 100.0, 0);
        f1.ts = t0;
        let mut f2 = fill("0xa", Direction::Long, 3.0, 104.0, 0);
        f2.ts = t0 + Duration::seconds(10);

        let votes = collapse_to_votes(&[f1, f2], 10.0);
        assert_eq!(votes.len(), 1);
        assert!((votes[0].price - 103.0).abs() < 1e-9);
        assert_eq!(votes[0].ts, t0 + Duration::seconds(10));
        assert!((votes[0].weight - 0.4).abs() < 1e-9);
    }

    #[test]
    fn vote_weight_caps_at_one() {
        let fills = vec![fill("0xa", Direction::Long, 50.0, 100.0, 5)];
        let votes = collapse_to_votes(&fills, 1.0);
        assert_eq!(votes[0].weight, 1.0);
    }

    // -- effective K ----------------------------------------------------------

    fn uniform_votes(n: usize) -> Vec<Vote> {
        (0..n)
            .map(|i| Vote {
                address: format!("0x{i}"),
                direction: Direction::Long,
                weight: 1.0,
                price: 100.0,
                ts: Utc::now(),
            })
            .collect()
    }

    #[test]
    fn eff_k_uniform_rho_formula() {
        // n / (1 + (n-1)ρ) at n = 3.
        for (rho, expected) in [(0.0, 3.0), (0.3, 1.875), (0.5, 1.5), (1.0, 1.0)] {
            let eff = effective_k(&uniform_votes(3), |_, _| rho);
            assert!(
                (eff - expected).abs() < 1e-9,
                "rho={rho}: expected {expected}, got {eff}"
            );
        }
    }

    #[test]
    fn eff_k_bounds() {
        let votes = uniform_votes(5);
        let independent = effective_k(&votes, |_, _| 0.0);
        let identical = effective_k(&votes, |_, _| 1.0);
        let mixed = effective_k(&votes, |_, _| 0.4);

        assert!((independent - 5.0).abs() < 1e-9);
        assert!((identical - 1.0).abs() < 1e-9);
        assert!(mixed > 1.0 && mixed < 5.0);
    }

    #[test]
    fn eff_k_single_vote() {
        assert_eq!(effective_k(&uniform_votes(1), |_, _| 0.3), 1.0);
        assert_eq!(effective_k(&[], |_, _| 0.3), 0.0);
    }

    #[test]
    fn eff_k_clips_negative_rho() {
        // Anti-correlated traders count as independent, never diversifying.
        let eff = effective_k(&uniform_votes(3), |_, _| -0.8);
        assert!((eff - 3.0).abs() < 1e-9);
    }

    // -- EV and venue selection ----------------------------------------------

    #[test]
    fn ev_cost_conversion_uses_stop_distance() {
        // stop 1% = 100 bps; 10 bps cost = 0.1 R.
        let ev = calculate_ev(0.52, 100.0, 99.0, 1.0, 1.0, 10.0);
        assert!((ev.cost_r - 0.1).abs() < 1e-9);
        assert!((ev.gross_r - 0.04).abs() < 1e-9);
        assert!((ev.net_r - (-0.06)).abs() < 1e-9);
    }

    #[test]
    fn ev_non_increasing_in_fees() {
        let mut last_net = f64::INFINITY;
        for fees in [0.0, 5.0, 10.0, 20.0] {
            let ev = calculate_ev(0.6, 100_000.0, 99_000.0, 1.0, 1.0, fees);
            assert!(ev.net_r <= last_net);
            last_net = ev.net_r;
        }
    }

    #[test]
    fn venue_with_lower_total_cost_wins() {
        let venues = vec![
            quote(ExchangeType::Hyperliquid, 10.0, 2.0, 5.0),
            quote(ExchangeType::Bybit, 12.0, 2.0, -8.0),
        ];
        let (best, _, costs) =
            select_best_venue(0.6, 100_000.0, 99_000.0, 0.5, 0.3, &venues).unwrap();
        assert_eq!(best, ExchangeType::Bybit);
        assert!((costs.fees_bps - 12.0).abs() < 1e-9);
        assert!((costs.funding_bps + 8.0).abs() < 1e-9);
    }

    #[test]
    fn funding_rebate_beats_identical_costs() {
        let venues = vec![
            quote(ExchangeType::Hyperliquid, 10.0, 2.0, 3.0),
            quote(ExchangeType::Bybit, 10.0, 2.0, -3.0),
        ];
        let (best, _, _) = select_best_venue(0.6, 100_000.0, 99_000.0, 0.5, 0.3, &venues).unwrap();
        assert_eq!(best, ExchangeType::Bybit);
    }

    #[test]
    fn empty_venue_list_selects_nothing() {
        assert!(select_best_venue(0.6, 100.0, 99.0, 0.5, 0.3, &[]).is_none());
    }

    // -- adaptive window ------------------------------------------------------

    #[test]
    fn adaptive_window_tiers_and_clamps() {
        assert_eq!(adaptive_window_seconds(120, 0.1), 120);
        assert_eq!(adaptive_window_seconds(120, 0.5), 240);
        assert_eq!(adaptive_window_seconds(120, 0.9), 360);
        // Clamped to [60, 360].
        assert_eq!(adaptive_window_seconds(10, 0.1), 60);
        assert_eq!(adaptive_window_seconds(300, 0.9), 360);
    }

    // -- p_win ----------------------------------------------------------------

    #[test]
    fn p_win_bonuses_and_clamps() {
        // effK 3 -> +0.10 capped at 0.15; weight 3 -> +0.06.
        let p = calibrated_p_win(3.0, 3.0);
        assert!((p - 0.66).abs() < 1e-9);
        // Huge inputs clamp at 0.80.
        assert_eq!(calibrated_p_win(100.0, 100.0), 0.80);
        // effK below 1 cannot drag p below 0.30.
        assert!(calibrated_p_win(0.0, 0.0) >= 0.30);
    }

    // -- full gate walk -------------------------------------------------------

    fn three_long_fills(price: f64) -> Vec<Fill> {
        vec![
            fill("0xaaa", Direction::Long, 1.0, price, 90),
            fill("0xbbb", Direction::Long, 1.0, price, 60),
            fill("0xccc", Direction::Long, 1.0, price, 30),
        ]
    }

    /// Mark the three test traders as fully independent.
    fn decorrelate(det: &ConsensusDetector) {
        for (a, b) in [("0xaaa", "0xbbb"), ("0xaaa", "0xccc"), ("0xbbb", "0xccc")] {
            det.update_correlation(a, b, 0.0);
        }
    }

    /// Scenario: three independent traders long BTC inside 90 s. Costs favor
    /// the venue with the funding rebate.
    #[test]
    fn consensus_fires_on_best_venue() {
        let det = detector();
        decorrelate(&det);
        let ctx = EvaluationContext {
            stop_fraction: Some(0.01),
            atr_block_reason: None,
            venues: vec![
                quote(ExchangeType::Hyperliquid, 10.0, 2.0, 5.0),
                quote(ExchangeType::Bybit, 12.0, 2.0, -8.0),
            ],
            avg_win_r: 1.0,
            avg_loss_r: 0.3,
            now: Utc::now(),
        };

        let mut last = None;
        for f in three_long_fills(100_000.0) {
            last = det.process_fill(&f, 0.5, &ctx);
        }

        let eval = last.unwrap();
        assert_eq!(eval.decision_type(), "signal");
        let signal = eval.signal.unwrap();
        assert_eq!(signal.target_exchange, ExchangeType::Bybit);
        assert!((signal.costs.fees_bps - 12.0).abs() < 1e-9);
        assert!((signal.costs.funding_bps + 8.0).abs() < 1e-9);
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.n_agreeing, 3);
        assert!((signal.entry_price - 100_000.0).abs() < 1e-6);
        assert!((signal.stop_price - 99_000.0).abs() < 1e-6);

        // Window cleared after emission.
        assert!(det.check_consensus("BTC", &ctx).is_none());
    }

    /// Scenario: high pairwise correlation crushes effective K below the
    /// floor and the evaluation records the failing gate.
    #[test]
    fn correlation_crushes_eff_k() {
        let det = detector();
        for (a, b) in [("0xaaa", "0xbbb"), ("0xaaa", "0xccc"), ("0xbbb", "0xccc")] {
            det.update_correlation(a, b, 0.9);
        }

        let ctx = EvaluationContext {
            stop_fraction: Some(0.01),
            atr_block_reason: None,
            venues: vec![quote(ExchangeType::Hyperliquid, 10.0, 2.0, 0.0)],
            avg_win_r: 1.0,
            avg_loss_r: 0.3,
            now: Utc::now(),
        };

        let mut last = None;
        for f in three_long_fills(100_000.0) {
            last = det.process_fill(&f, 0.5, &ctx);
        }

        let eval = last.unwrap();
        assert_eq!(eval.decision_type(), "skip");
        assert!(eval.signal.is_none());

        let gate = eval.gates.iter().find(|g| g.name == "effective_k").unwrap();
        assert!(!gate.passed);
        // 3 / (1 + 2·0.9) ≈ 1.07
        assert!((gate.value - 3.0 / 2.8).abs() < 0.01);
        assert!((gate.threshold - 2.0).abs() < 1e-9);

        // Later gates were never evaluated.
        assert!(!eval.gates.iter().any(|g| g.name == "ev_gate"));
    }

    #[test]
    fn price_band_gate_rejects_moved_market() {
        let det = detector();
        decorrelate(&det);
        let ctx = EvaluationContext {
            stop_fraction: Some(0.01),
            atr_block_reason: None,
            venues: vec![quote(ExchangeType::Hyperliquid, 5.0, 1.0, 0.0)],
            avg_win_r: 1.0,
            avg_loss_r: 0.3,
            now: Utc::now(),
        };

        for f in three_long_fills(100_000.0) {
            det.process_fill(&f, 0.5, &ctx);
        }
        // Mid drifts 20 bps from the median entry.
        det.set_current_price("BTC", 100_200.0);

        let eval = det.check_consensus("BTC", &ctx).unwrap();
        assert_eq!(eval.decision_type(), "skip");
        let gate = eval.gates.iter().find(|g| g.name == "price_band").unwrap();
        assert!(!gate.passed);
        assert!(gate.value > 8.0);
    }

    #[test]
    fn stale_votes_fail_freshness() {
        let det = detector();
        decorrelate(&det);
        let ctx = EvaluationContext {
            stop_fraction: Some(0.01),
            atr_block_reason: None,
            venues: vec![quote(ExchangeType::Hyperliquid, 5.0, 1.0, 0.0)],
            avg_win_r: 1.0,
            avg_loss_r: 0.3,
            // Evaluate far in the future relative to the fills.
            now: Utc::now() + Duration::seconds(1_000),
        };

        // Window created at ctx.now, but fills are ~1000s older.
        for f in three_long_fills(100_000.0) {
            det.process_fill(&f, 0.5, &ctx);
        }
        let eval = det.check_consensus("BTC", &ctx).unwrap();
        assert_eq!(eval.decision_type(), "skip");
        let gate = eval.gates.iter().find(|g| g.name == "freshness").unwrap();
        assert!(!gate.passed);
    }

    #[test]
    fn atr_block_reason_fails_data_quality_gate() {
        let det = detector();
        decorrelate(&det);
        let ctx = EvaluationContext {
            stop_fraction: None,
            atr_block_reason: Some("no fresh ATR for BTC".to_string()),
            venues: vec![quote(ExchangeType::Hyperliquid, 5.0, 1.0, 0.0)],
            avg_win_r: 1.0,
            avg_loss_r: 0.3,
            now: Utc::now(),
        };

        let mut last = None;
        for f in three_long_fills(100_000.0) {
            last = det.process_fill(&f, 0.5, &ctx);
        }
        let eval = last.unwrap();
        assert_eq!(eval.decision_type(), "skip");
        let gate = eval.gates.iter().find(|g| g.name == "atr_validity").unwrap();
        assert!(!gate.passed);
        assert!(gate.detail.contains("no fresh ATR"));
    }

    #[test]
    fn untracked_symbol_is_ignored() {
        let det = detector();
        let ctx = EvaluationContext::basic(vec![quote(ExchangeType::Hyperliquid, 5.0, 1.0, 0.0)]);
        let mut f = fill("0xaaa", Direction::Long, 1.0, 100.0, 10);
        f.asset = "DOGE".to_string();
        assert!(det.process_fill(&f, 0.5, &ctx).is_none());
    }

    #[test]
    fn tie_breaks_long() {
        let det = ConsensusDetector::new(ConsensusConfig {
            min_traders: 2,
            min_agreeing: 1,
            min_pct: 0.5,
            ..ConsensusConfig::default()
        });
        let ctx = EvaluationContext::basic(vec![quote(ExchangeType::Hyperliquid, 5.0, 1.0, 0.0)]);

        det.process_fill(&fill("0xaaa", Direction::Long, 1.0, 100_000.0, 10), 0.5, &ctx);
        let eval = det
            .process_fill(&fill("0xbbb", Direction::Short, 1.0, 100_000.0, 5), 0.5, &ctx)
            .unwrap();

        // 1v1 tie: majority reads long.
        let gate = eval
            .gates
            .iter()
            .find(|g| g.name == "supermajority")
            .unwrap();
        assert!(gate.detail.contains("long"));
    }

    #[test]
    fn median_of_even_and_odd_sets() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(median(&[]), 0.0);
    }
}
