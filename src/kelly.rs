// =============================================================================
// Kelly position sizing — fractional Kelly with fee drag and hard caps
// =============================================================================
//
// Full Kelly: f* = p - (1-p)/R with R = avg_win / avg_loss. Fractional
// Kelly (25% by default) trades expected growth for variance control, which
// matters when the edge estimate itself is uncertain.
//
// The regime multiplier scales the fractional Kelly BEFORE the max-fraction
// cap, so the cap binds last and stays a true ceiling in every regime.
//
// Sizing converts the Kelly fraction into a position through the stop
// distance: risking f of equity with a stop s away means a position of
// f / s of equity, capped at the configured maximum.
// =============================================================================

use std::sync::Arc;

use crate::config::KellyConfig;
use crate::db::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizingMethod {
    Kelly,
    KellyConsensus,
    FallbackInsufficientData,
    FallbackNegativeEv,
    FallbackNoKellyTraders,
    Error,
}

impl SizingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kelly => "kelly",
            Self::KellyConsensus => "kelly_consensus",
            Self::FallbackInsufficientData => "fallback_insufficient_data",
            Self::FallbackNegativeEv => "fallback_negative_ev",
            Self::FallbackNoKellyTraders => "fallback_no_kelly_traders",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for SizingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inputs to one Kelly sizing calculation.
#[derive(Debug, Clone)]
pub struct KellyInput {
    /// p: probability of winning (0-1).
    pub win_rate: f64,
    /// Average win in R-multiples (positive).
    pub avg_win_r: f64,
    /// Average loss in R-multiples (stored positive).
    pub avg_loss_r: f64,
    /// Sample size behind the estimates.
    pub episode_count: u32,
    pub account_value: f64,
    pub current_price: f64,
    /// Stop distance as a fraction (0.01 = 1%).
    pub stop_distance_pct: f64,
    /// Round-trip fees as a fraction (0.001 = 10 bps).
    pub round_trip_fee_pct: f64,
}

#[derive(Debug, Clone)]
pub struct KellyResult {
    pub full_kelly: f64,
    pub fractional_kelly: f64,
    /// Final position size as a fraction of equity.
    pub position_pct: f64,
    pub position_size_usd: f64,
    pub position_size_coin: f64,
    pub method: SizingMethod,
    pub reasoning: String,
    pub capped: bool,
}

impl KellyResult {
    fn fallback(
        method: SizingMethod,
        position_pct: f64,
        account_value: f64,
        current_price: f64,
        reasoning: String,
    ) -> Self {
        let size_usd = account_value * position_pct;
        let size_coin = if current_price > 0.0 {
            size_usd / current_price
        } else {
            0.0
        };
        Self {
            full_kelly: 0.0,
            fractional_kelly: 0.0,
            position_pct,
            position_size_usd: size_usd,
            position_size_coin: size_coin,
            method,
            reasoning,
            capped: false,
        }
    }
}

/// Full Kelly fraction, clamped to [0, 1]. Zero when the edge is negative
/// or the loss leg is degenerate.
pub fn kelly_fraction(win_rate: f64, avg_win_r: f64, avg_loss_r: f64) -> f64 {
    if !(0.0..=1.0).contains(&win_rate) {
        return 0.0;
    }
    let avg_loss_r = avg_loss_r.abs();
    if avg_loss_r <= 0.0 {
        return 0.0;
    }
    let r = avg_win_r / avg_loss_r;
    if r <= 0.0 {
        return 0.0;
    }
    (win_rate - (1.0 - win_rate) / r).clamp(0.0, 1.0)
}

/// Fee-adjusted expected value per trade in R-multiples. Fees are charged
/// on every trade regardless of outcome.
pub fn expected_value_r(win_rate: f64, avg_win_r: f64, avg_loss_r: f64, fee_cost_r: f64) -> f64 {
    let avg_loss_r = avg_loss_r.abs();
    win_rate * avg_win_r - (1.0 - win_rate) * avg_loss_r - fee_cost_r
}

/// Size a position with fractional Kelly. `regime_multiplier` scales the
/// fractional Kelly before the hard caps.
pub fn kelly_position_size(
    input: &KellyInput,
    config: &KellyConfig,
    regime_multiplier: f64,
) -> KellyResult {
    if input.current_price <= 0.0 {
        return KellyResult::fallback(
            SizingMethod::Error,
            0.0,
            input.account_value,
            input.current_price,
            "Invalid price (<= 0)".to_string(),
        );
    }

    if input.episode_count < config.min_episodes {
        return KellyResult::fallback(
            SizingMethod::FallbackInsufficientData,
            config.fallback_pct,
            input.account_value,
            input.current_price,
            format!(
                "Only {} episodes, need {}",
                input.episode_count, config.min_episodes
            ),
        );
    }

    // If the stop is 1%, a 10 bps round trip costs 0.1 R every trade.
    let fee_cost_r = if input.stop_distance_pct > 0.0 && input.round_trip_fee_pct > 0.0 {
        input.round_trip_fee_pct / input.stop_distance_pct
    } else {
        0.0
    };

    let ev = expected_value_r(input.win_rate, input.avg_win_r, input.avg_loss_r, fee_cost_r);

    if ev <= 0.0 {
        // Half the fallback size: keep learning, stop paying for edge that
        // fees have consumed.
        let fee_msg = if fee_cost_r > 0.0 {
            format!(" (incl {fee_cost_r:.3}R fees)")
        } else {
            String::new()
        };
        return KellyResult::fallback(
            SizingMethod::FallbackNegativeEv,
            config.fallback_pct * 0.5,
            input.account_value,
            input.current_price,
            format!("Negative EV: {ev:.3}R per trade{fee_msg}"),
        );
    }

    let full_kelly = kelly_fraction(input.win_rate, input.avg_win_r, input.avg_loss_r);
    if full_kelly <= 0.0 {
        return KellyResult::fallback(
            SizingMethod::FallbackNegativeEv,
            config.fallback_pct * 0.5,
            input.account_value,
            input.current_price,
            format!("Kelly fraction zero at win_rate={:.2}", input.win_rate),
        );
    }

    // Regime scaling first, cap last.
    let mut fractional_kelly = full_kelly * config.fraction * regime_multiplier;
    let fraction_capped = fractional_kelly > config.max_fraction;
    fractional_kelly = fractional_kelly.min(config.max_fraction);

    let raw_position_pct = if input.stop_distance_pct > 0.0 {
        fractional_kelly / input.stop_distance_pct
    } else {
        fractional_kelly
    };

    let position_capped = raw_position_pct > config.max_position_pct;
    let position_pct = raw_position_pct.min(config.max_position_pct);

    let size_usd = input.account_value * position_pct;
    let size_coin = size_usd / input.current_price;

    let fee_msg = if fee_cost_r > 0.0 {
        format!(", Fees={fee_cost_r:.2}R")
    } else {
        String::new()
    };
    let reasoning = format!(
        "Kelly={:.1}%, Fractional={:.1}%, EV={ev:.3}R, Win={:.1}%{fee_msg}",
        full_kelly * 100.0,
        fractional_kelly * 100.0,
        input.win_rate * 100.0,
    );

    KellyResult {
        full_kelly,
        fractional_kelly,
        position_pct,
        position_size_usd: size_usd,
        position_size_coin: size_coin,
        method: SizingMethod::Kelly,
        reasoning,
        capped: fraction_capped || position_capped,
    }
}

/// Consensus sizing: one Kelly calculation per trigger trader, then the
/// median position fraction across those meeting the episode minimum. No
/// qualifying traders falls back to the fixed fraction.
pub fn consensus_kelly_size(
    store: Option<&Arc<Store>>,
    addresses: &[String],
    account_value: f64,
    current_price: f64,
    stop_distance_pct: f64,
    round_trip_fee_pct: f64,
    config: &KellyConfig,
    regime_multiplier: f64,
) -> KellyResult {
    let mut results: Vec<KellyResult> = Vec::new();

    if let Some(store) = store {
        for address in addresses {
            let Ok(Some(perf)) = store.get_trader_performance(address) else {
                continue;
            };
            if perf.episode_count < config.min_episodes {
                continue;
            }
            let input = KellyInput {
                win_rate: perf.win_rate,
                avg_win_r: perf.avg_win_r,
                avg_loss_r: perf.avg_loss_r,
                episode_count: perf.episode_count,
                account_value,
                current_price,
                stop_distance_pct,
                round_trip_fee_pct,
            };
            let result = kelly_position_size(&input, config, regime_multiplier);
            if result.method == SizingMethod::Kelly {
                results.push(result);
            }
        }
    }

    if results.is_empty() {
        return KellyResult::fallback(
            SizingMethod::FallbackNoKellyTraders,
            config.fallback_pct,
            account_value,
            current_price,
            format!("No traders with {}+ episodes", config.min_episodes),
        );
    }

    results.sort_by(|a, b| a.position_pct.total_cmp(&b.position_pct));
    let median = results[results.len() / 2].clone();

    KellyResult {
        method: SizingMethod::KellyConsensus,
        reasoning: format!("Median of {} traders: {}", results.len(), median.reasoning),
        ..median
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KellyConfig {
        KellyConfig::default()
    }

    fn input(win_rate: f64, stop_pct: f64, fee_pct: f64) -> KellyInput {
        KellyInput {
            win_rate,
            avg_win_r: 1.0,
            avg_loss_r: 1.0,
            episode_count: 100,
            account_value: 100_000.0,
            current_price: 100_000.0,
            stop_distance_pct: stop_pct,
            round_trip_fee_pct: fee_pct,
        }
    }

    #[test]
    fn full_kelly_at_even_odds() {
        // p = 0.55 with R = 1: f* = 0.55 - 0.45 = 0.10.
        assert!((kelly_fraction(0.55, 1.0, 1.0) - 0.10).abs() < 1e-9);
        // p = 0.45 with R = 1 has negative edge: clamp to zero.
        assert_eq!(kelly_fraction(0.45, 1.0, 1.0), 0.0);
    }

    #[test]
    fn degenerate_loss_leg_returns_zero() {
        assert_eq!(kelly_fraction(0.6, 1.0, 0.0), 0.0);
        assert_eq!(kelly_fraction(1.5, 1.0, 1.0), 0.0);
    }

    #[test]
    fn fractional_never_exceeds_full_or_cap() {
        for p in [0.51, 0.6, 0.7, 0.9] {
            let result = kelly_position_size(&input(p, 0.02, 0.0), &config(), 1.0);
            assert!(result.fractional_kelly <= result.full_kelly + 1e-12);
            assert!(result.fractional_kelly <= config().max_fraction);
        }
    }

    #[test]
    fn position_pct_capped_unconditionally() {
        // Tiny stop inflates position fraction; the cap must hold.
        let result = kelly_position_size(&input(0.7, 0.001, 0.0), &config(), 1.0);
        assert!(result.position_pct <= config().max_position_pct + 1e-12);
        assert!(result.capped);
    }

    #[test]
    fn ev_is_non_increasing_in_fees() {
        let mut last = f64::INFINITY;
        for fee_bps in [0.0, 5.0, 10.0, 20.0, 50.0] {
            let ev = expected_value_r(0.55, 1.0, 1.0, fee_bps / 10_000.0 / 0.01);
            assert!(ev <= last);
            last = ev;
        }
    }

    /// Scenario: p=0.52 at even R with a 1% stop and 10 bps round trip.
    /// Fee drag of 0.10R flips the 0.04R edge negative.
    #[test]
    fn fees_flip_ev_negative() {
        let result = kelly_position_size(&input(0.52, 0.01, 0.001), &config(), 1.0);
        assert_eq!(result.method, SizingMethod::FallbackNegativeEv);
        // Half the fallback percentage.
        assert!((result.position_pct - 0.005).abs() < 1e-12);
        assert!(result.reasoning.contains("-0.060R")
            || result.reasoning.contains("-0.06"));
    }

    #[test]
    fn insufficient_episodes_fall_back() {
        let mut few = input(0.6, 0.02, 0.0);
        few.episode_count = 10;
        let result = kelly_position_size(&few, &config(), 1.0);
        assert_eq!(result.method, SizingMethod::FallbackInsufficientData);
        assert!((result.position_pct - 0.01).abs() < 1e-12);
    }

    #[test]
    fn invalid_price_is_an_error() {
        let mut bad = input(0.6, 0.02, 0.0);
        bad.current_price = 0.0;
        let result = kelly_position_size(&bad, &config(), 1.0);
        assert_eq!(result.method, SizingMethod::Error);
        assert_eq!(result.position_pct, 0.0);
    }

    #[test]
    fn regime_multiplier_scales_before_cap() {
        let full = kelly_position_size(&input(0.6, 0.02, 0.0), &config(), 1.0);
        let half = kelly_position_size(&input(0.6, 0.02, 0.0), &config(), 0.5);
        // Neither hits the fraction cap here, so halving the regime
        // multiplier halves the fractional Kelly.
        assert!((half.fractional_kelly - full.fractional_kelly * 0.5).abs() < 1e-12);
    }

    #[test]
    fn sizes_derive_from_equity_and_price() {
        let result = kelly_position_size(&input(0.6, 0.02, 0.0), &config(), 1.0);
        assert_eq!(result.method, SizingMethod::Kelly);
        assert!((result.position_size_usd - result.position_pct * 100_000.0).abs() < 1e-6);
        assert!(
            (result.position_size_coin - result.position_size_usd / 100_000.0).abs() < 1e-12
        );
    }

    #[test]
    fn consensus_median_of_qualifying_traders() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        // Three traders with distinct win rates; one below the episode bar.
        let rows = [
            ("0xaaa", 0.52, 60),
            ("0xbbb", 0.60, 80),
            ("0xccc", 0.70, 90),
            ("0xddd", 0.90, 5),
        ];
        for (addr, win, episodes) in rows {
            store
                .conn_for_tests()
                .execute(
                    "INSERT INTO trader_performance
                     (address, win_rate, avg_win_r, avg_loss_r, episode_count)
                     VALUES (?1, ?2, 1.0, 1.0, ?3)",
                    rusqlite::params![addr, win, episodes],
                )
                .unwrap();
        }

        let addresses: Vec<String> = ["0xaaa", "0xbbb", "0xccc", "0xddd"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = consensus_kelly_size(
            Some(&store),
            &addresses,
            100_000.0,
            100_000.0,
            0.02,
            0.0,
            &config(),
            1.0,
        );
        assert_eq!(result.method, SizingMethod::KellyConsensus);

        // The median trader is 0xbbb (p = 0.60): f* = 0.2, quarter Kelly
        // 0.05, position = 0.05 / 0.02 = 2.5 -> capped at 10%.
        assert!((result.position_pct - 0.10).abs() < 1e-9);
        assert!(result.reasoning.starts_with("Median of 3 traders"));
    }

    #[test]
    fn consensus_without_qualifying_traders_falls_back() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let result = consensus_kelly_size(
            Some(&store),
            &["0xnobody".to_string()],
            100_000.0,
            100_000.0,
            0.02,
            0.0,
            &config(),
            1.0,
        );
        assert_eq!(result.method, SizingMethod::FallbackNoKellyTraders);
        assert!((result.position_pct - 0.01).abs() < 1e-12);
    }
}
