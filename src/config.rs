// =============================================================================
// Runtime Configuration — every tunable of the decision engine in one place
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::exchanges::ExchangeType;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_symbols() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_min_traders() -> usize {
    3
}

fn default_min_agreeing() -> usize {
    3
}

fn default_min_pct() -> f64 {
    0.70
}

fn default_min_effective_k() -> f64 {
    2.0
}

fn default_base_window_s() -> u64 {
    120
}

fn default_max_staleness_factor() -> f64 {
    1.25
}

fn default_max_price_band_bps() -> f64 {
    8.0
}

fn default_min_ev_r() -> f64 {
    0.20
}

fn default_weight_cap() -> f64 {
    1.0
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_multipliers() -> HashMap<String, f64> {
    HashMap::from([("BTC".to_string(), 2.0), ("ETH".to_string(), 1.5)])
}

fn default_atr_cache_ttl_s() -> u64 {
    60
}

fn default_atr_max_staleness_s() -> u64 {
    300
}

fn default_corr_lookback_days() -> i64 {
    30
}

fn default_corr_bucket_minutes() -> i64 {
    5
}

fn default_corr_min_common_buckets() -> usize {
    10
}

fn default_corr_max_staleness_days() -> i64 {
    7
}

fn default_corr_halflife_days() -> f64 {
    3.0
}

fn default_rho() -> f64 {
    0.3
}

fn default_non_hl_rho() -> f64 {
    0.5
}

fn default_kelly_fraction() -> f64 {
    0.25
}

fn default_kelly_min_episodes() -> u32 {
    30
}

fn default_kelly_fallback_pct() -> f64 {
    0.01
}

fn default_kelly_max_fraction() -> f64 {
    0.50
}

fn default_kelly_max_position_pct() -> f64 {
    0.10
}

fn default_liquidation_distance_min() -> f64 {
    1.5
}

fn default_daily_drawdown_kill_pct() -> f64 {
    0.05
}

fn default_min_equity_floor() -> f64 {
    10_000.0
}

fn default_max_position_size_pct() -> f64 {
    0.10
}

fn default_max_total_exposure_pct() -> f64 {
    0.50
}

fn default_kill_switch_cooldown_s() -> u64 {
    86_400
}

fn default_max_concurrent_positions() -> usize {
    3
}

fn default_max_position_per_symbol() -> usize {
    1
}

fn default_api_error_threshold() -> u32 {
    3
}

fn default_api_error_pause_s() -> u64 {
    300
}

fn default_max_consecutive_losses() -> u32 {
    5
}

fn default_loss_streak_pause_s() -> u64 {
    3_600
}

fn default_stop_poll_interval_s() -> u64 {
    5
}

fn default_rr_ratio() -> f64 {
    2.0
}

fn default_max_hold_h() -> i64 {
    168
}

fn default_venue_selection_exchanges() -> Vec<ExchangeType> {
    vec![ExchangeType::Hyperliquid, ExchangeType::Bybit]
}

fn default_slippage_pct() -> f64 {
    0.5
}

fn default_rate_limit_delays_ms() -> HashMap<String, u64> {
    HashMap::from([
        ("hyperliquid".to_string(), 300),
        ("aster".to_string(), 500),
        ("bybit".to_string(), 750),
    ])
}

// =============================================================================
// Sections
// =============================================================================

/// Consensus detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_min_traders")]
    pub min_traders: usize,
    #[serde(default = "default_min_agreeing")]
    pub min_agreeing: usize,
    /// Minimum fraction of voters in the majority direction.
    #[serde(default = "default_min_pct")]
    pub min_pct: f64,
    #[serde(default = "default_min_effective_k")]
    pub min_effective_k: f64,
    #[serde(default = "default_base_window_s")]
    pub base_window_s: u64,
    /// Oldest agreeing vote may be at most window_s × this factor old.
    #[serde(default = "default_max_staleness_factor")]
    pub max_staleness_factor: f64,
    #[serde(default = "default_max_price_band_bps")]
    pub max_price_band_bps: f64,
    #[serde(default = "default_min_ev_r")]
    pub min_ev_r: f64,
    /// Net-delta normalization cap for vote weights.
    #[serde(default = "default_weight_cap")]
    pub weight_cap: f64,
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_traders: default_min_traders(),
            min_agreeing: default_min_agreeing(),
            min_pct: default_min_pct(),
            min_effective_k: default_min_effective_k(),
            base_window_s: default_base_window_s(),
            max_staleness_factor: default_max_staleness_factor(),
            max_price_band_bps: default_max_price_band_bps(),
            min_ev_r: default_min_ev_r(),
            weight_cap: default_weight_cap(),
            symbols: default_symbols(),
        }
    }
}

/// ATR provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtrConfig {
    #[serde(default = "default_atr_period")]
    pub period: usize,
    /// Per-asset stop multipliers applied to ATR%.
    #[serde(default = "default_atr_multipliers")]
    pub multipliers: HashMap<String, f64>,
    #[serde(default = "default_atr_cache_ttl_s")]
    pub cache_ttl_s: u64,
    #[serde(default = "default_atr_max_staleness_s")]
    pub max_staleness_s: u64,
    /// When true, a hardcoded-fallback ATR blocks the signal gate.
    #[serde(default = "default_true")]
    pub strict_mode: bool,
}

impl Default for AtrConfig {
    fn default() -> Self {
        Self {
            period: default_atr_period(),
            multipliers: default_atr_multipliers(),
            cache_ttl_s: default_atr_cache_ttl_s(),
            max_staleness_s: default_atr_max_staleness_s(),
            strict_mode: true,
        }
    }
}

/// Correlation provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    #[serde(default = "default_corr_bucket_minutes")]
    pub bucket_minutes: i64,
    #[serde(default = "default_corr_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_corr_min_common_buckets")]
    pub min_common_buckets: usize,
    #[serde(default = "default_corr_max_staleness_days")]
    pub max_staleness_days: i64,
    #[serde(default = "default_corr_halflife_days")]
    pub halflife_days: f64,
    #[serde(default = "default_rho")]
    pub default_rho: f64,
    /// More conservative default for venues the correlation data was not
    /// derived from.
    #[serde(default = "default_non_hl_rho")]
    pub non_hl_default_rho: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            bucket_minutes: default_corr_bucket_minutes(),
            lookback_days: default_corr_lookback_days(),
            min_common_buckets: default_corr_min_common_buckets(),
            max_staleness_days: default_corr_max_staleness_days(),
            halflife_days: default_corr_halflife_days(),
            default_rho: default_rho(),
            non_hl_default_rho: default_non_hl_rho(),
        }
    }
}

/// Kelly sizing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_kelly_fraction")]
    pub fraction: f64,
    #[serde(default = "default_kelly_min_episodes")]
    pub min_episodes: u32,
    #[serde(default = "default_kelly_fallback_pct")]
    pub fallback_pct: f64,
    #[serde(default = "default_kelly_max_fraction")]
    pub max_fraction: f64,
    #[serde(default = "default_kelly_max_position_pct")]
    pub max_position_pct: f64,
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            fraction: default_kelly_fraction(),
            min_episodes: default_kelly_min_episodes(),
            fallback_pct: default_kelly_fallback_pct(),
            max_fraction: default_kelly_max_fraction(),
            max_position_pct: default_kelly_max_position_pct(),
        }
    }
}

/// Hard safety ceilings and circuit breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_liquidation_distance_min")]
    pub liquidation_distance_min: f64,
    #[serde(default = "default_daily_drawdown_kill_pct")]
    pub daily_drawdown_kill_pct: f64,
    #[serde(default = "default_min_equity_floor")]
    pub min_equity_floor: f64,
    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: f64,
    #[serde(default = "default_max_total_exposure_pct")]
    pub max_total_exposure_pct: f64,
    #[serde(default = "default_kill_switch_cooldown_s")]
    pub kill_switch_cooldown_s: u64,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: usize,
    #[serde(default = "default_max_position_per_symbol")]
    pub max_position_per_symbol: usize,
    #[serde(default = "default_api_error_threshold")]
    pub api_error_threshold: u32,
    #[serde(default = "default_api_error_pause_s")]
    pub api_error_pause_s: u64,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
    #[serde(default = "default_loss_streak_pause_s")]
    pub loss_streak_pause_s: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            liquidation_distance_min: default_liquidation_distance_min(),
            daily_drawdown_kill_pct: default_daily_drawdown_kill_pct(),
            min_equity_floor: default_min_equity_floor(),
            max_position_size_pct: default_max_position_size_pct(),
            max_total_exposure_pct: default_max_total_exposure_pct(),
            kill_switch_cooldown_s: default_kill_switch_cooldown_s(),
            max_concurrent_positions: default_max_concurrent_positions(),
            max_position_per_symbol: default_max_position_per_symbol(),
            api_error_threshold: default_api_error_threshold(),
            api_error_pause_s: default_api_error_pause_s(),
            max_consecutive_losses: default_max_consecutive_losses(),
            loss_streak_pause_s: default_loss_streak_pause_s(),
        }
    }
}

/// Stop manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfig {
    #[serde(default = "default_stop_poll_interval_s")]
    pub poll_interval_s: u64,
    /// Reward:risk ratio used to derive take-profit from the stop distance.
    #[serde(default = "default_rr_ratio")]
    pub default_rr: f64,
    #[serde(default = "default_max_hold_h")]
    pub max_hold_h: i64,
    #[serde(default)]
    pub trailing_enabled: bool,
    #[serde(default = "default_true")]
    pub use_native_stops: bool,
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: default_stop_poll_interval_s(),
            default_rr: default_rr_ratio(),
            max_hold_h: default_max_hold_h(),
            trailing_enabled: false,
            use_native_stops: true,
        }
    }
}

/// Venue selection and execution switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Master switch. When false no order (real or simulated) is attempted.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Real orders only when explicitly enabled; default is dry-run.
    #[serde(default)]
    pub real_execution_enabled: bool,
    #[serde(default)]
    pub default_exchange: ExchangeType,
    /// Compare per-venue EV and route each signal to the best venue.
    #[serde(default = "default_true")]
    pub per_signal_venue_selection: bool,
    #[serde(default = "default_venue_selection_exchanges")]
    pub venue_selection_exchanges: Vec<ExchangeType>,
    #[serde(default = "default_slippage_pct")]
    pub default_slippage_pct: f64,
    /// Inter-probe delay per venue during health checks, milliseconds.
    #[serde(default = "default_rate_limit_delays_ms")]
    pub rate_limit_delays_ms: HashMap<String, u64>,
    #[serde(default = "default_true")]
    pub testnet: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            real_execution_enabled: false,
            default_exchange: ExchangeType::default(),
            per_signal_venue_selection: true,
            venue_selection_exchanges: default_venue_selection_exchanges(),
            default_slippage_pct: default_slippage_pct(),
            rate_limit_delays_ms: default_rate_limit_delays_ms(),
            testnet: true,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Quorum engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub atr: AtrConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    #[serde(default)]
    pub kelly: KellyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub stops: StopConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.consensus.symbols,
            real_execution = config.execution.real_execution_enabled,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Health-check delay before probing `exchange`, in milliseconds.
    pub fn rate_limit_delay_ms(&self, exchange: ExchangeType) -> u64 {
        self.execution
            .rate_limit_delays_ms
            .get(exchange.as_str())
            .copied()
            .unwrap_or(500)
    }
}
