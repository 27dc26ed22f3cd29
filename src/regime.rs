// =============================================================================
// Market regime detection — trending / ranging / volatile from 1-minute bars
// =============================================================================
//
// Three signals feed an additive scoring rule:
//   1. MA spread      (SMA20 - SMA50) / SMA50
//   2. Vol ratio      current-window ATR% / longer-window ATR%
//   3. Price range%   (max high - min low) / price over the last 20 bars
//
// A vol ratio above 2.0 overrides everything: volatile, confidence 0.9.
// Fewer than 50 candles yields `unknown`.
//
// Each regime carries fixed multipliers consumed by the stop and sizing
// layers.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exchanges::{manager::ExchangeManager, Candle, ExchangeType};

const MA_SHORT: usize = 20;
const MA_LONG: usize = 50;
const TREND_THRESHOLD: f64 = 0.02;
const VOLATILITY_HIGH_MULT: f64 = 1.5;
const VOLATILITY_LOW_MULT: f64 = 0.7;
const MIN_CANDLES: usize = 50;
const CACHE_TTL_S: u64 = 60;
const LOOKBACK_BARS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketRegime {
    Trending,
    Ranging,
    Volatile,
    Unknown,
}

impl MarketRegime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trending => "trending",
            Self::Ranging => "ranging",
            Self::Volatile => "volatile",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Strategy multipliers for one regime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegimeParams {
    /// Applied to ATR-derived stop distances.
    pub stop_multiplier: f64,
    /// Applied to the fractional Kelly before the hard cap.
    pub kelly_multiplier: f64,
    /// Added to the minimum confidence threshold.
    pub min_confidence_adjustment: f64,
    /// Cap on position size as a fraction of the configured maximum.
    pub max_position_fraction: f64,
}

pub fn regime_params(regime: MarketRegime) -> RegimeParams {
    match regime {
        // Wider stops to ride the trend, full sizing.
        MarketRegime::Trending => RegimeParams {
            stop_multiplier: 1.2,
            kelly_multiplier: 1.0,
            min_confidence_adjustment: 0.0,
            max_position_fraction: 1.0,
        },
        // Tighter stops, reduced sizing in chop.
        MarketRegime::Ranging => RegimeParams {
            stop_multiplier: 0.8,
            kelly_multiplier: 0.75,
            min_confidence_adjustment: 0.05,
            max_position_fraction: 0.75,
        },
        // Wide stops, half Kelly, high confidence bar.
        MarketRegime::Volatile => RegimeParams {
            stop_multiplier: 1.5,
            kelly_multiplier: 0.5,
            min_confidence_adjustment: 0.10,
            max_position_fraction: 0.5,
        },
        MarketRegime::Unknown => RegimeParams {
            stop_multiplier: 1.0,
            kelly_multiplier: 0.5,
            min_confidence_adjustment: 0.05,
            max_position_fraction: 0.5,
        },
    }
}

/// Complete regime read for an (asset, venue).
#[derive(Debug, Clone)]
pub struct RegimeAnalysis {
    pub asset: String,
    pub exchange: ExchangeType,
    pub regime: MarketRegime,
    pub params: RegimeParams,
    pub confidence: f64,
    pub ma_spread_pct: Option<f64>,
    pub volatility_ratio: Option<f64>,
    pub price_range_pct: Option<f64>,
    pub candles_used: usize,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Pure signal math
// ---------------------------------------------------------------------------

fn sma(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.len() < period {
        return None;
    }
    let closes = &candles[candles.len() - period..];
    Some(closes.iter().map(|c| c.close).sum::<f64>() / period as f64)
}

/// Mean true-range fraction of price over the trailing `lookback` bars.
fn volatility(candles: &[Candle], lookback: usize) -> Option<f64> {
    if candles.len() < lookback + 1 {
        return None;
    }
    let recent = &candles[candles.len() - lookback..];
    let mut ratios = Vec::with_capacity(lookback);
    for i in 1..recent.len() {
        let curr = &recent[i];
        let prev_close = recent[i - 1].close;
        let tr = (curr.high - curr.low)
            .max((curr.high - prev_close).abs())
            .max((curr.low - prev_close).abs());
        if curr.close > 0.0 {
            ratios.push(tr / curr.close);
        }
    }
    if ratios.len() < lookback / 2 {
        return None;
    }
    Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
}

fn price_range(candles: &[Candle], lookback: usize) -> Option<f64> {
    if candles.len() < lookback {
        return None;
    }
    let recent = &candles[candles.len() - lookback..];
    let max_high = recent.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let min_low = recent.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    Some(max_high - min_low)
}

/// Additive scoring over the three signals. Returns (regime, confidence).
pub fn classify_regime(
    ma_spread_pct: Option<f64>,
    volatility_ratio: Option<f64>,
    price_range_pct: Option<f64>,
) -> (MarketRegime, f64) {
    // Very high volatility always wins.
    if let Some(ratio) = volatility_ratio {
        if ratio > 2.0 {
            return (MarketRegime::Volatile, 0.9);
        }
    }

    let mut trending: f64 = 0.0;
    let mut ranging: f64 = 0.0;
    let mut volatile: f64 = 0.0;

    if let Some(spread) = ma_spread_pct {
        let abs_spread = spread.abs();
        if abs_spread > TREND_THRESHOLD {
            trending += 0.4;
        } else if abs_spread < TREND_THRESHOLD * 0.5 {
            ranging += 0.3;
        }
    }

    if let Some(ratio) = volatility_ratio {
        if ratio > VOLATILITY_HIGH_MULT {
            volatile += 0.4;
        } else if ratio < VOLATILITY_LOW_MULT {
            ranging += 0.2;
            trending += 0.1;
        } else {
            trending += 0.15;
            ranging += 0.15;
        }
    }

    if let Some(range_pct) = price_range_pct {
        if range_pct > 0.03 {
            trending += 0.2;
            volatile += 0.2;
        } else if range_pct < 0.01 {
            ranging += 0.3;
        }
    }

    let total = trending + ranging + volatile;
    if total == 0.0 {
        return (MarketRegime::Unknown, 0.0);
    }

    let (regime, max_score) = [
        (MarketRegime::Trending, trending),
        (MarketRegime::Ranging, ranging),
        (MarketRegime::Volatile, volatile),
    ]
    .into_iter()
    .max_by(|a, b| a.1.total_cmp(&b.1))
    .unwrap_or((MarketRegime::Unknown, 0.0));

    let confidence = max_score / total;
    if max_score < 0.3 {
        return (MarketRegime::Unknown, confidence);
    }

    (regime, confidence.min(0.95))
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

pub struct RegimeDetector {
    manager: Arc<ExchangeManager>,
    default_exchange: ExchangeType,
    cache: RwLock<HashMap<String, (RegimeAnalysis, Instant)>>,
}

impl RegimeDetector {
    pub fn new(manager: Arc<ExchangeManager>, default_exchange: ExchangeType) -> Self {
        Self {
            manager,
            default_exchange,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn detect_regime(
        &self,
        asset: &str,
        exchange: Option<ExchangeType>,
    ) -> RegimeAnalysis {
        let target = exchange.unwrap_or(self.default_exchange);
        let key = format!("{}:{}", asset.to_uppercase(), target.as_str());

        {
            let cache = self.cache.read();
            if let Some((analysis, at)) = cache.get(&key) {
                if at.elapsed().as_secs() < CACHE_TTL_S {
                    return analysis.clone();
                }
            }
        }

        let candles = match self.manager.get_exchange(target) {
            Some(adapter) if adapter.is_connected() => {
                adapter
                    .get_candles(asset, MA_LONG + 10 + LOOKBACK_BARS)
                    .await
            }
            _ => Vec::new(),
        };

        let analysis = Self::analyze(asset, target, &candles);
        debug!(
            asset,
            exchange = %target,
            regime = %analysis.regime,
            confidence = analysis.confidence,
            candles = analysis.candles_used,
            "regime detected"
        );

        self.cache
            .write()
            .insert(key, (analysis.clone(), Instant::now()));
        analysis
    }

    /// Signal extraction and classification over a candle series.
    pub fn analyze(asset: &str, exchange: ExchangeType, candles: &[Candle]) -> RegimeAnalysis {
        if candles.len() < MIN_CANDLES {
            return RegimeAnalysis {
                asset: asset.to_uppercase(),
                exchange,
                regime: MarketRegime::Unknown,
                params: regime_params(MarketRegime::Unknown),
                confidence: 0.0,
                ma_spread_pct: None,
                volatility_ratio: None,
                price_range_pct: None,
                candles_used: candles.len(),
                timestamp: Utc::now(),
            };
        }

        let ma_short = sma(candles, MA_SHORT);
        let ma_long = sma(candles, MA_LONG);
        let current_vol = volatility(candles, 14);
        let historical_vol = volatility(candles, candles.len().min(MA_LONG));
        let range = price_range(candles, 20);
        let current_price = candles.last().map(|c| c.close).unwrap_or(0.0);

        let ma_spread_pct = match (ma_short, ma_long) {
            (Some(s), Some(l)) if l > 0.0 => Some((s - l) / l),
            _ => None,
        };
        let volatility_ratio = match (current_vol, historical_vol) {
            (Some(c), Some(h)) if h > 0.0 => Some(c / h),
            _ => None,
        };
        let price_range_pct = match range {
            Some(r) if current_price > 0.0 => Some(r / current_price),
            _ => None,
        };

        let (regime, confidence) = classify_regime(ma_spread_pct, volatility_ratio, price_range_pct);

        RegimeAnalysis {
            asset: asset.to_uppercase(),
            exchange,
            regime,
            params: regime_params(regime),
            confidence,
            ma_spread_pct,
            volatility_ratio,
            price_range_pct,
            candles_used: candles.len(),
            timestamp: Utc::now(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candle(base: f64, spread: f64, offset_min: i64) -> Candle {
        Candle {
            ts: Utc::now() + Duration::minutes(offset_min),
            open: base,
            high: base + spread,
            low: base - spread,
            close: base,
        }
    }

    #[test]
    fn vol_ratio_override_always_wins() {
        let (regime, confidence) = classify_regime(Some(0.05), Some(2.5), Some(0.05));
        assert_eq!(regime, MarketRegime::Volatile);
        assert_eq!(confidence, 0.9);
    }

    #[test]
    fn strong_ma_spread_scores_trending() {
        let (regime, _) = classify_regime(Some(0.03), Some(1.0), Some(0.02));
        assert_eq!(regime, MarketRegime::Trending);
    }

    #[test]
    fn converged_mas_and_tight_range_score_ranging() {
        let (regime, _) = classify_regime(Some(0.005), Some(0.6), Some(0.005));
        assert_eq!(regime, MarketRegime::Ranging);
    }

    #[test]
    fn high_vol_without_trend_scores_volatile() {
        let (regime, _) = classify_regime(Some(0.012), Some(1.8), Some(0.04));
        assert_eq!(regime, MarketRegime::Volatile);
    }

    #[test]
    fn no_signals_is_unknown() {
        let (regime, confidence) = classify_regime(None, None, None);
        assert_eq!(regime, MarketRegime::Unknown);
        assert_eq!(confidence, 0.0);
    }

    #[test]
    fn params_table_matches_presets() {
        let trending = regime_params(MarketRegime::Trending);
        assert_eq!(trending.stop_multiplier, 1.2);
        assert_eq!(trending.kelly_multiplier, 1.0);
        assert_eq!(trending.max_position_fraction, 1.0);

        let volatile = regime_params(MarketRegime::Volatile);
        assert_eq!(volatile.stop_multiplier, 1.5);
        assert_eq!(volatile.kelly_multiplier, 0.5);
        assert_eq!(volatile.min_confidence_adjustment, 0.10);
        assert_eq!(volatile.max_position_fraction, 0.5);

        let unknown = regime_params(MarketRegime::Unknown);
        assert_eq!(unknown.kelly_multiplier, 0.5);
    }

    #[test]
    fn insufficient_candles_yields_unknown() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(100.0, 1.0, i)).collect();
        let analysis = RegimeDetector::analyze("BTC", ExchangeType::Hyperliquid, &candles);
        assert_eq!(analysis.regime, MarketRegime::Unknown);
        assert_eq!(analysis.candles_used, 10);
    }

    #[test]
    fn flat_series_classifies_ranging() {
        let candles: Vec<Candle> = (0..80).map(|i| candle(100.0, 0.2, i)).collect();
        let analysis = RegimeDetector::analyze("BTC", ExchangeType::Hyperliquid, &candles);
        assert_eq!(analysis.regime, MarketRegime::Ranging);
        assert!(analysis.ma_spread_pct.unwrap().abs() < 0.001);
    }

    #[test]
    fn steady_climb_classifies_trending() {
        let candles: Vec<Candle> = (0..80)
            .map(|i| candle(100.0 + i as f64 * 1.5, 0.5, i))
            .collect();
        let analysis = RegimeDetector::analyze("BTC", ExchangeType::Hyperliquid, &candles);
        assert_eq!(analysis.regime, MarketRegime::Trending);
        assert!(analysis.ma_spread_pct.unwrap() > TREND_THRESHOLD);
    }
}
