// =============================================================================
// ATR provider — per-venue volatility with a layered fallback chain
// =============================================================================
//
// ATR measures volatility by decomposing the entire range of a bar:
//
//   TR    = max(H - L, |H - prevClose|, |L - prevClose|)
//   ATR_0 = SMA of first `period` TR values
//   ATR_t = (ATR_{t-1} * (period - 1) + TR_t) / period   (Wilder's smoothing)
//
// Fallback chain per (asset, venue):
//   1. venue-native 1-minute candles (source: calculated)
//   2. precomputed ATR from the marks table (source: db)
//   3. 24h realized volatility from log returns (source: realized_vol, stale)
//   4. hardcoded per-asset default (source: fallback_hardcoded, stale)
//
// In strict mode a hardcoded-fallback ATR blocks the signal gate.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::{cache_key, CacheEntry};
use crate::config::AtrConfig;
use crate::db::Store;
use crate::exchanges::{manager::ExchangeManager, Candle, ExchangeType};

/// Last-resort per-asset ATR percentages (typical 1-minute values).
fn hardcoded_atr_pct(asset: &str) -> f64 {
    match asset.to_uppercase().as_str() {
        "BTC" => 0.4,
        "ETH" => 0.6,
        _ => 0.5,
    }
}

/// Minimum closes needed before realized volatility is attempted.
const REALIZED_VOL_MIN_CLOSES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtrSource {
    Api,
    Db,
    Calculated,
    RealizedVol,
    FallbackHardcoded,
}

impl AtrSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Db => "db",
            Self::Calculated => "calculated",
            Self::RealizedVol => "realized_vol",
            Self::FallbackHardcoded => "fallback_hardcoded",
        }
    }
}

/// ATR reading for one (asset, venue).
#[derive(Debug, Clone)]
pub struct AtrData {
    pub asset: String,
    pub exchange: ExchangeType,
    /// Raw ATR in price units.
    pub atr: f64,
    /// ATR as a percentage of price.
    pub atr_pct: f64,
    pub price: f64,
    /// Per-asset stop multiplier.
    pub multiplier: f64,
    /// atr_pct × multiplier, as a percentage.
    pub stop_distance_pct: f64,
    pub timestamp: DateTime<Utc>,
    pub source: AtrSource,
}

impl AtrData {
    /// Fallback and realized-vol readings are always stale; everything else
    /// goes stale past the configured age.
    pub fn is_stale(&self, now: DateTime<Utc>, max_staleness_s: u64) -> bool {
        match self.source {
            AtrSource::FallbackHardcoded | AtrSource::RealizedVol => true,
            _ => {
                let age = (now - self.timestamp).num_seconds();
                age > max_staleness_s as i64
            }
        }
    }

    pub fn is_data_driven(&self) -> bool {
        !matches!(self.source, AtrSource::FallbackHardcoded)
    }

    /// Stop distance as a fraction (0.01 = 1%).
    pub fn stop_fraction(&self) -> f64 {
        self.stop_distance_pct / 100.0
    }
}

// ---------------------------------------------------------------------------
// Pure ATR math
// ---------------------------------------------------------------------------

/// True Range for one candle given the previous close.
pub fn true_range(candle: &Candle, prev_close: Option<f64>) -> f64 {
    let hl = candle.high - candle.low;
    match prev_close {
        Some(pc) => hl.max((candle.high - pc).abs()).max((candle.low - pc).abs()),
        None => hl,
    }
}

/// ATR over `candles` (oldest first) using Wilder's smoothing. Needs at
/// least `period + 1` candles so every TR has a previous close.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }

    let mut tr_values = Vec::with_capacity(candles.len() - 1);
    for i in 1..candles.len() {
        tr_values.push(true_range(&candles[i], Some(candles[i - 1].close)));
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    atr.is_finite().then_some(atr)
}

/// Mean absolute 1-bar log return × 100, a crude stand-in for ATR% when no
/// full candle history is available.
pub fn realized_vol_pct(closes: &[f64]) -> Option<f64> {
    if closes.len() < 2 {
        return None;
    }
    let mut sum = 0.0;
    let mut n = 0usize;
    for pair in closes.windows(2) {
        if pair[0] > 0.0 && pair[1] > 0.0 {
            sum += (pair[1] / pair[0]).ln().abs();
            n += 1;
        }
    }
    if n == 0 {
        return None;
    }
    Some(sum / n as f64 * 100.0)
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

pub struct AtrProvider {
    config: AtrConfig,
    manager: Arc<ExchangeManager>,
    store: Option<Arc<Store>>,
    default_exchange: ExchangeType,
    cache: RwLock<HashMap<String, CacheEntry<AtrData>>>,
}

impl AtrProvider {
    pub fn new(
        config: AtrConfig,
        manager: Arc<ExchangeManager>,
        store: Option<Arc<Store>>,
        default_exchange: ExchangeType,
    ) -> Self {
        Self {
            config,
            manager,
            store,
            default_exchange,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn multiplier(&self, asset: &str) -> f64 {
        self.config
            .multipliers
            .get(&asset.to_uppercase())
            .copied()
            .unwrap_or(2.0)
    }

    /// ATR for `asset` on `exchange`, walking the fallback chain. When the
    /// target venue yields no data-driven reading and differs from the
    /// default venue, the default venue is consulted before the hardcoded
    /// fallback.
    pub async fn get_atr(
        &self,
        asset: &str,
        exchange: Option<ExchangeType>,
        price: Option<f64>,
        force_refresh: bool,
    ) -> AtrData {
        let target = exchange.unwrap_or(self.default_exchange);
        let key = cache_key(target.as_str(), asset);

        if !force_refresh {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&key) {
                if !entry.is_expired(self.config.cache_ttl_s) {
                    return entry.value.clone();
                }
            }
        }

        let mut data = self.compute_atr(asset, target, price).await;

        if !data.is_data_driven() && target != self.default_exchange {
            debug!(
                asset,
                target = %target,
                default = %self.default_exchange,
                "ATR fallback to default venue"
            );
            let default_data = self.compute_atr(asset, self.default_exchange, price).await;
            if default_data.is_data_driven() {
                data = default_data;
            }
        }

        self.cache
            .write()
            .insert(key, CacheEntry::new(data.clone()));
        data
    }

    async fn compute_atr(
        &self,
        asset: &str,
        exchange: ExchangeType,
        price: Option<f64>,
    ) -> AtrData {
        let multiplier = self.multiplier(asset);
        let count = self.config.period + 5;

        // 1. Venue-native candles.
        let candles = match self.manager.get_exchange(exchange) {
            Some(adapter) if adapter.is_connected() => adapter.get_candles(asset, count + 60).await,
            _ => Vec::new(),
        };

        let last_close = candles.last().map(|c| c.close);
        let current_price = price.or(last_close).unwrap_or(0.0);

        if candles.len() >= count {
            if let Some(atr) = calculate_atr(&candles, self.config.period) {
                if current_price > 0.0 {
                    let atr_pct = atr / current_price * 100.0;
                    return AtrData {
                        asset: asset.to_uppercase(),
                        exchange,
                        atr,
                        atr_pct,
                        price: current_price,
                        multiplier,
                        stop_distance_pct: atr_pct * multiplier,
                        timestamp: Utc::now(),
                        source: AtrSource::Calculated,
                    };
                }
            }
        }

        // 2. Precomputed ATR from the marks table.
        if let Some(store) = &self.store {
            if let Ok(Some((atr, ts))) = store.latest_db_atr(&asset.to_uppercase()) {
                if current_price > 0.0 {
                    let atr_pct = atr / current_price * 100.0;
                    return AtrData {
                        asset: asset.to_uppercase(),
                        exchange,
                        atr,
                        atr_pct,
                        price: current_price,
                        multiplier,
                        stop_distance_pct: atr_pct * multiplier,
                        timestamp: ts,
                        source: AtrSource::Db,
                    };
                }
            }
        }

        // 3. Realized volatility from whatever closes we do have.
        if candles.len() >= REALIZED_VOL_MIN_CLOSES {
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            if let Some(vol_pct) = realized_vol_pct(&closes) {
                if current_price > 0.0 {
                    warn!(asset, exchange = %exchange, "ATR from realized vol (marked stale)");
                    return AtrData {
                        asset: asset.to_uppercase(),
                        exchange,
                        atr: current_price * vol_pct / 100.0,
                        atr_pct: vol_pct,
                        price: current_price,
                        multiplier,
                        stop_distance_pct: vol_pct * multiplier,
                        timestamp: Utc::now(),
                        source: AtrSource::RealizedVol,
                    };
                }
            }
        }

        // 4. Hardcoded last resort.
        let atr_pct = hardcoded_atr_pct(asset);
        let fallback_price = if current_price > 0.0 {
            current_price
        } else {
            100_000.0
        };
        warn!(
            asset,
            exchange = %exchange,
            atr_pct,
            strict = self.config.strict_mode,
            "using hardcoded fallback ATR"
        );
        AtrData {
            asset: asset.to_uppercase(),
            exchange,
            atr: fallback_price * atr_pct / 100.0,
            atr_pct,
            price: fallback_price,
            multiplier,
            stop_distance_pct: atr_pct * multiplier,
            timestamp: Utc::now(),
            source: AtrSource::FallbackHardcoded,
        }
    }

    /// Whether signal gating must be blocked on data-quality grounds.
    pub fn should_block_gate(&self, data: &AtrData) -> (bool, String) {
        if !self.config.strict_mode {
            return (false, String::new());
        }
        if data.source == AtrSource::FallbackHardcoded {
            return (
                true,
                format!(
                    "no fresh ATR for {} on {} (hardcoded fallback)",
                    data.asset, data.exchange
                ),
            );
        }
        (false, String::new())
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
    use crate::exchanges::mock::MockExchange;
    use crate::exchanges::ExchangeAdapter;
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
    fn atr_insufficient_data() {
        let candles: Vec<Candle> = (0..10).map(|i| candle(100.0, 5.0, i)).collect();
        assert!(calculate_atr(&candles, 14).is_none());
        assert!(calculate_atr(&candles, 0).is_none());
    }

    #[test]
    fn atr_constant_range_converges_to_range() {
        let candles: Vec<Candle> = (0..30)
            .map(|i| candle(100.0 + i as f64 * 0.1, 5.0, i))
            .collect();
        let atr = calculate_atr(&candles, 14).unwrap();
        assert!((atr - 10.0).abs() < 1.0, "expected ATR near 10.0, got {atr}");
    }

    #[test]
    fn atr_true_range_uses_prev_close_on_gaps() {
        let candles = vec![
            Candle { ts: Utc::now(), open: 100.0, high: 105.0, low: 95.0, close: 95.0 },
            Candle { ts: Utc::now(), open: 110.0, high: 115.0, low: 108.0, close: 112.0 },
            Candle { ts: Utc::now(), open: 112.0, high: 118.0, low: 110.0, close: 115.0 },
            Candle { ts: Utc::now(), open: 115.0, high: 120.0, low: 113.0, close: 118.0 },
        ];
        // Gap up: |115 - 95| = 20 > 115 - 108 = 7.
        let atr = calculate_atr(&candles, 3).unwrap();
        assert!(atr > 7.0, "ATR should reflect the gap, got {atr}");
    }

    #[test]
    fn atr_nan_returns_none() {
        let mut candles: Vec<Candle> = (0..5).map(|i| candle(100.0, 5.0, i)).collect();
        candles[2].high = f64::NAN;
        assert!(calculate_atr(&candles, 3).is_none());
    }

    #[test]
    fn realized_vol_of_flat_series_is_zero() {
        let closes = vec![100.0; 25];
        assert_eq!(realized_vol_pct(&closes), Some(0.0));
        assert!(realized_vol_pct(&[100.0]).is_none());
    }

    #[test]
    fn staleness_rules() {
        let mut data = AtrData {
            asset: "BTC".into(),
            exchange: ExchangeType::Hyperliquid,
            atr: 400.0,
            atr_pct: 0.4,
            price: 100_000.0,
            multiplier: 2.0,
            stop_distance_pct: 0.8,
            timestamp: Utc::now(),
            source: AtrSource::Calculated,
        };
        let now = Utc::now();
        assert!(!data.is_stale(now, 300));
        assert!(data.is_stale(now + Duration::seconds(301), 300));

        data.source = AtrSource::FallbackHardcoded;
        assert!(data.is_stale(now, 300));
        data.source = AtrSource::RealizedVol;
        assert!(data.is_stale(now, 300));
    }

    #[tokio::test]
    async fn candle_path_produces_calculated_atr() {
        let mock = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        {
            let mut candles = mock.candles.write();
            for i in 0..40 {
                candles.push(candle(100_000.0, 250.0, i));
            }
        }
        let manager = Arc::new(ExchangeManager::new(None, std::collections::HashMap::new(), true));
        manager
            .connect_exchange(Arc::clone(&mock) as Arc<dyn ExchangeAdapter>, true)
            .await;
        let provider = AtrProvider::new(
            AtrConfig::default(),
            manager,
            None,
            ExchangeType::Hyperliquid,
        );

        let data = provider
            .get_atr("BTC", Some(ExchangeType::Hyperliquid), None, false)
            .await;
        assert_eq!(data.source, AtrSource::Calculated);
        assert!(data.atr > 0.0);
        assert!((data.stop_distance_pct - data.atr_pct * 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_data_yields_hardcoded_fallback() {
        let mock = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        let manager = Arc::new(ExchangeManager::new(None, std::collections::HashMap::new(), true));
        manager
            .connect_exchange(Arc::clone(&mock) as Arc<dyn ExchangeAdapter>, true)
            .await;
        let provider = AtrProvider::new(
            AtrConfig::default(),
            manager,
            None,
            ExchangeType::Hyperliquid,
        );

        let data = provider
            .get_atr("BTC", Some(ExchangeType::Hyperliquid), Some(100_000.0), false)
            .await;
        assert_eq!(data.source, AtrSource::FallbackHardcoded);
        assert!((data.atr_pct - 0.4).abs() < 1e-9);

        // Strict mode blocks the gate on hardcoded fallback.
        let (blocked, reason) = provider.should_block_gate(&data);
        assert!(blocked);
        assert!(reason.contains("BTC"));
    }

    #[tokio::test]
    async fn cache_serves_second_read() {
        let mock = Arc::new(MockExchange::new(ExchangeType::Hyperliquid));
        let manager = Arc::new(ExchangeManager::new(None, std::collections::HashMap::new(), true));
        manager
            .connect_exchange(Arc::clone(&mock) as Arc<dyn ExchangeAdapter>, true)
            .await;
        let provider = AtrProvider::new(
            AtrConfig::default(),
            manager,
            None,
            ExchangeType::Hyperliquid,
        );

        let first = provider
            .get_atr("BTC", Some(ExchangeType::Hyperliquid), Some(100_000.0), false)
            .await;
        // Give the mock candles now; the cached fallback should still serve.
        {
            let mut candles = mock.candles.write();
            for i in 0..40 {
                candles.push(candle(100_000.0, 250.0, i));
            }
        }
        let second = provider
            .get_atr("BTC", Some(ExchangeType::Hyperliquid), Some(100_000.0), false)
            .await;
        assert_eq!(second.source, first.source);

        // Force refresh bypasses the cache.
        let refreshed = provider
            .get_atr("BTC", Some(ExchangeType::Hyperliquid), Some(100_000.0), true)
            .await;
        assert_eq!(refreshed.source, AtrSource::Calculated);
    }
}
