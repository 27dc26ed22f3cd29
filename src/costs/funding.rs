// =============================================================================
// Funding-rate provider — hold-period funding cost in bps, direction-signed
// =============================================================================
//
// Perp funding accrues every 8 hours. The expected cost of holding a
// position is the current rate scaled to the hold horizon; longs pay
// positive funding, shorts receive it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{cache_key, CacheEntry};
use crate::exchanges::{manager::ExchangeManager, ExchangeType};
use crate::types::Direction;

const FUNDING_CACHE_TTL_S: u64 = 60;

/// Funding interval on all supported venues.
const FUNDING_INTERVAL_HOURS: f64 = 8.0;

/// Expected funding cost over `hold_hours`, in bps of notional. Positive is
/// a cost, negative a rebate.
pub fn funding_cost_bps(funding_rate: f64, hold_hours: f64, direction: Direction) -> f64 {
    let periods = hold_hours / FUNDING_INTERVAL_HOURS;
    let total_rate = funding_rate * periods;
    // Longs pay when funding is positive; shorts receive.
    let signed = match direction {
        Direction::Long => total_rate,
        Direction::Short => -total_rate,
    };
    signed * 10_000.0
}

pub struct FundingProvider {
    manager: Arc<ExchangeManager>,
    cache: RwLock<HashMap<String, CacheEntry<f64>>>,
}

impl FundingProvider {
    pub fn new(manager: Arc<ExchangeManager>) -> Self {
        Self {
            manager,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Current funding rate (fraction per interval) for an asset on a venue.
    pub async fn get_funding_rate(
        &self,
        asset: &str,
        exchange: ExchangeType,
        force_refresh: bool,
    ) -> Option<f64> {
        let key = cache_key(exchange.as_str(), asset);
        if !force_refresh {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&key) {
                if !entry.is_expired(FUNDING_CACHE_TTL_S) {
                    return Some(entry.value);
                }
            }
        }

        let rate = self
            .manager
            .get_market_data(asset, Some(exchange))
            .await?
            .funding_rate?;

        self.cache.write().insert(key, CacheEntry::new(rate));
        debug!(asset, exchange = %exchange, rate, "funding rate refreshed");
        Some(rate)
    }

    /// Estimated hold-period funding in bps. Missing data reads as zero
    /// cost rather than blocking the pipeline.
    pub async fn get_funding_bps(
        &self,
        asset: &str,
        exchange: ExchangeType,
        hold_hours: f64,
        direction: Direction,
    ) -> f64 {
        match self.get_funding_rate(asset, exchange, false).await {
            Some(rate) => funding_cost_bps(rate, hold_hours, direction),
            None => 0.0,
        }
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }
}
