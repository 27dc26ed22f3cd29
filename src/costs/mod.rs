// =============================================================================
// Cost providers — ATR, fees, slippage, funding, hold time
// =============================================================================
//
// All providers share the same shape: an in-process cache keyed by
// (venue, asset) with a short TTL, an explicit force-refresh path, a
// staleness predicate, and a source tag on every datum. Cache writers swap
// the whole entry; nothing is mutated in place.
// =============================================================================

pub mod atr;
pub mod fees;
pub mod funding;
pub mod hold_time;
pub mod slippage;

use std::time::Instant;

/// A cached value plus the instant it was fetched.
#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<T> {
    pub value: T,
    pub fetched_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            fetched_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, ttl_s: u64) -> bool {
        self.fetched_at.elapsed().as_secs() >= ttl_s
    }
}

/// Cache key for per-(venue, asset) entries.
pub(crate) fn cache_key(exchange: &str, asset: &str) -> String {
    format!("{}:{}", exchange.to_lowercase(), asset.to_uppercase())
}
