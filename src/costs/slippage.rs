// =============================================================================
// Slippage provider — orderbook walk with a static size-bucket fallback
// =============================================================================
//
// Preferred path walks the venue orderbook: consume levels on the relevant
// side until the order notional is filled, take the notional-weighted average
// fill, report impact bps = |avg_fill - mid| / mid × 10 000, then add the
// half-spread. When no book is available, a static table keyed by
// (venue, asset, size bucket) stands in.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::warn;

use super::{cache_key, CacheEntry};
use crate::exchanges::ExchangeType;

const SLIPPAGE_CACHE_TTL_S: u64 = 60;

/// Size-bucket thresholds in USD notional.
const SIZE_THRESHOLD_SMALL: f64 = 10_000.0;
const SIZE_THRESHOLD_LARGE: f64 = 50_000.0;

/// Slippage above this raises the warning flag.
const SLIPPAGE_WARNING_THRESHOLD_BPS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    /// Size in base asset units.
    pub size: f64,
}

/// One orderbook snapshot. Bids best-first descending, asks best-first
/// ascending.
#[derive(Debug, Clone)]
pub struct OrderbookSnapshot {
    pub asset: String,
    pub exchange: ExchangeType,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub mid_price: f64,
    pub spread_bps: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlippageSource {
    Orderbook,
    Static,
}

impl SlippageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orderbook => "orderbook",
            Self::Static => "static",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlippageEstimate {
    pub asset: String,
    pub exchange: ExchangeType,
    pub order_size_usd: f64,
    pub estimated_slippage_bps: f64,
    pub impact_bps: f64,
    pub expected_fill_price: f64,
    pub mid_price: f64,
    pub is_warning: bool,
    pub source: SlippageSource,
}

/// Static estimates (bps) used when the orderbook is unavailable. CEX books
/// are typically tighter than DEX books.
fn static_slippage_bps(exchange: ExchangeType, asset: &str, size_bucket: &str) -> f64 {
    let table: &[(&str, f64, f64, f64)] = match exchange {
        ExchangeType::Hyperliquid | ExchangeType::Aster => {
            &[("BTC", 1.0, 2.0, 5.0), ("ETH", 1.5, 3.0, 7.0)]
        }
        ExchangeType::Bybit => &[("BTC", 0.5, 1.5, 3.0), ("ETH", 1.0, 2.0, 5.0)],
    };

    let (small, medium, large) = table
        .iter()
        .find(|(a, _, _, _)| *a == asset.to_uppercase())
        .map(|(_, s, m, l)| (*s, *m, *l))
        .unwrap_or((2.0, 4.0, 10.0));

    match size_bucket {
        "small" => small,
        "medium" => medium,
        _ => large,
    }
}

fn size_bucket(order_size_usd: f64) -> &'static str {
    if order_size_usd < SIZE_THRESHOLD_SMALL {
        "small"
    } else if order_size_usd < SIZE_THRESHOLD_LARGE {
        "medium"
    } else {
        "large"
    }
}

/// Walk one side of the book until `order_size_usd` is filled and return the
/// notional-weighted average fill price. Partial liquidity fills what it can.
pub fn walk_book(levels: &[BookLevel], order_size_usd: f64) -> Option<f64> {
    let mut remaining_usd = order_size_usd;
    let mut total_filled = 0.0;
    let mut total_cost = 0.0;

    for level in levels {
        if remaining_usd <= 0.0 {
            break;
        }
        let level_usd = level.price * level.size;
        if level_usd >= remaining_usd {
            let fill = remaining_usd / level.price;
            total_filled += fill;
            total_cost += remaining_usd;
            remaining_usd = 0.0;
        } else {
            total_filled += level.size;
            total_cost += level_usd;
            remaining_usd -= level_usd;
        }
    }

    (total_filled > 0.0).then(|| total_cost / total_filled)
}

/// Estimate slippage from a book snapshot: price impact plus half-spread.
pub fn estimate_from_book(
    book: &OrderbookSnapshot,
    order_size_usd: f64,
    is_buy: bool,
) -> SlippageEstimate {
    let levels = if is_buy { &book.asks } else { &book.bids };

    let (avg_fill, impact_bps) = match walk_book(levels, order_size_usd) {
        Some(avg) if book.mid_price > 0.0 => {
            let impact = (avg - book.mid_price).abs() / book.mid_price * 10_000.0;
            (avg, impact)
        }
        _ => (book.mid_price, book.spread_bps / 2.0),
    };

    let slippage_bps = impact_bps + book.spread_bps / 2.0;

    SlippageEstimate {
        asset: book.asset.clone(),
        exchange: book.exchange,
        order_size_usd,
        estimated_slippage_bps: slippage_bps,
        impact_bps,
        expected_fill_price: avg_fill,
        mid_price: book.mid_price,
        is_warning: slippage_bps > SLIPPAGE_WARNING_THRESHOLD_BPS,
        source: SlippageSource::Orderbook,
    }
}

pub struct SlippageProvider {
    client: reqwest::Client,
    testnet: bool,
    cache: RwLock<HashMap<String, CacheEntry<OrderbookSnapshot>>>,
}

impl SlippageProvider {
    pub fn new(testnet: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            testnet,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Estimate slippage for an order, walking the live book when one can be
    /// fetched and falling back to the static table otherwise.
    pub async fn estimate_slippage(
        &self,
        asset: &str,
        exchange: ExchangeType,
        order_size_usd: f64,
        is_buy: bool,
        force_refresh: bool,
    ) -> SlippageEstimate {
        match self.get_orderbook(asset, exchange, force_refresh).await {
            Some(book) => estimate_from_book(&book, order_size_usd, is_buy),
            None => self.estimate_static(asset, exchange, order_size_usd),
        }
    }

    fn estimate_static(
        &self,
        asset: &str,
        exchange: ExchangeType,
        order_size_usd: f64,
    ) -> SlippageEstimate {
        let bucket = size_bucket(order_size_usd);
        let slippage_bps = static_slippage_bps(exchange, asset, bucket);
        SlippageEstimate {
            asset: asset.to_uppercase(),
            exchange,
            order_size_usd,
            estimated_slippage_bps: slippage_bps,
            impact_bps: slippage_bps,
            expected_fill_price: 0.0,
            mid_price: 0.0,
            is_warning: slippage_bps > SLIPPAGE_WARNING_THRESHOLD_BPS,
            source: SlippageSource::Static,
        }
    }

    pub async fn get_orderbook(
        &self,
        asset: &str,
        exchange: ExchangeType,
        force_refresh: bool,
    ) -> Option<OrderbookSnapshot> {
        let key = cache_key(exchange.as_str(), asset);
        if !force_refresh {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&key) {
                if !entry.is_expired(SLIPPAGE_CACHE_TTL_S) {
                    return Some(entry.value.clone());
                }
            }
        }

        let book = match exchange {
            ExchangeType::Bybit => self.fetch_bybit_book(asset).await,
            // Aster's book shape matches Hyperliquid's closely enough that
            // the HL book stands in when routing size there.
            ExchangeType::Hyperliquid | ExchangeType::Aster => self.fetch_hl_book(asset).await,
        }?;

        self.cache.write().insert(key, CacheEntry::new(book.clone()));
        Some(book)
    }

    async fn fetch_hl_book(&self, asset: &str) -> Option<OrderbookSnapshot> {
        let url = if self.testnet {
            "https://api.hyperliquid-testnet.xyz/info"
        } else {
            "https://api.hyperliquid.xyz/info"
        };
        let payload = json!({"type": "l2Book", "coin": asset.to_uppercase()});
        let resp = match self.client.post(url).json(&payload).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, asset, "hyperliquid l2Book fetch failed");
                return None;
            }
        };
        let value: Value = resp.json().await.ok()?;

        let levels = value["levels"].as_array()?;
        if levels.len() < 2 {
            return None;
        }
        let parse_side = |side: &Value| -> Vec<BookLevel> {
            side.as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|level| {
                            let price = level["px"].as_str()?.parse().ok()?;
                            let size = level["sz"].as_str()?.parse().ok()?;
                            Some(BookLevel { price, size })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let bids = parse_side(&levels[0]);
        let asks = parse_side(&levels[1]);
        build_snapshot(asset, ExchangeType::Hyperliquid, bids, asks)
    }

    async fn fetch_bybit_book(&self, asset: &str) -> Option<OrderbookSnapshot> {
        let base = if self.testnet {
            "https://api-testnet.bybit.com"
        } else {
            "https://api.bybit.com"
        };
        let url = format!(
            "{base}/v5/market/orderbook?category=linear&symbol={}USDT&limit=25",
            asset.to_uppercase()
        );
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, asset, "bybit orderbook fetch failed");
                return None;
            }
        };
        let value: Value = resp.json().await.ok()?;
        if value["retCode"].as_i64() != Some(0) {
            return None;
        }

        let parse_side = |side: &Value| -> Vec<BookLevel> {
            side.as_array()
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|level| {
                            let pair = level.as_array()?;
                            let price = pair.first()?.as_str()?.parse().ok()?;
                            let size = pair.get(1)?.as_str()?.parse().ok()?;
                            Some(BookLevel { price, size })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        let bids = parse_side(&value["result"]["b"]);
        let asks = parse_side(&value["result"]["a"]);
        build_snapshot(asset, ExchangeType::Bybit, bids, asks)
    }

    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Seed the book cache directly; test fixtures use this to keep
    /// estimates deterministic and off the network.
    #[cfg(test)]
    pub(crate) fn prime_book(&self, book: OrderbookSnapshot) {
        let key = cache_key(book.exchange.as_str(), &book.asset);
        self.cache.write().insert(key, CacheEntry::new(book));
    }
}

fn build_snapshot(
    asset: &str,
    exchange: ExchangeType,
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
) -> Option<OrderbookSnapshot> {
    let best_bid = bids.first()?.price;
    let best_ask = asks.first()?.price;
    let mid = (best_bid + best_ask) / 2.0;
    if mid <= 0.0 {
        return None;
    }
    Some(OrderbookSnapshot {
        asset: asset.to_uppercase(),
        exchange,
        bids,
        asks,
        mid_price: mid,
        spread_bps: (best_ask - best_bid) / mid * 10_000.0,
    })
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderbookSnapshot {
        // Mid 100_000, spread 10 -> 1 bps.
        OrderbookSnapshot {
            asset: "BTC".into(),
            exchange: ExchangeType::Hyperliquid,
            bids: vec![
                BookLevel { price: 99_995.0, size: 0.5 },
                BookLevel { price: 99_990.0, size: 1.0 },
                BookLevel { price: 99_980.0, size: 2.0 },
            ],
            asks: vec![
                BookLevel { price: 100_005.0, size: 0.5 },
                BookLevel { price: 100_010.0, size: 1.0 },
                BookLevel { price: 100_020.0, size: 2.0 },
            ],
            mid_price: 100_000.0,
            spread_bps: 1.0,
        }
    }

    #[test]
    fn small_order_fills_at_top_of_book() {
        let avg = walk_book(&book().asks, 10_000.0).unwrap();
        assert!((avg - 100_005.0).abs() < 1e-6);
    }

    #[test]
    fn large_order_walks_deeper_levels() {
        // 0.5 BTC at 100_005 = 50_002.5; the rest fills at 100_010.
        let avg = walk_book(&book().asks, 100_000.0).unwrap();
        assert!(avg > 100_005.0);
        assert!(avg < 100_010.0);
    }

    #[test]
    fn empty_book_returns_none() {
        assert!(walk_book(&[], 10_000.0).is_none());
    }

    #[test]
    fn estimate_adds_half_spread_to_impact() {
        let est = estimate_from_book(&book(), 10_000.0, true);
        assert_eq!(est.source, SlippageSource::Orderbook);
        // Impact of a top-of-book fill = half spread (0.5 bps); plus the
        // half-spread term = 1.0 bps total.
        assert!((est.impact_bps - 0.5).abs() < 0.01);
        assert!((est.estimated_slippage_bps - 1.0).abs() < 0.01);
        assert!(!est.is_warning);
    }

    #[test]
    fn bigger_orders_cost_more() {
        let small = estimate_from_book(&book(), 10_000.0, true);
        let large = estimate_from_book(&book(), 200_000.0, true);
        assert!(large.estimated_slippage_bps > small.estimated_slippage_bps);
    }

    #[test]
    fn sell_side_walks_bids() {
        let est = estimate_from_book(&book(), 200_000.0, false);
        assert!(est.expected_fill_price < 100_000.0);
    }

    #[test]
    fn static_buckets() {
        assert_eq!(size_bucket(5_000.0), "small");
        assert_eq!(size_bucket(20_000.0), "medium");
        assert_eq!(size_bucket(80_000.0), "large");

        // Bybit book is assumed tighter than Hyperliquid's.
        let hl = static_slippage_bps(ExchangeType::Hyperliquid, "BTC", "large");
        let bybit = static_slippage_bps(ExchangeType::Bybit, "BTC", "large");
        assert!(bybit < hl);
    }

    #[tokio::test]
    async fn static_fallback_estimate_for_unreachable_book() {
        // Testnet host is not reachable from tests; the static path serves.
        let provider = SlippageProvider::new(true);
        provider.cache.write().clear();
        let est = provider.estimate_static("BTC", ExchangeType::Bybit, 20_000.0);
        assert_eq!(est.source, SlippageSource::Static);
        assert!((est.estimated_slippage_bps - 1.5).abs() < 1e-9);
    }
}
