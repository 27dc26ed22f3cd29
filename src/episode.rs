// =============================================================================
// Episode tracking — fills in, closed episodes with R attribution out
// =============================================================================
//
// One episode per (trader, asset): opened by the first net fill, grown by
// same-direction fills (entry VWAP re-weighted), reduced by opposite fills.
// A reducing fill larger than the open size closes the episode with reason
// `direction_flip` and opens a fresh episode in the opposite direction with
// the excess.
//
// R = realized_pnl / (entry_size × entry_vwap × stop_distance_pct),
// winsorized to [-2, +2] with the raw value preserved alongside.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::db::{EpisodeRow, Store};
use crate::types::{Direction, Fill};

/// Winsorization bounds for R-multiples.
const R_CLAMP: f64 = 2.0;

/// Notional-weighted mean price of a fill set.
pub fn calculate_vwap(fills: &[(f64, f64)]) -> f64 {
    // (size, price) pairs; sizes always positive here.
    let total_size: f64 = fills.iter().map(|(size, _)| size.abs()).sum();
    if total_size <= 0.0 {
        return 0.0;
    }
    fills
        .iter()
        .map(|(size, price)| size.abs() * price)
        .sum::<f64>()
        / total_size
}

/// R-multiple of a realized PnL against the risk taken. Returns
/// (winsorized, raw); degenerate risk reads as zero.
pub fn calculate_r(
    realized_pnl: f64,
    entry_size: f64,
    entry_vwap: f64,
    stop_distance_pct: f64,
) -> (f64, f64) {
    let risk = entry_size.abs() * entry_vwap * stop_distance_pct;
    if risk <= 0.0 {
        return (0.0, 0.0);
    }
    let raw = realized_pnl / risk;
    (raw.clamp(-R_CLAMP, R_CLAMP), raw)
}

/// An open episode for one (trader, asset).
#[derive(Debug, Clone)]
pub struct Episode {
    pub address: String,
    pub asset: String,
    pub direction: Direction,
    /// Remaining open size, positive.
    pub open_size: f64,
    pub entry_vwap: f64,
    /// (size, price) entry legs backing the VWAP.
    pub entry_fills: Vec<(f64, f64)>,
    pub stop_distance_pct: f64,
    pub opened_at: DateTime<Utc>,
    pub realized_pnl: f64,
}

/// A finished episode with its outcome.
#[derive(Debug, Clone)]
pub struct ClosedEpisode {
    pub address: String,
    pub asset: String,
    pub direction: Direction,
    pub entry_vwap: f64,
    pub entry_size: f64,
    pub realized_pnl: f64,
    pub r_multiple: f64,
    pub r_multiple_raw: f64,
    pub closed_reason: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    /// Set when the close came from a larger opposite fill.
    pub direction_flip: bool,
}

pub struct EpisodeTracker {
    episodes: RwLock<HashMap<(String, String), Episode>>,
    store: Option<Arc<Store>>,
    default_stop_pct: f64,
}

impl EpisodeTracker {
    pub fn new(store: Option<Arc<Store>>, default_stop_pct: f64) -> Self {
        Self {
            episodes: RwLock::new(HashMap::new()),
            store,
            default_stop_pct,
        }
    }

    fn key(address: &str, asset: &str) -> (String, String) {
        (address.to_lowercase(), asset.to_uppercase())
    }

    pub fn open_episode(&self, address: &str, asset: &str) -> Option<Episode> {
        self.episodes
            .read()
            .get(&Self::key(address, asset))
            .cloned()
    }

    /// Feed one fill through the state machine. Returns any episode the fill
    /// closed (full close or flip).
    pub fn process_fill(&self, fill: &Fill) -> Option<ClosedEpisode> {
        let key = Self::key(&fill.address, &fill.asset);
        let mut episodes = self.episodes.write();

        let Some(existing) = episodes.get_mut(&key) else {
            episodes.insert(key, self.new_episode(fill, fill.size, fill.ts));
            return None;
        };

        if existing.direction == fill.direction {
            // Same direction: grow the position and re-weight the VWAP.
            existing.entry_fills.push((fill.size, fill.price));
            existing.open_size += fill.size;
            existing.entry_vwap = calculate_vwap(&existing.entry_fills);
            debug!(
                address = %fill.address,
                asset = %fill.asset,
                size = existing.open_size,
                vwap = existing.entry_vwap,
                "episode grown"
            );
            return None;
        }

        // Opposite direction: reduce, close, or flip.
        if fill.size < existing.open_size - 1e-12 {
            let pnl = leg_pnl(existing.direction, existing.entry_vwap, fill.price, fill.size);
            existing.open_size -= fill.size;
            existing.realized_pnl += pnl;
            debug!(
                address = %fill.address,
                asset = %fill.asset,
                remaining = existing.open_size,
                realized = existing.realized_pnl,
                "episode partially closed"
            );
            return None;
        }

        let episode = episodes.remove(&key).expect("entry exists");
        let flip_excess = fill.size - episode.open_size;
        let is_flip = flip_excess > 1e-12;

        let close_pnl = leg_pnl(
            episode.direction,
            episode.entry_vwap,
            fill.price,
            episode.open_size,
        );
        let total_pnl = episode.realized_pnl + close_pnl;
        let entry_size: f64 = episode.entry_fills.iter().map(|(size, _)| size).sum();
        let (r_multiple, r_raw) = calculate_r(
            total_pnl,
            entry_size,
            episode.entry_vwap,
            episode.stop_distance_pct,
        );

        let closed = ClosedEpisode {
            address: episode.address.clone(),
            asset: episode.asset.clone(),
            direction: episode.direction,
            entry_vwap: episode.entry_vwap,
            entry_size,
            realized_pnl: total_pnl,
            r_multiple,
            r_multiple_raw: r_raw,
            closed_reason: if is_flip {
                "direction_flip".to_string()
            } else {
                "full_close".to_string()
            },
            opened_at: episode.opened_at,
            closed_at: fill.ts,
            direction_flip: is_flip,
        };

        if is_flip {
            // The excess opens a fresh episode on the other side.
            episodes.insert(key, self.new_episode(fill, flip_excess, fill.ts));
        }

        self.persist(&closed);
        Some(closed)
    }

    fn new_episode(&self, fill: &Fill, size: f64, ts: DateTime<Utc>) -> Episode {
        Episode {
            address: fill.address.to_lowercase(),
            asset: fill.asset.to_uppercase(),
            direction: fill.direction,
            open_size: size,
            entry_vwap: fill.price,
            entry_fills: vec![(size, fill.price)],
            stop_distance_pct: self.default_stop_pct,
            opened_at: ts,
            realized_pnl: 0.0,
        }
    }

    fn persist(&self, closed: &ClosedEpisode) {
        let Some(store) = &self.store else { return };
        let row = EpisodeRow {
            address: closed.address.clone(),
            asset: closed.asset.clone(),
            direction: closed.direction,
            entry_vwap: closed.entry_vwap,
            entry_size: closed.entry_size,
            realized_pnl: closed.realized_pnl,
            r_multiple: closed.r_multiple,
            r_multiple_raw: closed.r_multiple_raw,
            closed_reason: closed.closed_reason.clone(),
            opened_at: closed.opened_at,
            closed_at: closed.closed_at,
        };
        if let Err(e) = store.insert_episode(&row) {
            warn!(error = %e, "failed to persist closed episode");
        }
    }
}

/// PnL of closing `size` units of a position against its entry VWAP.
fn leg_pnl(direction: Direction, entry_vwap: f64, exit_price: f64, size: f64) -> f64 {
    match direction {
        Direction::Long => (exit_price - entry_vwap) * size,
        Direction::Short => (entry_vwap - exit_price) * size,
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fill(address: &str, direction: Direction, size: f64, price: f64) -> Fill {
        Fill {
            fill_id: format!("{address}-{size}-{price}"),
            address: address.to_string(),
            asset: "BTC".to_string(),
            direction,
            size,
            price,
            ts: Utc::now(),
        }
    }

    fn tracker() -> EpisodeTracker {
        EpisodeTracker::new(None, 0.02)
    }

    // -- VWAP -----------------------------------------------------------------

    #[test]
    fn vwap_single_fill() {
        assert_eq!(calculate_vwap(&[(1.0, 50_000.0)]), 50_000.0);
    }

    #[test]
    fn vwap_equal_sizes() {
        assert_eq!(calculate_vwap(&[(1.0, 50_000.0), (1.0, 52_000.0)]), 51_000.0);
    }

    #[test]
    fn vwap_weighted() {
        // 1 @ 48k + 3 @ 52k = (48 + 156) / 4 = 51k.
        assert_eq!(calculate_vwap(&[(1.0, 48_000.0), (3.0, 52_000.0)]), 51_000.0);
    }

    #[test]
    fn vwap_empty() {
        assert_eq!(calculate_vwap(&[]), 0.0);
    }

    // -- R multiples ----------------------------------------------------------

    #[test]
    fn positive_r() {
        // Risk = 1 × 50_000 × 0.02 = 1_000; pnl 500 -> 0.5 R.
        let (r, raw) = calculate_r(500.0, 1.0, 50_000.0, 0.02);
        assert!((r - 0.5).abs() < 1e-9);
        assert_eq!(r, raw);
    }

    #[test]
    fn negative_r() {
        let (r, _) = calculate_r(-1_000.0, 1.0, 50_000.0, 0.02);
        assert!((r + 1.0).abs() < 1e-9);
    }

    #[test]
    fn winsorized_upper_preserves_raw() {
        let (r, raw) = calculate_r(5_000.0, 1.0, 50_000.0, 0.02);
        assert_eq!(r, 2.0);
        assert!((raw - 5.0).abs() < 1e-9);
    }

    #[test]
    fn winsorized_lower_preserves_raw() {
        let (r, raw) = calculate_r(-5_000.0, 1.0, 50_000.0, 0.02);
        assert_eq!(r, -2.0);
        assert!((raw + 5.0).abs() < 1e-9);
    }

    #[test]
    fn zero_risk_returns_zero() {
        assert_eq!(calculate_r(500.0, 0.0, 50_000.0, 0.02), (0.0, 0.0));
        assert_eq!(calculate_r(500.0, 1.0, 50_000.0, 0.0), (0.0, 0.0));
    }

    // -- episode state machine ------------------------------------------------

    #[test]
    fn open_long_position() {
        let t = tracker();
        assert!(t.process_fill(&fill("0xabc", Direction::Long, 1.0, 50_000.0)).is_none());
        let episode = t.open_episode("0xABC", "btc").unwrap();
        assert_eq!(episode.direction, Direction::Long);
        assert_eq!(episode.open_size, 1.0);
        assert_eq!(episode.entry_vwap, 50_000.0);
    }

    #[test]
    fn add_to_long_updates_vwap() {
        let t = tracker();
        t.process_fill(&fill("0xabc", Direction::Long, 1.0, 50_000.0));
        t.process_fill(&fill("0xabc", Direction::Long, 1.0, 52_000.0));
        let episode = t.open_episode("0xabc", "BTC").unwrap();
        assert_eq!(episode.open_size, 2.0);
        assert_eq!(episode.entry_vwap, 51_000.0);
    }

    #[test]
    fn close_long_computes_r() {
        let t = tracker();
        t.process_fill(&fill("0xabc", Direction::Long, 1.0, 50_000.0));
        let closed = t
            .process_fill(&fill("0xabc", Direction::Short, 1.0, 51_000.0))
            .unwrap();
        assert_eq!(closed.closed_reason, "full_close");
        assert!(!closed.direction_flip);
        assert!((closed.realized_pnl - 1_000.0).abs() < 1e-9);
        // Risk = 50_000 × 0.02 = 1_000 -> R = 1.0.
        assert!((closed.r_multiple - 1.0).abs() < 1e-9);
        assert!(t.open_episode("0xabc", "BTC").is_none());
    }

    #[test]
    fn close_short_computes_r() {
        let t = tracker();
        t.process_fill(&fill("0xabc", Direction::Short, 1.0, 50_000.0));
        let closed = t
            .process_fill(&fill("0xabc", Direction::Long, 1.0, 49_000.0))
            .unwrap();
        assert!((closed.realized_pnl - 1_000.0).abs() < 1e-9);
        assert!(closed.r_multiple > 0.0);
    }

    #[test]
    fn partial_close_keeps_episode_open() {
        let t = tracker();
        t.process_fill(&fill("0xabc", Direction::Long, 2.0, 50_000.0));
        assert!(t
            .process_fill(&fill("0xabc", Direction::Short, 0.5, 51_000.0))
            .is_none());
        let episode = t.open_episode("0xabc", "BTC").unwrap();
        assert!((episode.open_size - 1.5).abs() < 1e-9);
        assert!((episode.realized_pnl - 500.0).abs() < 1e-9);

        // Final close folds the partial PnL into the episode total.
        let closed = t
            .process_fill(&fill("0xabc", Direction::Short, 1.5, 51_000.0))
            .unwrap();
        assert!((closed.realized_pnl - 2_000.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_sell_flips_long_to_short() {
        let t = tracker();
        t.process_fill(&fill("0xabc", Direction::Long, 1.0, 50_000.0));
        let closed = t
            .process_fill(&fill("0xabc", Direction::Short, 1.5, 50_500.0))
            .unwrap();
        assert_eq!(closed.closed_reason, "direction_flip");
        assert!(closed.direction_flip);
        assert!((closed.realized_pnl - 500.0).abs() < 1e-9);

        let flipped = t.open_episode("0xabc", "BTC").unwrap();
        assert_eq!(flipped.direction, Direction::Short);
        assert!((flipped.open_size - 0.5).abs() < 1e-9);
        assert_eq!(flipped.entry_vwap, 50_500.0);
    }

    #[test]
    fn traders_and_assets_are_independent() {
        let t = tracker();
        t.process_fill(&fill("0xaaa", Direction::Long, 1.0, 50_000.0));
        t.process_fill(&fill("0xbbb", Direction::Short, 1.0, 50_000.0));
        let mut eth = fill("0xaaa", Direction::Short, 2.0, 3_000.0);
        eth.asset = "ETH".to_string();
        t.process_fill(&eth);

        assert_eq!(t.open_episode("0xaaa", "BTC").unwrap().direction, Direction::Long);
        assert_eq!(t.open_episode("0xbbb", "BTC").unwrap().direction, Direction::Short);
        assert_eq!(t.open_episode("0xaaa", "ETH").unwrap().direction, Direction::Short);
    }

    #[test]
    fn closed_episodes_persist() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let t = EpisodeTracker::new(Some(Arc::clone(&store)), 0.02);
        t.process_fill(&fill("0xabc", Direction::Long, 1.0, 50_000.0));
        t.process_fill(&fill("0xabc", Direction::Short, 1.0, 51_000.0));
        // avg_hold_hours proves a row landed.
        assert!(store.avg_hold_hours("BTC").unwrap().is_some());
    }
}
