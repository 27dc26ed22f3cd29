// =============================================================================
// Hold-time estimator — expected hold horizon from historical episodes
// =============================================================================

use std::sync::Arc;

use crate::db::Store;
use crate::regime::MarketRegime;

/// Default horizon when no episode history exists.
const DEFAULT_HOLD_HOURS: f64 = 24.0;

/// Bounds on the estimate.
const MIN_HOLD_HOURS: f64 = 1.0;
const MAX_HOLD_HOURS: f64 = 168.0;

pub struct HoldTimeEstimator {
    store: Option<Arc<Store>>,
    default_hold_hours: f64,
}

impl HoldTimeEstimator {
    pub fn new(store: Option<Arc<Store>>) -> Self {
        Self {
            store,
            default_hold_hours: DEFAULT_HOLD_HOURS,
        }
    }

    pub fn with_default(store: Option<Arc<Store>>, default_hold_hours: f64) -> Self {
        Self {
            store,
            default_hold_hours,
        }
    }

    /// Expected hold horizon in hours for an asset. Regime shortens the
    /// horizon in volatile markets (positions get stopped or targeted
    /// faster when ranges widen).
    pub fn estimate_hold_hours(&self, asset: &str, regime: Option<MarketRegime>) -> f64 {
        let base = self
            .store
            .as_ref()
            .and_then(|store| store.avg_hold_hours(&asset.to_uppercase()).ok().flatten())
            .unwrap_or(self.default_hold_hours);

        let adjusted = match regime {
            Some(MarketRegime::Volatile) => base * 0.5,
            _ => base,
        };

        adjusted.clamp(MIN_HOLD_HOURS, MAX_HOLD_HOURS)
    }
}
