// =============================================================================
// Correlation provider — pairwise trader correlations with time decay
// =============================================================================
//
// Pairwise ρ is computed by an upstream daily job and read here once per
// day. Lookups normalize addresses to lowercase and key on the sorted pair.
// Negative correlations are clipped to zero: anti-correlated traders count
// as independent, never as diversifying.
//
// Time decay blends the stored value toward a venue-aware default as the
// data ages:
//
//   decay = 2^(-age_days / halflife)
//   rho   = raw                         when decay >= 0.99
//   rho   = raw*decay + rho0*(1-decay)  otherwise
//
// The non-Hyperliquid default is higher (more conservative) because the
// stored correlations are derived from Hyperliquid behavior only.
//
// Decay and staleness are pure functions of (today, loaded date) so tests
// never need a mocked clock.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::CorrelationConfig;
use crate::db::Store;
use crate::exchanges::ExchangeType;

/// Sorted lowercase address pair, the canonical matrix key.
pub fn pair_key(addr_a: &str, addr_b: &str) -> (String, String) {
    let a = addr_a.to_lowercase();
    let b = addr_b.to_lowercase();
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Exponential decay factor for data `age_days` old.
pub fn decay_factor(age_days: i64, halflife_days: f64) -> f64 {
    if age_days <= 0 {
        return 1.0;
    }
    if halflife_days <= 0.0 {
        return 0.0;
    }
    2f64.powf(-(age_days as f64) / halflife_days)
}

/// Blend a raw correlation toward the default under decay, clipped to [0, 1].
pub fn decayed_rho(raw: f64, decay: f64, default_rho: f64) -> f64 {
    let blended = if decay >= 0.99 {
        raw
    } else {
        raw * decay + default_rho * (1.0 - decay)
    };
    blended.clamp(0.0, 1.0)
}

pub struct CorrelationProvider {
    config: CorrelationConfig,
    store: Option<Arc<Store>>,
    matrix: RwLock<HashMap<(String, String), f64>>,
    loaded_date: RwLock<Option<NaiveDate>>,
}

impl CorrelationProvider {
    pub fn new(config: CorrelationConfig, store: Option<Arc<Store>>) -> Self {
        Self {
            config,
            store,
            matrix: RwLock::new(HashMap::new()),
            loaded_date: RwLock::new(None),
        }
    }

    /// Venue-aware default ρ.
    pub fn default_rho(&self, target_exchange: ExchangeType) -> f64 {
        match target_exchange {
            ExchangeType::Hyperliquid => self.config.default_rho,
            _ => self.config.non_hl_default_rho,
        }
    }

    /// Load the latest day's matrix from the store. Returns the number of
    /// pairs loaded.
    pub fn load(&self, today: NaiveDate) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };

        let (as_of, rows) = match store.load_correlations() {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "failed to load correlations");
                return 0;
            }
        };

        let mut matrix = HashMap::new();
        for row in &rows {
            // Negative correlation means independent strategies, not hedges.
            let rho = row.rho.clamp(0.0, 1.0);
            matrix.insert(pair_key(&row.addr_a, &row.addr_b), rho);
        }

        let count = matrix.len();
        *self.matrix.write() = matrix;
        *self.loaded_date.write() = as_of.or(Some(today));

        if self.is_stale(today) {
            warn!(
                age_days = self.age_days(today),
                max = self.config.max_staleness_days,
                "correlation data is stale; defaults will dominate"
            );
        }
        info!(pairs = count, as_of = ?as_of, "correlation matrix loaded");
        count
    }

    pub fn age_days(&self, today: NaiveDate) -> i64 {
        match *self.loaded_date.read() {
            Some(loaded) => (today - loaded).num_days(),
            None => i64::MAX,
        }
    }

    pub fn is_stale(&self, today: NaiveDate) -> bool {
        self.age_days(today) > self.config.max_staleness_days
    }

    /// Raw stored ρ for a pair, if present.
    pub fn get(&self, addr_a: &str, addr_b: &str) -> Option<f64> {
        self.matrix.read().get(&pair_key(addr_a, addr_b)).copied()
    }

    /// ρ for a pair with time decay applied. Always returns a value: missing
    /// pairs and fully decayed data read as the venue default.
    pub fn get_with_decay(
        &self,
        addr_a: &str,
        addr_b: &str,
        target_exchange: ExchangeType,
        today: NaiveDate,
    ) -> f64 {
        let default_rho = self.default_rho(target_exchange);

        let Some(raw) = self.get(addr_a, addr_b) else {
            return default_rho;
        };

        let age = self.age_days(today);
        let decay = decay_factor(age, self.config.halflife_days);
        decayed_rho(raw, decay, default_rho)
    }

    /// Copy the entire (decayed) matrix into `apply`, which receives each
    /// pair under its sorted key. Returns the number of pairs written.
    pub fn hydrate<F>(&self, target_exchange: ExchangeType, today: NaiveDate, mut apply: F) -> usize
    where
        F: FnMut(&str, &str, f64),
    {
        let default_rho = self.default_rho(target_exchange);
        let age = self.age_days(today);
        let decay = decay_factor(age, self.config.halflife_days);

        let matrix = self.matrix.read();
        for ((a, b), raw) in matrix.iter() {
            apply(a, b, decayed_rho(*raw, decay, default_rho));
        }
        matrix.len()
    }
}
