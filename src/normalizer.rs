// =============================================================================
// Account normalizer — one currency for risk math
// =============================================================================
//
// Every venue reports in its own quote currency (USD on Hyperliquid, USDT on
// Bybit and Aster). Risk math wants a single denomination, so balances and
// position notionals are normalized to USD here. USDT is treated as 1:1 with
// USD; sub-basis-point depegs are ignored as a matter of policy.
// =============================================================================

use tracing::warn;

use crate::exchanges::{Balance, Position};

/// Balance with USD-equivalent values, wrapping the original so audit can
/// trace the source currency and applied rate.
#[derive(Debug, Clone)]
pub struct NormalizedBalance {
    pub original: Balance,
    pub total_equity_usd: f64,
    pub available_balance_usd: f64,
    pub margin_used_usd: f64,
    pub maintenance_margin_usd: f64,
    pub unrealized_pnl_usd: f64,
    pub conversion_rate: f64,
    /// "identity" for USD/USDT, "assumed" for anything unrecognized.
    pub conversion_source: &'static str,
}

/// Position with USD-equivalent notional.
#[derive(Debug, Clone)]
pub struct NormalizedPosition {
    pub original: Position,
    pub notional_value_usd: f64,
    pub conversion_rate: f64,
    pub conversion_source: &'static str,
}

/// Conversion rate for `currency` to USD.
pub fn conversion_rate(currency: &str) -> (f64, &'static str) {
    match currency.to_ascii_uppercase().as_str() {
        "USD" | "USDT" => (1.0, "identity"),
        other => {
            warn!(currency = other, "unknown quote currency, assuming 1:1 USD");
            (1.0, "assumed")
        }
    }
}

pub fn normalize_balance(balance: &Balance) -> NormalizedBalance {
    let (rate, source) = conversion_rate(&balance.currency);
    NormalizedBalance {
        original: balance.clone(),
        total_equity_usd: balance.total_equity * rate,
        available_balance_usd: balance.available_balance * rate,
        margin_used_usd: balance.margin_used * rate,
        maintenance_margin_usd: balance.maintenance_margin * rate,
        unrealized_pnl_usd: balance.unrealized_pnl * rate,
        conversion_rate: rate,
        conversion_source: source,
    }
}

pub fn normalize_position(position: &Position, quote_currency: &str) -> NormalizedPosition {
    let (rate, source) = conversion_rate(quote_currency);
    NormalizedPosition {
        original: position.clone(),
        notional_value_usd: position.notional_value() * rate,
        conversion_rate: rate,
        conversion_source: source,
    }
}
