// =============================================================================
// Shared types used across the Quorum decision engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction. Inbound fills may say "buy"/"sell" or "long"/"short";
/// both map onto this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// Parse any of buy/sell/long/short (case-insensitive).
    pub fn parse(side: &str) -> Option<Self> {
        match side.to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(Self::Long),
            "short" | "sell" => Some(Self::Short),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    /// +1.0 for long, -1.0 for short.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// A single observed execution by a tracked trader. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: String,
    /// Trader wallet address, stored lowercase.
    pub address: String,
    /// Canonical asset code (BTC, ETH).
    pub asset: String,
    pub direction: Direction,
    /// Always positive; sign comes from `direction`.
    pub size: f64,
    pub price: f64,
    pub ts: DateTime<Utc>,
}

impl Fill {
    /// Positive for longs/buys, negative for shorts/sells.
    pub fn signed_size(&self) -> f64 {
        self.direction.sign() * self.size
    }
}
