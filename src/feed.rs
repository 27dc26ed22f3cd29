// =============================================================================
// Feed — wire messages in from the scout, signals and outcomes out
// =============================================================================
//
// The upstream scout publishes fill events as JSON; the sage service may
// publish per-trader scores. Downstream auditors receive emitted signals and
// terminal outcomes. The transport is out of scope here: messages arrive on
// an in-process channel at the service boundary and leave the same way.
// =============================================================================

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::consensus::ConsensusSignal;
use crate::context::AppContext;
use crate::types::{Direction, Fill};

/// A fill event from the scout. `side` accepts buy/sell/long/short and `ts`
/// is epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillMessage {
    pub fill_id: String,
    pub address: String,
    pub asset: String,
    pub side: String,
    pub size: f64,
    pub price: f64,
    pub ts: i64,
}

impl FillMessage {
    /// Validate and convert to the internal fill type. Rejects unknown
    /// sides, non-positive sizes/prices, and unrepresentable timestamps.
    pub fn into_fill(self) -> Option<Fill> {
        let direction = Direction::parse(&self.side)?;
        if self.size <= 0.0 || self.price <= 0.0 {
            return None;
        }
        let ts = Utc.timestamp_millis_opt(self.ts).single()?;
        Some(Fill {
            fill_id: self.fill_id,
            address: self.address.to_lowercase(),
            asset: self.asset.to_uppercase(),
            direction,
            size: self.size,
            price: self.price,
            ts,
        })
    }
}

/// A per-trader scalar from the sage service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreMessage {
    pub address: String,
    pub score: f64,
}

/// Terminal result for one decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeMessage {
    pub decision_id: String,
    pub symbol: String,
    pub pnl: f64,
    pub r_multiple: f64,
    pub reason: String,
}

/// Everything the decision service consumes.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Fill(FillMessage),
    Score(ScoreMessage),
}

/// Everything the decision service publishes.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Signal(Box<ConsensusSignal>),
    Outcome(OutcomeMessage),
}

/// Consume inbound events until the channel closes. Fills are serialized
/// through here, which serializes window mutation per asset; a parse failure
/// drops the message with a warning and the loop continues.
pub async fn run_feed_loop(ctx: std::sync::Arc<AppContext>, mut rx: mpsc::Receiver<InboundEvent>) {
    info!("feed loop started");
    while let Some(event) = rx.recv().await {
        match event {
            InboundEvent::Fill(message) => {
                let fill_id = message.fill_id.clone();
                match message.into_fill() {
                    Some(fill) => ctx.handle_fill(&fill).await,
                    None => warn!(fill_id, "dropping malformed fill message"),
                }
            }
            InboundEvent::Score(score) => {
                ctx.record_trader_score(&score.address, score.score);
            }
        }
    }
    info!("feed loop ended (channel closed)");
}
