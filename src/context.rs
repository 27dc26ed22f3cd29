// =============================================================================
// Application context — every service constructed once, threaded everywhere
// =============================================================================
//
// No global singletons: the context owns the providers, detector, governor,
// executor, and stop manager, and the background loops borrow what they
// need through it. Tests substitute a context built over mock adapters.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::consensus::{ConsensusDetector, CostBreakdown, EvaluationContext, VenueQuote};
use crate::correlation::CorrelationProvider;
use crate::costs::atr::AtrProvider;
use crate::costs::fees::FeeProvider;
use crate::costs::funding::FundingProvider;
use crate::costs::hold_time::HoldTimeEstimator;
use crate::costs::slippage::SlippageProvider;
use crate::db::Store;
use crate::decision_log::DecisionLogger;
use crate::episode::EpisodeTracker;
use crate::exchanges::manager::ExchangeManager;
use crate::executor::Executor;
use crate::feed::{OutboundEvent, OutcomeMessage};
use crate::regime::RegimeDetector;
use crate::risk::RiskGovernor;
use crate::stops::{StopManager, StopTriggerResult};
use crate::types::{Direction, Fill};

/// Reference notional for consensus-time slippage quotes; the executor
/// re-quotes at the actual sized notional before placing.
const REFERENCE_ORDER_USD: f64 = 10_000.0;

/// Volatility percentile used for the adaptive window until a percentile
/// feed exists.
const DEFAULT_ATR_PERCENTILE: f64 = 0.5;

pub struct AppContext {
    pub config: Arc<RwLock<RuntimeConfig>>,
    pub store: Option<Arc<Store>>,
    pub manager: Arc<ExchangeManager>,
    pub detector: Arc<ConsensusDetector>,
    pub decision_logger: Arc<DecisionLogger>,
    pub correlation: Arc<CorrelationProvider>,
    pub atr: Arc<AtrProvider>,
    pub fees: Arc<FeeProvider>,
    pub slippage: Arc<SlippageProvider>,
    pub funding: Arc<FundingProvider>,
    pub hold_time: Arc<HoldTimeEstimator>,
    pub regime: Arc<RegimeDetector>,
    pub governor: Arc<RiskGovernor>,
    pub stops: Arc<StopManager>,
    pub executor: Arc<Executor>,
    pub episodes: Arc<EpisodeTracker>,
    /// Sink for signal/outcome messages to downstream subscribers.
    pub outbound_tx: RwLock<Option<mpsc::UnboundedSender<OutboundEvent>>>,
    /// Per-trader scalars from the sage service, kept for audit.
    trader_scores: RwLock<HashMap<String, f64>>,
    /// Active alpha-pool addresses. Empty set means no filtering (the scout
    /// already scopes its feed).
    alpha_pool: RwLock<HashSet<String>>,
}

impl AppContext {
    pub fn new(
        config: RuntimeConfig,
        store: Option<Arc<Store>>,
        manager: Arc<ExchangeManager>,
    ) -> Arc<Self> {
        let default_exchange = config.execution.default_exchange;
        let detector = Arc::new(ConsensusDetector::new(config.consensus.clone()));
        let correlation = Arc::new(CorrelationProvider::new(
            config.correlation.clone(),
            store.clone(),
        ));
        let atr = Arc::new(AtrProvider::new(
            config.atr.clone(),
            Arc::clone(&manager),
            store.clone(),
            default_exchange,
        ));
        let fees = Arc::new(FeeProvider::new());
        let slippage = Arc::new(SlippageProvider::new(config.execution.testnet));
        let funding = Arc::new(FundingProvider::new(Arc::clone(&manager)));
        let hold_time = Arc::new(HoldTimeEstimator::new(store.clone()));
        let regime = Arc::new(RegimeDetector::new(Arc::clone(&manager), default_exchange));
        let governor = Arc::new(RiskGovernor::new(config.risk.clone(), store.clone()));
        let stops = Arc::new(StopManager::new(
            config.stops.clone(),
            store.clone(),
            Arc::clone(&manager),
        ));
        let decision_logger = Arc::new(DecisionLogger::new(store.clone()));
        let episodes = Arc::new(EpisodeTracker::new(
            store.clone(),
            crate::consensus::DEFAULT_STOP_FRACTION,
        ));

        let config = Arc::new(RwLock::new(config));
        let executor = Arc::new(Executor::new(
            Arc::clone(&config),
            Arc::clone(&manager),
            Arc::clone(&governor),
            Arc::clone(&stops),
            store.clone(),
            Arc::clone(&fees),
            Arc::clone(&slippage),
            Arc::clone(&funding),
            Arc::clone(&hold_time),
            Arc::clone(&regime),
        ));

        Arc::new(Self {
            config,
            store,
            manager,
            detector,
            decision_logger,
            correlation,
            atr,
            fees,
            slippage,
            funding,
            hold_time,
            regime,
            governor,
            stops,
            executor,
            episodes,
            outbound_tx: RwLock::new(None),
            trader_scores: RwLock::new(HashMap::new()),
            alpha_pool: RwLock::new(HashSet::new()),
        })
    }

    pub fn set_outbound(&self, tx: mpsc::UnboundedSender<OutboundEvent>) {
        *self.outbound_tx.write() = Some(tx);
    }

    fn publish(&self, event: OutboundEvent) {
        if let Some(tx) = self.outbound_tx.read().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn record_trader_score(&self, address: &str, score: f64) {
        self.trader_scores
            .write()
            .insert(address.to_lowercase(), score);
    }

    /// Refresh the detector's correlation matrix from the provider, using
    /// the first venue-selection exchange to choose the default ρ.
    pub fn hydrate_correlations(&self) {
        let today = Utc::now().date_naive();
        let target = {
            let config = self.config.read();
            config
                .execution
                .venue_selection_exchanges
                .first()
                .copied()
                .unwrap_or(config.execution.default_exchange)
        };
        self.correlation.load(today);
        self.detector
            .set_default_rho(self.correlation.default_rho(target));
        let pairs = self
            .correlation
            .hydrate(target, today, |a, b, rho| {
                self.detector.update_correlation(a, b, rho);
            });
        info!(pairs, "detector correlation matrix hydrated");
        self.refresh_alpha_pool();
    }

    /// Reload the set of tracked trader addresses.
    pub fn refresh_alpha_pool(&self) {
        let Some(store) = &self.store else { return };
        match store.active_alpha_addresses() {
            Ok(addresses) => {
                let count = addresses.len();
                *self.alpha_pool.write() = addresses.into_iter().collect();
                info!(count, "alpha pool loaded");
            }
            Err(e) => warn!(error = %e, "failed to load alpha pool"),
        }
    }

    /// One inbound fill: episode attribution, consensus evaluation, decision
    /// logging, and execution handoff on a fired signal.
    pub async fn handle_fill(&self, fill: &Fill) {
        {
            let pool = self.alpha_pool.read();
            if !pool.is_empty() && !pool.contains(&fill.address) {
                debug!(address = %fill.address, "ignoring fill from outside the alpha pool");
                return;
            }
        }

        if let Some(closed) = self.episodes.process_fill(fill) {
            debug!(
                address = %closed.address,
                asset = %closed.asset,
                r = closed.r_multiple,
                reason = %closed.closed_reason,
                "trader episode closed"
            );
        }

        let ctx = self.build_evaluation_context(&fill.asset, fill.price).await;
        let Some(eval) = self
            .detector
            .process_fill(fill, DEFAULT_ATR_PERCENTILE, &ctx)
        else {
            return;
        };

        let decision_id = self.decision_logger.log_evaluation(&eval);

        let Some(signal) = eval.signal.clone() else {
            return;
        };

        self.publish(OutboundEvent::Signal(Box::new(signal.clone())));

        let result = self
            .executor
            .maybe_execute_signal(
                &decision_id,
                &signal.symbol,
                signal.direction,
                &signal.trigger_addresses,
                signal.stop_distance_pct,
                Some(signal.target_exchange),
            )
            .await;

        match result {
            Some(result) => {
                // A safety block on a fired signal gets its own risk_reject
                // record alongside the signal row.
                if result.status == crate::executor::ExecutionStatus::Rejected {
                    let checks = vec![crate::decision_log::RiskCheckRecord {
                        name: "execution_validation".to_string(),
                        passed: false,
                        reason: result
                            .error_message
                            .clone()
                            .unwrap_or_else(|| "execution blocked".to_string()),
                    }];
                    self.decision_logger.log_risk_reject(&eval, &checks);
                }
                info!(
                    decision_id,
                    symbol = %signal.symbol,
                    status = result.status.as_str(),
                    "signal execution finished"
                );
            }
            None => debug!(decision_id, "execution disabled, signal recorded only"),
        }
    }

    /// Resolve the async inputs one consensus evaluation needs. Errors
    /// degrade to conservative defaults rather than propagate.
    pub async fn build_evaluation_context(&self, asset: &str, price_hint: f64) -> EvaluationContext {
        let (venues, default_exchange) = {
            let config = self.config.read();
            let venues = if config.execution.per_signal_venue_selection {
                config.execution.venue_selection_exchanges.clone()
            } else {
                vec![config.execution.default_exchange]
            };
            (venues, config.execution.default_exchange)
        };

        // Volatility and regime for the stop distance, from the default
        // venue's data.
        let atr_data = self
            .atr
            .get_atr(asset, Some(default_exchange), Some(price_hint), false)
            .await;
        let regime_analysis = self.regime.detect_regime(asset, Some(default_exchange)).await;

        let stop_fraction =
            atr_data.stop_fraction() * regime_analysis.params.stop_multiplier;
        let (blocked, block_reason) = self.atr.should_block_gate(&atr_data);
        let hold_hours = self
            .hold_time
            .estimate_hold_hours(asset, Some(regime_analysis.regime));

        let mut quotes = Vec::with_capacity(venues.len());
        for exchange in venues {
            let fees_bps = self.fees.get_fees_bps(exchange, false).await;
            let slippage = self
                .slippage
                .estimate_slippage(asset, exchange, REFERENCE_ORDER_USD, true, false)
                .await;
            // Priced for the long side; the detector flips for shorts.
            let funding_bps = self
                .funding
                .get_funding_bps(asset, exchange, hold_hours, Direction::Long)
                .await;

            quotes.push(VenueQuote {
                exchange,
                costs: CostBreakdown {
                    fees_bps,
                    slippage_bps: slippage.estimated_slippage_bps,
                    funding_bps,
                    hold_hours,
                },
            });
        }

        EvaluationContext {
            stop_fraction: (stop_fraction > 0.0).then_some(stop_fraction),
            atr_block_reason: blocked.then_some(block_reason),
            venues: quotes,
            avg_win_r: crate::consensus::DEFAULT_AVG_WIN_R,
            avg_loss_r: crate::consensus::DEFAULT_AVG_LOSS_R,
            now: Utc::now(),
        }
    }

    /// Outcome attribution for a triggered stop: realized PnL and R flow to
    /// the decision row, the loss/win streak, and the outbound subject.
    pub fn handle_stop_trigger(&self, trigger: &StopTriggerResult) {
        let pnl = match trigger.direction {
            Direction::Long => {
                (trigger.trigger_price - trigger.entry_price) * trigger.entry_size
            }
            Direction::Short => {
                (trigger.entry_price - trigger.trigger_price) * trigger.entry_size
            }
        };
        let (r_multiple, _) = crate::episode::calculate_r(
            pnl,
            trigger.entry_size,
            trigger.entry_price,
            trigger.stop_distance_pct,
        );

        self.decision_logger
            .update_outcome(&trigger.decision_id, pnl, r_multiple);
        self.governor.report_trade_result(pnl > 0.0, Utc::now());
        self.governor.adjust_position_count(&trigger.symbol, -1);

        if let Some(order) = &trigger.order_result {
            if !order.success {
                warn!(
                    decision_id = %trigger.decision_id,
                    error = ?order.error,
                    "close order failed on stop trigger"
                );
            }
        }

        self.publish(OutboundEvent::Outcome(OutcomeMessage {
            decision_id: trigger.decision_id.clone(),
            symbol: trigger.symbol.clone(),
            pnl,
            r_multiple,
            reason: trigger.trigger_reason.clone(),
        }));
    }
}
