// =============================================================================
// Decision logging — every evaluation gets exactly one auditable record
// =============================================================================
//
// Fires, skips, and risk rejections all land here with the gate-by-gate
// trail and a human-readable reasoning line. When the position later closes
// the same row picks up realized PnL and the R-multiple. Logging failures
// never break the signal flow.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::consensus::ConsensusEvaluation;
use crate::db::{DecisionLogRow, DecisionStats, Store};

/// Result of a single gate check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub value: f64,
    pub threshold: f64,
    #[serde(default)]
    pub detail: String,
}

impl GateResult {
    pub fn new(name: &str, passed: bool, value: f64, threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            passed,
            value,
            threshold,
            detail: String::new(),
        }
    }

    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = detail;
        self
    }
}

/// One risk-governor check in a serializable form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCheckRecord {
    pub name: String,
    pub passed: bool,
    pub reason: String,
}

/// Human-readable explanation of a decision, built from the failing gates.
pub fn generate_reasoning(
    decision_type: &str,
    symbol: &str,
    direction: &str,
    trader_count: u32,
    agreement_pct: f64,
    effective_k: f64,
    gates: &[GateResult],
    risk_checks: Option<&[RiskCheckRecord]>,
) -> String {
    match decision_type {
        "signal" => format!(
            "{trader_count} alpha pool traders opened {} {symbol}. \
             {:.0}% agreement with effK={effective_k:.1}. All consensus gates passed.",
            direction.to_uppercase(),
            agreement_pct * 100.0,
        ),
        "skip" => {
            let mut reasons = Vec::new();
            for gate in gates.iter().filter(|g| !g.passed) {
                let reason = match gate.name.as_str() {
                    "min_traders" => format!(
                        "only {} traders (need {})",
                        gate.value as u32, gate.threshold as u32
                    ),
                    "supermajority" => format!(
                        "only {:.0}% agreement (need {:.0}%)",
                        gate.value * 100.0,
                        gate.threshold * 100.0
                    ),
                    "effective_k" => format!(
                        "effK={:.2} too low (need {:.1})",
                        gate.value, gate.threshold
                    ),
                    "freshness" => format!(
                        "signal {:.0}s stale (max {:.0}s)",
                        gate.value, gate.threshold
                    ),
                    "price_band" => format!(
                        "price drifted {:.1}bps (max {:.1}bps)",
                        gate.value, gate.threshold
                    ),
                    "atr_validity" => format!("ATR data invalid: {}", gate.detail),
                    "ev_gate" => format!(
                        "EV={:.2}R below threshold ({:.2}R)",
                        gate.value, gate.threshold
                    ),
                    other => format!("{other} failed ({:.2} vs {:.2})", gate.value, gate.threshold),
                };
                reasons.push(reason);
            }

            if reasons.is_empty() {
                format!("Skipped: {trader_count} traders but no clear consensus.")
            } else {
                format!(
                    "Skipped: {trader_count} traders detected but gates failed. {}.",
                    reasons.join("; ")
                )
            }
        }
        "risk_reject" => {
            let risk_reasons: Vec<String> = risk_checks
                .unwrap_or(&[])
                .iter()
                .filter(|c| !c.passed)
                .map(|c| c.reason.clone())
                .collect();
            let reason_str = if risk_reasons.is_empty() {
                "risk limits exceeded".to_string()
            } else {
                risk_reasons.join("; ")
            };
            format!(
                "Consensus detected but rejected by risk limits. \
                 {trader_count} traders, {:.0}% agreement. Reason: {reason_str}.",
                agreement_pct * 100.0,
            )
        }
        _ => "Decision recorded.".to_string(),
    }
}

pub struct DecisionLogger {
    store: Option<Arc<Store>>,
}

impl DecisionLogger {
    pub fn new(store: Option<Arc<Store>>) -> Self {
        Self { store }
    }

    /// Record a consensus evaluation (signal or skip). Returns the decision
    /// id for downstream correlation.
    pub fn log_evaluation(&self, eval: &ConsensusEvaluation) -> String {
        let decision_type = eval.decision_type();
        let direction = eval
            .direction
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());

        // A fired signal keeps its own id so the executor and stop manager
        // reference the same row.
        let decision_id = eval
            .signal
            .as_ref()
            .map(|s| s.id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let reasoning = generate_reasoning(
            decision_type,
            &eval.symbol,
            &direction,
            eval.trader_count,
            eval.agreement_pct,
            eval.effective_k,
            &eval.gates,
            None,
        );

        self.write_row(DecisionLogRow {
            id: decision_id.clone(),
            created_at: Utc::now(),
            symbol: eval.symbol.clone(),
            direction,
            decision_type: decision_type.to_string(),
            trader_count: eval.trader_count,
            agreement_pct: eval.agreement_pct,
            effective_k: eval.effective_k,
            avg_confidence: eval.p_win,
            ev_estimate: eval.ev_net_r,
            price_at_decision: eval.price,
            gates: serde_json::to_value(&eval.gates).unwrap_or(serde_json::Value::Null),
            risk_checks: None,
            reasoning,
            outcome_pnl: None,
            outcome_r_multiple: None,
        });

        decision_id
    }

    /// Record a consensus that fired but was refused by the risk layer.
    pub fn log_risk_reject(
        &self,
        eval: &ConsensusEvaluation,
        risk_checks: &[RiskCheckRecord],
    ) -> String {
        let decision_id = Uuid::new_v4().to_string();
        let direction = eval
            .direction
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());

        let reasoning = generate_reasoning(
            "risk_reject",
            &eval.symbol,
            &direction,
            eval.trader_count,
            eval.agreement_pct,
            eval.effective_k,
            &eval.gates,
            Some(risk_checks),
        );

        self.write_row(DecisionLogRow {
            id: decision_id.clone(),
            created_at: Utc::now(),
            symbol: eval.symbol.clone(),
            direction,
            decision_type: "risk_reject".to_string(),
            trader_count: eval.trader_count,
            agreement_pct: eval.agreement_pct,
            effective_k: eval.effective_k,
            avg_confidence: eval.p_win,
            ev_estimate: eval.ev_net_r,
            price_at_decision: eval.price,
            gates: serde_json::to_value(&eval.gates).unwrap_or(serde_json::Value::Null),
            risk_checks: serde_json::to_value(risk_checks).ok(),
            reasoning,
            outcome_pnl: None,
            outcome_r_multiple: None,
        });

        decision_id
    }

    /// Attach the realized outcome to a decision once its position closes.
    pub fn update_outcome(&self, decision_id: &str, pnl: f64, r_multiple: f64) {
        if let Some(store) = &self.store {
            if let Err(e) = store.update_decision_outcome(decision_id, pnl, r_multiple) {
                warn!(error = %e, decision_id, "failed to update decision outcome");
            }
        }
    }

    pub fn list(
        &self,
        symbol: Option<&str>,
        decision_type: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> (u64, Vec<DecisionLogRow>) {
        match &self.store {
            Some(store) => store
                .list_decisions(symbol, decision_type, limit, offset)
                .unwrap_or_else(|e| {
                    warn!(error = %e, "failed to list decisions");
                    (0, Vec::new())
                }),
            None => (0, Vec::new()),
        }
    }

    pub fn stats(&self, days: i64) -> DecisionStats {
        match &self.store {
            Some(store) => store.decision_stats(days).unwrap_or_else(|e| {
                warn!(error = %e, "failed to compute decision stats");
                DecisionStats::default()
            }),
            None => DecisionStats::default(),
        }
    }

    fn write_row(&self, row: DecisionLogRow) {
        if let Some(store) = &self.store {
            if let Err(e) = store.insert_decision(&row) {
                warn!(error = %e, "failed to log decision");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    fn evaluation(decision_type: &str) -> ConsensusEvaluation {
        let gates = vec![
            GateResult::new("min_traders", true, 3.0, 3.0),
            GateResult::new("supermajority", true, 1.0, 0.7),
            GateResult::new(
                "effective_k",
                decision_type != "skip",
                if decision_type == "skip" { 1.07 } else { 2.5 },
                2.0,
            ),
        ];
        ConsensusEvaluation {
            symbol: "BTC".to_string(),
            direction: Some(Direction::Long),
            trader_count: 3,
            agreement_pct: 1.0,
            effective_k: if decision_type == "skip" { 1.07 } else { 2.5 },
            p_win: Some(0.62),
            ev_net_r: Some(0.35),
            price: Some(100_000.0),
            gates,
            signal: None,
        }
    }

    #[test]
    fn signal_reasoning_mentions_agreement_and_eff_k() {
        let text = generate_reasoning("signal", "BTC", "long", 3, 1.0, 2.5, &[], None);
        assert!(text.contains("3 alpha pool traders"));
        assert!(text.contains("LONG"));
        assert!(text.contains("100% agreement"));
        assert!(text.contains("effK=2.5"));
    }

    #[test]
    fn skip_reasoning_names_failed_gates() {
        let gates = vec![
            GateResult::new("supermajority", true, 1.0, 0.7),
            GateResult::new("effective_k", false, 1.07, 2.0),
        ];
        let text = generate_reasoning("skip", "BTC", "long", 3, 1.0, 1.07, &gates, None);
        assert!(text.contains("effK=1.07 too low (need 2.0)"));
    }

    #[test]
    fn risk_reject_reasoning_carries_check_reasons() {
        let checks = vec![RiskCheckRecord {
            name: "kill_switch".to_string(),
            passed: false,
            reason: "KILL SWITCH: Daily drawdown 6.0% >= 5.0%".to_string(),
        }];
        let text = generate_reasoning("risk_reject", "BTC", "long", 3, 1.0, 2.5, &[], Some(&checks));
        assert!(text.contains("rejected by risk limits"));
        assert!(text.contains("KILL SWITCH"));
    }

    #[test]
    fn evaluation_roundtrips_through_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let logger = DecisionLogger::new(Some(Arc::clone(&store)));

        let skip_id = logger.log_evaluation(&evaluation("skip"));
        assert!(!skip_id.is_empty());

        let (total, rows) = logger.list(Some("BTC"), Some("skip"), 10, 0);
        assert_eq!(total, 1);
        assert_eq!(rows[0].decision_type, "skip");
        assert!(rows[0].reasoning.contains("gates failed"));
        let gates = rows[0].gates.as_array().unwrap();
        assert_eq!(gates.len(), 3);

        logger.update_outcome(&skip_id, -120.0, -0.6);
        let (_, rows) = logger.list(None, None, 10, 0);
        assert_eq!(rows[0].outcome_r_multiple, Some(-0.6));

        let stats = logger.stats(7);
        assert_eq!(stats.total_decisions, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.wins, 0);
    }

    #[test]
    fn logger_without_store_is_silent() {
        let logger = DecisionLogger::new(None);
        let id = logger.log_evaluation(&evaluation("skip"));
        assert!(!id.is_empty());
        assert_eq!(logger.list(None, None, 10, 0).0, 0);
    }
}
