// =============================================================================
// Persistence — embedded SQLite store for telemetry, audit, and durable state
// =============================================================================
//
// Writes from the decision path are best-effort: callers log a warning on
// Err and carry on. Schema bootstrap is a single idempotent pass; proper
// migrations live outside this service.
//
// Concurrency: one connection behind a Mutex, acquire-per-statement. Every
// query here is short.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::exchanges::Balance;
use crate::types::Direction;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS marks_1m (
    asset TEXT NOT NULL,
    ts TEXT NOT NULL,
    open REAL, high REAL, low REAL, close REAL, mid REAL,
    atr14 REAL,
    PRIMARY KEY (asset, ts)
);

CREATE TABLE IF NOT EXISTS trader_performance (
    address TEXT PRIMARY KEY,
    nig_m REAL, nig_kappa REAL, nig_alpha REAL, nig_beta REAL,
    total_signals INTEGER DEFAULT 0,
    avg_r REAL, avg_win_r REAL, avg_loss_r REAL,
    win_rate REAL,
    episode_count INTEGER DEFAULT 0
);

CREATE TABLE IF NOT EXISTS trader_corr (
    as_of_date TEXT NOT NULL,
    asset TEXT NOT NULL,
    addr_a TEXT NOT NULL,
    addr_b TEXT NOT NULL,
    rho REAL NOT NULL,
    n_buckets INTEGER NOT NULL,
    computed_at TEXT NOT NULL,
    PRIMARY KEY (as_of_date, asset, addr_a, addr_b)
);

CREATE TABLE IF NOT EXISTS alpha_pool_addresses (
    address TEXT PRIMARY KEY,
    is_active INTEGER NOT NULL DEFAULT 1,
    pnl_30d REAL, roi_30d REAL, win_rate REAL, account_value REAL
);

CREATE TABLE IF NOT EXISTS active_stops (
    decision_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    entry_price REAL NOT NULL,
    entry_size REAL NOT NULL,
    stop_price REAL NOT NULL,
    take_profit_price REAL,
    trailing_enabled INTEGER NOT NULL DEFAULT 0,
    trail_distance_pct REAL NOT NULL DEFAULT 0.02,
    timeout_at TEXT,
    exchange TEXT NOT NULL DEFAULT 'hyperliquid',
    native_stop_placed INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL,
    triggered_at TEXT,
    triggered_price REAL,
    triggered_reason TEXT,
    PRIMARY KEY (symbol, decision_id)
);

CREATE TABLE IF NOT EXISTS decision_logs (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    decision_type TEXT NOT NULL,
    trader_count INTEGER NOT NULL,
    agreement_pct REAL NOT NULL,
    effective_k REAL NOT NULL,
    avg_confidence REAL,
    ev_estimate REAL,
    price_at_decision REAL,
    gates TEXT,
    risk_checks TEXT,
    reasoning TEXT NOT NULL,
    outcome_pnl REAL,
    outcome_r_multiple REAL,
    outcome_closed_at TEXT
);

CREATE TABLE IF NOT EXISTS execution_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    decision_id TEXT,
    created_at TEXT NOT NULL,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    size REAL NOT NULL,
    leverage INTEGER NOT NULL DEFAULT 1,
    status TEXT NOT NULL,
    fill_price REAL,
    fill_size REAL,
    error_message TEXT,
    account_value REAL,
    position_pct REAL,
    exposure_before REAL,
    exposure_after REAL,
    kelly_full REAL,
    kelly_fraction_used REAL,
    kelly_position_pct REAL,
    kelly_method TEXT,
    kelly_reasoning TEXT,
    kelly_capped INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS exchange_connections (
    exchange_type TEXT NOT NULL,
    testnet INTEGER NOT NULL,
    is_connected INTEGER NOT NULL,
    last_connected_at TEXT,
    last_error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (exchange_type, testnet)
);

CREATE TABLE IF NOT EXISTS exchange_balances (
    exchange_type TEXT PRIMARY KEY,
    total_equity REAL NOT NULL,
    available_balance REAL NOT NULL,
    margin_used REAL NOT NULL,
    unrealized_pnl REAL NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_daily_pnl (
    date TEXT PRIMARY KEY,
    starting_equity REAL NOT NULL,
    current_equity REAL NOT NULL,
    daily_drawdown_pct REAL NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS risk_governor_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trade_episodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL,
    asset TEXT NOT NULL,
    direction TEXT NOT NULL,
    entry_vwap REAL NOT NULL,
    entry_size REAL NOT NULL,
    realized_pnl REAL NOT NULL,
    r_multiple REAL NOT NULL,
    r_multiple_raw REAL NOT NULL,
    closed_reason TEXT NOT NULL,
    opened_at TEXT NOT NULL,
    closed_at TEXT NOT NULL
);
"#;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// NIG posterior plus running R statistics for one tracked trader.
/// Read-only here; the sage service owns the writes.
#[derive(Debug, Clone)]
pub struct TraderPerformanceRow {
    pub address: String,
    pub win_rate: f64,
    pub avg_win_r: f64,
    pub avg_loss_r: f64,
    pub episode_count: u32,
}

#[derive(Debug, Clone)]
pub struct CorrelationRow {
    pub addr_a: String,
    pub addr_b: String,
    pub rho: f64,
    pub n_buckets: u32,
}

#[derive(Debug, Clone)]
pub struct ActiveStopRow {
    pub decision_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub entry_size: f64,
    pub stop_price: f64,
    pub take_profit_price: Option<f64>,
    pub trailing_enabled: bool,
    pub trail_distance_pct: f64,
    pub timeout_at: Option<DateTime<Utc>>,
    pub exchange: String,
    pub native_stop_placed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DecisionLogRow {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub symbol: String,
    pub direction: String,
    pub decision_type: String,
    pub trader_count: u32,
    pub agreement_pct: f64,
    pub effective_k: f64,
    pub avg_confidence: Option<f64>,
    pub ev_estimate: Option<f64>,
    pub price_at_decision: Option<f64>,
    pub gates: serde_json::Value,
    pub risk_checks: Option<serde_json::Value>,
    pub reasoning: String,
    pub outcome_pnl: Option<f64>,
    pub outcome_r_multiple: Option<f64>,
}

#[derive(Debug, Clone, Default)]
pub struct DecisionStats {
    pub total_decisions: u64,
    pub signals: u64,
    pub skipped: u64,
    pub risk_rejected: u64,
    pub closed: u64,
    pub wins: u64,
    pub avg_effective_k: f64,
    pub avg_ev: f64,
    pub avg_result_r: f64,
    pub total_r: f64,
}

impl DecisionStats {
    pub fn win_rate(&self) -> f64 {
        if self.closed == 0 {
            return 0.0;
        }
        self.wins as f64 / self.closed as f64
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLogRow {
    pub decision_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub leverage: u32,
    pub status: String,
    pub fill_price: Option<f64>,
    pub fill_size: Option<f64>,
    pub error_message: Option<String>,
    pub account_value: Option<f64>,
    pub position_pct: Option<f64>,
    pub exposure_before: Option<f64>,
    pub exposure_after: Option<f64>,
    pub kelly_full: Option<f64>,
    pub kelly_fraction_used: Option<f64>,
    pub kelly_position_pct: Option<f64>,
    pub kelly_method: Option<String>,
    pub kelly_reasoning: Option<String>,
    pub kelly_capped: bool,
}

#[derive(Debug, Clone)]
pub struct EpisodeRow {
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
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite store at {path}"))?;
        conn.execute_batch(SCHEMA).context("schema bootstrap failed")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory store")?;
        conn.execute_batch(SCHEMA).context("schema bootstrap failed")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Raw connection access for test fixtures that seed upstream-owned
    /// tables (trader_performance, trader_corr, alpha_pool_addresses).
    #[cfg(test)]
    pub(crate) fn conn_for_tests(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    // -- exchange telemetry ---------------------------------------------------

    pub fn record_connection(
        &self,
        exchange: &str,
        testnet: bool,
        is_connected: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let connected_at = if is_connected { Some(now.clone()) } else { None };
        self.conn.lock().execute(
            "INSERT INTO exchange_connections
             (exchange_type, testnet, is_connected, last_connected_at, last_error, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (exchange_type, testnet) DO UPDATE SET
                 is_connected = excluded.is_connected,
                 last_connected_at = COALESCE(excluded.last_connected_at, last_connected_at),
                 last_error = excluded.last_error,
                 updated_at = excluded.updated_at",
            params![exchange, testnet, is_connected, connected_at, error, now],
        )?;
        Ok(())
    }

    pub fn record_balance(&self, exchange: &str, balance: &Balance) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO exchange_balances
             (exchange_type, total_equity, available_balance, margin_used, unrealized_pnl, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (exchange_type) DO UPDATE SET
                 total_equity = excluded.total_equity,
                 available_balance = excluded.available_balance,
                 margin_used = excluded.margin_used,
                 unrealized_pnl = excluded.unrealized_pnl,
                 timestamp = excluded.timestamp",
            params![
                exchange,
                balance.total_equity,
                balance.available_balance,
                balance.margin_used,
                balance.unrealized_pnl,
                balance.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    // -- risk governor durable state -----------------------------------------

    pub fn save_governor_state(&self, key: &str, value: &str) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO risk_governor_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (key) DO UPDATE SET
                 value = excluded.value,
                 updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_governor_state(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM risk_governor_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Record the equity observation for `date`. The first observation of a
    /// UTC date fixes the day's starting equity; later ones only update the
    /// current equity and drawdown. Returns the starting equity on record.
    pub fn upsert_daily_equity(&self, date: &str, current_equity: f64) -> Result<f64> {
        let conn = self.conn.lock();
        let existing: Option<f64> = conn
            .query_row(
                "SELECT starting_equity FROM risk_daily_pnl WHERE date = ?1",
                params![date],
                |row| row.get(0),
            )
            .optional()?;

        let now = Utc::now().to_rfc3339();
        match existing {
            Some(starting) => {
                let drawdown = if starting > 0.0 {
                    ((starting - current_equity) / starting).max(0.0)
                } else {
                    0.0
                };
                conn.execute(
                    "UPDATE risk_daily_pnl
                     SET current_equity = ?1, daily_drawdown_pct = ?2, updated_at = ?3
                     WHERE date = ?4",
                    params![current_equity, drawdown, now, date],
                )?;
                Ok(starting)
            }
            None => {
                conn.execute(
                    "INSERT INTO risk_daily_pnl
                     (date, starting_equity, current_equity, daily_drawdown_pct, updated_at)
                     VALUES (?1, ?2, ?2, 0, ?3)",
                    params![date, current_equity, now],
                )?;
                Ok(current_equity)
            }
        }
    }

    // -- trader data (read-only for this service) ----------------------------

    pub fn get_trader_performance(&self, address: &str) -> Result<Option<TraderPerformanceRow>> {
        let row = self
            .conn
            .lock()
            .query_row(
                "SELECT address,
                        COALESCE(win_rate, 0.5),
                        COALESCE(avg_win_r, 0.5),
                        COALESCE(avg_loss_r, 1.0),
                        COALESCE(episode_count, 0)
                 FROM trader_performance
                 WHERE address = ?1",
                params![address.to_lowercase()],
                |row| {
                    Ok(TraderPerformanceRow {
                        address: row.get(0)?,
                        win_rate: row.get(1)?,
                        avg_win_r: row.get(2)?,
                        avg_loss_r: row.get::<_, f64>(3)?.abs(),
                        episode_count: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Latest day's pairwise correlations, with the as-of date they carry.
    pub fn load_correlations(&self) -> Result<(Option<NaiveDate>, Vec<CorrelationRow>)> {
        let conn = self.conn.lock();
        let as_of: Option<String> = conn
            .query_row("SELECT MAX(as_of_date) FROM trader_corr", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        let Some(as_of) = as_of else {
            return Ok((None, Vec::new()));
        };

        let mut stmt = conn.prepare(
            "SELECT addr_a, addr_b, rho, n_buckets FROM trader_corr WHERE as_of_date = ?1",
        )?;
        let rows = stmt
            .query_map(params![as_of], |row| {
                Ok(CorrelationRow {
                    addr_a: row.get(0)?,
                    addr_b: row.get(1)?,
                    rho: row.get(2)?,
                    n_buckets: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let date = NaiveDate::parse_from_str(&as_of, "%Y-%m-%d").ok();
        Ok((date, rows))
    }

    pub fn active_alpha_addresses(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT LOWER(address) FROM alpha_pool_addresses WHERE is_active = 1")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- ATR / marks ----------------------------------------------------------

    /// Most recent precomputed 1-minute ATR for an asset, if any.
    pub fn latest_db_atr(&self, asset: &str) -> Result<Option<(f64, DateTime<Utc>)>> {
        let row: Option<(f64, String)> = self
            .conn
            .lock()
            .query_row(
                "SELECT atr14, ts FROM marks_1m
                 WHERE asset = ?1 AND atr14 IS NOT NULL
                 ORDER BY ts DESC LIMIT 1",
                params![asset],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(atr, ts)| {
            DateTime::parse_from_rfc3339(&ts)
                .ok()
                .map(|t| (atr, t.with_timezone(&Utc)))
        }))
    }

    // -- active stops ---------------------------------------------------------

    pub fn save_stop(&self, row: &ActiveStopRow) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO active_stops
             (decision_id, symbol, direction, entry_price, entry_size, stop_price,
              take_profit_price, trailing_enabled, trail_distance_pct, timeout_at,
              exchange, native_stop_placed, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'active', ?13)
             ON CONFLICT (symbol, decision_id) DO UPDATE SET
                 stop_price = excluded.stop_price,
                 take_profit_price = excluded.take_profit_price,
                 exchange = excluded.exchange,
                 native_stop_placed = excluded.native_stop_placed,
                 status = 'active'",
            params![
                row.decision_id,
                row.symbol,
                row.direction.to_string(),
                row.entry_price,
                row.entry_size,
                row.stop_price,
                row.take_profit_price,
                row.trailing_enabled,
                row.trail_distance_pct,
                row.timeout_at.map(|t| t.to_rfc3339()),
                row.exchange,
                row.native_stop_placed,
                row.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn active_stops(&self) -> Result<Vec<ActiveStopRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT decision_id, symbol, direction, entry_price, entry_size, stop_price,
                    take_profit_price, trailing_enabled, trail_distance_pct, timeout_at,
                    exchange, native_stop_placed, created_at
             FROM active_stops
             WHERE status = 'active'",
        )?;

        let rows = stmt
            .query_map([], |row| {
                let direction: String = row.get(2)?;
                let timeout_at: Option<String> = row.get(9)?;
                let created_at: String = row.get(12)?;
                Ok(ActiveStopRow {
                    decision_id: row.get(0)?,
                    symbol: row.get(1)?,
                    direction: Direction::parse(&direction).unwrap_or(Direction::Long),
                    entry_price: row.get(3)?,
                    entry_size: row.get(4)?,
                    stop_price: row.get(5)?,
                    take_profit_price: row.get(6)?,
                    trailing_enabled: row.get(7)?,
                    trail_distance_pct: row.get(8)?,
                    timeout_at: timeout_at.and_then(|t| {
                        DateTime::parse_from_rfc3339(&t)
                            .ok()
                            .map(|t| t.with_timezone(&Utc))
                    }),
                    exchange: row.get(10)?,
                    native_stop_placed: row.get(11)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn update_stop_price(&self, decision_id: &str, symbol: &str, new_stop: f64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE active_stops SET stop_price = ?1
             WHERE decision_id = ?2 AND symbol = ?3 AND status = 'active'",
            params![new_stop, decision_id, symbol],
        )?;
        Ok(())
    }

    pub fn mark_stop_triggered(
        &self,
        decision_id: &str,
        symbol: &str,
        price: f64,
        reason: &str,
    ) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE active_stops
             SET status = 'triggered', triggered_at = ?1, triggered_price = ?2,
                 triggered_reason = ?3
             WHERE decision_id = ?4 AND symbol = ?5",
            params![Utc::now().to_rfc3339(), price, reason, decision_id, symbol],
        )?;
        Ok(())
    }

    pub fn mark_stop_cancelled(&self, decision_id: &str, symbol: &str) -> Result<bool> {
        let changed = self.conn.lock().execute(
            "UPDATE active_stops SET status = 'cancelled'
             WHERE decision_id = ?1 AND symbol = ?2 AND status = 'active'",
            params![decision_id, symbol],
        )?;
        Ok(changed > 0)
    }

    // -- decision logs --------------------------------------------------------

    pub fn insert_decision(&self, row: &DecisionLogRow) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO decision_logs
             (id, created_at, symbol, direction, decision_type, trader_count,
              agreement_pct, effective_k, avg_confidence, ev_estimate,
              price_at_decision, gates, risk_checks, reasoning)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                row.id,
                row.created_at.to_rfc3339(),
                row.symbol,
                row.direction,
                row.decision_type,
                row.trader_count,
                row.agreement_pct,
                row.effective_k,
                row.avg_confidence,
                row.ev_estimate,
                row.price_at_decision,
                row.gates.to_string(),
                row.risk_checks.as_ref().map(|v| v.to_string()),
                row.reasoning,
            ],
        )?;
        Ok(())
    }

    pub fn update_decision_outcome(&self, decision_id: &str, pnl: f64, r_multiple: f64) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE decision_logs
             SET outcome_pnl = ?1, outcome_r_multiple = ?2, outcome_closed_at = ?3
             WHERE id = ?4",
            params![pnl, r_multiple, Utc::now().to_rfc3339(), decision_id],
        )?;
        Ok(())
    }

    pub fn list_decisions(
        &self,
        symbol: Option<&str>,
        decision_type: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<(u64, Vec<DecisionLogRow>)> {
        let conn = self.conn.lock();

        let mut conditions = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(s) = symbol {
            conditions.push(format!("symbol = ?{}", args.len() + 1));
            args.push(s.to_uppercase());
        }
        if let Some(t) = decision_type {
            conditions.push(format!("decision_type = ?{}", args.len() + 1));
            args.push(t.to_string());
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM decision_logs {where_clause}");
        let total: u64 = conn.query_row(
            &count_sql,
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let list_sql = format!(
            "SELECT id, created_at, symbol, direction, decision_type, trader_count,
                    agreement_pct, effective_k, avg_confidence, ev_estimate,
                    price_at_decision, gates, risk_checks, reasoning,
                    outcome_pnl, outcome_r_multiple
             FROM decision_logs {where_clause}
             ORDER BY created_at DESC
             LIMIT ?{} OFFSET ?{}",
            args.len() + 1,
            args.len() + 2,
        );
        let mut full_args = args.clone();
        full_args.push(limit.to_string());
        full_args.push(offset.to_string());

        let mut stmt = conn.prepare(&list_sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(full_args.iter()), |row| {
                let created_at: String = row.get(1)?;
                let gates: Option<String> = row.get(11)?;
                let risk_checks: Option<String> = row.get(12)?;
                Ok(DecisionLogRow {
                    id: row.get(0)?,
                    created_at: DateTime::parse_from_rfc3339(&created_at)
                        .map(|t| t.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    symbol: row.get(2)?,
                    direction: row.get(3)?,
                    decision_type: row.get(4)?,
                    trader_count: row.get(5)?,
                    agreement_pct: row.get(6)?,
                    effective_k: row.get(7)?,
                    avg_confidence: row.get(8)?,
                    ev_estimate: row.get(9)?,
                    price_at_decision: row.get(10)?,
                    gates: gates
                        .and_then(|g| serde_json::from_str(&g).ok())
                        .unwrap_or(serde_json::Value::Null),
                    risk_checks: risk_checks.and_then(|r| serde_json::from_str(&r).ok()),
                    reasoning: row.get(13)?,
                    outcome_pnl: row.get(14)?,
                    outcome_r_multiple: row.get(15)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok((total, rows))
    }

    pub fn decision_stats(&self, days: i64) -> Result<DecisionStats> {
        let since = (Utc::now() - chrono::Duration::days(days)).to_rfc3339();
        let conn = self.conn.lock();
        let stats = conn.query_row(
            "SELECT
                COUNT(*),
                SUM(CASE WHEN decision_type = 'signal' THEN 1 ELSE 0 END),
                SUM(CASE WHEN decision_type = 'skip' THEN 1 ELSE 0 END),
                SUM(CASE WHEN decision_type = 'risk_reject' THEN 1 ELSE 0 END),
                SUM(CASE WHEN outcome_r_multiple IS NOT NULL THEN 1 ELSE 0 END),
                SUM(CASE WHEN outcome_r_multiple > 0 THEN 1 ELSE 0 END),
                AVG(CASE WHEN decision_type = 'signal' THEN effective_k END),
                AVG(CASE WHEN decision_type = 'signal' THEN ev_estimate END),
                AVG(outcome_r_multiple),
                SUM(outcome_r_multiple)
             FROM decision_logs
             WHERE created_at > ?1",
            params![since],
            |row| {
                Ok(DecisionStats {
                    total_decisions: row.get::<_, Option<u64>>(0)?.unwrap_or(0),
                    signals: row.get::<_, Option<u64>>(1)?.unwrap_or(0),
                    skipped: row.get::<_, Option<u64>>(2)?.unwrap_or(0),
                    risk_rejected: row.get::<_, Option<u64>>(3)?.unwrap_or(0),
                    closed: row.get::<_, Option<u64>>(4)?.unwrap_or(0),
                    wins: row.get::<_, Option<u64>>(5)?.unwrap_or(0),
                    avg_effective_k: row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
                    avg_ev: row.get::<_, Option<f64>>(7)?.unwrap_or(0.0),
                    avg_result_r: row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
                    total_r: row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
                })
            },
        )?;
        Ok(stats)
    }

    // -- execution logs -------------------------------------------------------

    pub fn insert_execution(&self, row: &ExecutionLogRow) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO execution_logs
             (decision_id, created_at, exchange, symbol, side, size, leverage, status,
              fill_price, fill_size, error_message, account_value, position_pct,
              exposure_before, exposure_after, kelly_full, kelly_fraction_used,
              kelly_position_pct, kelly_method, kelly_reasoning, kelly_capped)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                row.decision_id,
                Utc::now().to_rfc3339(),
                row.exchange,
                row.symbol,
                row.side,
                row.size,
                row.leverage,
                row.status,
                row.fill_price,
                row.fill_size,
                row.error_message,
                row.account_value,
                row.position_pct,
                row.exposure_before,
                row.exposure_after,
                row.kelly_full,
                row.kelly_fraction_used,
                row.kelly_position_pct,
                row.kelly_method,
                row.kelly_reasoning,
                row.kelly_capped,
            ],
        )?;
        Ok(())
    }

    // -- episodes -------------------------------------------------------------

    pub fn insert_episode(&self, row: &EpisodeRow) -> Result<()> {
        self.conn.lock().execute(
            "INSERT INTO trade_episodes
             (address, asset, direction, entry_vwap, entry_size, realized_pnl,
              r_multiple, r_multiple_raw, closed_reason, opened_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.address,
                row.asset,
                row.direction.to_string(),
                row.entry_vwap,
                row.entry_size,
                row.realized_pnl,
                row.r_multiple,
                row.r_multiple_raw,
                row.closed_reason,
                row.opened_at.to_rfc3339(),
                row.closed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Mean closed-episode duration for an asset, in hours.
    pub fn avg_hold_hours(&self, asset: &str) -> Result<Option<f64>> {
        let avg: Option<f64> = self
            .conn
            .lock()
            .query_row(
                "SELECT AVG((julianday(closed_at) - julianday(opened_at)) * 24.0)
                 FROM trade_episodes
                 WHERE asset = ?1",
                params![asset],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(avg)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Store {
        Store::open_in_memory().unwrap()
    }

    #[test]
    fn daily_equity_first_observation_fixes_starting() {
        let s = store();
        let starting = s.upsert_daily_equity("2026-08-01", 100_000.0).unwrap();
        assert_eq!(starting, 100_000.0);

        // Later observations keep the starting equity.
        let starting = s.upsert_daily_equity("2026-08-01", 94_000.0).unwrap();
        assert_eq!(starting, 100_000.0);

        // A new date starts fresh.
        let starting = s.upsert_daily_equity("2026-08-02", 94_000.0).unwrap();
        assert_eq!(starting, 94_000.0);
    }

    #[test]
    fn stop_lifecycle_roundtrip() {
        let s = store();
        let row = ActiveStopRow {
            decision_id: "d1".into(),
            symbol: "BTC".into(),
            direction: Direction::Long,
            entry_price: 50_000.0,
            entry_size: 0.1,
            stop_price: 49_500.0,
            take_profit_price: Some(51_000.0),
            trailing_enabled: false,
            trail_distance_pct: 0.01,
            timeout_at: Some(Utc::now() + chrono::Duration::hours(168)),
            exchange: "hyperliquid".into(),
            native_stop_placed: true,
            created_at: Utc::now(),
        };
        s.save_stop(&row).unwrap();

        let active = s.active_stops().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].decision_id, "d1");
        assert!(active[0].native_stop_placed);
        assert_eq!(active[0].take_profit_price, Some(51_000.0));

        s.mark_stop_triggered("d1", "BTC", 49_400.0, "stop_loss").unwrap();
        assert!(s.active_stops().unwrap().is_empty());
    }

    #[test]
    fn cancel_only_touches_active_rows() {
        let s = store();
        assert!(!s.mark_stop_cancelled("missing", "BTC").unwrap());
    }

    #[test]
    fn decision_log_filters_and_stats() {
        let s = store();
        for (i, dtype) in ["signal", "skip", "skip"].iter().enumerate() {
            s.insert_decision(&DecisionLogRow {
                id: format!("d{i}"),
                created_at: Utc::now(),
                symbol: "BTC".into(),
                direction: "long".into(),
                decision_type: dtype.to_string(),
                trader_count: 3,
                agreement_pct: 1.0,
                effective_k: 2.5,
                avg_confidence: Some(0.6),
                ev_estimate: Some(0.3),
                price_at_decision: Some(100_000.0),
                gates: serde_json::json!([]),
                risk_checks: None,
                reasoning: "test".into(),
                outcome_pnl: None,
                outcome_r_multiple: None,
            })
            .unwrap();
        }

        let (total, rows) = s.list_decisions(Some("BTC"), Some("skip"), 10, 0).unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);

        s.update_decision_outcome("d0", 500.0, 1.2).unwrap();
        let stats = s.decision_stats(7).unwrap();
        assert_eq!(stats.total_decisions, 3);
        assert_eq!(stats.signals, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.wins, 1);
        assert!((stats.win_rate() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn trader_performance_read_applies_abs_to_loss() {
        let s = store();
        s.conn
            .lock()
            .execute(
                "INSERT INTO trader_performance
                 (address, win_rate, avg_win_r, avg_loss_r, episode_count)
                 VALUES ('0xabc', 0.6, 1.2, -0.8, 42)",
                [],
            )
            .unwrap();

        let row = s.get_trader_performance("0xABC").unwrap().unwrap();
        assert_eq!(row.episode_count, 42);
        assert!((row.avg_loss_r - 0.8).abs() < 1e-9);
    }

    #[test]
    fn episode_hold_hours_average() {
        let s = store();
        let opened = Utc::now() - chrono::Duration::hours(10);
        s.insert_episode(&EpisodeRow {
            address: "0xabc".into(),
            asset: "BTC".into(),
            direction: Direction::Long,
            entry_vwap: 50_000.0,
            entry_size: 0.1,
            realized_pnl: 100.0,
            r_multiple: 0.5,
            r_multiple_raw: 0.5,
            closed_reason: "full_close".into(),
            opened_at: opened,
            closed_at: opened + chrono::Duration::hours(4),
        })
        .unwrap();

        let avg = s.avg_hold_hours("BTC").unwrap().unwrap();
        assert!((avg - 4.0).abs() < 0.01);
        assert!(s.avg_hold_hours("ETH").unwrap().is_none());
    }

    #[test]
    fn connection_and_balance_upserts() {
        let s = store();
        s.record_connection("bybit", true, true, None).unwrap();
        s.record_connection("bybit", true, false, Some("timeout")).unwrap();
        let b = Balance {
            total_equity: 5_000.0,
            available_balance: 4_000.0,
            margin_used: 1_000.0,
            maintenance_margin: 100.0,
            unrealized_pnl: 0.0,
            currency: "USDT".into(),
            timestamp: Utc::now(),
        };
        s.record_balance("bybit", &b).unwrap();
        s.record_balance("bybit", &b).unwrap();
    }

    #[test]
    fn governor_state_roundtrip() {
        let s = store();
        assert!(s.load_governor_state("kill_switch_active").unwrap().is_none());
        s.save_governor_state("kill_switch_active", "true").unwrap();
        assert_eq!(
            s.load_governor_state("kill_switch_active").unwrap().as_deref(),
            Some("true")
        );
        s.save_governor_state("kill_switch_active", "false").unwrap();
        assert_eq!(
            s.load_governor_state("kill_switch_active").unwrap().as_deref(),
            Some("false")
        );
    }
}
