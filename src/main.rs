// =============================================================================
// Quorum Decision Engine — Main Entry Point
// =============================================================================
//
// The engine starts in dry-run mode for safety. Real execution requires
// real_execution_enabled=true in the runtime config.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod consensus;
mod context;
mod correlation;
mod costs;
mod db;
mod decision_log;
mod episode;
mod exchanges;
mod executor;
mod feed;
mod kelly;
mod normalizer;
mod regime;
mod risk;
mod stops;
mod types;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;
use crate::context::AppContext;
use crate::db::Store;
use crate::exchanges::aster::AsterAdapter;
use crate::exchanges::bybit::BybitAdapter;
use crate::exchanges::hyperliquid::HyperliquidAdapter;
use crate::exchanges::manager::ExchangeManager;
use crate::exchanges::{ExchangeAdapter, ExchangeConfig, ExchangeType};
use crate::feed::OutboundEvent;

const CONFIG_PATH: &str = "runtime_config.json";
const STORE_PATH: &str = "quorum.db";

/// Seconds between health-check passes.
const HEALTH_CHECK_INTERVAL_S: u64 = 60;

/// Seconds between correlation matrix reloads (daily data).
const CORRELATION_RELOAD_INTERVAL_S: u64 = 6 * 3_600;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          Quorum Decision Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    info!(
        symbols = ?config.consensus.symbols,
        real_execution = config.execution.real_execution_enabled,
        testnet = config.execution.testnet,
        "engine configuration"
    );
    if !config.execution.real_execution_enabled {
        info!("DRY RUN mode: signals are evaluated and logged, no orders placed");
    }

    // ── 2. Persistence ───────────────────────────────────────────────────
    let store = match Store::open(STORE_PATH) {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!(error = %e, "store unavailable, running without persistence");
            None
        }
    };

    // ── 3. Exchange manager & adapters ───────────────────────────────────
    let testnet = config.execution.testnet;
    let manager = Arc::new(ExchangeManager::new(
        store.clone(),
        config.execution.rate_limit_delays_ms.clone(),
        testnet,
    ));

    let adapters: Vec<Arc<dyn ExchangeAdapter>> = vec![
        Arc::new(HyperliquidAdapter::new(ExchangeConfig::new(
            ExchangeType::Hyperliquid,
            testnet,
        ))),
        Arc::new(AsterAdapter::new(ExchangeConfig::new(
            ExchangeType::Aster,
            testnet,
        ))),
        Arc::new(BybitAdapter::new(ExchangeConfig::new(
            ExchangeType::Bybit,
            testnet,
        ))),
    ];

    for adapter in adapters {
        let ex_type = adapter.exchange_type();
        if !adapter.is_configured() {
            info!(exchange = %ex_type, "skipping venue (no credentials in environment)");
            continue;
        }
        let is_default = ex_type == config.execution.default_exchange;
        manager.connect_exchange(adapter, is_default).await;
    }

    if manager.connected_exchanges().is_empty() {
        warn!("no venues connected; running in evaluation-only mode");
    }

    // ── 4. Build the application context ─────────────────────────────────
    let ctx = AppContext::new(config, store, Arc::clone(&manager));
    ctx.governor.load_state();
    ctx.hydrate_correlations();

    // Outbound subject: downstream auditors/executors subscribe here.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundEvent>();
    ctx.set_outbound(outbound_tx);
    tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            match event {
                OutboundEvent::Signal(signal) => {
                    info!(
                        id = %signal.id,
                        symbol = %signal.symbol,
                        direction = %signal.direction,
                        venue = %signal.target_exchange,
                        ev_net_r = signal.ev_net_r,
                        "outbound signal"
                    );
                }
                OutboundEvent::Outcome(outcome) => {
                    info!(
                        decision_id = %outcome.decision_id,
                        pnl = outcome.pnl,
                        r = outcome.r_multiple,
                        reason = %outcome.reason,
                        "outbound outcome"
                    );
                }
            }
        }
    });

    // ── 5. Inbound feed ──────────────────────────────────────────────────
    // The scout transport attaches to this sender; fills and scores flow in
    // as `InboundEvent`s.
    let (inbound_tx, inbound_rx) = mpsc::channel::<feed::InboundEvent>(1_024);
    let feed_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        feed::run_feed_loop(feed_ctx, inbound_rx).await;
    });

    // ── 6. Stop manager loop ─────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (trigger_tx, mut trigger_rx) = mpsc::unbounded_channel();
    let stops = Arc::clone(&ctx.stops);
    tokio::spawn(stops.run_loop(shutdown_rx.clone(), Some(trigger_tx)));

    let trigger_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        while let Some(trigger) = trigger_rx.recv().await {
            trigger_ctx.handle_stop_trigger(&trigger);
        }
    });

    // ── 7. Health check loop ─────────────────────────────────────────────
    let health_manager = Arc::clone(&manager);
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(HEALTH_CHECK_INTERVAL_S));
        loop {
            ticker.tick().await;
            let report = health_manager.health_check().await;
            if !report.reconnected.is_empty() {
                info!(reconnected = ?report.reconnected, "health check reconnected venues");
            }
            for (venue, status) in &report.venues {
                if !status.healthy {
                    warn!(venue, error = ?status.error, "venue unhealthy");
                }
            }
        }
    });

    // ── 8. Correlation reload loop ───────────────────────────────────────
    let corr_ctx = Arc::clone(&ctx);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(
            CORRELATION_RELOAD_INTERVAL_S,
        ));
        ticker.tick().await; // hydrated once already at startup
        loop {
            ticker.tick().await;
            corr_ctx.hydrate_correlations();
        }
    });

    info!("all subsystems running; press Ctrl+C to stop");

    // Hold the inbound sender so the feed stays open for the transport.
    let _inbound_handle = inbound_tx;

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received, stopping gracefully");

    // Let the stop manager finish its tick, then disconnect venues.
    let _ = shutdown_tx.send(true);
    manager.disconnect_all().await;

    if let Err(e) = ctx.config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Quorum Decision Engine shut down complete");
    Ok(())
}
