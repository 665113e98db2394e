// =============================================================================
// Tradewind — always-on single-instrument trading engine
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod account;
mod config;
mod connectivity;
mod engine;
mod error;
mod execution;
mod indicators;
mod logging;
mod market_data;
mod net;
mod position;
mod providers;
mod risk;
mod state;
mod strategy;
mod supervisor;
mod trade_log;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::account::AccountManager;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::engine::TradingEngine;
use crate::execution::OrderExecutionEngine;
use crate::market_data::MarketDataFetcher;
use crate::position::PositionManager;
use crate::providers::alpaca_stocks::AlpacaStocksClient;
use crate::providers::alpaca_trading::AlpacaTradingClient;
use crate::providers::polygon_crypto::PolygonCryptoClient;
use crate::providers::ProviderRouter;
use crate::state::SharedStateHub;
use crate::supervisor::WorkerSupervisor;
use crate::trade_log::TradeHistoryWriter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & configuration ───────────────────────────────────
    let _ = dotenv::dotenv();
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tradewind.json".to_string());
    let config = Arc::new(Config::load(&config_path).context("configuration load failed")?);

    let _log_guard =
        logging::init(&config.logging).context("log sink initialization failed")?;

    info!("════════════════════════════════════════════════════════");
    info!("  Tradewind engine starting");
    info!("════════════════════════════════════════════════════════");
    info!(
        symbol = %config.target.symbol,
        atr_period = config.strategy.atr_period,
        rr_ratio = config.strategy.rr_ratio,
        risk_per_trade = config.strategy.risk_per_trade,
        max_exposure_pct = config.strategy.max_exposure_pct,
        wash_trade_interval_s = config.timing.minimum_interval_between_orders_seconds,
        "session parameters"
    );

    // ── 2. Connectivity supervisor and provider adapters ─────────────────
    let connectivity = Arc::new(ConnectivityMonitor::new(config.connectivity.clone()));

    let trading = Arc::new(AlpacaTradingClient::new(
        config.providers.trading.clone(),
        connectivity.clone(),
    )?);
    let stocks = Arc::new(AlpacaStocksClient::new(
        config.providers.stock_data.clone(),
        connectivity.clone(),
    )?);
    let crypto = Arc::new(PolygonCryptoClient::new(
        config.providers.crypto_data.clone(),
        config.ws_accumulator.clone(),
        Duration::from_millis(config.timing.websocket_reconnect_delay_ms),
        Duration::from_millis(config.timing.websocket_error_retry_delay_ms),
        connectivity.clone(),
    )?);
    let router = Arc::new(ProviderRouter::new(trading, stocks, crypto.clone()));

    // ── 3. Shared state and collaborators ────────────────────────────────
    let hub = Arc::new(SharedStateHub::new());
    let account = Arc::new(AccountManager::new(router.clone(), config.clone()));

    let trade_log = if config.logging.trade_history_csv.is_empty() {
        None
    } else {
        Some(Arc::new(TradeHistoryWriter::open(
            &config.logging.trade_history_csv,
        )?))
    };

    // Session-start equity anchors the daily P&L gate; zero disables it
    // until the account endpoint responds.
    let initial_equity = match account.fetch_account_equity().await {
        Ok(equity) => equity,
        Err(e) => {
            warn!(error = %e, "initial equity fetch failed, daily P&L gate starts disarmed");
            0.0
        }
    };

    let fetcher = Arc::new(MarketDataFetcher::new(
        router.clone(),
        hub.clone(),
        config.clone(),
    ));
    let execution = OrderExecutionEngine::new(
        router.clone(),
        account.clone(),
        hub.clone(),
        config.clone(),
        trade_log,
    );
    let position = PositionManager::new(router.clone(), config.clone());
    let engine = Arc::new(TradingEngine::new(
        hub.clone(),
        router,
        account.clone(),
        connectivity,
        execution,
        position,
        config.clone(),
        initial_equity,
    ));

    // ── 4. Workers ───────────────────────────────────────────────────────
    let workers = WorkerSupervisor::start(hub.clone(), fetcher, account, engine, config);

    // ── 5. Wait for a shutdown signal ────────────────────────────────────
    wait_for_shutdown_signal().await;

    workers.shutdown().await;
    crypto.disconnect().await;
    info!("engine stopped cleanly");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, relying on ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = sigterm.recv() => info!("termination signal received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}
