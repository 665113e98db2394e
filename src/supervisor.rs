// =============================================================================
// Worker supervisor — spawns the engine's long-lived tasks and winds them
// down in reverse dependency order
// =============================================================================
//
// Workers: market-data poller, account poller, decision loop. (The WebSocket
// receive loop is owned by the crypto adapter's client and stops with it.)
// Each worker carries a log tag and samples the running flag between sleeps,
// so shutdown completes within one tick.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::account::AccountManager;
use crate::config::Config;
use crate::engine::TradingEngine;
use crate::error::EngineError;
use crate::logging::with_worker_tag;
use crate::market_data::MarketDataFetcher;
use crate::state::SharedStateHub;

pub struct WorkerSupervisor {
    hub: Arc<SharedStateHub>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerSupervisor {
    /// Spawn the worker set. Producers start before the decision consumer.
    pub fn start(
        hub: Arc<SharedStateHub>,
        fetcher: Arc<MarketDataFetcher>,
        account: Arc<AccountManager>,
        engine: Arc<TradingEngine>,
        config: Arc<Config>,
    ) -> Self {
        let mut handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        {
            let hub = hub.clone();
            let interval = config.timing.thread_market_data_poll_interval_sec;
            handles.push((
                "market-data",
                tokio::spawn(with_worker_tag("MKTDAT", async move {
                    market_data_worker(hub, fetcher, interval).await;
                })),
            ));
        }

        {
            let hub = hub.clone();
            let interval = config.timing.thread_account_poll_interval_sec;
            handles.push((
                "account",
                tokio::spawn(with_worker_tag("ACCNT", async move {
                    account_worker(hub, account, interval).await;
                })),
            ));
        }

        {
            handles.push((
                "decision",
                tokio::spawn(with_worker_tag("DECIDE", async move {
                    engine.run().await;
                })),
            ));
        }

        info!(workers = handles.len(), "workers started");
        Self { hub, handles }
    }

    /// Cooperative shutdown: drop the running flag, wake waiters, then join
    /// consumers before producers.
    pub async fn shutdown(mut self) {
        info!("shutting down workers");
        self.hub.shutdown();
        for (name, handle) in self.handles.drain(..).rev() {
            match handle.await {
                Ok(()) => info!(worker = name, "worker joined"),
                Err(e) => warn!(worker = name, error = %e, "worker join failed"),
            }
        }
    }
}

async fn market_data_worker(
    hub: Arc<SharedStateHub>,
    fetcher: Arc<MarketDataFetcher>,
    interval_secs: u64,
) {
    info!(interval_secs, "market data worker started");
    while hub.is_running() {
        if hub.allow_fetch() {
            match fetcher.poll_once().await {
                Ok(()) => {}
                // Both of these clear on their own; the next poll retries.
                Err(EngineError::ConnectivityGated { retry_in_secs }) => {
                    debug!(retry_in_secs, "market data poll gated")
                }
                Err(EngineError::NoAccumulatedBars) => {
                    info!("waiting for the realtime feed to accumulate bars")
                }
                Err(e) => warn!(error = %e, "market data poll failed"),
            }
        }
        sleep_while_running(&hub, interval_secs).await;
    }
    info!("market data worker stopped");
}

async fn account_worker(
    hub: Arc<SharedStateHub>,
    account: Arc<AccountManager>,
    interval_secs: u64,
) {
    info!(interval_secs, "account worker started");
    while hub.is_running() {
        match account.fetch_snapshot().await {
            Ok(snapshot) => hub.publish_account(snapshot),
            Err(e) => warn!(error = %e, "account poll failed"),
        }
        sleep_while_running(&hub, interval_secs).await;
    }
    info!("account worker stopped");
}

/// Sleep `seconds` in one-second slices, bailing as soon as shutdown starts.
async fn sleep_while_running(hub: &SharedStateHub, seconds: u64) {
    let mut remaining = seconds;
    while remaining > 0 && hub.is_running() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        remaining -= 1;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_bails_out_on_shutdown() {
        let hub = Arc::new(SharedStateHub::new());
        hub.shutdown();
        // With the flag already down this returns without consuming time.
        let before = tokio::time::Instant::now();
        sleep_while_running(&hub, 3_600).await;
        assert_eq!(tokio::time::Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_runs_full_duration_while_running() {
        let hub = Arc::new(SharedStateHub::new());
        let before = tokio::time::Instant::now();
        sleep_while_running(&hub, 3).await;
        let elapsed = tokio::time::Instant::now() - before;
        assert_eq!(elapsed, Duration::from_secs(3));
    }
}
