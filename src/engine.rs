// =============================================================================
// Trading orchestrator — the decision loop
// =============================================================================
//
// One cycle: wait for fresh snapshots on the hub, consume them, check data
// freshness and the risk gate, evaluate signals/filters/sizing, hand valid
// trades to the execution engine, then count down to the next cycle in
// one-second ticks that re-check the running flag. Per-cycle errors are
// logged and the loop continues; only shutdown stops it.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::account::AccountManager;
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{EngineError, EngineResult};
use crate::execution::{validate_trade_feasibility, OrderExecutionEngine};
use crate::position::PositionManager;
use crate::providers::{is_crypto_symbol, ProviderRouter};
use crate::risk::{RiskManager, TradeGateInput};
use crate::state::SharedStateHub;
use crate::strategy;
use crate::types::ProcessedData;

/// How long one wait on the hub may block before the loop re-checks flags.
const DATA_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Halt length when an outage reports no concrete retry window.
const CONNECTIVITY_HALT_FALLBACK_SECS: u64 = 60;

pub struct TradingEngine {
    hub: Arc<SharedStateHub>,
    router: Arc<ProviderRouter>,
    account: Arc<AccountManager>,
    connectivity: Arc<ConnectivityMonitor>,
    risk: RiskManager,
    execution: OrderExecutionEngine,
    position: PositionManager,
    config: Arc<Config>,
    /// Session-start equity for the daily P&L gate.
    initial_equity: f64,
    loop_counter: AtomicU64,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hub: Arc<SharedStateHub>,
        router: Arc<ProviderRouter>,
        account: Arc<AccountManager>,
        connectivity: Arc<ConnectivityMonitor>,
        execution: OrderExecutionEngine,
        position: PositionManager,
        config: Arc<Config>,
        initial_equity: f64,
    ) -> Self {
        let risk = RiskManager::new(config.strategy.clone());
        Self {
            hub,
            router,
            account,
            connectivity,
            risk,
            execution,
            position,
            config,
            initial_equity,
            loop_counter: AtomicU64::new(0),
        }
    }

    fn symbol(&self) -> &str {
        &self.config.target.symbol
    }

    fn is_crypto(&self) -> bool {
        is_crypto_symbol(self.symbol())
    }

    /// Decision loop. Returns when the running flag drops.
    pub async fn run(&self) {
        info!(symbol = %self.symbol(), initial_equity = self.initial_equity, "decision loop started");
        while self.hub.is_running() {
            if let Err(e) = self.run_cycle().await {
                warn!(error = %e, "trading cycle failed, continuing");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        info!("decision loop stopped");
    }

    async fn run_cycle(&self) -> EngineResult<()> {
        if !self.hub.wait_for_data(DATA_WAIT_TIMEOUT).await {
            return Ok(());
        }
        if !self.hub.is_running() {
            return Ok(());
        }

        let (market, account) = self.hub.consume_snapshots();
        let cycle = self.loop_counter.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            cycle,
            symbol = %self.symbol(),
            equity = account.equity,
            close = market.curr.close,
            atr = market.atr,
            "trading cycle"
        );

        // Step 4: freshness. Stale data skips straight to the countdown.
        let staleness_limit = if self.is_crypto() {
            self.config.timing.crypto_data_staleness_threshold_seconds
        } else {
            self.config.timing.market_data_staleness_threshold_seconds
        };
        let age_secs = self.hub.market_data_age().map(|age| age.as_secs());
        if !age_secs.map(|age| age <= staleness_limit).unwrap_or(false) {
            let stale = EngineError::StaleData {
                age_secs: age_secs.unwrap_or(u64::MAX),
                max_secs: staleness_limit,
            };
            warn!(error = %stale, "skipping cycle");
            self.countdown_to_next_cycle().await;
            return Ok(());
        }

        // Step 5: risk gate; a rejection halts trading for a while.
        let gate = self.risk.evaluate_trade_gate(TradeGateInput {
            initial_equity: self.initial_equity,
            current_equity: account.equity,
            exposure_pct: account.exposure_pct,
        });
        if !gate.allowed {
            self.perform_halt_countdown().await;
            return Ok(());
        }

        let data = ProcessedData::merge(&market, &account);

        if data.pos_details.qty != 0.0 && data.open_orders == 0 {
            warn!(
                qty = data.pos_details.qty,
                "open position has no working protective orders"
            );
        }

        // Market-hours gate; after hours the only action is flattening.
        if !self.router.is_market_open(self.symbol()).await.unwrap_or(false) {
            debug!("market closed, checking for positions to flatten");
            if let Err(e) = self.position.handle_market_close_positions(&data).await {
                warn!(error = %e, "market-close flattening failed");
            }
            self.countdown_to_next_cycle().await;
            return Ok(());
        }

        // Step 6: evaluate and possibly execute.
        self.evaluate_and_execute(&data, account.equity).await?;

        // Step 7: countdown.
        self.countdown_to_next_cycle().await;
        Ok(())
    }

    async fn evaluate_and_execute(&self, data: &ProcessedData, equity: f64) -> EngineResult<()> {
        let strategy_config = &self.config.strategy;
        let current_qty = data.pos_details.qty;

        // Profit taking runs before regular signal processing.
        if current_qty != 0.0
            && strategy_config.profit_taking_threshold_dollars > 0.0
            && data.pos_details.unrealized_pl > strategy_config.profit_taking_threshold_dollars
        {
            info!(
                unrealized_pl = data.pos_details.unrealized_pl,
                threshold = strategy_config.profit_taking_threshold_dollars,
                "profit-taking threshold exceeded, flattening position"
            );
            return self
                .execution
                .flatten_position_market(data.curr.close, current_qty)
                .await;
        }

        let decision = strategy::detect_trading_signals(data, strategy_config);
        let filters = strategy::evaluate_trading_filters(data, strategy_config);
        debug!(
            buy = decision.buy,
            sell = decision.sell,
            strength = decision.strength,
            atr_ratio = filters.atr_ratio,
            vol_ratio = filters.vol_ratio,
            reason = %decision.reason,
            "signal analysis"
        );

        let buying_power = self.account.fetch_buying_power().await?;
        let sizing = strategy::calculate_position_sizing(
            data,
            equity,
            strategy_config,
            buying_power,
            self.is_crypto(),
        );

        if !filters.all_pass {
            info!(
                quantity = sizing.quantity,
                risk_amount = sizing.risk_amount,
                "filters not met, preview only"
            );
            return Ok(());
        }
        if !quantity_is_tradable(sizing.quantity, self.is_crypto()) {
            info!(quantity = sizing.quantity, "sized quantity not tradable, preview only");
            return Ok(());
        }
        if !validate_trade_feasibility(
            &sizing,
            buying_power,
            data.curr.close,
            strategy_config.buying_power_validation_safety_margin,
        ) {
            info!(buying_power, "trade not feasible against buying power, preview only");
            return Ok(());
        }
        if !decision.buy && !decision.sell {
            debug!("filters passed but no directional signal");
            return Ok(());
        }

        match self
            .execution
            .execute_trade(data, current_qty, &sizing, &decision)
            .await
        {
            Ok(()) => Ok(()),
            // Recoverable rejections: the next cycle re-evaluates.
            Err(
                e @ (EngineError::NotReady { .. }
                | EngineError::PositionCap { .. }
                | EngineError::ValidationFailed(_)
                | EngineError::BrokerReject { .. }),
            ) => {
                info!(error = %e, "trade rejected this cycle");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Halt after a risk-gate rejection: a connectivity outage halts until
    /// its retry window, anything else for the configured emergency duration.
    async fn perform_halt_countdown(&self) {
        let halt_secs = if self.connectivity.is_outage() {
            let until_retry = self.connectivity.seconds_until_retry();
            if until_retry > 0 {
                until_retry
            } else {
                CONNECTIVITY_HALT_FALLBACK_SECS
            }
        } else {
            self.config.timing.emergency_trading_halt_duration_minutes * 60
        };
        warn!(halt_secs, "trading halted");
        self.tick_countdown(halt_secs, "halt").await;
    }

    async fn countdown_to_next_cycle(&self) {
        self.tick_countdown(self.config.timing.thread_trader_poll_interval_sec, "next cycle")
            .await;
    }

    /// Sleep in ticks, sampling the running flag between ticks.
    async fn tick_countdown(&self, seconds: u64, label: &str) {
        let tick = Duration::from_secs(
            self.config.timing.countdown_display_refresh_interval_seconds.max(1),
        );
        let mut remaining = seconds;
        while remaining > 0 && self.hub.is_running() {
            debug!(remaining, label, "countdown");
            tokio::time::sleep(tick).await;
            remaining = remaining.saturating_sub(tick.as_secs());
        }
    }
}

/// Stocks need at least one whole share; crypto trades any positive fraction.
fn quantity_is_tradable(quantity: f64, is_crypto: bool) -> bool {
    if is_crypto {
        quantity > 0.0
    } else {
        quantity >= 1.0
    }
}
