// =============================================================================
// Order execution engine — validation, wash gate, order-type selection,
// submission with retries, timestamp recording
// =============================================================================
//
// Per trade attempt: validate parameters, enforce the wash-trade interval,
// close an opposite position when reversal closure is configured, check the
// position cap, pick an order type, submit with retries, then record the
// accepted-order timestamp. Crypto diverges in three broker rules: it cannot
// be sold short (a sell closes the actual on-exchange quantity, refetched
// immediately before submission), it only accepts gtc/ioc time-in-force, and
// it gets no native bracket orders (simulated with market entry plus
// protective stop-limit and take-profit limit children).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::account::AccountManager;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::providers::{is_crypto_symbol, json_str, ProviderRouter};
use crate::state::SharedStateHub;
use crate::strategy::{compute_exit_targets, ExitTargets, PositionSizing, SignalDecision};
use crate::trade_log::{TradeHistoryWriter, TradeRecord};
use crate::types::{OrderSide, ProcessedData};

/// ATR-expansion ratio above which entries use stop-limit protection.
const HIGH_VOLATILITY_RATIO: f64 = 1.5;
/// Close-to-close move (percent) above which entries use stop-limit
/// protection.
const HIGH_PRICE_CHANGE_PCT: f64 = 1.0;
/// Broker floor for sell-side stops relative to base price.
const SELL_STOP_FLOOR_OFFSET: f64 = 0.01;

/// Order flavors this engine can submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Market,
    Limit,
    StopLimit,
    Bracket,
    CryptoBracketSim,
}

/// Broker acknowledgement of an accepted order.
#[derive(Debug, Clone, Default)]
pub struct OrderAck {
    pub id: String,
    pub status: String,
    pub filled_qty: String,
    pub filled_avg_price: String,
    pub submitted_at: String,
}

pub struct OrderExecutionEngine {
    router: Arc<ProviderRouter>,
    account: Arc<AccountManager>,
    hub: Arc<SharedStateHub>,
    config: Arc<Config>,
    trade_log: Option<Arc<TradeHistoryWriter>>,
}

impl OrderExecutionEngine {
    pub fn new(
        router: Arc<ProviderRouter>,
        account: Arc<AccountManager>,
        hub: Arc<SharedStateHub>,
        config: Arc<Config>,
        trade_log: Option<Arc<TradeHistoryWriter>>,
    ) -> Self {
        Self {
            router,
            account,
            hub,
            config,
            trade_log,
        }
    }

    fn symbol(&self) -> &str {
        &self.config.target.symbol
    }

    fn is_crypto(&self) -> bool {
        is_crypto_symbol(self.symbol())
    }

    // -----------------------------------------------------------------------
    // Entry point
    // -----------------------------------------------------------------------

    pub async fn execute_trade(
        &self,
        data: &ProcessedData,
        current_qty: f64,
        sizing: &PositionSizing,
        decision: &SignalDecision,
    ) -> EngineResult<()> {
        validate_order_parameters(data, sizing, &self.config.strategy, self.is_crypto())?;

        let buying_power = self.account.fetch_buying_power().await?;
        let required_capital = data.curr.close * sizing.quantity;
        let margin = self.config.strategy.short_safety_margin;
        if required_capital > buying_power * margin {
            return Err(EngineError::ValidationFailed(format!(
                "insufficient buying power: required ${required_capital:.2}, \
                 available ${buying_power:.2} at {:.0}% margin",
                margin * 100.0
            )));
        }

        if decision.buy {
            self.execute_order(OrderSide::Buy, data, current_qty, sizing).await
        } else if decision.sell {
            if self.is_crypto() {
                self.close_crypto_position_on_sell(data, current_qty).await
            } else if current_qty >= 0.0 {
                // Opens a short when flat, closes the long otherwise.
                self.execute_order(OrderSide::Sell, data, current_qty, sizing).await
            } else {
                // Buy to cover the existing short.
                self.execute_order(OrderSide::Buy, data, current_qty, sizing).await
            }
        } else {
            debug!("no actionable signal, nothing submitted");
            Ok(())
        }
    }

    /// Crypto sells never open shorts: refetch the on-exchange quantity and
    /// flatten exactly that amount with a market order.
    async fn close_crypto_position_on_sell(
        &self,
        data: &ProcessedData,
        cached_qty: f64,
    ) -> EngineResult<()> {
        let actual_qty = match self.account.fetch_position_details(self.symbol()).await {
            Ok(details) => details.qty,
            Err(e) => {
                warn!(error = %e, "position refetch failed, falling back to cached quantity");
                cached_qty
            }
        };

        if actual_qty <= 0.0 {
            info!("sell signal with no crypto position held, nothing to close");
            return Ok(());
        }

        self.check_wash_gate()?;
        info!(qty = format_qty(actual_qty).as_str(), "closing full crypto position on sell signal");
        let order = build_market_order(self.symbol(), OrderSide::Sell, actual_qty, true);
        let ack = self.submit_with_retry(&order).await?;
        self.record_accepted(&ack, OrderSide::Sell, actual_qty, data.curr.close, None);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Core order path
    // -----------------------------------------------------------------------

    async fn execute_order(
        &self,
        side: OrderSide,
        data: &ProcessedData,
        current_qty: f64,
        sizing: &PositionSizing,
    ) -> EngineResult<()> {
        self.check_wash_gate()?;

        if should_close_opposite(side, current_qty, self.config.strategy.close_positions_on_signal_reversal)
        {
            self.close_opposite_position(side, current_qty).await?;
        }

        // Capacity is judged on the quantity this cycle observed, closure or
        // not: a slot only frees once the next account snapshot confirms it.
        if !can_open_new_position(
            current_qty,
            self.config.strategy.allow_multiple_positions_per_symbol,
        ) {
            return Err(EngineError::PositionCap {
                symbol: self.symbol().to_string(),
            });
        }

        if current_qty != 0.0 {
            // Adjusting or closing an existing position: market order for speed.
            let order = build_market_order(self.symbol(), side, sizing.quantity, self.is_crypto());
            let ack = self.submit_with_retry(&order).await?;
            self.record_accepted(&ack, side, sizing.quantity, data.curr.close, None);
            return Ok(());
        }

        // Opening a position: compute targets off the freshest price we can
        // get, then pick the order type for the current regime.
        let entry_price = self.entry_price(data).await;
        let targets = compute_exit_targets(
            side,
            entry_price,
            sizing.risk_amount,
            self.config.strategy.rr_ratio,
        );

        let order_type = select_order_type(
            self.is_crypto(),
            false,
            true,
            volatility_ratio(data),
            price_change_pct(data),
        );
        debug!(?order_type, entry_price, "order type selected");

        match order_type {
            OrderType::CryptoBracketSim => {
                self.execute_crypto_bracket_simulation(side, entry_price, sizing, &targets)
                    .await
            }
            OrderType::StopLimit => {
                let order = build_stop_limit_order(
                    self.symbol(),
                    side,
                    sizing.quantity,
                    targets.stop_loss,
                    targets.stop_loss,
                    self.is_crypto(),
                );
                let ack = self.submit_with_retry(&order).await?;
                self.record_accepted(&ack, side, sizing.quantity, entry_price, Some(&targets));
                Ok(())
            }
            _ => {
                let order = build_bracket_order(
                    self.symbol(),
                    side,
                    sizing.quantity,
                    entry_price,
                    &targets,
                    self.is_crypto(),
                );
                let ack = self.submit_with_retry(&order).await?;
                self.record_accepted(&ack, side, sizing.quantity, entry_price, Some(&targets));
                Ok(())
            }
        }
    }

    /// Brackets are not available for crypto: cancel anything that could trip
    /// wash-trade detection, enter at market, then park the protective
    /// stop-limit and the take-profit limit as separate orders.
    async fn execute_crypto_bracket_simulation(
        &self,
        side: OrderSide,
        entry_price: f64,
        sizing: &PositionSizing,
        targets: &ExitTargets,
    ) -> EngineResult<()> {
        self.cancel_conflicting_orders().await?;

        let entry = build_market_order(self.symbol(), side, sizing.quantity, true);
        let ack = self.submit_with_retry(&entry).await?;
        self.record_accepted(&ack, side, sizing.quantity, entry_price, Some(targets));

        if side == OrderSide::Buy {
            let protective = build_stop_limit_order(
                self.symbol(),
                OrderSide::Sell,
                sizing.quantity,
                targets.stop_loss,
                targets.stop_loss,
                true,
            );
            let stop_ack = self.submit_with_retry(&protective).await?;
            debug!(order_id = %stop_ack.id, "protective stop placed");
        }

        let take_profit = build_limit_order(
            self.symbol(),
            side.opposite(),
            sizing.quantity,
            targets.take_profit,
            true,
        );
        let tp_ack = self.submit_with_retry(&take_profit).await?;
        debug!(order_id = %tp_ack.id, "take-profit limit placed");
        info!("crypto bracket simulation complete");
        Ok(())
    }

    /// Cancel every non-final order on the symbol, tolerating already-gone
    /// orders, then give the broker time to process the cancellations.
    async fn cancel_conflicting_orders(&self) -> EngineResult<()> {
        let payload = self.router.trading().open_orders_raw().await?;
        let Some(orders) = payload.as_array() else {
            return Ok(());
        };

        let mut cancelled = 0u32;
        for order in orders {
            if json_str(order, "symbol").as_deref() != Some(self.symbol()) {
                continue;
            }
            let Some(order_id) = json_str(order, "id") else { continue };
            let status = json_str(order, "status").unwrap_or_default();
            if matches!(status.as_str(), "filled" | "canceled" | "expired" | "rejected") {
                continue;
            }
            self.router.trading().cancel_order(&order_id).await?;
            cancelled += 1;
            debug!(order_id = %order_id, status = %status, "conflicting order cancelled");
        }

        if cancelled > 0 {
            info!(cancelled, "cancelled conflicting orders before new submission");
            tokio::time::sleep(Duration::from_millis(
                self.config.timing.order_cancellation_processing_delay_milliseconds,
            ))
            .await;
        }
        Ok(())
    }

    /// Close the position opposing `side` and verify it is gone before the
    /// new order goes out.
    async fn close_opposite_position(&self, side: OrderSide, current_qty: f64) -> EngineResult<()> {
        info!(
            side = %side,
            current_qty,
            "closing opposite position before reversal entry"
        );
        self.router.trading().close_position(self.symbol(), None).await?;

        let pause =
            Duration::from_millis(self.config.timing.position_verification_timeout_milliseconds);
        let attempts = self.config.timing.maximum_position_verification_attempts;

        for attempt in 0..attempts {
            tokio::time::sleep(pause).await;
            let details = self.account.fetch_position_details(self.symbol()).await?;
            if details.qty == 0.0 {
                debug!(attempt, "opposite position confirmed closed");
                return Ok(());
            }
        }
        Err(EngineError::ValidationFailed(
            "opposite position still open after verification attempts".into(),
        ))
    }

    /// Entry price: realtime quote when configured and available, else the
    /// snapshot close.
    async fn entry_price(&self, data: &ProcessedData) -> f64 {
        if self.config.strategy.use_current_market_price_for_order_execution {
            match self
                .router
                .market_data_for(self.symbol())
                .current_price(self.symbol())
                .await
            {
                Ok(price) if price > 0.0 => {
                    debug!(price, snapshot = data.curr.close, "using realtime entry price");
                    return price;
                }
                Ok(_) | Err(_) => {
                    debug!(snapshot = data.curr.close, "realtime price unavailable, using snapshot");
                }
            }
        }
        data.curr.close
    }

    /// Flatten the whole position at market, e.g. for profit taking. Bypasses
    /// sizing but still records the order timestamp.
    pub async fn flatten_position_market(
        &self,
        price: f64,
        current_qty: f64,
    ) -> EngineResult<()> {
        if current_qty == 0.0 {
            return Ok(());
        }
        let side = if current_qty > 0.0 { OrderSide::Sell } else { OrderSide::Buy };
        let order = build_market_order(self.symbol(), side, current_qty.abs(), self.is_crypto());
        let ack = self.submit_with_retry(&order).await?;
        self.record_accepted(&ack, side, current_qty.abs(), price, None);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Wash-trade gate
    // -----------------------------------------------------------------------

    fn check_wash_gate(&self) -> EngineResult<()> {
        if !self.config.timing.enable_wash_trade_prevention_mechanism {
            return Ok(());
        }
        wash_gate_check(
            self.hub.seconds_since_last_order(),
            self.config.timing.minimum_interval_between_orders_seconds,
        )
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// POST the order, retrying broker rejections and transport failures with
    /// a linearly growing delay.
    async fn submit_with_retry(&self, order: &Value) -> EngineResult<OrderAck> {
        let max_retries = self.config.strategy.max_retries;
        let base_delay = self.config.strategy.retry_delay_ms;
        let mut last_error = EngineError::ValidationFailed("order never submitted".into());

        for attempt in 1..=max_retries {
            match self.router.trading().place_order(order).await {
                Ok(response) => match parse_order_response(&response) {
                    Ok(ack) => {
                        info!(
                            order_id = %ack.id,
                            status = %ack.status,
                            attempt,
                            payload = %order,
                            "order accepted"
                        );
                        return Ok(ack);
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "broker rejected order");
                        last_error = e;
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "order submission failed");
                    last_error = e;
                }
            }
            if attempt < max_retries {
                tokio::time::sleep(Duration::from_millis(base_delay * u64::from(attempt))).await;
            }
        }
        Err(last_error)
    }

    fn record_accepted(
        &self,
        ack: &OrderAck,
        side: OrderSide,
        qty: f64,
        price: f64,
        targets: Option<&ExitTargets>,
    ) {
        self.hub.record_order_timestamp();
        if let Some(log) = &self.trade_log {
            log.record(&TradeRecord {
                timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                symbol: self.symbol().to_string(),
                side: side.as_str().to_string(),
                qty,
                price,
                stop_loss: targets.map(|t| t.stop_loss).unwrap_or(0.0),
                take_profit: targets.map(|t| t.take_profit).unwrap_or(0.0),
                order_id: ack.id.clone(),
                status: ack.status.clone(),
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Pure decision helpers
// ---------------------------------------------------------------------------

/// Seconds-based wash gate. `elapsed == None` means no prior order.
pub fn wash_gate_check(elapsed: Option<u64>, min_interval: u64) -> EngineResult<()> {
    match elapsed {
        None => Ok(()),
        Some(secs) if secs >= min_interval => Ok(()),
        Some(secs) => Err(EngineError::NotReady {
            remaining_secs: min_interval - secs,
        }),
    }
}

pub fn should_close_opposite(side: OrderSide, current_qty: f64, reversal_enabled: bool) -> bool {
    if !reversal_enabled {
        return false;
    }
    (side == OrderSide::Buy && current_qty < 0.0) || (side == OrderSide::Sell && current_qty > 0.0)
}

pub fn can_open_new_position(current_qty: f64, allow_multiple: bool) -> bool {
    current_qty == 0.0 || allow_multiple
}

pub fn volatility_ratio(data: &ProcessedData) -> f64 {
    if data.avg_atr > 0.0 {
        data.atr / data.avg_atr
    } else {
        1.0
    }
}

pub fn price_change_pct(data: &ProcessedData) -> f64 {
    if data.prev.close > 0.0 {
        ((data.curr.close - data.prev.close) / data.prev.close * 100.0).abs()
    } else {
        0.0
    }
}

/// Order-type selection. Closing is always a market order. Openings with
/// stop targets use stop-limit protection in fast markets, native brackets
/// otherwise; crypto openings always go through the bracket simulation.
pub fn select_order_type(
    is_crypto: bool,
    closing: bool,
    has_stop_targets: bool,
    volatility_ratio: f64,
    price_change_pct: f64,
) -> OrderType {
    if closing || !has_stop_targets {
        return OrderType::Market;
    }
    if is_crypto {
        return OrderType::CryptoBracketSim;
    }
    if volatility_ratio > HIGH_VOLATILITY_RATIO || price_change_pct > HIGH_PRICE_CHANGE_PCT {
        return OrderType::StopLimit;
    }
    OrderType::Bracket
}

// ---------------------------------------------------------------------------
// Order payload builders
// ---------------------------------------------------------------------------

/// Quantities go to the wire as strings with up to 8 decimals.
pub fn format_qty(qty: f64) -> String {
    let formatted = format!("{qty:.8}");
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn time_in_force(is_crypto: bool) -> &'static str {
    if is_crypto {
        "gtc"
    } else {
        "day"
    }
}

fn base_order(symbol: &str, side: OrderSide, qty: f64, is_crypto: bool) -> Value {
    json!({
        "symbol": symbol,
        "qty": format_qty(qty),
        "side": side.as_str(),
        "time_in_force": time_in_force(is_crypto),
        "client_order_id": Uuid::new_v4().to_string(),
    })
}

pub fn build_market_order(symbol: &str, side: OrderSide, qty: f64, is_crypto: bool) -> Value {
    let mut order = base_order(symbol, side, qty, is_crypto);
    order["type"] = json!("market");
    order
}

pub fn build_limit_order(
    symbol: &str,
    side: OrderSide,
    qty: f64,
    limit_price: f64,
    is_crypto: bool,
) -> Value {
    let mut order = base_order(symbol, side, qty, is_crypto);
    order["type"] = json!("limit");
    order["limit_price"] = json!(format!("{limit_price:.2}"));
    order
}

pub fn build_stop_limit_order(
    symbol: &str,
    side: OrderSide,
    qty: f64,
    stop_price: f64,
    limit_price: f64,
    is_crypto: bool,
) -> Value {
    let mut order = base_order(symbol, side, qty, is_crypto);
    order["type"] = json!("stop_limit");
    order["stop_price"] = json!(format!("{stop_price:.2}"));
    order["limit_price"] = json!(format!("{limit_price:.2}"));
    order
}

pub fn build_bracket_order(
    symbol: &str,
    side: OrderSide,
    qty: f64,
    entry_price: f64,
    targets: &ExitTargets,
    is_crypto: bool,
) -> Value {
    let mut stop_loss = targets.stop_loss;
    // Broker rule: sell-side stops must sit at least one cent above the base
    // price or the bracket is rejected outright.
    if side == OrderSide::Sell {
        let floor = entry_price + SELL_STOP_FLOOR_OFFSET;
        if stop_loss < floor {
            debug!(original = stop_loss, floor, "raising sell stop to broker floor");
            stop_loss = floor;
        }
    }

    let mut order = base_order(symbol, side, qty, is_crypto);
    order["type"] = json!("market");
    order["order_class"] = json!("bracket");
    order["stop_loss"] = json!({
        "stop_price": format!("{stop_loss:.2}"),
        "limit_price": format!("{stop_loss:.2}"),
    });
    order["take_profit"] = json!({
        "limit_price": format!("{:.2}", targets.take_profit),
    });
    order
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// An `id` means accepted; a `code`/`message` without one is a rejection.
pub fn parse_order_response(response: &Value) -> EngineResult<OrderAck> {
    if let Some(id) = json_str(response, "id") {
        return Ok(OrderAck {
            id,
            status: json_str(response, "status").unwrap_or_default(),
            filled_qty: json_str(response, "filled_qty").unwrap_or_else(|| "0".into()),
            filled_avg_price: json_str(response, "filled_avg_price").unwrap_or_default(),
            submitted_at: json_str(response, "submitted_at").unwrap_or_default(),
        });
    }

    if response.get("code").is_some() || response.get("message").is_some() {
        return Err(EngineError::BrokerReject {
            code: response.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: json_str(response, "message").unwrap_or_else(|| "unspecified".into()),
            base_price: crate::providers::json_f64(response, "base_price"),
        });
    }

    Err(EngineError::Parse(format!(
        "order response carries neither id nor error: {response}"
    )))
}

// ---------------------------------------------------------------------------
// Parameter validation
// ---------------------------------------------------------------------------

pub fn validate_order_parameters(
    data: &ProcessedData,
    sizing: &PositionSizing,
    config: &crate::config::StrategyConfig,
    is_crypto: bool,
) -> EngineResult<()> {
    let price = data.curr.close;
    if price <= 0.0 || !price.is_finite() {
        return Err(EngineError::ValidationFailed("price is zero, negative or non-finite".into()));
    }
    if sizing.quantity <= 0.0 {
        return Err(EngineError::ValidationFailed("quantity must be positive".into()));
    }
    if sizing.risk_amount <= 0.0 {
        return Err(EngineError::ValidationFailed("risk amount must be positive".into()));
    }

    // Share-count and price-range ceilings are stock concepts; crypto trades
    // fractional quantities at prices far outside the configured band.
    if !is_crypto {
        if sizing.quantity > config.maximum_share_quantity_per_single_trade {
            return Err(EngineError::ValidationFailed(format!(
                "quantity {} exceeds per-trade share ceiling {}",
                sizing.quantity, config.maximum_share_quantity_per_single_trade
            )));
        }
        if price < config.minimum_acceptable_price_for_signals
            || price > config.maximum_acceptable_price_for_signals
        {
            return Err(EngineError::ValidationFailed(format!(
                "price {price} outside acceptable range [{}, {}]",
                config.minimum_acceptable_price_for_signals,
                config.maximum_acceptable_price_for_signals
            )));
        }
    }

    let order_value = price * sizing.quantity;
    let max_value = config.maximum_dollar_value_per_single_trade;
    // Tolerance: one cent or a hundredth of a percent, whichever is larger.
    let epsilon = (max_value * 0.0001).max(0.01);
    if order_value > max_value + epsilon {
        return Err(EngineError::ValidationFailed(format!(
            "order value ${order_value:.2} exceeds per-trade maximum ${max_value:.2}"
        )));
    }
    Ok(())
}

/// Feasibility: the buying power must cover the order value scaled by the
/// validation safety margin.
pub fn validate_trade_feasibility(
    sizing: &PositionSizing,
    buying_power: f64,
    current_price: f64,
    safety_margin: f64,
) -> bool {
    if sizing.quantity <= 0.0 {
        return false;
    }
    buying_power >= sizing.quantity * current_price * safety_margin
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::types::{Bar, PositionDetails};

    fn data(close: f64, prev_close: f64, atr: f64, avg_atr: f64) -> ProcessedData {
        ProcessedData {
            atr,
            avg_atr,
            avg_vol: 1_000.0,
            curr: Bar {
                open: close - 1.0,
                high: close + 1.0,
                low: close - 2.0,
                close,
                volume: 5_000.0,
                timestamp: "1700000060000".into(),
            },
            prev: Bar {
                open: prev_close,
                high: prev_close + 1.0,
                low: prev_close - 1.0,
                close: prev_close,
                volume: 1_000.0,
                timestamp: "1700000000000".into(),
            },
            pos_details: PositionDetails::default(),
            open_orders: 0,
            exposure_pct: 0.0,
        }
    }

    fn sizing(qty: f64) -> PositionSizing {
        PositionSizing {
            quantity: qty,
            risk_amount: 1.0,
            size_multiplier: 1.0,
            risk_based_qty: qty,
            exposure_based_qty: qty,
            max_value_qty: qty,
            buying_power_qty: qty,
        }
    }

    // -- wash gate ----------------------------------------------------------

    #[test]
    fn wash_gate_passes_with_no_prior_order() {
        assert!(wash_gate_check(None, 60).is_ok());
    }

    #[test]
    fn wash_gate_blocks_until_the_interval_elapses() {
        let err = wash_gate_check(Some(59), 60).unwrap_err();
        assert!(matches!(err, EngineError::NotReady { remaining_secs: 1 }));
        assert!(wash_gate_check(Some(60), 60).is_ok());
        assert!(wash_gate_check(Some(61), 60).is_ok());
    }

    // -- opposite closure / capacity ----------------------------------------

    #[test]
    fn opposite_closure_requires_reversal_config() {
        assert!(should_close_opposite(OrderSide::Buy, -10.0, true));
        assert!(should_close_opposite(OrderSide::Sell, 10.0, true));
        assert!(!should_close_opposite(OrderSide::Buy, -10.0, false));
        assert!(!should_close_opposite(OrderSide::Buy, 10.0, true));
        assert!(!should_close_opposite(OrderSide::Sell, -10.0, true));
    }

    #[test]
    fn position_cap_blocks_stacking() {
        assert!(can_open_new_position(0.0, false));
        assert!(!can_open_new_position(5.0, false));
        assert!(can_open_new_position(5.0, true));
    }

    // -- order type selection ------------------------------------------------

    #[test]
    fn closing_always_uses_market() {
        assert_eq!(select_order_type(false, true, true, 2.0, 2.0), OrderType::Market);
        assert_eq!(select_order_type(true, true, true, 0.5, 0.1), OrderType::Market);
    }

    #[test]
    fn calm_stock_entries_use_brackets() {
        assert_eq!(select_order_type(false, false, true, 1.0, 0.2), OrderType::Bracket);
    }

    #[test]
    fn volatile_entries_use_stop_limits() {
        assert_eq!(select_order_type(false, false, true, 1.6, 0.2), OrderType::StopLimit);
        assert_eq!(select_order_type(false, false, true, 1.0, 1.1), OrderType::StopLimit);
    }

    #[test]
    fn crypto_entries_use_the_bracket_simulation() {
        assert_eq!(
            select_order_type(true, false, true, 1.0, 0.2),
            OrderType::CryptoBracketSim
        );
        assert_eq!(
            select_order_type(true, false, true, 5.0, 5.0),
            OrderType::CryptoBracketSim
        );
    }

    #[test]
    fn entries_without_targets_fall_back_to_market() {
        assert_eq!(select_order_type(false, false, false, 1.0, 0.1), OrderType::Market);
    }

    // -- payload builders ----------------------------------------------------

    #[test]
    fn quantity_formatting_keeps_eight_decimals() {
        assert_eq!(format_qty(0.00099645), "0.00099645");
        assert_eq!(format_qty(100.0), "100");
        assert_eq!(format_qty(1.50), "1.5");
    }

    #[test]
    fn market_order_payload_shape() {
        let order = build_market_order("BTC/USD", OrderSide::Sell, 0.00099645, true);
        assert_eq!(order["symbol"], "BTC/USD");
        assert_eq!(order["side"], "sell");
        assert_eq!(order["type"], "market");
        assert_eq!(order["qty"], "0.00099645");
        assert_eq!(order["time_in_force"], "gtc");
        assert!(order["client_order_id"].as_str().unwrap().len() >= 32);
    }

    #[test]
    fn stock_orders_use_day_time_in_force() {
        let order = build_market_order("AAPL", OrderSide::Buy, 100.0, false);
        assert_eq!(order["time_in_force"], "day");
    }

    #[test]
    fn bracket_payload_carries_both_legs() {
        let targets = ExitTargets { stop_loss: 99.5, take_profit: 102.5 };
        let order = build_bracket_order("AAPL", OrderSide::Buy, 100.0, 100.5, &targets, false);
        assert_eq!(order["order_class"], "bracket");
        assert_eq!(order["type"], "market");
        assert_eq!(order["stop_loss"]["stop_price"], "99.50");
        assert_eq!(order["take_profit"]["limit_price"], "102.50");
    }

    #[test]
    fn sell_bracket_raises_the_stop_to_the_broker_floor() {
        // A sell stop below base + 0.01 is rejected broker-side; the builder
        // lifts it preemptively.
        let targets = ExitTargets { stop_loss: 100.0, take_profit: 98.0 };
        let order = build_bracket_order("BTC/USD", OrderSide::Sell, 0.5, 101.0, &targets, true);
        assert_eq!(order["stop_loss"]["stop_price"], "101.01");
        // Buy brackets are untouched.
        let order = build_bracket_order("BTC/USD", OrderSide::Buy, 0.5, 101.0, &targets, true);
        assert_eq!(order["stop_loss"]["stop_price"], "100.00");
    }

    #[test]
    fn stop_limit_payload_shape() {
        let order = build_stop_limit_order("AAPL", OrderSide::Sell, 50.0, 99.5, 99.5, false);
        assert_eq!(order["type"], "stop_limit");
        assert_eq!(order["stop_price"], "99.50");
        assert_eq!(order["limit_price"], "99.50");
    }

    // -- response parsing ----------------------------------------------------

    #[test]
    fn accepted_response_parses_to_an_ack() {
        let response: Value = serde_json::from_str(
            r#"{"id":"b6b1b3b0","status":"accepted","filled_qty":"0","submitted_at":"2024-03-01T14:30:01Z"}"#,
        )
        .unwrap();
        let ack = parse_order_response(&response).unwrap();
        assert_eq!(ack.id, "b6b1b3b0");
        assert_eq!(ack.status, "accepted");
    }

    #[test]
    fn rejection_surfaces_code_message_and_base_price() {
        let response: Value = serde_json::from_str(
            r#"{"code":40310000,"message":"cost basis must be >= base_price","base_price":"101.50"}"#,
        )
        .unwrap();
        match parse_order_response(&response).unwrap_err() {
            EngineError::BrokerReject { code, message, base_price } => {
                assert_eq!(code, 40310000);
                assert!(message.contains("base_price"));
                assert_eq!(base_price, Some(101.50));
            }
            other => panic!("expected BrokerReject, got {other}"),
        }
    }

    #[test]
    fn garbage_response_is_a_parse_error() {
        let response: Value = serde_json::from_str(r#"{"unexpected":true}"#).unwrap();
        assert!(matches!(
            parse_order_response(&response),
            Err(EngineError::Parse(_))
        ));
    }

    // -- validation ----------------------------------------------------------

    #[test]
    fn validation_rejects_degenerate_parameters() {
        let config = sample_config().strategy;
        let d = data(100.5, 99.7, 1.0, 0.5);
        assert!(validate_order_parameters(&d, &sizing(0.0), &config, false).is_err());

        let mut bad_risk = sizing(10.0);
        bad_risk.risk_amount = 0.0;
        assert!(validate_order_parameters(&d, &bad_risk, &config, false).is_err());

        let mut bad_price = d.clone();
        bad_price.curr.close = 0.0;
        assert!(validate_order_parameters(&bad_price, &sizing(10.0), &config, false).is_err());
    }

    #[test]
    fn stock_ceilings_do_not_apply_to_crypto() {
        let mut config = sample_config().strategy;
        config.maximum_share_quantity_per_single_trade = 5.0;
        config.maximum_acceptable_price_for_signals = 1_000.0;
        let d = data(64_000.0, 63_800.0, 100.0, 80.0);
        // Way over the share ceiling and the price band, but fractional
        // crypto under the dollar cap passes.
        assert!(validate_order_parameters(&d, &sizing(0.001), &config, true).is_ok());
        assert!(validate_order_parameters(&d, &sizing(6.0), &config, false).is_err());
    }

    #[test]
    fn dollar_cap_applies_everywhere() {
        let mut config = sample_config().strategy;
        config.maximum_dollar_value_per_single_trade = 1_000.0;
        let d = data(100.0, 99.0, 1.0, 0.5);
        assert!(validate_order_parameters(&d, &sizing(9.0), &config, false).is_ok());
        assert!(validate_order_parameters(&d, &sizing(11.0), &config, false).is_err());
        // Crypto honors the same dollar ceiling.
        assert!(validate_order_parameters(&d, &sizing(11.0), &config, true).is_err());
    }

    #[test]
    fn feasibility_scales_with_the_safety_margin() {
        let s = sizing(100.0);
        assert!(validate_trade_feasibility(&s, 12_000.0, 100.0, 1.1));
        assert!(!validate_trade_feasibility(&s, 10_000.0, 100.0, 1.1));
        assert!(!validate_trade_feasibility(&sizing(0.0), 1_000_000.0, 100.0, 1.0));
    }

    // -- crypto sell closure (stubbed broker) --------------------------------

    use crate::providers::{MarketDataProvider, TradingProvider};
    use crate::types::{BarRequest, Quote};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    struct RecordingTrading {
        orders: PlMutex<Vec<Value>>,
        position_qty: &'static str,
    }

    #[async_trait]
    impl TradingProvider for RecordingTrading {
        fn provider_name(&self) -> &'static str {
            "recording"
        }
        async fn account_raw(&self) -> EngineResult<Value> {
            Ok(serde_json::json!({
                "equity": "100000", "cash": "50000", "buying_power": "200000"
            }))
        }
        async fn positions_raw(&self) -> EngineResult<Value> {
            Ok(serde_json::json!([
                {"symbol": "BTC/USD", "qty": self.position_qty,
                 "market_value": "63.77", "unrealized_pl": "-1.20"}
            ]))
        }
        async fn open_orders_raw(&self) -> EngineResult<Value> {
            Ok(serde_json::json!([]))
        }
        async fn place_order(&self, order: &Value) -> EngineResult<Value> {
            self.orders.lock().push(order.clone());
            Ok(serde_json::json!({"id": "ord-1", "status": "accepted"}))
        }
        async fn cancel_order(&self, _order_id: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn close_position(&self, _symbol: &str, _qty: Option<f64>) -> EngineResult<()> {
            Ok(())
        }
        async fn is_market_open(&self) -> EngineResult<bool> {
            Ok(true)
        }
    }

    struct IdleData;

    #[async_trait]
    impl MarketDataProvider for IdleData {
        fn provider_name(&self) -> &'static str {
            "idle"
        }
        async fn recent_bars(&self, _request: &BarRequest) -> EngineResult<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn historical_bars(
            &self,
            _symbol: &str,
            _timespan: &str,
            _start_ms: i64,
            _end_ms: i64,
            _limit: usize,
        ) -> EngineResult<Vec<Bar>> {
            Ok(Vec::new())
        }
        async fn current_price(&self, _symbol: &str) -> EngineResult<f64> {
            Ok(64_005.0)
        }
        async fn latest_quote(&self, _symbol: &str) -> EngineResult<Quote> {
            Err(EngineError::NoAccumulatedBars)
        }
        async fn is_market_open(&self) -> EngineResult<bool> {
            Ok(true)
        }
    }

    fn crypto_engine(
        position_qty: &'static str,
    ) -> (OrderExecutionEngine, Arc<RecordingTrading>, Arc<SharedStateHub>) {
        let trading = Arc::new(RecordingTrading {
            orders: PlMutex::new(Vec::new()),
            position_qty,
        });
        let idle = Arc::new(IdleData);
        let router = Arc::new(ProviderRouter::new(trading.clone(), idle.clone(), idle));
        let config = Arc::new(sample_config()); // target symbol BTC/USD
        let account = Arc::new(AccountManager::new(router.clone(), config.clone()));
        let hub = Arc::new(SharedStateHub::new());
        let engine = OrderExecutionEngine::new(router, account, hub.clone(), config, None);
        (engine, trading, hub)
    }

    fn crypto_sell_data() -> ProcessedData {
        let mut d = data(64_005.0, 64_100.0, 100.0, 80.0);
        d.pos_details.qty = 0.00099645;
        d.pos_details.current_value = 63.77;
        d
    }

    #[tokio::test]
    async fn crypto_sell_flattens_the_exact_on_exchange_quantity() {
        let (engine, trading, hub) = crypto_engine("0.00099645");
        let decision = SignalDecision {
            sell: true,
            strength: 0.8,
            reason: "sell".into(),
            ..Default::default()
        };

        engine
            .execute_trade(&crypto_sell_data(), 0.001, &sizing(0.0005), &decision)
            .await
            .unwrap();

        let orders = trading.orders.lock();
        assert_eq!(orders.len(), 1);
        let order = &orders[0];
        // The refetched fractional quantity goes out, not the cached one.
        assert_eq!(order["qty"], "0.00099645");
        assert_eq!(order["side"], "sell");
        assert_eq!(order["type"], "market");
        assert_eq!(order["time_in_force"], "gtc");
        assert!(hub.seconds_since_last_order().is_some());
    }

    #[tokio::test]
    async fn crypto_sell_with_no_position_opens_no_short() {
        let (engine, trading, hub) = crypto_engine("0");
        let decision = SignalDecision {
            sell: true,
            strength: 0.8,
            reason: "sell".into(),
            ..Default::default()
        };

        engine
            .execute_trade(&crypto_sell_data(), 0.0, &sizing(0.0005), &decision)
            .await
            .unwrap();

        assert!(trading.orders.lock().is_empty());
        assert!(hub.seconds_since_last_order().is_none());
    }

    #[tokio::test]
    async fn second_order_inside_the_interval_is_not_ready() {
        let (engine, trading, _hub) = crypto_engine("0.00099645");
        let decision = SignalDecision {
            sell: true,
            strength: 0.8,
            reason: "sell".into(),
            ..Default::default()
        };
        let d = crypto_sell_data();

        engine
            .execute_trade(&d, 0.001, &sizing(0.0005), &decision)
            .await
            .unwrap();
        // Immediately retrying trips the wash-trade gate.
        let err = engine
            .execute_trade(&d, 0.001, &sizing(0.0005), &decision)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotReady { .. }));
        assert_eq!(trading.orders.lock().len(), 1);
    }

    // -- regime metrics ------------------------------------------------------

    #[test]
    fn volatility_metrics_handle_missing_baselines() {
        let d = data(100.5, 99.7, 1.0, 0.5);
        assert!((volatility_ratio(&d) - 2.0).abs() < 1e-12);
        assert!((price_change_pct(&d) - 0.80240722).abs() < 1e-6);

        let mut no_baseline = d.clone();
        no_baseline.avg_atr = 0.0;
        assert_eq!(volatility_ratio(&no_baseline), 1.0);
        let mut no_prev = d;
        no_prev.prev.close = 0.0;
        assert_eq!(price_change_pct(&no_prev), 0.0);
    }
}
