// =============================================================================
// Strategy logic — signal detection, entry filters, position sizing, exits
// =============================================================================
//
// Pure functions over ProcessedData and the strategy configuration; the
// decision loop owns all I/O. Signals require both a candle-body direction
// and a close-to-close confirmation; ties resolve to no signal. Sizing takes
// the most conservative of four independent caps.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::indicators::is_doji;
use crate::types::{OrderSide, ProcessedData};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Outcome of signal detection. At most one side is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignalDecision {
    pub buy: bool,
    pub sell: bool,
    /// Combined confidence in [0, 1].
    pub strength: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterResult {
    pub atr_pass: bool,
    pub vol_pass: bool,
    pub doji_pass: bool,
    pub all_pass: bool,
    pub atr_ratio: f64,
    pub vol_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionSizing {
    /// Final tradable quantity: fractional for crypto, whole for stocks.
    pub quantity: f64,
    /// Dollar risk per unit (the stop distance).
    pub risk_amount: f64,
    pub size_multiplier: f64,
    pub risk_based_qty: f64,
    pub exposure_based_qty: f64,
    pub max_value_qty: f64,
    pub buying_power_qty: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExitTargets {
    pub stop_loss: f64,
    pub take_profit: f64,
}

// ---------------------------------------------------------------------------
// Signal detection
// ---------------------------------------------------------------------------

pub fn detect_trading_signals(data: &ProcessedData, config: &StrategyConfig) -> SignalDecision {
    let curr = &data.curr;
    let prev = &data.prev;

    let momentum_ok = if config.require_momentum_confirmation {
        prev.close > 0.0
            && ((curr.close - prev.close) / prev.close * 100.0).abs()
                >= config.momentum_min_change_pct
    } else {
        true
    };

    let buy_pattern = curr.close > curr.open && curr.close > prev.close && momentum_ok;
    let sell_pattern = curr.close < curr.open && curr.close < prev.close && momentum_ok;

    if buy_pattern {
        SignalDecision {
            buy: true,
            sell: false,
            strength: signal_strength(data, config),
            reason: format!(
                "{}: close above open and above previous close",
                config.signal_buy_string
            ),
        }
    } else if sell_pattern {
        SignalDecision {
            buy: false,
            sell: true,
            strength: signal_strength(data, config),
            reason: format!(
                "{}: close below open and below previous close",
                config.signal_sell_string
            ),
        }
    } else {
        SignalDecision {
            reason: "no directional pattern".into(),
            ..Default::default()
        }
    }
}

/// Weighted blend of the normalized candle body, ATR expansion, and volume
/// expansion. Weights are validated at startup to sum to one.
fn signal_strength(data: &ProcessedData, config: &StrategyConfig) -> f64 {
    let range = data.curr.high - data.curr.low;
    let price_component = if range > 0.0 {
        ((data.curr.close - data.curr.open).abs() / range).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let atr_component = if data.avg_atr > 0.0 && config.entry_signal_atr_multiplier > 0.0 {
        ((data.atr / data.avg_atr) / config.entry_signal_atr_multiplier).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let vol_component = if data.avg_vol > 0.0 && config.volume_multiplier > 0.0 {
        ((data.curr.volume / data.avg_vol) / config.volume_multiplier).clamp(0.0, 1.0)
    } else {
        0.0
    };

    (config.strength_weight_price * price_component
        + config.strength_weight_atr * atr_component
        + config.strength_weight_volume * vol_component)
        .clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Entry filters
// ---------------------------------------------------------------------------

pub fn evaluate_trading_filters(data: &ProcessedData, config: &StrategyConfig) -> FilterResult {
    let atr_ratio = if data.avg_atr > 0.0 { data.atr / data.avg_atr } else { 0.0 };
    let atr_pass = if config.use_absolute_atr_threshold {
        data.atr >= config.atr_absolute_minimum_threshold
    } else {
        atr_ratio >= config.entry_signal_atr_multiplier
    };

    let vol_ratio = if data.avg_vol > 0.0 { data.curr.volume / data.avg_vol } else { 0.0 };
    let vol_pass = vol_ratio >= config.volume_multiplier;

    let doji_pass = !is_doji(&data.curr, config.doji_ratio);

    FilterResult {
        atr_pass,
        vol_pass,
        doji_pass,
        all_pass: atr_pass && vol_pass && doji_pass,
        atr_ratio,
        vol_ratio,
    }
}

// ---------------------------------------------------------------------------
// Position sizing
// ---------------------------------------------------------------------------

pub fn calculate_position_sizing(
    data: &ProcessedData,
    equity: f64,
    config: &StrategyConfig,
    buying_power: f64,
    is_crypto: bool,
) -> PositionSizing {
    let price = data.curr.close;
    let risk_amount = (data.atr * config.atr_stop_multiplier)
        .clamp(config.min_stop_distance, config.max_stop_distance);

    if price <= 0.0 || risk_amount <= 0.0 {
        return PositionSizing {
            risk_amount,
            size_multiplier: 1.0,
            ..Default::default()
        };
    }

    let risk_based_qty = equity * config.risk_per_trade / risk_amount;
    let exposure_based_qty =
        (config.max_exposure_pct * equity / 100.0 - data.pos_details.current_value.abs()) / price;
    let max_value_qty = config.maximum_dollar_value_per_single_trade / price;
    let buying_power_qty = buying_power * config.short_safety_margin / price;

    // Stocks trade whole shares; crypto keeps fractional sizes and is not
    // subject to the share-count ceiling.
    let snap = |qty: f64| if is_crypto { qty } else { qty.floor() };
    let risk_based_qty = snap(risk_based_qty);
    let exposure_based_qty = snap(exposure_based_qty);
    let max_value_qty = snap(max_value_qty);
    let buying_power_qty = snap(buying_power_qty);

    let quantity = risk_based_qty
        .min(exposure_based_qty)
        .min(max_value_qty)
        .min(buying_power_qty)
        .max(0.0);

    PositionSizing {
        quantity,
        risk_amount,
        size_multiplier: 1.0,
        risk_based_qty,
        exposure_based_qty,
        max_value_qty,
        buying_power_qty,
    }
}

// ---------------------------------------------------------------------------
// Exit targets
// ---------------------------------------------------------------------------

pub fn compute_exit_targets(
    side: OrderSide,
    entry_price: f64,
    risk_amount: f64,
    rr_ratio: f64,
) -> ExitTargets {
    match side {
        OrderSide::Buy => ExitTargets {
            stop_loss: entry_price - risk_amount,
            take_profit: entry_price + rr_ratio * risk_amount,
        },
        OrderSide::Sell => ExitTargets {
            stop_loss: entry_price + risk_amount,
            take_profit: entry_price - rr_ratio * risk_amount,
        },
    }
}
