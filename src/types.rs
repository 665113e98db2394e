// =============================================================================
// Shared data model for the Tradewind engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// A single OHLCV bar. Timestamps are stringified milliseconds-since-epoch;
/// the bar's identity within a stream is its timestamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timestamp: String,
}

impl Bar {
    /// Parse the timestamp into epoch milliseconds.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.timestamp.parse::<i64>().ok()
    }

    /// All prices finite and positive, volume non-negative, and the OHLC
    /// relationships hold (H >= L, H >= C, L <= C).
    pub fn is_valid_ohlc(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return false;
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return false;
        }
        self.high >= self.low && self.high >= self.close && self.low <= self.close
    }
}

/// Best bid/ask snapshot from the realtime quote stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quote {
    pub ask_price: f64,
    pub bid_price: f64,
    pub ask_size: f64,
    pub bid_size: f64,
    pub mid_price: f64,
    pub timestamp: String,
}

impl Quote {
    pub fn new(
        ask_price: f64,
        bid_price: f64,
        ask_size: f64,
        bid_size: f64,
        timestamp: String,
    ) -> Self {
        Self {
            ask_price,
            bid_price,
            ask_size,
            bid_size,
            mid_price: (ask_price + bid_price) / 2.0,
            timestamp,
        }
    }
}

/// Current position in the target symbol. Quantity is fractional for crypto
/// and whole-share for stocks; signed (negative = short).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PositionDetails {
    pub qty: f64,
    pub current_value: f64,
    pub unrealized_pl: f64,
}

/// Indicator state plus the two most recent bars, produced by the market
/// data fetcher and replaced wholesale in the shared state hub. Zero values
/// for atr/avg_atr/avg_vol mean "uncomputed".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub atr: f64,
    pub avg_atr: f64,
    pub avg_vol: f64,
    pub curr: Bar,
    pub prev: Bar,
}

/// Account state produced by the account manager.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub pos_details: PositionDetails,
    pub open_orders: u32,
    pub exposure_pct: f64,
}

/// Extended account fields from the broker account endpoint. Numeric fields
/// may arrive string-encoded; the account manager accepts both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_number: String,
    pub status: String,
    pub currency: String,
    pub pattern_day_trader: bool,
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
    pub last_equity: f64,
    pub long_market_value: f64,
    pub short_market_value: f64,
    pub day_trade_count: f64,
}

/// Merged projection of market + account snapshots consumed by strategy and
/// execution.
#[derive(Debug, Clone, Default)]
pub struct ProcessedData {
    pub atr: f64,
    pub avg_atr: f64,
    pub avg_vol: f64,
    pub curr: Bar,
    pub prev: Bar,
    pub pos_details: PositionDetails,
    pub open_orders: u32,
    pub exposure_pct: f64,
}

impl ProcessedData {
    pub fn merge(market: &MarketSnapshot, account: &AccountSnapshot) -> Self {
        Self {
            atr: market.atr,
            avg_atr: market.avg_atr,
            avg_vol: market.avg_vol,
            curr: market.curr.clone(),
            prev: market.prev.clone(),
            pos_details: account.pos_details,
            open_orders: account.open_orders,
            exposure_pct: account.exposure_pct,
        }
    }
}

/// Request for the most recent bars of a symbol.
#[derive(Debug, Clone)]
pub struct BarRequest {
    pub symbol: String,
    pub limit: usize,
}

/// Order side. Serialized lowercase to match the broker wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exposure as |position value| / equity * 100, zero when equity is not
/// positive.
pub fn exposure_percentage(current_value: f64, equity: f64) -> f64 {
    if equity <= 0.0 {
        return 0.0;
    }
    (current_value.abs() / equity) * 100.0
}
