// =============================================================================
// Provider adapters — capability traits and the per-symbol router
// =============================================================================
//
// Adapters expose two capability surfaces instead of one concrete client:
// market data (bars/quotes/clock) and trading (account/orders/positions).
// The router picks the data adapter from the symbol shape; trading operations
// always go to the brokerage trading adapter.
// =============================================================================

pub mod alpaca_stocks;
pub mod alpaca_trading;
pub mod polygon_crypto;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineResult;
use crate::types::{Bar, BarRequest, Quote};

/// Market data capability: bars, quotes, market-hours.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Most recent bars, oldest first.
    async fn recent_bars(&self, request: &BarRequest) -> EngineResult<Vec<Bar>>;

    /// Bars over an explicit window, oldest first. Timestamps are epoch ms.
    async fn historical_bars(
        &self,
        symbol: &str,
        timespan: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> EngineResult<Vec<Bar>>;

    async fn current_price(&self, symbol: &str) -> EngineResult<f64>;

    async fn latest_quote(&self, symbol: &str) -> EngineResult<Quote>;

    async fn is_market_open(&self) -> EngineResult<bool>;

    /// For most venues this is the same question as `is_market_open`;
    /// adapters with fetch windows narrower than the session override it.
    async fn is_within_trading_hours(&self) -> EngineResult<bool> {
        self.is_market_open().await
    }
}

/// Trading capability: account state and order lifecycle.
#[async_trait]
pub trait TradingProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    async fn account_raw(&self) -> EngineResult<Value>;

    async fn positions_raw(&self) -> EngineResult<Value>;

    /// Open orders only (`status=open` at the broker).
    async fn open_orders_raw(&self) -> EngineResult<Value>;

    /// Submit an order; returns the broker response payload (which carries
    /// either `id` or `code`/`message`).
    async fn place_order(&self, order: &Value) -> EngineResult<Value>;

    /// Idempotent cancellation; 404/empty responses are success.
    async fn cancel_order(&self, order_id: &str) -> EngineResult<()>;

    /// Close a position, optionally partially.
    async fn close_position(&self, symbol: &str, qty: Option<f64>) -> EngineResult<()>;

    async fn is_market_open(&self) -> EngineResult<bool>;
}

/// Symbols with a pair separator or a major crypto base route to the crypto
/// data plane; everything else is a stock ticker.
pub fn is_crypto_symbol(symbol: &str) -> bool {
    symbol.contains('/')
        || symbol.contains('-')
        || symbol.contains("BTC")
        || symbol.contains("ETH")
}

/// Routes operations to the right adapter for the configured instrument.
pub struct ProviderRouter {
    trading: Arc<dyn TradingProvider>,
    stock_data: Arc<dyn MarketDataProvider>,
    crypto_data: Arc<dyn MarketDataProvider>,
}

impl ProviderRouter {
    pub fn new(
        trading: Arc<dyn TradingProvider>,
        stock_data: Arc<dyn MarketDataProvider>,
        crypto_data: Arc<dyn MarketDataProvider>,
    ) -> Self {
        Self {
            trading,
            stock_data,
            crypto_data,
        }
    }

    pub fn market_data_for(&self, symbol: &str) -> &Arc<dyn MarketDataProvider> {
        if is_crypto_symbol(symbol) {
            &self.crypto_data
        } else {
            &self.stock_data
        }
    }

    pub fn trading(&self) -> &Arc<dyn TradingProvider> {
        &self.trading
    }

    /// Market-hours check routed like market data: crypto venues never close.
    pub async fn is_market_open(&self, symbol: &str) -> EngineResult<bool> {
        self.market_data_for(symbol).is_market_open().await
    }
}

// ---------------------------------------------------------------------------
// Payload helpers shared by the adapters
// ---------------------------------------------------------------------------

/// Read a numeric field that brokers encode either as a number or a string.
pub fn json_f64(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Read a string field, tolerating nulls and numeric encodings.
pub fn json_str(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse a `bars`/`results` array of {o,h,l,c,v,t} records, dropping any
/// malformed entry. `t` may be epoch milliseconds or an ISO-8601 string.
pub fn parse_bar_array(payload: &Value) -> Vec<Bar> {
    let records = payload
        .get("bars")
        .or_else(|| payload.get("results"))
        .and_then(Value::as_array);
    let Some(records) = records else {
        return Vec::new();
    };

    records
        .iter()
        .filter_map(|record| {
            let bar = Bar {
                open: json_f64(record, "o")?,
                high: json_f64(record, "h")?,
                low: json_f64(record, "l")?,
                close: json_f64(record, "c")?,
                volume: json_f64(record, "v")?,
                timestamp: parse_bar_timestamp(record.get("t")?)?,
            };
            bar.is_valid_ohlc().then_some(bar)
        })
        .collect()
}

/// Timestamps arrive as epoch ms (crypto) or ISO-8601 (stocks); both
/// normalize to the stringified-ms form the rest of the engine uses.
fn parse_bar_timestamp(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_i64().map(|ms| ms.to_string()),
        Value::String(s) => {
            if let Ok(ms) = s.parse::<i64>() {
                return Some(ms.to_string());
            }
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.timestamp_millis().to_string())
        }
        _ => None,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_symbols_are_detected() {
        assert!(is_crypto_symbol("BTC/USD"));
        assert!(is_crypto_symbol("BTC-USD"));
        assert!(is_crypto_symbol("ETHUSD"));
        assert!(is_crypto_symbol("BTCUSD"));
    }

    #[test]
    fn stock_symbols_route_to_stock_data() {
        assert!(!is_crypto_symbol("AAPL"));
        assert!(!is_crypto_symbol("MSFT"));
        assert!(!is_crypto_symbol("SPY"));
    }

    #[test]
    fn numeric_fields_accept_both_encodings() {
        let payload: Value =
            serde_json::from_str(r#"{"equity":"100000.50","cash":25000.25,"name":"x"}"#).unwrap();
        assert_eq!(json_f64(&payload, "equity"), Some(100_000.50));
        assert_eq!(json_f64(&payload, "cash"), Some(25_000.25));
        assert_eq!(json_f64(&payload, "name"), None);
        assert_eq!(json_f64(&payload, "missing"), None);
    }

    #[test]
    fn bar_array_parses_both_timestamp_forms() {
        let payload: Value = serde_json::from_str(
            r#"{"bars":[
                {"o":99.0,"h":101.0,"l":98.8,"c":100.5,"v":5000,"t":"2024-03-01T14:30:00Z"},
                {"o":100.5,"h":102.0,"l":100.0,"c":101.0,"v":4000,"t":1709303460000}
            ]}"#,
        )
        .unwrap();
        let bars = parse_bar_array(&payload);
        assert_eq!(bars.len(), 2);
        assert!(bars[0].timestamp_ms().is_some());
        assert_eq!(bars[1].timestamp, "1709303460000");
    }

    #[test]
    fn malformed_bars_are_dropped_not_fatal() {
        let payload: Value = serde_json::from_str(
            r#"{"results":[
                {"o":99.0,"h":101.0,"l":98.8,"c":100.5,"v":5000,"t":1709303400000},
                {"o":"bad","h":101.0,"l":98.8,"c":100.5,"v":5000,"t":1709303460000},
                {"o":99.0,"h":90.0,"l":98.8,"c":100.5,"v":5000,"t":1709303520000},
                {"h":101.0,"l":98.8,"c":100.5,"v":5000,"t":1709303580000}
            ]}"#,
        )
        .unwrap();
        // One good record; a non-numeric open, an H<L violation, and a
        // missing open all drop.
        assert_eq!(parse_bar_array(&payload).len(), 1);
    }

    #[test]
    fn missing_array_yields_empty() {
        let payload: Value = serde_json::from_str(r#"{"status":"ok"}"#).unwrap();
        assert!(parse_bar_array(&payload).is_empty());
    }
}
