// =============================================================================
// Account manager — equity, buying power, positions, open-order counts
// =============================================================================
//
// All broker numerics are accepted as strings or numbers. Snapshot fetches
// are cached for a configurable window (age-based invalidation only) so the
// decision loop and execution engine do not hammer the account endpoint
// within one cycle.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::providers::{json_f64, json_str, ProviderRouter};
use crate::types::{exposure_percentage, AccountInfo, AccountSnapshot, PositionDetails};

/// Order statuses that occupy a slot at the broker.
const WORKING_ORDER_STATUSES: [&str; 3] = ["new", "partially_filled", "pending_new"];

struct CachedSnapshot {
    at: Instant,
    snapshot: AccountSnapshot,
}

pub struct AccountManager {
    router: Arc<ProviderRouter>,
    config: Arc<Config>,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl AccountManager {
    pub fn new(router: Arc<ProviderRouter>, config: Arc<Config>) -> Self {
        Self {
            router,
            config,
            cache: Mutex::new(None),
        }
    }

    pub async fn fetch_account_info(&self) -> EngineResult<AccountInfo> {
        let payload = self.router.trading().account_raw().await?;
        parse_account_info(&payload)
    }

    pub async fn fetch_account_equity(&self) -> EngineResult<f64> {
        Ok(self.fetch_account_info().await?.equity)
    }

    pub async fn fetch_buying_power(&self) -> EngineResult<f64> {
        Ok(self.fetch_account_info().await?.buying_power)
    }

    pub async fn fetch_position_details(&self, symbol: &str) -> EngineResult<PositionDetails> {
        let payload = self.router.trading().positions_raw().await?;
        Ok(parse_position_details(&payload, symbol))
    }

    pub async fn fetch_open_orders_count(&self, symbol: &str) -> EngineResult<u32> {
        let payload = self.router.trading().open_orders_raw().await?;
        Ok(count_working_orders(&payload, symbol))
    }

    /// Full snapshot with the cache window applied.
    pub async fn fetch_snapshot(&self) -> EngineResult<AccountSnapshot> {
        let max_age = Duration::from_secs(self.config.timing.account_cache_seconds);
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.at.elapsed() < max_age {
                debug!("account snapshot served from cache");
                return Ok(cached.snapshot.clone());
            }
        }

        let snapshot = self.fetch_snapshot_uncached().await?;
        *self.cache.lock() = Some(CachedSnapshot {
            at: Instant::now(),
            snapshot: snapshot.clone(),
        });
        Ok(snapshot)
    }

    /// Bypass the cache; used when execution needs the on-exchange truth
    /// (e.g. refetching a crypto position right before closing it).
    pub async fn fetch_snapshot_uncached(&self) -> EngineResult<AccountSnapshot> {
        let symbol = self.config.target.symbol.clone();
        let info = self.fetch_account_info().await?;
        let pos_details = self.fetch_position_details(&symbol).await?;
        let open_orders = self.fetch_open_orders_count(&symbol).await?;

        Ok(AccountSnapshot {
            equity: info.equity,
            pos_details,
            open_orders,
            exposure_pct: exposure_percentage(pos_details.current_value, info.equity),
        })
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

pub fn parse_account_info(payload: &Value) -> EngineResult<AccountInfo> {
    // Broker error payloads surface a message without account fields.
    if payload.get("equity").is_none() {
        if let Some(message) = json_str(payload, "message") {
            return Err(EngineError::Parse(format!("account endpoint error: {message}")));
        }
        return Err(EngineError::MissingField { field: "equity" });
    }

    let equity =
        json_f64(payload, "equity").ok_or(EngineError::MissingField { field: "equity" })?;
    let cash = json_f64(payload, "cash").ok_or(EngineError::MissingField { field: "cash" })?;
    let buying_power = json_f64(payload, "buying_power")
        .ok_or(EngineError::MissingField { field: "buying_power" })?;

    Ok(AccountInfo {
        account_number: json_str(payload, "account_number").unwrap_or_default(),
        status: json_str(payload, "status").unwrap_or_else(|| "UNKNOWN".into()),
        currency: json_str(payload, "currency").unwrap_or_else(|| "USD".into()),
        pattern_day_trader: payload
            .get("pattern_day_trader")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        equity,
        cash,
        buying_power,
        last_equity: json_f64(payload, "last_equity").unwrap_or(0.0),
        long_market_value: json_f64(payload, "long_market_value").unwrap_or(0.0),
        short_market_value: json_f64(payload, "short_market_value").unwrap_or(0.0),
        day_trade_count: json_f64(payload, "day_trade_count").unwrap_or(0.0),
    })
}

/// Missing position is a flat position, not an error.
pub fn parse_position_details(payload: &Value, symbol: &str) -> PositionDetails {
    let Some(positions) = payload.as_array() else {
        return PositionDetails::default();
    };
    for position in positions {
        if json_str(position, "symbol").as_deref() == Some(symbol) {
            return PositionDetails {
                qty: json_f64(position, "qty").unwrap_or(0.0),
                current_value: json_f64(position, "market_value").unwrap_or(0.0),
                unrealized_pl: json_f64(position, "unrealized_pl").unwrap_or(0.0),
            };
        }
    }
    PositionDetails::default()
}

pub fn count_working_orders(payload: &Value, symbol: &str) -> u32 {
    let Some(orders) = payload.as_array() else {
        return 0;
    };
    orders
        .iter()
        .filter(|order| json_str(order, "symbol").as_deref() == Some(symbol))
        .filter(|order| {
            json_str(order, "status")
                .map(|status| WORKING_ORDER_STATUSES.contains(&status.as_str()))
                .unwrap_or(false)
        })
        .count() as u32
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_info_accepts_string_encoded_numerics() {
        let payload: Value = serde_json::from_str(
            r#"{
                "account_number":"PA3ABC","status":"ACTIVE","currency":"USD",
                "pattern_day_trader":false,
                "equity":"100000.50","cash":"25000","buying_power":"200001.00",
                "last_equity":"99000.25","long_market_value":"75000","short_market_value":"0",
                "day_trade_count":2
            }"#,
        )
        .unwrap();
        let info = parse_account_info(&payload).unwrap();
        assert_eq!(info.equity, 100_000.50);
        assert_eq!(info.cash, 25_000.0);
        assert_eq!(info.buying_power, 200_001.0);
        assert_eq!(info.day_trade_count, 2.0);
        assert!(!info.pattern_day_trader);
    }

    #[test]
    fn account_info_accepts_numeric_fields_too() {
        let payload: Value = serde_json::from_str(
            r#"{"equity":100000.5,"cash":25000,"buying_power":200001}"#,
        )
        .unwrap();
        let info = parse_account_info(&payload).unwrap();
        assert_eq!(info.equity, 100_000.5);
    }

    #[test]
    fn missing_required_field_is_fatal_for_the_op() {
        let payload: Value =
            serde_json::from_str(r#"{"equity":"100000.50","cash":"25000"}"#).unwrap();
        assert!(matches!(
            parse_account_info(&payload),
            Err(EngineError::MissingField { field: "buying_power" })
        ));
    }

    #[test]
    fn broker_error_payload_is_surfaced() {
        let payload: Value =
            serde_json::from_str(r#"{"code":40110000,"message":"request is not authorized"}"#)
                .unwrap();
        let err = parse_account_info(&payload).unwrap_err();
        assert!(err.to_string().contains("not authorized"));
    }

    #[test]
    fn fractional_crypto_position_is_preserved() {
        let payload: Value = serde_json::from_str(
            r#"[
                {"symbol":"AAPL","qty":"100","market_value":"19000.00","unrealized_pl":"150.25"},
                {"symbol":"BTC/USD","qty":"0.00099645","market_value":"63.77","unrealized_pl":"-1.20"}
            ]"#,
        )
        .unwrap();
        let details = parse_position_details(&payload, "BTC/USD");
        assert!((details.qty - 0.00099645).abs() < 1e-12);
        assert!((details.unrealized_pl + 1.20).abs() < 1e-12);
    }

    #[test]
    fn absent_position_reads_flat() {
        let payload: Value = serde_json::from_str("[]").unwrap();
        let details = parse_position_details(&payload, "AAPL");
        assert_eq!(details.qty, 0.0);
        assert_eq!(details.current_value, 0.0);
    }

    #[test]
    fn open_order_count_filters_by_symbol_and_status() {
        let payload: Value = serde_json::from_str(
            r#"[
                {"symbol":"AAPL","status":"new"},
                {"symbol":"AAPL","status":"partially_filled"},
                {"symbol":"AAPL","status":"pending_new"},
                {"symbol":"AAPL","status":"filled"},
                {"symbol":"AAPL","status":"canceled"},
                {"symbol":"MSFT","status":"new"}
            ]"#,
        )
        .unwrap();
        assert_eq!(count_working_orders(&payload, "AAPL"), 3);
        assert_eq!(count_working_orders(&payload, "MSFT"), 1);
        assert_eq!(count_working_orders(&payload, "SPY"), 0);
    }
}
