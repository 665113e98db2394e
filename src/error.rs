// =============================================================================
// Error taxonomy for the trading pipeline
// =============================================================================
//
// Recoverable outcomes travel as values; process-fatal cases (BadConfig at
// startup) abort via main. Per-cycle failures in the data and decision loops
// are logged by the owning loop, which then continues.
// =============================================================================

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or invalid configuration at startup. Fatal.
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    /// The connectivity monitor blocked the attempt. Retried next cycle.
    #[error("connectivity gated, retry in {retry_in_secs}s")]
    ConnectivityGated { retry_in_secs: u64 },

    /// Network/TLS failure after all retries.
    #[error("http transport failure: {0}")]
    HttpTransport(String),

    /// HTTP 2xx with an empty body; fatal for the call.
    #[error("empty response from {url}")]
    EmptyResponse { url: String },

    /// The broker returned an error payload for an order operation.
    #[error("broker rejected order: {message} (code {code})")]
    BrokerReject {
        code: i64,
        message: String,
        base_price: Option<f64>,
    },

    /// JSON/timestamp/number parse failure for a record the caller needs.
    #[error("parse failure: {0}")]
    Parse(String),

    /// Required field absent from a provider payload. Fatal for that op.
    #[error("required field missing from payload: {field}")]
    MissingField { field: &'static str },

    /// OHLC invariant violation or non-finite values; snapshot not published.
    #[error("invalid market data: {reason}")]
    InvalidMarketData { reason: String },

    /// WebSocket feed is live but the accumulator is still warming up.
    #[error("websocket feed active but no accumulated bars yet")]
    NoAccumulatedBars,

    /// Market data older than the staleness threshold.
    #[error("market data stale: {age_secs}s old, max {max_secs}s")]
    StaleData { age_secs: u64, max_secs: u64 },

    /// Order parameters out of configured bounds.
    #[error("order validation failed: {0}")]
    ValidationFailed(String),

    /// Position cap reached with multiple positions disabled.
    #[error("position cap reached for {symbol}")]
    PositionCap { symbol: String },

    /// Wash-trade interval not yet elapsed.
    #[error("order interval not met, {remaining_secs}s remaining")]
    NotReady { remaining_secs: u64 },
}

impl EngineError {
    /// Whether this failure should count against the connectivity monitor.
    /// Gated attempts never do (no I/O happened).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::HttpTransport(_) | Self::EmptyResponse { .. }
        )
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = EngineError::NotReady { remaining_secs: 42 };
        assert!(err.to_string().contains("42s remaining"));

        let err = EngineError::BrokerReject {
            code: 40310000,
            message: "cost basis must be >= base_price".to_string(),
            base_price: Some(101.5),
        };
        assert!(err.to_string().contains("40310000"));
    }

    #[test]
    fn transport_classification() {
        assert!(EngineError::HttpTransport("timeout".into()).is_transport());
        assert!(EngineError::EmptyResponse { url: "u".into() }.is_transport());
        assert!(!EngineError::NoAccumulatedBars.is_transport());
        assert!(!EngineError::ConnectivityGated { retry_in_secs: 3 }.is_transport());
    }
}
