// =============================================================================
// Trade history — append-only CSV of accepted orders
// =============================================================================

use std::fs::OpenOptions;
use std::path::Path;

use csv::WriterBuilder;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{EngineError, EngineResult};

/// One accepted order.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub timestamp: String,
    pub symbol: String,
    pub side: String,
    pub qty: f64,
    pub price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub order_id: String,
    pub status: String,
}

pub struct TradeHistoryWriter {
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl TradeHistoryWriter {
    /// Open (or create) the history file. Headers are written only when the
    /// file starts empty so appends across restarts stay well-formed.
    pub fn open(path: &str) -> EngineResult<Self> {
        let is_new = !Path::new(path).exists()
            || std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EngineError::BadConfig(format!("cannot open trade history {path}: {e}")))?;
        let writer = WriterBuilder::new().has_headers(is_new).from_writer(file);
        info!(path, "trade history sink opened");
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    /// Append one record. Failures are logged, never propagated; history is
    /// an audit trail, not a trading dependency.
    pub fn record(&self, record: &TradeRecord) {
        let mut writer = self.writer.lock();
        if let Err(e) = writer.serialize(record) {
            warn!(error = %e, "trade history write failed");
            return;
        }
        if let Err(e) = writer.flush() {
            warn!(error = %e, "trade history flush failed");
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(order_id: &str) -> TradeRecord {
        TradeRecord {
            timestamp: "2024-03-01 14:30:00".into(),
            symbol: "BTC/USD".into(),
            side: "buy".into(),
            qty: 0.00099645,
            price: 64_005.0,
            stop_loss: 63_900.0,
            take_profit: 64_200.0,
            order_id: order_id.into(),
            status: "accepted".into(),
        }
    }

    #[test]
    fn records_append_with_a_single_header() {
        let dir = std::env::temp_dir().join(format!("tradewind-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("history.csv");
        let path_str = path.to_str().unwrap();

        {
            let writer = TradeHistoryWriter::open(path_str).unwrap();
            writer.record(&sample_record("ord-1"));
        }
        {
            // Reopen and append; no second header row.
            let writer = TradeHistoryWriter::open(path_str).unwrap();
            writer.record(&sample_record("ord-2"));
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,symbol,side"));
        assert!(lines[1].contains("ord-1"));
        assert!(lines[2].contains("ord-2"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
