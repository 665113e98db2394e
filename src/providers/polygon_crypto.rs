// =============================================================================
// Crypto market-data adapter — realtime WebSocket feed with a two-level bar
// accumulator, plus historical REST for warm starts
// =============================================================================
//
// The feed subscribes to 1-second aggregates (XAS) and quotes (XQ) for the
// configured pair. Incoming aggregates fold into the per-symbol accumulator;
// `recent_bars` reads from the accumulator only, never from synthetic data.
// A cold accumulator is seeded from the last half hour of historical
// 1-second bars before the warm-up error is surfaced. Crypto venues never
// close, so `is_market_open` is constant.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{ProviderConfig, WsAccumulatorConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{EngineError, EngineResult};
use crate::market_data::accumulator::BarAccumulator;
use crate::net::http::HttpClient;
use crate::net::render_endpoint;
use crate::net::ws::{WsClient, WsSessionConfig};
use crate::providers::{json_f64, parse_bar_array, MarketDataProvider};
use crate::types::{Bar, BarRequest, Quote};

/// Cold accumulators are seeded with this much recent history.
const WARM_START_MINUTES: i64 = 30;
const WARM_START_BAR_LIMIT: usize = 1_800;

type AccumulatorMap = Arc<Mutex<HashMap<String, Arc<BarAccumulator>>>>;
type QuoteMap = Arc<Mutex<HashMap<String, Quote>>>;
type PriceMap = Arc<Mutex<HashMap<String, f64>>>;

pub struct PolygonCryptoClient {
    config: ProviderConfig,
    acc_config: WsAccumulatorConfig,
    http: HttpClient,
    ws: WsClient,
    accumulators: AccumulatorMap,
    latest_quotes: QuoteMap,
    latest_prices: PriceMap,
}

impl PolygonCryptoClient {
    pub fn new(
        config: ProviderConfig,
        acc_config: WsAccumulatorConfig,
        reconnect_delay: Duration,
        error_retry_delay: Duration,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> EngineResult<Self> {
        if config.api_key.is_empty() || config.api_secret.is_empty() || config.base_url.is_empty()
        {
            return Err(EngineError::BadConfig(
                "crypto data provider requires api_key, api_secret and base_url".into(),
            ));
        }
        if config.websocket_url.is_empty() {
            return Err(EngineError::BadConfig(
                "crypto data provider requires websocket_url".into(),
            ));
        }
        let http = HttpClient::new(&config, connectivity)?;
        let ws = WsClient::new(WsSessionConfig {
            url: config.websocket_url.clone(),
            auth_key: config.api_key.clone(),
            reconnect_delay,
            error_retry_delay,
        });
        info!(base_url = %config.base_url, ws = %config.websocket_url, "crypto data adapter initialized");
        Ok(Self {
            config,
            acc_config,
            http,
            ws,
            accumulators: Arc::new(Mutex::new(HashMap::new())),
            latest_quotes: Arc::new(Mutex::new(HashMap::new())),
            latest_prices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Register the symbol's accumulator and start the stream if idle. The
    /// data mutex is held only for the map insert, never across the connect.
    fn ensure_feed(&self, symbol: &str) -> EngineResult<Arc<BarAccumulator>> {
        let accumulator = {
            let mut map = self.accumulators.lock();
            match map.get(symbol) {
                Some(existing) => existing.clone(),
                None => {
                    let created = Arc::new(BarAccumulator::new(
                        self.acc_config.websocket_bar_accumulation_seconds,
                        self.acc_config.websocket_second_level_accumulation_seconds,
                        self.acc_config.websocket_max_bar_history_size,
                    )?);
                    map.insert(symbol.to_string(), created.clone());
                    created
                }
            }
        };

        if !self.ws.is_running() {
            let accumulators = self.accumulators.clone();
            let quotes = self.latest_quotes.clone();
            let prices = self.latest_prices.clone();
            self.ws.set_message_callback(Arc::new(move |text| {
                handle_feed_message(text, &accumulators, &quotes, &prices)
            }));

            let ws_symbol = ws_symbol_format(symbol);
            self.ws.subscribe(&format!("XAS.{ws_symbol},XQ.{ws_symbol}"));
            self.ws.start_receive_loop();
            info!(symbol, "crypto realtime feed started");
        }
        Ok(accumulator)
    }

    /// Seed a cold accumulator with fresh 1-second history so the ATR window
    /// fills before the first live bar lands.
    async fn warm_start(&self, symbol: &str, accumulator: &BarAccumulator) {
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = end_ms - WARM_START_MINUTES * 60 * 1_000;
        match self
            .historical_bars(symbol, "second", start_ms, end_ms, WARM_START_BAR_LIMIT)
            .await
        {
            Ok(bars) if !bars.is_empty() => {
                for bar in &bars {
                    accumulator.add_bar(bar);
                }
                info!(symbol, seeded = bars.len(), "accumulator warm-started from history");
            }
            Ok(_) => warn!(symbol, "no historical bars available for warm start"),
            Err(e) => warn!(symbol, error = %e, "warm start fetch failed"),
        }
    }

    /// Whether the realtime session is currently established (distinct from
    /// the loop running: a reconnect in progress reads false).
    pub fn is_feed_connected(&self) -> bool {
        self.ws.is_connected()
    }

    pub async fn disconnect(&self) {
        self.ws.disconnect().await;
    }
}

// ---------------------------------------------------------------------------
// Symbol format conversions
// ---------------------------------------------------------------------------

/// Stream form: `BTC/USD` -> `BTC-USD`.
pub fn ws_symbol_format(symbol: &str) -> String {
    symbol.replacen('/', "-", 1)
}

/// Stream pairs arrive dashed; normalize to the engine's slash form.
pub fn normalize_pair(pair: &str) -> String {
    pair.replacen('-', "/", 1)
}

/// REST form: `BTC/USD` -> `X:BTCUSD`.
pub fn rest_symbol_format(symbol: &str) -> String {
    match symbol.split_once('/') {
        Some((base, quote)) => format!("X:{base}{quote}"),
        None if symbol.starts_with("X:") => symbol.to_string(),
        None => format!("X:{symbol}"),
    }
}

fn join_query(url: &str, params: &[(&str, String)]) -> String {
    let mut out = url.to_string();
    for (i, (key, value)) in params.iter().enumerate() {
        out.push(if i == 0 && !url.contains('?') { '?' } else { '&' });
        out.push_str(key);
        out.push('=');
        out.push_str(value);
    }
    out
}

// ---------------------------------------------------------------------------
// Feed message dispatch
// ---------------------------------------------------------------------------

/// Dispatch one text frame. Messages arrive as single objects or arrays of
/// objects discriminated by `ev`. Malformed records are dropped at the
/// record level; the stream itself never fails from here.
fn handle_feed_message(
    text: &str,
    accumulators: &AccumulatorMap,
    quotes: &QuoteMap,
    prices: &PriceMap,
) -> bool {
    let parsed: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "unparseable feed frame dropped");
            return false;
        }
    };

    let records: Vec<&Value> = match &parsed {
        Value::Array(items) => items.iter().collect(),
        single => vec![single],
    };

    let mut all_consumed = true;
    for record in records {
        match record.get("ev").and_then(Value::as_str) {
            Some("status") => {
                let status = record.get("status").and_then(Value::as_str).unwrap_or("");
                let message = record.get("message").and_then(Value::as_str).unwrap_or("");
                debug!(status, message, "feed status");
            }
            Some("XAS") | Some("XA") => {
                if !apply_bar_record(record, accumulators, prices) {
                    all_consumed = false;
                }
            }
            Some("XQ") => {
                if !apply_quote_record(record, quotes) {
                    all_consumed = false;
                }
            }
            other => {
                debug!(event = ?other, "unknown feed event dropped");
                all_consumed = false;
            }
        }
    }
    all_consumed
}

fn apply_bar_record(record: &Value, accumulators: &AccumulatorMap, prices: &PriceMap) -> bool {
    let Some(pair) = record.get("pair").and_then(Value::as_str) else {
        debug!("aggregate record without pair dropped");
        return false;
    };
    let symbol = normalize_pair(pair);

    let (Some(open), Some(high), Some(low), Some(close), Some(volume)) = (
        json_f64(record, "o"),
        json_f64(record, "h"),
        json_f64(record, "l"),
        json_f64(record, "c"),
        json_f64(record, "v"),
    ) else {
        debug!(symbol, "aggregate record with missing fields dropped");
        return false;
    };
    let start_ms = record.get("s").and_then(Value::as_i64).unwrap_or(0);
    if close <= 0.0 || start_ms <= 0 {
        debug!(symbol, close, start_ms, "aggregate record with invalid data dropped");
        return false;
    }

    let bar = Bar {
        open,
        high,
        low,
        close,
        volume,
        timestamp: start_ms.to_string(),
    };

    prices.lock().insert(symbol.clone(), close);
    if let Some(accumulator) = accumulators.lock().get(&symbol) {
        accumulator.add_bar(&bar);
    }
    true
}

fn apply_quote_record(record: &Value, quotes: &QuoteMap) -> bool {
    let Some(pair) = record.get("pair").and_then(Value::as_str) else {
        debug!("quote record without pair dropped");
        return false;
    };
    let symbol = normalize_pair(pair);

    let (Some(bid), Some(ask)) = (json_f64(record, "bp"), json_f64(record, "ap")) else {
        debug!(symbol, "quote record with missing sides dropped");
        return false;
    };
    let timestamp = record
        .get("t")
        .and_then(Value::as_i64)
        .map(|t| t.to_string())
        .unwrap_or_default();

    let quote = Quote::new(
        ask,
        bid,
        json_f64(record, "as").unwrap_or(0.0),
        json_f64(record, "bs").unwrap_or(0.0),
        timestamp,
    );
    quotes.lock().insert(symbol, quote);
    true
}

// ---------------------------------------------------------------------------
// MarketDataProvider
// ---------------------------------------------------------------------------

#[async_trait]
impl MarketDataProvider for PolygonCryptoClient {
    fn provider_name(&self) -> &'static str {
        "polygon-crypto"
    }

    async fn recent_bars(&self, request: &BarRequest) -> EngineResult<Vec<Bar>> {
        let accumulator = self.ensure_feed(&request.symbol)?;

        if accumulator.accumulated_bars_count() == 0 {
            self.warm_start(&request.symbol, &accumulator).await;
        }

        let bars = accumulator.accumulated_bars(request.limit);
        if bars.is_empty() {
            if !self.is_feed_connected() {
                debug!(symbol = %request.symbol, "realtime session still reconnecting");
            }
            // The loop is alive; the window just has not filled yet.
            return Err(EngineError::NoAccumulatedBars);
        }
        debug!(symbol = %request.symbol, bars = bars.len(), "accumulated bars served");
        Ok(bars)
    }

    async fn historical_bars(
        &self,
        symbol: &str,
        timespan: &str,
        start_ms: i64,
        end_ms: i64,
        limit: usize,
    ) -> EngineResult<Vec<Bar>> {
        let endpoint = render_endpoint(
            &self.config.endpoints.historical_bars,
            &[
                ("symbol", rest_symbol_format(symbol).as_str()),
                ("multiplier", &self.config.bar_multiplier.to_string()),
                ("timespan", timespan),
                ("from", &start_ms.to_string()),
                ("to", &end_ms.to_string()),
            ],
        )?;
        let url = join_query(
            &format!("{}{}", self.config.base_url, endpoint),
            &[
                ("adjusted", "true".to_string()),
                ("sort", "asc".to_string()),
                ("limit", limit.to_string()),
                ("apiKey", self.config.api_key.clone()),
            ],
        );

        let body = self.http.get(&url).await?;
        let payload: Value = serde_json::from_str(&body)
            .map_err(|e| EngineError::Parse(format!("invalid historical bars payload: {e}")))?;
        let mut bars = parse_bar_array(&payload);
        if bars.len() > limit {
            let excess = bars.len() - limit;
            bars.drain(..excess);
        }
        Ok(bars)
    }

    async fn current_price(&self, symbol: &str) -> EngineResult<f64> {
        if let Some(price) = self.latest_prices.lock().get(symbol) {
            return Ok(*price);
        }
        // Fall back to the freshest accumulated close before giving up.
        let accumulator = self.accumulators.lock().get(symbol).cloned();
        if let Some(accumulator) = accumulator {
            if let Some(last) = accumulator.accumulated_bars(1).last() {
                return Ok(last.close);
            }
        }
        Err(EngineError::NoAccumulatedBars)
    }

    async fn latest_quote(&self, symbol: &str) -> EngineResult<Quote> {
        self.latest_quotes
            .lock()
            .get(symbol)
            .cloned()
            .ok_or(EngineError::NoAccumulatedBars)
    }

    async fn is_market_open(&self) -> EngineResult<bool> {
        Ok(true)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn empty_maps() -> (AccumulatorMap, QuoteMap, PriceMap) {
        (
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(Mutex::new(HashMap::new())),
        )
    }

    fn maps_with_accumulator(symbol: &str) -> (AccumulatorMap, QuoteMap, PriceMap) {
        let (accumulators, quotes, prices) = empty_maps();
        accumulators.lock().insert(
            symbol.to_string(),
            Arc::new(BarAccumulator::new(1, 2, 100).unwrap()),
        );
        (accumulators, quotes, prices)
    }

    #[test]
    fn symbol_conversions_round_trip() {
        assert_eq!(ws_symbol_format("BTC/USD"), "BTC-USD");
        assert_eq!(normalize_pair("BTC-USD"), "BTC/USD");
        assert_eq!(rest_symbol_format("BTC/USD"), "X:BTCUSD");
        assert_eq!(rest_symbol_format("X:ETHUSD"), "X:ETHUSD");
    }

    #[test]
    fn join_query_handles_existing_query_strings() {
        assert_eq!(
            join_query("https://h/p", &[("a", "1".into()), ("b", "2".into())]),
            "https://h/p?a=1&b=2"
        );
        assert_eq!(
            join_query("https://h/p?x=0", &[("a", "1".into())]),
            "https://h/p?x=0&a=1"
        );
    }

    #[test]
    fn aggregate_records_feed_the_accumulator_and_price_map() {
        let (accumulators, quotes, prices) = maps_with_accumulator("BTC/USD");
        let frame = r#"[{"ev":"XAS","pair":"BTC-USD","o":64000.0,"h":64010.0,"l":63990.0,"c":64005.0,"v":1.25,"s":1709303400000}]"#;
        assert!(handle_feed_message(frame, &accumulators, &quotes, &prices));

        assert_eq!(prices.lock().get("BTC/USD"), Some(&64005.0));
        let acc = accumulators.lock().get("BTC/USD").unwrap().clone();
        assert!(acc.accumulated_bars_count() > 0);
    }

    #[test]
    fn quote_records_update_the_quote_map() {
        let (accumulators, quotes, prices) = empty_maps();
        let frame = r#"{"ev":"XQ","pair":"BTC-USD","bp":63999.0,"ap":64001.0,"bs":0.5,"as":0.7,"t":1709303400123}"#;
        assert!(handle_feed_message(frame, &accumulators, &quotes, &prices));

        let map = quotes.lock();
        let quote = map.get("BTC/USD").unwrap();
        assert!((quote.mid_price - 64_000.0).abs() < 1e-9);
        assert_eq!(quote.timestamp, "1709303400123");
    }

    #[test]
    fn status_messages_are_consumed_quietly() {
        let (accumulators, quotes, prices) = empty_maps();
        let frame = r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#;
        assert!(handle_feed_message(frame, &accumulators, &quotes, &prices));
        assert!(quotes.lock().is_empty());
    }

    #[test]
    fn malformed_records_drop_without_poisoning_the_batch() {
        let (accumulators, quotes, prices) = maps_with_accumulator("BTC/USD");
        // Second record is garbage; first still applies.
        let frame = r#"[
            {"ev":"XAS","pair":"BTC-USD","o":100.0,"h":101.0,"l":99.0,"c":100.5,"v":1.0,"s":1709303400000},
            {"ev":"XAS","pair":"BTC-USD","o":100.0,"h":101.0,"l":99.0,"c":-5.0,"v":1.0,"s":1709303401000},
            {"ev":"mystery"}
        ]"#;
        assert!(!handle_feed_message(frame, &accumulators, &quotes, &prices));
        assert_eq!(prices.lock().get("BTC/USD"), Some(&100.5));
    }

    #[test]
    fn unparseable_frames_are_rejected() {
        let (accumulators, quotes, prices) = empty_maps();
        assert!(!handle_feed_message("not json", &accumulators, &quotes, &prices));
    }

    #[test]
    fn bars_for_untracked_symbols_only_update_prices() {
        let (accumulators, quotes, prices) = maps_with_accumulator("BTC/USD");
        let frame = r#"{"ev":"XAS","pair":"ETH-USD","o":3000.0,"h":3001.0,"l":2999.0,"c":3000.5,"v":2.0,"s":1709303400000}"#;
        assert!(handle_feed_message(frame, &accumulators, &quotes, &prices));
        assert_eq!(prices.lock().get("ETH/USD"), Some(&3000.5));
        let acc = accumulators.lock().get("BTC/USD").unwrap().clone();
        assert_eq!(acc.accumulated_bars_count(), 0);
    }
}
