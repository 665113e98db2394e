// =============================================================================
// Stock market-data adapter — REST bars, latest quotes, market clock
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::ProviderConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{EngineError, EngineResult};
use crate::net::http::HttpClient;
use crate::net::render_endpoint;
use crate::providers::{json_f64, json_str, parse_bar_array, MarketDataProvider};
use crate::types::{Bar, BarRequest, Quote};

pub struct AlpacaStocksClient {
    config: ProviderConfig,
    http: HttpClient,
}

impl AlpacaStocksClient {
    pub fn new(
        config: ProviderConfig,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> EngineResult<Self> {
        if config.api_key.is_empty() || config.api_secret.is_empty() || config.base_url.is_empty()
        {
            return Err(EngineError::BadConfig(
                "stock data provider requires api_key, api_secret and base_url".into(),
            ));
        }
        let http = HttpClient::new(&config, connectivity)?;
        info!(base_url = %config.base_url, "stock data adapter initialized");
        Ok(Self { config, http })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    async fn get_json(&self, url: &str) -> EngineResult<Value> {
        let body = self.http.get(url).await?;
        serde_json::from_str(&body)
            .map_err(|e| EngineError::Parse(format!("invalid JSON from {url}: {e}")))
    }

    fn bars_url(
        &self,
        template: &str,
        symbol: &str,
        timespan: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> EngineResult<String> {
        let endpoint = render_endpoint(
            template,
            &[
                ("symbol", symbol),
                ("multiplier", &self.config.bar_multiplier.to_string()),
                ("timespan", timespan),
                ("from", &start_ms.to_string()),
                ("to", &end_ms.to_string()),
            ],
        )?;
        Ok(self.url(&endpoint))
    }
}

/// Approximate milliseconds covered by one bar of the configured timespan.
fn timespan_millis(timespan: &str, multiplier: u32) -> i64 {
    let unit_ms: i64 = match timespan {
        "second" | "1sec" => 1_000,
        "minute" | "1min" => 60_000,
        "hour" => 3_600_000,
        "day" => 86_400_000,
        _ => 60_000,
    };
    unit_ms * i64::from(multiplier.max(1))
}

/// Latest-quote payloads nest under `quote` with short field names.
fn parse_latest_quote(payload: &Value) -> EngineResult<Quote> {
    let quote = payload.get("quote").unwrap_or(payload);
    let ask_price = json_f64(quote, "ap").ok_or(EngineError::MissingField { field: "ap" })?;
    let bid_price = json_f64(quote, "bp").ok_or(EngineError::MissingField { field: "bp" })?;
    Ok(Quote::new(
        ask_price,
        bid_price,
        json_f64(quote, "as").unwrap_or(0.0),
        json_f64(quote, "bs").unwrap_or(0.0),
        json_str(quote, "t").unwrap_or_default(),
    ))
}

#[async_trait]
impl MarketDataProvider for AlpacaStocksClient {
    fn provider_name(&self) -> &'static str {
        "alpaca-stocks"
    }

    async fn recent_bars(&self, request: &BarRequest) -> EngineResult<Vec<Bar>> {
        let end_ms = Utc::now().timestamp_millis();
        // Double the nominal window to ride out weekends and halts.
        let span = timespan_millis(&self.config.bar_timespan, self.config.bar_multiplier);
        let start_ms = end_ms - span * (request.limit as i64) * 2;

        let url = self.bars_url(
            &self.config.endpoints.bars,
            &request.symbol,
            &self.config.bar_timespan,
            start_ms,
            end_ms,
        )?;
        let payload = self.get_json(&url).await?;
        let mut bars = parse_bar_array(&payload);
        if bars.len() > request.limit {
            let excess = bars.len() - request.limit;
            bars.drain(..excess);
        }
        debug!(symbol = %request.symbol, bars = bars.len(), "recent bars fetched");
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
        let url = self.bars_url(
            &self.config.endpoints.historical_bars,
            symbol,
            timespan,
            start_ms,
            end_ms,
        )?;
        let payload = self.get_json(&url).await?;
        let mut bars = parse_bar_array(&payload);
        if bars.len() > limit {
            let excess = bars.len() - limit;
            bars.drain(..excess);
        }
        Ok(bars)
    }

    async fn current_price(&self, symbol: &str) -> EngineResult<f64> {
        let quote = self.latest_quote(symbol).await?;
        if quote.mid_price > 0.0 {
            Ok(quote.mid_price)
        } else {
            Err(EngineError::InvalidMarketData {
                reason: format!("non-positive mid price for {symbol}"),
            })
        }
    }

    async fn latest_quote(&self, symbol: &str) -> EngineResult<Quote> {
        let endpoint = render_endpoint(
            &self.config.endpoints.quotes_latest,
            &[("symbol", symbol)],
        )?;
        let url = self.url(&endpoint);
        let payload = self.get_json(&url).await?;
        parse_latest_quote(&payload)
    }

    async fn is_market_open(&self) -> EngineResult<bool> {
        let url = self.url(&self.config.endpoints.clock);
        let payload = self.get_json(&url).await?;
        payload
            .get("is_open")
            .and_then(Value::as_bool)
            .ok_or(EngineError::MissingField { field: "is_open" })
    }

    /// The fetch window opens a little before the session so the indicator
    /// history is warm at the bell.
    async fn is_within_trading_hours(&self) -> EngineResult<bool> {
        let url = self.url(&self.config.endpoints.clock);
        let payload = self.get_json(&url).await?;
        Ok(within_fetch_window(
            &payload,
            self.config.pre_open_fetch_buffer_minutes,
        ))
    }
}

/// Open markets always pass; closed markets pass only inside the pre-open
/// buffer before `next_open`. Unparseable clock payloads read as outside.
fn within_fetch_window(clock: &Value, buffer_minutes: u64) -> bool {
    if clock.get("is_open").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    let (Some(now_s), Some(next_open_s)) =
        (json_str(clock, "timestamp"), json_str(clock, "next_open"))
    else {
        return false;
    };
    let (Ok(now), Ok(next_open)) = (
        chrono::DateTime::parse_from_rfc3339(&now_s),
        chrono::DateTime::parse_from_rfc3339(&next_open_s),
    ) else {
        return false;
    };
    let minutes_to_open = (next_open - now).num_minutes();
    minutes_to_open >= 0 && minutes_to_open <= buffer_minutes as i64
}
