// =============================================================================
// Brokerage trading adapter — account, positions, orders, market clock
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{EngineError, EngineResult};
use crate::net::http::HttpClient;
use crate::providers::{json_str, TradingProvider};

/// `GET /v2/clock` payload.
#[derive(Debug, Clone)]
pub struct MarketClock {
    pub is_open: bool,
    pub timestamp: String,
    pub next_open: String,
}

pub struct AlpacaTradingClient {
    config: ProviderConfig,
    http: HttpClient,
}

impl AlpacaTradingClient {
    pub fn new(
        config: ProviderConfig,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> EngineResult<Self> {
        if config.api_key.is_empty() || config.api_secret.is_empty() || config.base_url.is_empty()
        {
            return Err(EngineError::BadConfig(
                "trading provider requires api_key, api_secret and base_url".into(),
            ));
        }
        let http = HttpClient::new(&config, connectivity)?;
        info!(base_url = %config.base_url, "trading adapter initialized");
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

    pub async fn clock(&self) -> EngineResult<MarketClock> {
        let url = self.url(&self.config.endpoints.clock);
        let payload = self.get_json(&url).await?;
        parse_clock(&payload)
    }
}

/// The clock payload must carry `is_open`; the rest is informational.
fn parse_clock(payload: &Value) -> EngineResult<MarketClock> {
    let is_open = payload
        .get("is_open")
        .and_then(Value::as_bool)
        .ok_or(EngineError::MissingField { field: "is_open" })?;
    Ok(MarketClock {
        is_open,
        timestamp: json_str(payload, "timestamp").unwrap_or_default(),
        next_open: json_str(payload, "next_open").unwrap_or_default(),
    })
}

/// Cancellation treats broker "not found" payloads as success: the order is
/// gone either way.
fn cancel_outcome(body: &str) -> EngineResult<()> {
    if body.trim().is_empty() {
        return Ok(());
    }
    if let Ok(payload) = serde_json::from_str::<Value>(body) {
        if let Some(message) = json_str(&payload, "message") {
            debug!(message, "cancel returned a broker message, treated as done");
        }
    }
    Ok(())
}

#[async_trait]
impl TradingProvider for AlpacaTradingClient {
    fn provider_name(&self) -> &'static str {
        "alpaca-trading"
    }

    async fn account_raw(&self) -> EngineResult<Value> {
        let url = self.url(&self.config.endpoints.account);
        self.get_json(&url).await
    }

    async fn positions_raw(&self) -> EngineResult<Value> {
        let url = self.url(&self.config.endpoints.positions);
        self.get_json(&url).await
    }

    async fn open_orders_raw(&self) -> EngineResult<Value> {
        let url = format!("{}?status=open", self.url(&self.config.endpoints.orders));
        self.get_json(&url).await
    }

    async fn place_order(&self, order: &Value) -> EngineResult<Value> {
        let url = self.url(&self.config.endpoints.orders);
        let body = self.http.post(&url, order.to_string()).await?;
        serde_json::from_str(&body)
            .map_err(|e| EngineError::Parse(format!("invalid order response: {e} | body: {body}")))
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        let url = format!("{}/{order_id}", self.url(&self.config.endpoints.orders));
        let body = self.http.delete(&url).await?;
        cancel_outcome(&body)
    }

    async fn close_position(&self, symbol: &str, qty: Option<f64>) -> EngineResult<()> {
        let mut url = format!("{}/{symbol}", self.url(&self.config.endpoints.positions));
        if let Some(qty) = qty {
            url.push_str(&format!("?qty={qty:.8}"));
        }
        let body = self.http.delete(&url).await?;
        if !body.trim().is_empty() {
            debug!(symbol, response = %body, "position close acknowledged");
        }
        warn!(symbol, qty = ?qty, "position closure submitted");
        Ok(())
    }

    async fn is_market_open(&self) -> EngineResult<bool> {
        Ok(self.clock().await?.is_open)
    }
}
