// =============================================================================
// HTTP client — authenticated REST with connectivity gating and retries
// =============================================================================
//
// One client per provider. Before every attempt the connectivity monitor is
// consulted; the outcome of every attempt is reported back to it. Transport
// failures sleep the provider's rate-limit delay plus a fixed second before
// retrying. HTTP error statuses are NOT transport failures: the body travels
// back to the adapter, which understands broker error payloads.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{EngineError, EngineResult};

/// Fixed pause between retry attempts, on top of the rate-limit delay.
const RETRY_PAUSE: Duration = Duration::from_secs(1);

pub struct HttpClient {
    client: reqwest::Client,
    connectivity: Arc<ConnectivityMonitor>,
    retry_count: u32,
    rate_limit_delay: Duration,
}

impl HttpClient {
    /// Build a client for one provider. Broker-style header credentials are
    /// installed as default headers on every request.
    pub fn new(
        config: &ProviderConfig,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> EngineResult<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&config.api_key)
            .map_err(|_| EngineError::BadConfig("api_key contains invalid characters".into()))?;
        let secret = HeaderValue::from_str(&config.api_secret)
            .map_err(|_| EngineError::BadConfig("api_secret contains invalid characters".into()))?;
        headers.insert("APCA-API-KEY-ID", key);
        headers.insert("APCA-API-SECRET-KEY", secret);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .danger_accept_invalid_certs(!config.enable_ssl_verification)
            .build()
            .map_err(|e| EngineError::BadConfig(format!("http client build failed: {e}")))?;

        Ok(Self {
            client,
            connectivity,
            retry_count: config.retry_count,
            rate_limit_delay: Duration::from_millis(config.rate_limit_delay_ms),
        })
    }

    pub async fn get(&self, url: &str) -> EngineResult<String> {
        self.execute(Method::GET, url, None, false).await
    }

    pub async fn post(&self, url: &str, body: String) -> EngineResult<String> {
        self.execute(Method::POST, url, Some(body), false).await
    }

    /// DELETE tolerates empty bodies (idempotent cancellation; 404/empty are
    /// normal outcomes the caller interprets).
    pub async fn delete(&self, url: &str) -> EngineResult<String> {
        self.execute(Method::DELETE, url, None, true).await
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<String>,
        allow_empty: bool,
    ) -> EngineResult<String> {
        let mut last_error = String::new();

        for attempt in 1..=self.retry_count {
            if !self.connectivity.should_attempt_connection() {
                let retry_in_secs = self.connectivity.seconds_until_retry();
                debug!(url, retry_in_secs, "request gated by connectivity monitor");
                return Err(EngineError::ConnectivityGated { retry_in_secs });
            }

            let mut request = self.client.request(method.clone(), url);
            if let Some(ref b) = body {
                request = request
                    .header("Content-Type", "application/json")
                    .body(b.clone());
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    self.connectivity.report_success();

                    if text.is_empty() && !allow_empty {
                        // A 2xx with no body is useless to every caller here.
                        return Err(EngineError::EmptyResponse { url: url.to_string() });
                    }
                    debug!(%method, url, %status, bytes = text.len(), "request completed");
                    return Ok(text);
                }
                Err(e) => {
                    last_error = format!("{method} {url} attempt {attempt}/{}: {e}", self.retry_count);
                    self.connectivity.report_failure(&last_error);
                    warn!(error = %last_error, "transport failure");

                    if attempt < self.retry_count {
                        tokio::time::sleep(self.rate_limit_delay).await;
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
        }

        Err(EngineError::HttpTransport(last_error))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectivityConfig;

    fn gated_monitor() -> Arc<ConnectivityMonitor> {
        let monitor = ConnectivityMonitor::new(ConnectivityConfig {
            max_retry_delay_seconds: 600,
            degraded_threshold: 1,
            disconnected_threshold: 2,
            backoff_multiplier: 3.0,
        });
        monitor.report_failure("seed 1");
        monitor.report_failure("seed 2");
        Arc::new(monitor)
    }

    fn provider() -> ProviderConfig {
        crate::config::tests::sample_provider()
    }

    #[tokio::test]
    async fn gated_client_fails_without_touching_the_network() {
        let client = HttpClient::new(&provider(), gated_monitor()).unwrap();
        // The host does not resolve; a gate failure proves no I/O happened.
        let err = client
            .get("https://does-not-exist.invalid/v2/account")
            .await
            .unwrap_err();
        match err {
            EngineError::ConnectivityGated { retry_in_secs } => assert!(retry_in_secs > 0),
            other => panic!("expected ConnectivityGated, got {other}"),
        }
    }

    #[test]
    fn invalid_header_credentials_are_bad_config() {
        let mut cfg = provider();
        cfg.api_key = "bad\nkey".into();
        let monitor = Arc::new(ConnectivityMonitor::new(ConnectivityConfig {
            max_retry_delay_seconds: 10,
            degraded_threshold: 1,
            disconnected_threshold: 1,
            backoff_multiplier: 2.0,
        }));
        assert!(matches!(
            HttpClient::new(&cfg, monitor),
            Err(EngineError::BadConfig(_))
        ));
    }
}
