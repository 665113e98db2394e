// =============================================================================
// Market data fetcher — poll, validate, compute indicators, publish
// =============================================================================
//
// One poll requests the recent bar window from the routed provider, validates
// every bar, computes the indicator set, and publishes a MarketSnapshot into
// the shared hub. Nothing is published on thin data, OHLC violations, or an
// uncomputable ATR; the decision loop simply keeps waiting.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::indicators;
use crate::providers::ProviderRouter;
use crate::state::SharedStateHub;
use crate::types::{Bar, BarRequest, MarketSnapshot};

pub struct MarketDataFetcher {
    router: Arc<ProviderRouter>,
    hub: Arc<SharedStateHub>,
    config: Arc<Config>,
}

impl MarketDataFetcher {
    pub fn new(router: Arc<ProviderRouter>, hub: Arc<SharedStateHub>, config: Arc<Config>) -> Self {
        Self { router, hub, config }
    }

    /// Fetch and publish one snapshot. Thin data is not an error: it logs and
    /// leaves the previous snapshot in place.
    pub async fn poll_once(&self) -> EngineResult<()> {
        let symbol = &self.config.target.symbol;
        let strategy = &self.config.strategy;

        let provider = self.router.market_data_for(symbol);

        // Outside the fetch window (market closed, not yet pre-open) there is
        // nothing worth polling. A failed window check does not block the
        // poll; the bar request carries its own failure handling.
        if let Ok(false) = provider.is_within_trading_hours().await {
            debug!(symbol = %symbol, "outside the fetch window, poll skipped");
            return Ok(());
        }

        let request = BarRequest {
            symbol: symbol.clone(),
            limit: strategy.atr_period + self.config.timing.bar_fetch_buffer,
        };
        let bars = provider.recent_bars(&request).await?;

        if bars.len() < strategy.atr_period + 2 {
            warn!(
                symbol = %symbol,
                bars = bars.len(),
                needed = strategy.atr_period + 2,
                "insufficient bars, snapshot not published"
            );
            return Ok(());
        }

        let snapshot = build_snapshot(&bars, self.config.as_ref())?;
        self.hub.publish_market(snapshot);
        debug!(symbol = %symbol, bars = bars.len(), "market snapshot published");
        Ok(())
    }
}

/// Validate bars and assemble the snapshot. Factored out so the validation
/// rules are testable without providers.
pub fn build_snapshot(bars: &[Bar], config: &Config) -> EngineResult<MarketSnapshot> {
    for bar in bars {
        if !bar.is_valid_ohlc() {
            return Err(EngineError::InvalidMarketData {
                reason: format!(
                    "bar at {} violates OHLC invariants (o={} h={} l={} c={})",
                    bar.timestamp, bar.open, bar.high, bar.low, bar.close
                ),
            });
        }
    }

    let strategy = &config.strategy;
    let atr = indicators::compute_atr(bars, strategy.atr_calculation_bars).unwrap_or(0.0);
    if atr <= 0.0 {
        return Err(EngineError::InvalidMarketData {
            reason: "ATR uncomputable from returned bars".into(),
        });
    }
    let avg_atr = indicators::compute_average_atr(
        bars,
        strategy.atr_calculation_bars,
        strategy.average_atr_comparison_multiplier,
    )
    .unwrap_or(0.0);
    let avg_vol = indicators::compute_average_volume(
        bars,
        strategy.atr_calculation_bars,
        strategy.minimum_volume_threshold,
    )
    .unwrap_or(0.0);

    let curr = bars[bars.len() - 1].clone();
    let prev = bars[bars.len() - 2].clone();
    if !curr.close.is_finite() || curr.close <= 0.0 {
        return Err(EngineError::InvalidMarketData {
            reason: "current close is not a finite positive price".into(),
        });
    }

    Ok(MarketSnapshot { atr, avg_atr, avg_vol, curr, prev })
}
