// =============================================================================
// Position manager — market-close flattening
// =============================================================================
//
// When the venue reports closed and a position is still open, flatten it.
// A sanity bound on the quantity guards against acting on corrupted account
// data; oversized readings are logged and left alone.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::EngineResult;
use crate::providers::ProviderRouter;
use crate::types::ProcessedData;

pub struct PositionManager {
    router: Arc<ProviderRouter>,
    config: Arc<Config>,
}

impl PositionManager {
    pub fn new(router: Arc<ProviderRouter>, config: Arc<Config>) -> Self {
        Self { router, config }
    }

    /// Flatten the position when the market has closed. Returns true when a
    /// closure was submitted.
    pub async fn handle_market_close_positions(&self, data: &ProcessedData) -> EngineResult<bool> {
        let symbol = &self.config.target.symbol;

        match self.router.is_market_open(symbol).await {
            Ok(true) => return Ok(false),
            Ok(false) => {}
            // An unreachable clock reads as closed: holding overnight risk on
            // a dead connection is worse than flattening early.
            Err(e) => warn!(error = %e, "market-hours check failed, assuming closed"),
        }

        let current_qty = data.pos_details.qty;
        if current_qty == 0.0 {
            return Ok(false);
        }

        let sanity_bound = self.config.strategy.maximum_reasonable_position_quantity;
        if current_qty.abs() > sanity_bound {
            error!(
                current_qty,
                sanity_bound,
                "position quantity fails the sanity bound, refusing market-close flatten"
            );
            return Ok(false);
        }

        info!(
            symbol = %symbol,
            current_qty,
            grace_period_min = self.config.timing.market_close_grace_period_minutes,
            "market closed with an open position, flattening"
        );
        self.router.trading().close_position(symbol, None).await?;
        Ok(true)
    }
}
