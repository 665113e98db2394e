// =============================================================================
// Risk manager — daily P&L gate and exposure gate
// =============================================================================
//
// Two circuit conditions protect capital:
//   1. Daily P&L   — the session return must stay inside
//                    (max_daily_loss, daily_profit_target).
//   2. Exposure    — |position value| / equity must not exceed the cap.
//
// Both are evaluated from snapshots; the gate itself performs no I/O.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::StrategyConfig;

/// Inputs to one gate evaluation.
#[derive(Debug, Clone, Copy)]
pub struct TradeGateInput {
    /// Equity at session start; zero means "unknown" and passes the P&L gate.
    pub initial_equity: f64,
    pub current_equity: f64,
    pub exposure_pct: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TradeGateResult {
    pub daily_pnl: f64,
    pub pnl_ok: bool,
    pub exposure_ok: bool,
    pub allowed: bool,
}

pub struct RiskManager {
    config: StrategyConfig,
}

impl RiskManager {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn evaluate_trade_gate(&self, input: TradeGateInput) -> TradeGateResult {
        let daily_pnl = if input.initial_equity == 0.0 {
            0.0
        } else {
            (input.current_equity - input.initial_equity) / input.initial_equity
        };

        let pnl_ok =
            daily_pnl > self.config.max_daily_loss && daily_pnl < self.config.daily_profit_target;
        let exposure_ok = input.exposure_pct <= self.config.max_exposure_pct;
        let allowed = pnl_ok && exposure_ok;

        if !allowed {
            warn!(
                daily_pnl_pct = daily_pnl * 100.0,
                exposure_pct = input.exposure_pct,
                pnl_ok,
                exposure_ok,
                "risk gate rejected trading"
            );
        }

        TradeGateResult {
            daily_pnl,
            pnl_ok,
            exposure_ok,
            allowed,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;

    fn manager() -> RiskManager {
        // max_daily_loss = -0.04, daily_profit_target = 0.05, exposure cap 50%.
        RiskManager::new(sample_config().strategy)
    }

    #[test]
    fn nominal_day_is_allowed() {
        let result = manager().evaluate_trade_gate(TradeGateInput {
            initial_equity: 100_000.0,
            current_equity: 101_000.0,
            exposure_pct: 10.0,
        });
        assert!(result.allowed);
        assert!((result.daily_pnl - 0.01).abs() < 1e-12);
    }

    #[test]
    fn daily_loss_beyond_limit_halts_trading() {
        let result = manager().evaluate_trade_gate(TradeGateInput {
            initial_equity: 100_000.0,
            current_equity: 95_000.0,
            exposure_pct: 0.0,
        });
        // -5% is below the -4% floor.
        assert!((result.daily_pnl + 0.05).abs() < 1e-12);
        assert!(!result.pnl_ok);
        assert!(!result.allowed);
        assert!(result.exposure_ok);
    }

    #[test]
    fn profit_target_also_halts_trading() {
        let result = manager().evaluate_trade_gate(TradeGateInput {
            initial_equity: 100_000.0,
            current_equity: 106_000.0,
            exposure_pct: 0.0,
        });
        assert!(!result.pnl_ok);
        assert!(!result.allowed);
    }

    #[test]
    fn exposure_above_cap_blocks_even_with_good_pnl() {
        let result = manager().evaluate_trade_gate(TradeGateInput {
            initial_equity: 100_000.0,
            current_equity: 100_500.0,
            exposure_pct: 55.0,
        });
        assert!(result.pnl_ok);
        assert!(!result.exposure_ok);
        assert!(!result.allowed);
    }

    #[test]
    fn unknown_initial_equity_passes_the_pnl_gate() {
        let result = manager().evaluate_trade_gate(TradeGateInput {
            initial_equity: 0.0,
            current_equity: 42_000.0,
            exposure_pct: 0.0,
        });
        assert_eq!(result.daily_pnl, 0.0);
        assert!(result.allowed);
    }

    #[test]
    fn allowed_implies_both_gates() {
        // Sweep a grid of equity/exposure pairs; allowed must always equal
        // the conjunction.
        let m = manager();
        for current in [90_000.0, 96_001.0, 100_000.0, 104_999.0, 110_000.0] {
            for exposure in [0.0, 25.0, 50.0, 75.0] {
                let r = m.evaluate_trade_gate(TradeGateInput {
                    initial_equity: 100_000.0,
                    current_equity: current,
                    exposure_pct: exposure,
                });
                assert_eq!(r.allowed, r.pnl_ok && r.exposure_ok);
                let expected = (current - 100_000.0) / 100_000.0;
                assert!((r.daily_pnl - expected).abs() < 1e-12);
            }
        }
    }
}
