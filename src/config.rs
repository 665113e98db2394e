// =============================================================================
// Configuration root — immutable, loaded once at startup
// =============================================================================
//
// Every tunable lives in a JSON file with NO serde defaults: a missing key is
// a startup error. API credentials may be left empty in the file, in which
// case they are filled from the environment (dotenv is loaded by main before
// this runs). The validated root is shared as `Arc<Config>` read-only views;
// nothing mutates it after startup.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Provider configuration
// ---------------------------------------------------------------------------

/// REST endpoint path templates. Placeholders `{symbol}`, `{multiplier}`,
/// `{timespan}`, `{from}`, `{to}` are substituted at request time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    pub bars: String,
    pub quotes_latest: String,
    pub orders: String,
    pub positions: String,
    pub account: String,
    pub clock: String,
    pub historical_bars: String,
}

/// Per-provider API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub api_secret: String,
    pub base_url: String,
    pub websocket_url: String,
    pub retry_count: u32,
    pub timeout_seconds: u64,
    pub enable_ssl_verification: bool,
    pub rate_limit_delay_ms: u64,
    pub bar_multiplier: u32,
    pub bar_timespan: String,
    /// Bars may be fetched this many minutes before the next open so
    /// indicators are warm at the bell.
    pub pre_open_fetch_buffer_minutes: u64,
    pub endpoints: EndpointsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub trading: ProviderConfig,
    pub stock_data: ProviderConfig,
    pub crypto_data: ProviderConfig,
}

// ---------------------------------------------------------------------------
// Strategy configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub atr_period: usize,
    pub atr_calculation_bars: usize,
    pub average_atr_comparison_multiplier: usize,
    pub minimum_volume_threshold: f64,
    pub entry_signal_atr_multiplier: f64,
    pub use_absolute_atr_threshold: bool,
    pub atr_absolute_minimum_threshold: f64,
    pub volume_multiplier: f64,
    pub doji_ratio: f64,
    pub rr_ratio: f64,
    pub atr_stop_multiplier: f64,
    pub min_stop_distance: f64,
    pub max_stop_distance: f64,
    pub risk_per_trade: f64,
    pub max_exposure_pct: f64,
    pub max_daily_loss: f64,
    pub daily_profit_target: f64,
    pub buying_power_validation_safety_margin: f64,
    pub short_safety_margin: f64,
    pub close_positions_on_signal_reversal: bool,
    pub allow_multiple_positions_per_symbol: bool,
    pub maximum_share_quantity_per_single_trade: f64,
    pub maximum_dollar_value_per_single_trade: f64,
    pub minimum_acceptable_price_for_signals: f64,
    pub maximum_acceptable_price_for_signals: f64,
    pub maximum_reasonable_position_quantity: f64,
    pub profit_taking_threshold_dollars: f64,
    pub use_current_market_price_for_order_execution: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub signal_buy_string: String,
    pub signal_sell_string: String,
    pub require_momentum_confirmation: bool,
    pub momentum_min_change_pct: f64,
    pub strength_weight_price: f64,
    pub strength_weight_atr: f64,
    pub strength_weight_volume: f64,
}

// ---------------------------------------------------------------------------
// Timing configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    pub minimum_interval_between_orders_seconds: u64,
    pub enable_wash_trade_prevention_mechanism: bool,
    pub market_data_staleness_threshold_seconds: u64,
    pub crypto_data_staleness_threshold_seconds: u64,
    pub order_cancellation_processing_delay_milliseconds: u64,
    pub position_verification_timeout_milliseconds: u64,
    pub maximum_position_verification_attempts: u32,
    pub market_close_grace_period_minutes: u64,
    pub emergency_trading_halt_duration_minutes: u64,
    pub countdown_display_refresh_interval_seconds: u64,
    pub thread_market_data_poll_interval_sec: u64,
    pub thread_account_poll_interval_sec: u64,
    pub thread_trader_poll_interval_sec: u64,
    pub bar_fetch_buffer: usize,
    pub account_cache_seconds: u64,
    pub websocket_reconnect_delay_ms: u64,
    pub websocket_error_retry_delay_ms: u64,
}

// ---------------------------------------------------------------------------
// Connectivity configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectivityConfig {
    pub max_retry_delay_seconds: u64,
    pub degraded_threshold: u32,
    pub disconnected_threshold: u32,
    pub backoff_multiplier: f64,
}

// ---------------------------------------------------------------------------
// WebSocket bar accumulator configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsAccumulatorConfig {
    pub websocket_bar_accumulation_seconds: u32,
    pub websocket_second_level_accumulation_seconds: u32,
    pub websocket_max_bar_history_size: usize,
}

// ---------------------------------------------------------------------------
// Logging configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_file: String,
    pub console_logging: bool,
    /// Append-only CSV trade history; empty string disables it.
    pub trade_history_csv: String,
}

// ---------------------------------------------------------------------------
// Target instrument
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Single configured instrument, e.g. "AAPL" or "BTC/USD".
    pub symbol: String,
}

// ---------------------------------------------------------------------------
// Root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub target: TargetConfig,
    pub providers: ProvidersConfig,
    pub strategy: StrategyConfig,
    pub timing: TimingConfig,
    pub connectivity: ConnectivityConfig,
    pub ws_accumulator: WsAccumulatorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load, fill credentials from the environment, and validate.
    pub fn load(path: &str) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::BadConfig(format!("cannot read {path}: {e}")))?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| EngineError::BadConfig(format!("cannot parse {path}: {e}")))?;

        config.fill_credentials_from_env();
        config.validate()?;

        info!(
            symbol = %config.target.symbol,
            log_file = %config.logging.log_file,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Empty credential fields fall back to the conventional environment
    /// variables. The trading and stock-data providers share broker keys.
    fn fill_credentials_from_env(&mut self) {
        let fill = |field: &mut String, var: &str| {
            if field.is_empty() {
                if let Ok(v) = std::env::var(var) {
                    *field = v;
                }
            }
        };
        fill(&mut self.providers.trading.api_key, "APCA_API_KEY_ID");
        fill(&mut self.providers.trading.api_secret, "APCA_API_SECRET_KEY");
        fill(&mut self.providers.stock_data.api_key, "APCA_API_KEY_ID");
        fill(&mut self.providers.stock_data.api_secret, "APCA_API_SECRET_KEY");
        fill(&mut self.providers.crypto_data.api_key, "POLYGON_API_KEY");
        fill(&mut self.providers.crypto_data.api_secret, "POLYGON_API_SECRET");
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.target.symbol.trim().is_empty() {
            return Err(EngineError::BadConfig("target.symbol is empty".into()));
        }

        for (name, p) in [
            ("trading", &self.providers.trading),
            ("stock_data", &self.providers.stock_data),
            ("crypto_data", &self.providers.crypto_data),
        ] {
            validate_provider(name, p)?;
        }

        let s = &self.strategy;
        if s.atr_period == 0 || s.atr_calculation_bars == 0 {
            return Err(EngineError::BadConfig("atr periods must be positive".into()));
        }
        if s.average_atr_comparison_multiplier == 0 {
            return Err(EngineError::BadConfig(
                "average_atr_comparison_multiplier must be positive".into(),
            ));
        }
        for (name, v) in [
            ("entry_signal_atr_multiplier", s.entry_signal_atr_multiplier),
            ("volume_multiplier", s.volume_multiplier),
            ("doji_ratio", s.doji_ratio),
            ("rr_ratio", s.rr_ratio),
            ("atr_stop_multiplier", s.atr_stop_multiplier),
            ("min_stop_distance", s.min_stop_distance),
            ("max_stop_distance", s.max_stop_distance),
            ("maximum_share_quantity_per_single_trade", s.maximum_share_quantity_per_single_trade),
            ("maximum_dollar_value_per_single_trade", s.maximum_dollar_value_per_single_trade),
            ("maximum_reasonable_position_quantity", s.maximum_reasonable_position_quantity),
        ] {
            if !(v > 0.0) {
                return Err(EngineError::BadConfig(format!("{name} must be positive")));
            }
        }
        if s.min_stop_distance > s.max_stop_distance {
            return Err(EngineError::BadConfig(
                "min_stop_distance exceeds max_stop_distance".into(),
            ));
        }
        if !(s.risk_per_trade > 0.0 && s.risk_per_trade <= 1.0) {
            return Err(EngineError::BadConfig("risk_per_trade must be in (0, 1]".into()));
        }
        if !(s.short_safety_margin > 0.0 && s.short_safety_margin <= 1.0) {
            return Err(EngineError::BadConfig(
                "short_safety_margin must be in (0, 1]".into(),
            ));
        }
        if !(s.buying_power_validation_safety_margin > 0.0) {
            return Err(EngineError::BadConfig(
                "buying_power_validation_safety_margin must be positive".into(),
            ));
        }
        if s.max_daily_loss >= 0.0 {
            return Err(EngineError::BadConfig(
                "max_daily_loss must be negative (a loss fraction)".into(),
            ));
        }
        if s.daily_profit_target <= 0.0 {
            return Err(EngineError::BadConfig(
                "daily_profit_target must be positive".into(),
            ));
        }
        if s.minimum_acceptable_price_for_signals >= s.maximum_acceptable_price_for_signals {
            return Err(EngineError::BadConfig(
                "acceptable price range is empty".into(),
            ));
        }
        if s.signal_buy_string.is_empty() || s.signal_sell_string.is_empty() {
            return Err(EngineError::BadConfig("signal strings must be non-empty".into()));
        }
        if s.max_retries == 0 {
            return Err(EngineError::BadConfig("max_retries must be positive".into()));
        }
        let weight_sum =
            s.strength_weight_price + s.strength_weight_atr + s.strength_weight_volume;
        if (weight_sum - 1.0).abs() > 1e-6 {
            return Err(EngineError::BadConfig(format!(
                "signal strength weights must sum to 1 (got {weight_sum})"
            )));
        }

        let t = &self.timing;
        for (name, v) in [
            ("minimum_interval_between_orders_seconds", t.minimum_interval_between_orders_seconds),
            ("market_data_staleness_threshold_seconds", t.market_data_staleness_threshold_seconds),
            ("crypto_data_staleness_threshold_seconds", t.crypto_data_staleness_threshold_seconds),
            ("position_verification_timeout_milliseconds", t.position_verification_timeout_milliseconds),
            ("countdown_display_refresh_interval_seconds", t.countdown_display_refresh_interval_seconds),
            ("thread_market_data_poll_interval_sec", t.thread_market_data_poll_interval_sec),
            ("thread_account_poll_interval_sec", t.thread_account_poll_interval_sec),
            ("thread_trader_poll_interval_sec", t.thread_trader_poll_interval_sec),
            ("emergency_trading_halt_duration_minutes", t.emergency_trading_halt_duration_minutes),
        ] {
            if v == 0 {
                return Err(EngineError::BadConfig(format!("{name} must be positive")));
            }
        }
        if t.maximum_position_verification_attempts == 0 {
            return Err(EngineError::BadConfig(
                "maximum_position_verification_attempts must be positive".into(),
            ));
        }

        let c = &self.connectivity;
        if c.max_retry_delay_seconds == 0 {
            return Err(EngineError::BadConfig(
                "max_retry_delay_seconds must be positive".into(),
            ));
        }
        if c.degraded_threshold == 0 || c.disconnected_threshold < c.degraded_threshold {
            return Err(EngineError::BadConfig(
                "connectivity thresholds must satisfy 0 < degraded <= disconnected".into(),
            ));
        }
        if !(c.backoff_multiplier > 1.0) {
            return Err(EngineError::BadConfig(
                "backoff_multiplier must be greater than 1".into(),
            ));
        }

        let w = &self.ws_accumulator;
        if w.websocket_bar_accumulation_seconds == 0
            || w.websocket_second_level_accumulation_seconds == 0
        {
            return Err(EngineError::BadConfig(
                "accumulation periods must be positive".into(),
            ));
        }
        if w.websocket_second_level_accumulation_seconds % w.websocket_bar_accumulation_seconds != 0
        {
            return Err(EngineError::BadConfig(
                "second-level accumulation period must be a multiple of the first".into(),
            ));
        }
        if w.websocket_max_bar_history_size == 0 {
            return Err(EngineError::BadConfig(
                "websocket_max_bar_history_size must be positive".into(),
            ));
        }

        if self.logging.log_file.trim().is_empty() {
            return Err(EngineError::BadConfig("logging.log_file is empty".into()));
        }

        Ok(())
    }
}

fn validate_provider(name: &str, p: &ProviderConfig) -> EngineResult<()> {
    if p.api_key.is_empty() || p.api_secret.is_empty() {
        return Err(EngineError::BadConfig(format!(
            "provider {name}: api credentials are empty (file and environment)"
        )));
    }
    if p.base_url.is_empty() {
        return Err(EngineError::BadConfig(format!("provider {name}: base_url is empty")));
    }
    if p.retry_count == 0 {
        return Err(EngineError::BadConfig(format!(
            "provider {name}: retry_count must be positive"
        )));
    }
    if p.timeout_seconds == 0 {
        return Err(EngineError::BadConfig(format!(
            "provider {name}: timeout_seconds must be positive"
        )));
    }
    if p.bar_multiplier == 0 || p.bar_timespan.is_empty() {
        return Err(EngineError::BadConfig(format!(
            "provider {name}: bar multiplier/timespan must be configured"
        )));
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_provider() -> ProviderConfig {
        ProviderConfig {
            api_key: "key".into(),
            api_secret: "secret".into(),
            base_url: "https://api.example.test".into(),
            websocket_url: "wss://stream.example.test/crypto".into(),
            retry_count: 3,
            timeout_seconds: 10,
            enable_ssl_verification: true,
            rate_limit_delay_ms: 250,
            bar_multiplier: 1,
            bar_timespan: "minute".into(),
            pre_open_fetch_buffer_minutes: 15,
            endpoints: EndpointsConfig {
                bars: "/v2/aggs/ticker/{symbol}/range/{multiplier}/{timespan}/{from}/{to}".into(),
                quotes_latest: "/v2/last/nbbo/{symbol}".into(),
                orders: "/v2/orders".into(),
                positions: "/v2/positions".into(),
                account: "/v2/account".into(),
                clock: "/v2/clock".into(),
                historical_bars: "/v2/aggs/ticker/{symbol}/range/{multiplier}/{timespan}/{from}/{to}".into(),
            },
        }
    }

    pub(crate) fn sample_config() -> Config {
        Config {
            target: TargetConfig { symbol: "BTC/USD".into() },
            providers: ProvidersConfig {
                trading: sample_provider(),
                stock_data: sample_provider(),
                crypto_data: sample_provider(),
            },
            strategy: StrategyConfig {
                atr_period: 14,
                atr_calculation_bars: 14,
                average_atr_comparison_multiplier: 2,
                minimum_volume_threshold: 1.0,
                entry_signal_atr_multiplier: 1.5,
                use_absolute_atr_threshold: false,
                atr_absolute_minimum_threshold: 0.05,
                volume_multiplier: 2.0,
                doji_ratio: 0.1,
                rr_ratio: 2.0,
                atr_stop_multiplier: 1.0,
                min_stop_distance: 0.01,
                max_stop_distance: 1_000.0,
                risk_per_trade: 0.01,
                max_exposure_pct: 50.0,
                max_daily_loss: -0.04,
                daily_profit_target: 0.05,
                buying_power_validation_safety_margin: 1.0,
                short_safety_margin: 0.9,
                close_positions_on_signal_reversal: true,
                allow_multiple_positions_per_symbol: false,
                maximum_share_quantity_per_single_trade: 10_000.0,
                maximum_dollar_value_per_single_trade: 100_000.0,
                minimum_acceptable_price_for_signals: 0.5,
                maximum_acceptable_price_for_signals: 500_000.0,
                maximum_reasonable_position_quantity: 100_000.0,
                profit_taking_threshold_dollars: 0.0,
                use_current_market_price_for_order_execution: false,
                max_retries: 3,
                retry_delay_ms: 500,
                signal_buy_string: "buy".into(),
                signal_sell_string: "sell".into(),
                require_momentum_confirmation: false,
                momentum_min_change_pct: 0.05,
                strength_weight_price: 0.4,
                strength_weight_atr: 0.3,
                strength_weight_volume: 0.3,
            },
            timing: TimingConfig {
                minimum_interval_between_orders_seconds: 60,
                enable_wash_trade_prevention_mechanism: true,
                market_data_staleness_threshold_seconds: 120,
                crypto_data_staleness_threshold_seconds: 30,
                order_cancellation_processing_delay_milliseconds: 500,
                position_verification_timeout_milliseconds: 1_000,
                maximum_position_verification_attempts: 3,
                market_close_grace_period_minutes: 5,
                emergency_trading_halt_duration_minutes: 5,
                countdown_display_refresh_interval_seconds: 1,
                thread_market_data_poll_interval_sec: 5,
                thread_account_poll_interval_sec: 10,
                thread_trader_poll_interval_sec: 30,
                bar_fetch_buffer: 10,
                account_cache_seconds: 5,
                websocket_reconnect_delay_ms: 200,
                websocket_error_retry_delay_ms: 5_000,
            },
            connectivity: ConnectivityConfig {
                max_retry_delay_seconds: 300,
                degraded_threshold: 3,
                disconnected_threshold: 10,
                backoff_multiplier: 2.0,
            },
            ws_accumulator: WsAccumulatorConfig {
                websocket_bar_accumulation_seconds: 10,
                websocket_second_level_accumulation_seconds: 60,
                websocket_max_bar_history_size: 500,
            },
            logging: LoggingConfig {
                log_file: "tradewind.log".into(),
                console_logging: true,
                trade_history_csv: String::new(),
            },
        }
    }

    #[test]
    fn sample_config_validates() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn json_round_trip_preserves_config() {
        let config = sample_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        back.validate().unwrap();
        assert_eq!(back.target.symbol, "BTC/USD");
        assert_eq!(back.strategy.atr_period, 14);
    }

    #[test]
    fn missing_key_is_rejected() {
        let config = sample_config();
        let mut json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        json["strategy"].as_object_mut().unwrap().remove("rr_ratio");
        let parsed: Result<Config, _> = serde_json::from_value(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn empty_credentials_rejected() {
        let mut config = sample_config();
        config.providers.trading.api_key.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn accumulator_periods_must_divide() {
        let mut config = sample_config();
        config.ws_accumulator.websocket_second_level_accumulation_seconds = 25;
        assert!(config.validate().is_err());
    }

    #[test]
    fn strength_weights_must_sum_to_one() {
        let mut config = sample_config();
        config.strategy.strength_weight_price = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_multiplier_must_exceed_one() {
        let mut config = sample_config();
        config.connectivity.backoff_multiplier = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn positive_max_daily_loss_rejected() {
        let mut config = sample_config();
        config.strategy.max_daily_loss = 0.04;
        assert!(config.validate().is_err());
    }
}
