//! Configuration management for the momentum scalper.
//!
//! Loads settings from an optional `config` file plus `TRADER__`-prefixed
//! environment variables. Every knob has a documented default.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Nominal capital used for sizing and limits
    #[serde(default = "default_capital")]
    pub capital: Decimal,
    /// If false, orders are logged and acknowledged without reaching the venue
    #[serde(default)]
    pub live_mode: bool,
    /// Venue credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Risk accounting limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Universe filtering and scoring thresholds
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// Sizing and order placement parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Exit loop parameters
    #[serde(default)]
    pub closer: CloserConfig,
    /// Session boost affinity tables
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Outbound request pacing
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Ledger storage location
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BinanceConfig {
    /// API key for authenticated endpoints
    #[serde(default)]
    pub api_key: String,
    /// Secret key for request signing
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum concurrently open positions
    #[serde(default = "default_max_open_trades")]
    pub max_open_trades: u32,
    /// Maximum projected loss per trade as a fraction of capital
    #[serde(default = "default_max_loss_per_trade")]
    pub max_loss_per_trade: Decimal,
    /// Maximum committed margin as a fraction of capital
    #[serde(default = "default_max_portfolio_risk")]
    pub max_portfolio_risk: Decimal,
    /// Daily realized loss that trips the circuit breaker
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScannerConfig {
    /// Minimum 24h quote volume for universe inclusion
    #[serde(default = "default_min_volume_24h")]
    pub min_volume_24h: Decimal,
    /// Minimum momentum score for candidate emission
    #[serde(default = "default_min_momentum_score")]
    pub min_momentum_score: u32,
    /// Survivors kept after the mobility pre-filter
    #[serde(default = "default_prefilter_top_k")]
    pub prefilter_top_k: usize,
    /// Minimum ATR(10) as percent of price on 1m candles
    #[serde(default = "default_min_atr_pct_1min")]
    pub min_atr_pct_1min: Decimal,
    /// Minimum recent/baseline volume ratio
    #[serde(default = "default_min_volume_ratio")]
    pub min_volume_ratio: Decimal,
    /// Minimum 5-minute absolute price change percent
    #[serde(default = "default_min_thrust_pct")]
    pub min_thrust_pct: Decimal,
    /// Accepted quote assets
    #[serde(default = "default_quote_allowlist")]
    pub quote_allowlist: Vec<String>,
    /// Symbols excluded regardless of metrics
    #[serde(default)]
    pub deny_list: Vec<String>,
    /// Budget for the universe + mobility phases; on overrun the tick emits
    /// no candidates rather than acting on partial data
    #[serde(default = "default_prefilter_deadline_secs")]
    pub prefilter_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Take-profit distance in ATR multiples
    #[serde(default = "default_tp_mult")]
    pub tp_mult: Decimal,
    /// Stop-loss distance in ATR multiples
    #[serde(default = "default_sl_mult")]
    pub sl_mult: Decimal,
    /// Maximum notional as a fraction of the symbol's 24h volume
    #[serde(default = "default_liquidity_cap")]
    pub liquidity_cap: Decimal,
    /// Deadline for order confirmation before flagging for reconciliation
    #[serde(default = "default_order_timeout_secs")]
    pub order_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloserConfig {
    /// Concurrent closer workers
    #[serde(default = "default_closer_workers")]
    pub workers: u32,
    /// Period of each worker's loop in seconds
    #[serde(default = "default_closer_interval_secs")]
    pub interval_secs: u64,
    /// Start offset between successive workers in seconds
    #[serde(default = "default_closer_stagger_secs")]
    pub stagger_secs: u64,
    /// Hard position lifetime in minutes
    #[serde(default = "default_max_hold_minutes")]
    pub max_hold_minutes: i64,
    /// Minutes after which a flat position is discarded
    #[serde(default = "default_fast_exit_minutes")]
    pub fast_exit_minutes: i64,
    /// Unrealized PnL fraction under which a position counts as flat
    #[serde(default = "default_fast_exit_threshold")]
    pub fast_exit_threshold: Decimal,
    /// Minutes before a news window during which positions are closed
    #[serde(default = "default_news_blackout_window_min")]
    pub news_blackout_window_min: i64,
    /// Scheduled news window start times (UTC)
    #[serde(default)]
    pub news_blackout_starts: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_asia_symbols")]
    pub asia: Vec<String>,
    #[serde(default = "default_europe_symbols")]
    pub europe: Vec<String>,
    #[serde(default = "default_us_symbols")]
    pub us: Vec<String>,
    #[serde(default = "default_asia_mult")]
    pub asia_mult: Decimal,
    #[serde(default = "default_europe_mult")]
    pub europe_mult: Decimal,
    #[serde(default = "default_us_mult")]
    pub us_mult: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Token bucket size, 90% of the venue's published request budget
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Maximum wait for a token before reporting the symbol unavailable
    #[serde(default = "default_token_wait_secs")]
    pub token_wait_secs: u64,
    /// Ticker cache freshness window in seconds
    #[serde(default = "default_ticker_ttl_secs")]
    pub ticker_ttl_secs: u64,
    /// Order book cache freshness window in seconds
    #[serde(default = "default_book_ttl_secs")]
    pub book_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions

fn default_capital() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_max_open_trades() -> u32 {
    3
}

fn default_max_loss_per_trade() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_portfolio_risk() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_daily_loss_limit() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_min_volume_24h() -> Decimal {
    Decimal::new(5_000_000, 0)
}

fn default_min_momentum_score() -> u32 {
    60
}

fn default_prefilter_top_k() -> usize {
    50
}

fn default_min_atr_pct_1min() -> Decimal {
    Decimal::new(25, 2) // 0.25%
}

fn default_min_volume_ratio() -> Decimal {
    Decimal::new(13, 1) // 1.3
}

fn default_min_thrust_pct() -> Decimal {
    Decimal::new(20, 2) // 0.20%
}

fn default_quote_allowlist() -> Vec<String> {
    vec!["USDT".to_string()]
}

fn default_prefilter_deadline_secs() -> u64 {
    20
}

fn default_tp_mult() -> Decimal {
    Decimal::new(2, 0)
}

fn default_sl_mult() -> Decimal {
    Decimal::ONE
}

fn default_liquidity_cap() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_order_timeout_secs() -> u64 {
    10
}

fn default_closer_workers() -> u32 {
    3
}

fn default_closer_interval_secs() -> u64 {
    30
}

fn default_closer_stagger_secs() -> u64 {
    10
}

fn default_max_hold_minutes() -> i64 {
    10
}

fn default_fast_exit_minutes() -> i64 {
    3
}

fn default_fast_exit_threshold() -> Decimal {
    Decimal::new(3, 3) // 0.003 = 0.3%
}

fn default_news_blackout_window_min() -> i64 {
    10
}

fn default_asia_symbols() -> Vec<String> {
    ["BNB", "TRX", "ADA", "DOT", "ATOM", "FIL", "NEAR", "VET", "IOTA"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_europe_symbols() -> Vec<String> {
    ["BTC", "ETH", "LTC", "XRP", "LINK", "UNI", "AAVE", "MKR"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_us_symbols() -> Vec<String> {
    ["SOL", "AVAX", "DOGE", "ARB", "OP", "INJ", "TIA", "SEI", "SUI"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_asia_mult() -> Decimal {
    Decimal::new(2, 0)
}

fn default_europe_mult() -> Decimal {
    Decimal::new(18, 1) // 1.8
}

fn default_us_mult() -> Decimal {
    Decimal::new(2, 0)
}

fn default_requests_per_minute() -> u32 {
    1080 // 90% of the venue's 1200/min budget
}

fn default_token_wait_secs() -> u64 {
    2
}

fn default_ticker_ttl_secs() -> u64 {
    30
}

fn default_book_ttl_secs() -> u64 {
    5
}

fn default_db_path() -> String {
    "trader.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("TRADER"),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.capital > Decimal::ZERO, "capital must be positive");

        anyhow::ensure!(
            self.risk.max_open_trades >= 1,
            "max_open_trades must be at least 1"
        );

        anyhow::ensure!(
            self.risk.max_portfolio_risk > Decimal::ZERO
                && self.risk.max_portfolio_risk <= Decimal::ONE,
            "max_portfolio_risk must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.daily_loss_limit > Decimal::ZERO
                && self.risk.daily_loss_limit <= Decimal::ONE,
            "daily_loss_limit must be between 0 and 1"
        );

        anyhow::ensure!(
            self.execution.sl_mult > Decimal::ZERO,
            "sl_mult must be positive"
        );

        anyhow::ensure!(self.closer.workers >= 1, "closer needs at least one worker");

        if self.live_mode {
            anyhow::ensure!(
                !self.binance.api_key.is_empty() && !self.binance.secret_key.is_empty(),
                "live_mode requires venue credentials"
            );
        }

        Ok(())
    }

    /// Per-trade capital fraction, 1 / max_open_trades.
    pub fn per_trade_fraction(&self) -> Decimal {
        Decimal::ONE / Decimal::from(self.risk.max_open_trades)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capital: default_capital(),
            live_mode: false,
            binance: BinanceConfig::default(),
            risk: RiskConfig::default(),
            scanner: ScannerConfig::default(),
            execution: ExecutionConfig::default(),
            closer: CloserConfig::default(),
            sessions: SessionConfig::default(),
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_trades: default_max_open_trades(),
            max_loss_per_trade: default_max_loss_per_trade(),
            max_portfolio_risk: default_max_portfolio_risk(),
            daily_loss_limit: default_daily_loss_limit(),
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            min_volume_24h: default_min_volume_24h(),
            min_momentum_score: default_min_momentum_score(),
            prefilter_top_k: default_prefilter_top_k(),
            min_atr_pct_1min: default_min_atr_pct_1min(),
            min_volume_ratio: default_min_volume_ratio(),
            min_thrust_pct: default_min_thrust_pct(),
            quote_allowlist: default_quote_allowlist(),
            deny_list: Vec::new(),
            prefilter_deadline_secs: default_prefilter_deadline_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            tp_mult: default_tp_mult(),
            sl_mult: default_sl_mult(),
            liquidity_cap: default_liquidity_cap(),
            order_timeout_secs: default_order_timeout_secs(),
        }
    }
}

impl Default for CloserConfig {
    fn default() -> Self {
        Self {
            workers: default_closer_workers(),
            interval_secs: default_closer_interval_secs(),
            stagger_secs: default_closer_stagger_secs(),
            max_hold_minutes: default_max_hold_minutes(),
            fast_exit_minutes: default_fast_exit_minutes(),
            fast_exit_threshold: default_fast_exit_threshold(),
            news_blackout_window_min: default_news_blackout_window_min(),
            news_blackout_starts: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            asia: default_asia_symbols(),
            europe: default_europe_symbols(),
            us: default_us_symbols(),
            asia_mult: default_asia_mult(),
            europe_mult: default_europe_mult(),
            us_mult: default_us_mult(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            token_wait_secs: default_token_wait_secs(),
            ticker_ttl_secs: default_ticker_ttl_secs(),
            book_ttl_secs: default_book_ttl_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.capital, dec!(10000));
        assert_eq!(config.risk.max_open_trades, 3);
        assert_eq!(config.scanner.min_volume_24h, dec!(5000000));
        assert_eq!(config.scanner.min_momentum_score, 60);
        assert_eq!(config.execution.tp_mult, dec!(2));
        assert_eq!(config.execution.sl_mult, dec!(1));
        assert_eq!(config.closer.max_hold_minutes, 10);
        assert_eq!(config.closer.fast_exit_minutes, 3);
        assert_eq!(config.risk.max_loss_per_trade, dec!(0.02));
        assert_eq!(config.risk.max_portfolio_risk, dec!(0.20));
        assert_eq!(config.risk.daily_loss_limit, dec!(0.05));
        assert!(!config.live_mode);
        assert_eq!(config.closer.news_blackout_window_min, 10);
    }

    #[test]
    fn test_per_trade_fraction() {
        let config = Config::default();
        assert_eq!(config.per_trade_fraction(), Decimal::ONE / dec!(3));
    }

    #[test]
    fn test_live_mode_requires_credentials() {
        let mut config = Config::default();
        config.live_mode = true;
        assert!(config.validate().is_err());

        config.binance.api_key = "key".to_string();
        config.binance.secret_key = "secret".to_string();
        assert!(config.validate().is_ok());
    }
}
