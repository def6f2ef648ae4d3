//! Grid engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::{GridError, GridResult};

/// Grid spacing type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpacingMode {
    /// Uniform price spacing (e.g., $100, $110, $120)
    #[default]
    Arithmetic,
    /// Percentage-based spacing (e.g., +10%, +10%, +10%)
    Geometric,
}

/// Price feed tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Samples older than this are stale and trigger a synchronous poll
    #[serde(default = "default_stale_after_ms")]
    pub stale_after_ms: u64,

    /// First reconnect delay
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,

    /// Reconnect delay cap
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Consecutive stream failures before degrading to polling
    #[serde(default = "default_max_stream_failures")]
    pub max_stream_failures: u32,

    /// Poll period while degraded
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// A subscribed stream silent for this long counts as a failure
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
}

fn default_stale_after_ms() -> u64 {
    10_000
}

fn default_reconnect_base_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_max_stream_failures() -> u32 {
    5
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_stream_idle_timeout_ms() -> u64 {
    30_000
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: default_stale_after_ms(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            max_stream_failures: default_max_stream_failures(),
            poll_interval_ms: default_poll_interval_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
        }
    }
}

impl FeedConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

/// Drawdown and volatility limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Maximum fractional decline from peak equity (0.05 = 5%)
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    /// Fraction of `max_drawdown` at which a warning is logged
    #[serde(default = "default_drawdown_warning_ratio")]
    pub drawdown_warning_ratio: f64,

    /// Pause on high volatility
    #[serde(default = "default_volatility_pause")]
    pub volatility_pause: bool,

    /// Bars averaged into the ATR
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// ATR limit, expressed as a percentage of the latest close
    #[serde(default = "default_atr_threshold")]
    pub atr_threshold: f64,

    /// Starting equity in quote currency, the base of the drawdown calculation
    #[serde(default = "default_initial_equity")]
    pub initial_equity: f64,
}

fn default_max_drawdown() -> f64 {
    0.05
}

fn default_drawdown_warning_ratio() -> f64 {
    0.8
}

fn default_volatility_pause() -> bool {
    true
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_threshold() -> f64 {
    2.0
}

fn default_initial_equity() -> f64 {
    10_000.0
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_drawdown: default_max_drawdown(),
            drawdown_warning_ratio: default_drawdown_warning_ratio(),
            volatility_pause: default_volatility_pause(),
            atr_period: default_atr_period(),
            atr_threshold: default_atr_threshold(),
            initial_equity: default_initial_equity(),
        }
    }
}

/// Bounded retry for exchange calls and placement backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per exchange call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,

    /// First delay before a failed level placement is retried
    #[serde(default = "default_placement_backoff_ms")]
    pub placement_backoff_ms: u64,

    /// Cap on the placement retry delay
    #[serde(default = "default_placement_backoff_max_ms")]
    pub placement_backoff_max_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    100
}

fn default_placement_backoff_ms() -> u64 {
    1_000
}

fn default_placement_backoff_max_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_retry_base_delay(),
            placement_backoff_ms: default_placement_backoff_ms(),
            placement_backoff_max_ms: default_placement_backoff_max_ms(),
        }
    }
}

impl RetryConfig {
    /// Delay before the next placement attempt after `attempts` failures
    pub fn placement_delay(&self, attempts: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempts.saturating_sub(1));
        let delay = self.placement_backoff_ms.saturating_mul(exp);
        Duration::from_millis(delay.min(self.placement_backoff_max_ms))
    }
}

/// Grid engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Trading pair (e.g., "BTC/USDT")
    pub symbol: String,

    /// Lower price boundary for the grid. Ignored with `auto_price`.
    #[serde(default)]
    pub lower_price: f64,

    /// Upper price boundary for the grid. Ignored with `auto_price`.
    #[serde(default)]
    pub upper_price: f64,

    /// Number of price levels, both boundaries included
    pub grid_num: usize,

    /// Grid spacing type (Arithmetic or Geometric)
    #[serde(default)]
    pub spacing: SpacingMode,

    /// Derive bounds from the current price as `price * (1 ± price_range)`
    #[serde(default)]
    pub auto_price: bool,

    /// Half-width of the auto range as a fraction of price
    #[serde(default = "default_price_range")]
    pub price_range: f64,

    /// Base quantity per order
    #[serde(default)]
    pub quantity: f64,

    /// Quote amount per level. Overrides `quantity` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_per_level: Option<f64>,

    /// Decimal places for level prices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_decimals: Option<u32>,

    /// Decimal places for order quantities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity_decimals: Option<u32>,

    /// Relative tolerance when matching exchange orders to levels
    #[serde(default = "default_price_tolerance")]
    pub price_tolerance: f64,

    /// Evaluation cycle period (milliseconds)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Run time limit in seconds, 0 = unlimited
    #[serde(default)]
    pub duration_secs: u64,

    /// Failing cycles in a row before the engine halts
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_price_range() -> f64 {
    0.05
}

fn default_price_tolerance() -> f64 {
    0.001
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_max_consecutive_errors() -> u32 {
    5
}

impl GridConfig {
    /// Create a new grid configuration with required parameters
    pub fn new(
        symbol: impl Into<String>,
        lower_price: f64,
        upper_price: f64,
        grid_num: usize,
        quantity: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            lower_price,
            upper_price,
            grid_num,
            spacing: SpacingMode::default(),
            auto_price: false,
            price_range: default_price_range(),
            quantity,
            quote_per_level: None,
            price_decimals: None,
            quantity_decimals: None,
            price_tolerance: default_price_tolerance(),
            interval_ms: default_interval_ms(),
            duration_secs: 0,
            max_consecutive_errors: default_max_consecutive_errors(),
            feed: FeedConfig::default(),
            risk: RiskConfig::default(),
            retry: RetryConfig::default(),
        }
    }

    /// Builder: set grid spacing type
    pub fn with_spacing(mut self, spacing: SpacingMode) -> Self {
        self.spacing = spacing;
        self
    }

    /// Builder: derive bounds from the reference price
    pub fn with_auto_price(mut self, price_range: f64) -> Self {
        self.auto_price = true;
        self.price_range = price_range;
        self
    }

    /// Builder: size orders by quote amount
    pub fn with_quote_per_level(mut self, quote: f64) -> Self {
        self.quote_per_level = Some(quote);
        self
    }

    /// Builder: set price and quantity rounding
    pub fn with_precision(mut self, price_decimals: u32, quantity_decimals: u32) -> Self {
        self.price_decimals = Some(price_decimals);
        self.quantity_decimals = Some(quantity_decimals);
        self
    }

    /// Builder: set cycle period
    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    /// Builder: set run time limit
    pub fn with_duration_secs(mut self, secs: u64) -> Self {
        self.duration_secs = secs;
        self
    }

    /// Builder: set feed parameters
    pub fn with_feed(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }

    /// Builder: set risk limits
    pub fn with_risk(mut self, risk: RiskConfig) -> Self {
        self.risk = risk;
        self
    }

    /// Builder: set retry parameters
    pub fn with_retry_config(mut self, max_attempts: u32, base_delay_ms: u64) -> Self {
        self.retry.max_attempts = max_attempts;
        self.retry.base_delay_ms = base_delay_ms;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> GridResult<()> {
        if self.symbol.is_empty() {
            return Err(GridError::InvalidConfig("symbol cannot be empty".into()));
        }

        if self.grid_num < 2 {
            return Err(GridError::InvalidConfig("grid_num must be at least 2".into()));
        }

        if self.auto_price {
            if !(self.price_range > 0.0 && self.price_range < 1.0) {
                return Err(GridError::InvalidConfig(
                    "price_range must be between 0 and 1 (exclusive)".into(),
                ));
            }
        } else if !(self.lower_price < self.upper_price) {
            return Err(GridError::InvalidConfig(
                "lower_price must be less than upper_price".into(),
            ));
        }

        match self.quote_per_level {
            Some(quote) if !(quote.is_finite() && quote > 0.0) => {
                return Err(GridError::InvalidConfig("quote_per_level must be positive".into()));
            }
            None if !(self.quantity.is_finite() && self.quantity > 0.0) => {
                return Err(GridError::InvalidConfig("quantity must be positive".into()));
            }
            _ => {}
        }

        // With quote sizing the top of the ladder gets the smallest order;
        // auto-price bounds are only known at startup
        if self.quote_per_level.is_none() || !self.auto_price {
            self.check_order_quantity(self.upper_price)?;
        }

        if self.price_tolerance < 0.0 {
            return Err(GridError::InvalidConfig("price_tolerance cannot be negative".into()));
        }

        if self.interval_ms == 0 {
            return Err(GridError::InvalidConfig("interval_ms must be positive".into()));
        }

        if self.max_consecutive_errors == 0 {
            return Err(GridError::InvalidConfig("max_consecutive_errors must be at least 1".into()));
        }

        if !(self.risk.max_drawdown > 0.0 && self.risk.max_drawdown < 1.0) {
            return Err(GridError::InvalidConfig(
                "max_drawdown must be between 0 and 1 (exclusive)".into(),
            ));
        }

        if self.risk.atr_period == 0 {
            return Err(GridError::InvalidConfig("atr_period must be at least 1".into()));
        }

        if self.retry.max_attempts == 0 {
            return Err(GridError::InvalidConfig("max_attempts must be at least 1".into()));
        }

        Ok(())
    }

    /// Order quantity for a level at `price`
    pub fn order_quantity(&self, price: f64) -> f64 {
        let raw = match self.quote_per_level {
            Some(quote) if price > 0.0 => quote / price,
            _ => self.quantity,
        };
        match self.quantity_decimals {
            Some(decimals) => truncate_decimals(raw, decimals),
            None => raw,
        }
    }

    /// Order quantity at `price`, rejecting sizes that round down to nothing
    pub fn check_order_quantity(&self, price: f64) -> GridResult<f64> {
        let quantity = self.order_quantity(price);
        if quantity.is_finite() && quantity > 0.0 {
            Ok(quantity)
        } else {
            Err(GridError::InvalidConfig(format!(
                "order size at price {} is {} after rounding to {:?} decimals",
                price, quantity, self.quantity_decimals
            )))
        }
    }

    /// Round a level price to the configured precision
    pub fn round_price(&self, price: f64) -> f64 {
        match self.price_decimals {
            Some(decimals) => {
                let factor = 10f64.powi(decimals as i32);
                (price * factor).round() / factor
            }
            None => price,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Run time limit, `None` when unlimited
    pub fn duration(&self) -> Option<Duration> {
        (self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }

    /// Load config from JSON file
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> GridResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }
}

/// Round down so order sizes never exceed the requested amount
fn truncate_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor + 1e-9).floor() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.01);
        assert!(config.validate().is_ok());

        // Invalid: lower >= upper
        let config = GridConfig::new("BTC/USDT", 150.0, 100.0, 10, 0.01);
        assert!(config.validate().is_err());

        // Invalid: grid_num < 2
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 1, 0.01);
        assert!(config.validate().is_err());

        // Invalid: quantity <= 0
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.0);
        assert!(config.validate().is_err());

        // Quote sizing replaces quantity
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.0).with_quote_per_level(50.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_unusable_sizes_and_error_budget() {
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, f64::NAN);
        assert!(matches!(config.validate(), Err(GridError::InvalidConfig(_))));

        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.0).with_quote_per_level(f64::INFINITY);
        assert!(config.validate().is_err());

        // 0.004 truncated to 2 decimals is zero
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.004).with_precision(2, 2);
        assert!(matches!(config.validate(), Err(GridError::InvalidConfig(_))));

        // $1 per level at $150 is 0.0066.., zero at 2 decimals
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.0)
            .with_quote_per_level(1.0)
            .with_precision(2, 2);
        assert!(config.validate().is_err());
        assert!(config.check_order_quantity(150.0).is_err());

        let config = GridConfig {
            max_consecutive_errors: 0,
            ..GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.01)
        };
        assert!(matches!(config.validate(), Err(GridError::InvalidConfig(_))));
    }

    #[test]
    fn test_auto_price_ignores_bounds() {
        let config = GridConfig::new("BTC/USDT", 0.0, 0.0, 10, 0.01).with_auto_price(0.05);
        assert!(config.validate().is_ok());

        let config = GridConfig::new("BTC/USDT", 0.0, 0.0, 10, 0.01).with_auto_price(1.5);
        assert!(matches!(config.validate(), Err(GridError::InvalidConfig(_))));
    }

    #[test]
    fn test_order_quantity() {
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.5);
        assert!((config.order_quantity(120.0) - 0.5).abs() < 1e-12);

        // $100 per level at $40 => 2.5 units
        let config = GridConfig::new("BTC/USDT", 40.0, 60.0, 10, 0.0)
            .with_quote_per_level(100.0)
            .with_precision(2, 3);
        assert!((config.order_quantity(40.0) - 2.5).abs() < 1e-9);
        // 100 / 60 = 1.6666.. truncated to 1.666
        assert!((config.order_quantity(60.0) - 1.666).abs() < 1e-9);
    }

    #[test]
    fn test_price_rounding() {
        let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.5).with_precision(2, 4);
        assert!((config.round_price(105.555_555) - 105.56).abs() < 1e-9);

        let unrounded = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 0.5);
        assert_eq!(unrounded.round_price(105.555_555), 105.555_555);
    }

    #[test]
    fn test_placement_delay_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.placement_delay(1), Duration::from_millis(1_000));
        assert_eq!(retry.placement_delay(2), Duration::from_millis(2_000));
        assert_eq!(retry.placement_delay(30), Duration::from_millis(60_000));
    }

    #[test]
    fn test_serde_defaults() {
        let json = r#"{ "symbol": "ETH/USDT", "lower_price": 1800.0, "upper_price": 2200.0, "grid_num": 5, "quantity": 0.1 }"#;
        let config: GridConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.spacing, SpacingMode::Arithmetic);
        assert_eq!(config.risk.atr_period, 14);
        assert!((config.risk.max_drawdown - 0.05).abs() < 1e-12);
        assert!(config.risk.volatility_pause);
        assert_eq!(config.feed.max_stream_failures, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.duration().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("grid_config_{}.json", uuid::Uuid::new_v4()));
        let config = GridConfig::new("SOL/USDT", 20.0, 30.0, 6, 1.0).with_spacing(SpacingMode::Geometric);
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = GridConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.symbol, "SOL/USDT");
        assert_eq!(loaded.spacing, SpacingMode::Geometric);
        std::fs::remove_file(&path).ok();
    }
}
