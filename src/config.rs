use config::{Config, Environment, File};
pub use config::ConfigError;
use serde::Deserialize;

use crate::grid::{GridConfig, GridResult, PaperConfig};

/// Main configuration struct
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Grid parameters (symbol, range, levels, risk, feed)
    pub grid: GridConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Paper exchange and synthetic price path
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load settings from a configuration file
    pub fn new(config_path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // Environment variables override the file
            // e.g. APP_GRID__UPPER_PRICE=110
            .add_source(Environment::with_prefix("APP").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    /// Demo settings used when no file is given: a grid around the paper price path
    pub fn example() -> Self {
        let paper = PaperConfig::default();
        let lower = paper.start_price * (1.0 - paper.amplitude);
        let upper = paper.start_price * (1.0 + paper.amplitude);

        Self {
            grid: GridConfig::new("BTC/USDT", lower, upper, 9, 0.1)
                .with_precision(2, 4)
                .with_interval_ms(1_000)
                .with_duration_secs(60),
            log: LogConfig::default(),
            paper,
        }
    }

    pub fn validate(&self) -> GridResult<()> {
        self.grid.validate()
    }
}
