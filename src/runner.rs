use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::time::interval;

use crate::config::Settings;
use crate::grid::{
    EngineStats, GridEngine, GridExchange, GridResult, LoggingListener, OscillatingPrice, PaperExchange,
    ShutdownHandle,
};

/// Runner for the grid engine
pub struct BotRunner {
    config: Settings,
}

impl BotRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> GridResult<Self> {
        let config = Settings::new(&config_path.as_ref().to_string_lossy())?;
        Ok(Self::from_settings(config))
    }

    pub fn from_settings(config: Settings) -> Self {
        Self { config }
    }

    pub fn settings(&self) -> &Settings {
        &self.config
    }

    /// Initialise env_logger at the configured level unless RUST_LOG is set
    pub fn init_logging(&self) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&self.config.log.level))
            .try_init()
            .ok();
    }

    /// Run the engine against `exchange` until ctrl-c, the duration limit, or a fatal error
    pub async fn run_with<E: GridExchange + 'static>(&self, exchange: Arc<E>) -> GridResult<EngineStats> {
        self.config.validate()?;
        let grid = &self.config.grid;
        info!("Starting BotRunner for {}", grid.symbol);
        info!(
            "Grid range: {} - {}, {} levels, {:?} spacing",
            grid.lower_price, grid.upper_price, grid.grid_num, grid.spacing
        );

        let mut engine = GridEngine::new(exchange, grid.clone())?.with_listener(LoggingListener);
        let ctrl_c = spawn_ctrl_c_handler(engine.shutdown_handle());

        let result = engine.run().await;
        ctrl_c.abort();

        match &result {
            Ok(stats) => info!(
                "Run finished: {} cycles, {} fills, realized pnl {:.4}, final equity {:.2}",
                stats.cycles,
                stats.profit.total_fills(),
                stats.profit.realized_pnl,
                stats.final_equity
            ),
            Err(e) => error!("Run failed: {}", e),
        }
        if let Some(stats) = result.as_ref().ok().filter(|s| !s.residual_orders.is_empty()) {
            warn!("Orders left open on the exchange: {:?}", stats.residual_orders);
        }
        result
    }

    /// Run against the in-process paper exchange driven by a synthetic price path
    pub async fn run_paper(&self) -> GridResult<EngineStats> {
        let paper = &self.config.paper;
        let exchange = Arc::new(PaperExchange::from_config(paper));
        let mut path = OscillatingPrice::from_config(paper);

        // The engine needs a price before it can lay out the grid
        exchange.set_price(path.next_price()).await;
        info!("Paper mode: price path around {} (+/-{:.1}%)", paper.start_price, paper.amplitude * 100.0);

        let driver = {
            let exchange = Arc::clone(&exchange);
            let tick = Duration::from_millis(paper.tick_ms.max(1));
            tokio::spawn(async move {
                let mut ticker = interval(tick);
                loop {
                    ticker.tick().await;
                    exchange.set_price(path.next_price()).await;
                }
            })
        };

        let result = self.run_with(Arc::clone(&exchange)).await;
        driver.abort();

        info!(
            "Paper account: balance {:.2}, value {:.2}, fees {:.4}, {} fills",
            exchange.balance().await,
            exchange.account_value().await,
            exchange.total_fees().await,
            exchange.fills().await.len()
        );
        result
    }
}

fn spawn_ctrl_c_handler(shutdown: ShutdownHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                shutdown.trigger();
            }
            Err(e) => warn!("Failed to listen for ctrl-c: {}", e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::grid::{GridConfig, PaperConfig};

    #[tokio::test]
    async fn test_paper_run_completes_and_cleans_up() {
        let paper = PaperConfig {
            start_price: 100.0,
            amplitude: 0.03,
            period_ticks: 8,
            tick_ms: 5,
            ..PaperConfig::default()
        };
        let settings = Settings {
            grid: GridConfig::new("BTC/USDT", 98.0, 102.0, 5, 1.0)
                .with_interval_ms(20)
                .with_duration_secs(1),
            log: LogConfig::default(),
            paper,
        };

        let stats = BotRunner::from_settings(settings).run_paper().await.unwrap();

        assert!(stats.cycles > 0);
        assert!(stats.profit.total_fills() > 0);
        assert!(stats.residual_orders.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_running() {
        let mut settings = Settings::example();
        settings.grid.grid_num = 1;

        let exchange = Arc::new(PaperExchange::new(1_000.0, 0.0));
        assert!(BotRunner::from_settings(settings).run_with(exchange).await.is_err());
    }
}
