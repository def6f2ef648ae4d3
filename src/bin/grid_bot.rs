//! Grid Trading Bot Binary
//!
//! Runs the grid engine in paper mode: orders are matched in-process against a
//! synthetic oscillating price, nothing is sent to a real exchange.
//!
//! ## Usage
//!
//! ```bash
//! # Built-in example settings (60 second run)
//! cargo run --bin grid_bot
//!
//! # Settings file, with APP_* environment overrides
//! cargo run --bin grid_bot -- --config grid.json
//! APP_GRID__GRID_NUM=15 cargo run --bin grid_bot -- --config grid.json
//! ```
//!
//! Press Ctrl-C to stop; open orders are cancelled before exit.

use std::env;

use log::{error, info};

use grid_engine::{BotRunner, Settings};

#[tokio::main]
async fn main() {
    // Load .env file
    let dotenv = dotenvy::dotenv();

    // Parse arguments
    let args: Vec<String> = env::args().collect();
    let settings = if args.len() > 2 && args[1] == "--config" {
        match Settings::new(&args[2]) {
            Ok(settings) => Ok(settings),
            Err(e) => Err(format!("Failed to load config {}: {}", args[2], e)),
        }
    } else {
        Ok(Settings::example())
    };

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let runner = BotRunner::from_settings(settings);
    runner.init_logging();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }
    if args.len() <= 2 {
        info!("No config file provided, using example configuration");
    }

    if let Err(e) = runner.run_paper().await {
        error!("Grid bot stopped with error: {}", e);
        std::process::exit(1);
    }
}
