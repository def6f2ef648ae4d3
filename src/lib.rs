#![deny(unreachable_pub)]
pub mod config;
pub mod grid;
pub mod runner;

pub use config::{ConfigError, Settings};
pub use grid::{GridConfig, GridEngine, GridError, GridExchange, GridResult};
pub use runner::BotRunner;
