//! Grid Trading Engine
//!
//! Places a ladder of limit orders across a price range and keeps it populated:
//! every fill is answered by an opposite order one level away, so the grid
//! harvests oscillation.
//!
//! # Architecture
//!
//! - [`config`] - Grid configuration and validation
//! - [`types`] - Core data types (GridLevel, ManagedOrder, RiskState, etc.)
//! - [`errors`] - Grid-specific error types
//! - [`calculator`] - Level computation (arithmetic or geometric spacing)
//! - [`feed`] - Streaming price feed with polling fallback
//! - [`risk`] - Drawdown and volatility gate
//! - [`state`] - Level to order mapping
//! - [`order_manager`] - Placement, reconciliation and rebalancing
//! - [`engine`] - Main control loop
//! - [`events`] - Engine notifications and listeners
//! - [`executor`] - Exchange abstraction (mockable for testing)
//! - [`paper`] - In-process simulated exchange
//! - [`shutdown`] - Cooperative shutdown flag
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use grid_engine::grid::{GridConfig, GridEngine, PaperExchange};
//!
//! // 10 levels between 100 and 150, one unit per order
//! let config = GridConfig::new("BTC/USDT", 100.0, 150.0, 10, 1.0);
//! let exchange = Arc::new(PaperExchange::new(100_000.0, 0.0001));
//!
//! let mut engine = GridEngine::new(exchange, config)?;
//! let stop = engine.shutdown_handle();
//!
//! // Runs until stop.trigger() is called
//! let stats = engine.run().await?;
//! ```
//!
//! # Testing
//!
//! The module provides a mock exchange with fill simulation and failure
//! injection:
//!
//! ```rust,ignore
//! use grid_engine::grid::executor::mock::MockExchange;
//!
//! let exchange = MockExchange::new(125.0);
//! exchange.fail_next_place(GridError::TransientExchange("timeout".into())).await;
//! ```

pub mod calculator;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod executor;
pub mod feed;
pub mod order_manager;
pub mod paper;
pub mod risk;
pub mod shutdown;
pub mod state;
pub mod types;

// Re-export commonly used types
pub use calculator::{BoundaryStatus, GridCalculator};
pub use config::{FeedConfig, GridConfig, RetryConfig, RiskConfig, SpacingMode};
pub use engine::GridEngine;
pub use errors::{GridError, GridResult};
pub use events::{ChannelListener, GridEvent, GridEventListener, LoggingListener, NoOpListener};
pub use executor::{with_retry, GridExchange, RetryPolicy, TickerStream};
pub use feed::{FeedState, PriceFeed};
pub use order_manager::{OrderManager, RebalanceOutcome, ReconcileReport, ShutdownReport};
pub use paper::{OscillatingPrice, PaperConfig, PaperExchange};
pub use risk::{PriceBar, PriceHistory, RiskManager};
pub use shutdown::{ShutdownHandle, ShutdownSignal};
pub use state::{GridState, GridStateSummary};
pub use types::{
    EngineStats, EngineStatus, ExchangeOrder, GridLevel, GridProfit, ManagedOrder, OrderSide,
    OrderStatus, PauseReason, PriceSample, PriceSource, RiskState,
};
