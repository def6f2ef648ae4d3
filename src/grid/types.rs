//! Core data types for grid trading

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Order side for grid levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Convert to exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" | "BID" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Engine execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    /// Computing levels and reconciling with the exchange
    Initializing,
    /// Normal grid operation
    Running,
    /// Risk gate closed, resting orders kept
    Paused,
    /// Cancelling orders
    Stopping,
    /// Fully stopped
    Stopped,
}

/// A fixed price point of the ladder. Immutable once computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    /// Index of this level (0 = lowest price)
    pub index: usize,
    /// Price at this level
    pub price: f64,
    /// Side assigned relative to the reference price at computation time
    pub side: OrderSide,
}

impl GridLevel {
    pub fn new(index: usize, price: f64, side: OrderSide) -> Self {
        Self { index, price, side }
    }
}

/// Lifecycle of a managed order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Deferred by the risk gate, not yet sent
    Pending,
    /// Resting on the exchange
    Open,
    /// Disappeared from the exchange without a cancel record
    Filled,
    /// Cancelled by us
    Cancelled,
    /// Placement failed, waiting for retry
    Failed,
}

/// An order owned by the order manager, bound to exactly one level
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedOrder {
    pub level_index: usize,
    /// Exchange order id. `None` until a placement succeeds.
    pub exchange_order_id: Option<String>,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// Quantity still resting, as last reported by the exchange
    pub remaining_quantity: f64,
    pub status: OrderStatus,
    /// Failed placement attempts so far
    pub attempts: u32,
    /// Earliest moment the next placement attempt may run
    pub retry_at: Option<Instant>,
    /// Fill price of the opposite order that produced this one
    pub origin_price: Option<f64>,
}

impl ManagedOrder {
    /// Order confirmed resting on the exchange
    pub fn open(
        level_index: usize,
        exchange_order_id: impl Into<String>,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> Self {
        Self {
            level_index,
            exchange_order_id: Some(exchange_order_id.into()),
            side,
            price,
            quantity,
            remaining_quantity: quantity,
            status: OrderStatus::Open,
            attempts: 0,
            retry_at: None,
            origin_price: None,
        }
    }

    /// Placement placeholder, not yet sent
    pub fn pending(level_index: usize, side: OrderSide, price: f64, quantity: f64) -> Self {
        Self {
            level_index,
            exchange_order_id: None,
            side,
            price,
            quantity,
            remaining_quantity: quantity,
            status: OrderStatus::Pending,
            attempts: 0,
            retry_at: None,
            origin_price: None,
        }
    }

    /// Set the originating fill price
    pub fn with_origin(mut self, origin_price: Option<f64>) -> Self {
        self.origin_price = origin_price;
        self
    }

    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Pending or Failed: no exchange order exists yet
    pub fn awaiting_placement(&self) -> bool {
        matches!(self.status, OrderStatus::Pending | OrderStatus::Failed)
    }

    /// Ready for another placement attempt at `now`
    pub fn is_due(&self, now: Instant) -> bool {
        match self.status {
            OrderStatus::Pending => true,
            OrderStatus::Failed => self.retry_at.map_or(true, |at| now >= at),
            _ => false,
        }
    }

    /// Record a failed placement attempt
    pub fn mark_failed(&mut self, retry_at: Instant) {
        self.status = OrderStatus::Failed;
        self.attempts += 1;
        self.retry_at = Some(retry_at);
        self.exchange_order_id = None;
    }

    pub fn mark_filled(&mut self) {
        self.status = OrderStatus::Filled;
        self.remaining_quantity = 0.0;
    }

    pub fn mark_cancelled(&mut self) {
        self.status = OrderStatus::Cancelled;
    }
}

/// An open order as reported by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub remaining_quantity: f64,
}

impl ExchangeOrder {
    pub fn new(order_id: impl Into<String>, side: OrderSide, price: f64, quantity: f64) -> Self {
        Self {
            order_id: order_id.into(),
            side,
            price,
            quantity,
            remaining_quantity: quantity,
        }
    }
}

/// Where a price sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Stream,
    Poll,
}

/// Most recent observed price
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceSample {
    pub price: f64,
    /// Wall-clock time the sample was accepted
    pub timestamp: DateTime<Utc>,
    /// Monotonic receive time, used for staleness
    pub received_at: Instant,
    pub source: PriceSource,
}

impl PriceSample {
    pub fn new(price: f64, source: PriceSource) -> Self {
        Self {
            price,
            timestamp: Utc::now(),
            received_at: Instant::now(),
            source,
        }
    }

    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age() > max_age
    }
}

/// Why the risk gate is closed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PauseReason {
    Drawdown { drawdown: f64, limit: f64 },
    Volatility { atr: f64, threshold: f64 },
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PauseReason::Drawdown { drawdown, limit } => write!(
                f,
                "drawdown {:.2}% exceeds limit {:.2}%",
                drawdown * 100.0,
                limit * 100.0
            ),
            PauseReason::Volatility { atr, threshold } => {
                write!(f, "ATR {:.4} exceeds threshold {:.4}", atr, threshold)
            }
        }
    }
}

/// Risk snapshot recomputed every cycle
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RiskState {
    pub peak_equity: f64,
    pub current_drawdown: f64,
    /// ATR over the configured window, once enough bars exist
    pub current_volatility: Option<f64>,
    pub paused: bool,
    pub pause_reason: Option<PauseReason>,
}

impl RiskState {
    /// Open gate, used before the first evaluation
    pub fn unrestricted() -> Self {
        Self::default()
    }
}

/// Profit and inventory tracking for the grid
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridProfit {
    /// Realized PnL on completed round trips
    pub realized_pnl: f64,
    /// Net quote flow: sells add, buys subtract
    pub cash_flow: f64,
    /// Net base inventory acquired by fills
    pub net_inventory: f64,
    /// Number of completed round trips (buy->sell or sell->buy)
    pub num_round_trips: u32,
    pub buy_fills: u32,
    pub sell_fills: u32,
    /// Total quote volume traded
    pub total_volume: f64,
}

impl GridProfit {
    /// Record a fill at `price` for `quantity`
    pub fn record_fill(&mut self, side: OrderSide, price: f64, quantity: f64) {
        let notional = price * quantity;
        self.total_volume += notional;
        match side {
            OrderSide::Buy => {
                self.buy_fills += 1;
                self.net_inventory += quantity;
                self.cash_flow -= notional;
            }
            OrderSide::Sell => {
                self.sell_fills += 1;
                self.net_inventory -= quantity;
                self.cash_flow += notional;
            }
        }
    }

    /// Close a round trip opened at `origin_price`
    pub fn complete_round_trip(&mut self, side: OrderSide, origin_price: f64, price: f64, quantity: f64) {
        let pnl = match side {
            OrderSide::Sell => (price - origin_price) * quantity,
            OrderSide::Buy => (origin_price - price) * quantity,
        };
        self.realized_pnl += pnl;
        self.num_round_trips += 1;
    }

    pub fn total_fills(&self) -> u32 {
        self.buy_fills + self.sell_fills
    }

    /// Mark-to-market equity relative to a starting balance
    pub fn equity(&self, initial_equity: f64, price: f64) -> f64 {
        initial_equity + self.cash_flow + self.net_inventory * price
    }
}

/// Final statistics emitted on shutdown
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub symbol: String,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub cycles: u64,
    pub last_price: Option<f64>,
    pub profit: GridProfit,
    pub final_equity: f64,
    pub peak_equity: f64,
    pub max_drawdown: f64,
    pub pauses: u32,
    pub cancelled_on_shutdown: usize,
    /// Exchange order ids still open after the shutdown sweep
    pub residual_orders: Vec<String>,
}
