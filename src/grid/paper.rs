//! Paper exchange - simulated order matching against a driven price
//!
//! Resting limit orders fill in full at their limit price once the simulated
//! price crosses them. Nothing leaves the process.

use std::collections::HashMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::errors::{GridError, GridResult};
use super::executor::{GridExchange, TickerStream};
use super::types::{ExchangeOrder, OrderSide};

/// Paper trading parameters, including the synthetic price path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting balance in quote currency
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,

    /// Fee rate per fill (0.0001 = 0.01%)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,

    /// Center of the synthetic price path
    #[serde(default = "default_start_price")]
    pub start_price: f64,

    /// Half-height of the oscillation as a fraction of `start_price`
    #[serde(default = "default_amplitude")]
    pub amplitude: f64,

    /// Ticks per full oscillation
    #[serde(default = "default_period_ticks")]
    pub period_ticks: u32,

    /// Time between synthetic price ticks (milliseconds)
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_initial_balance() -> f64 {
    100_000.0
}

fn default_fee_rate() -> f64 {
    0.0001
}

fn default_start_price() -> f64 {
    100.0
}

fn default_amplitude() -> f64 {
    0.04
}

fn default_period_ticks() -> u32 {
    120
}

fn default_tick_ms() -> u64 {
    250
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            fee_rate: default_fee_rate(),
            start_price: default_start_price(),
            amplitude: default_amplitude(),
            period_ticks: default_period_ticks(),
            tick_ms: default_tick_ms(),
        }
    }
}

/// Deterministic sine path around a center price
#[derive(Debug, Clone)]
pub struct OscillatingPrice {
    center: f64,
    amplitude: f64,
    period_ticks: u32,
    tick: u64,
}

impl OscillatingPrice {
    pub fn new(center: f64, amplitude: f64, period_ticks: u32) -> Self {
        Self {
            center,
            amplitude,
            period_ticks: period_ticks.max(2),
            tick: 0,
        }
    }

    pub fn from_config(config: &PaperConfig) -> Self {
        Self::new(config.start_price, config.amplitude, config.period_ticks)
    }

    /// Price at the current tick, then advance
    pub fn next_price(&mut self) -> f64 {
        let phase = (self.tick % self.period_ticks as u64) as f64 / self.period_ticks as f64;
        self.tick += 1;
        self.center * (1.0 + self.amplitude * (phase * std::f64::consts::TAU).sin())
    }
}

/// A simulated fill
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperFill {
    pub order_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
}

/// Net position with average entry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaperPosition {
    /// Position size (positive = long, negative = short)
    pub size: f64,
    pub entry_price: f64,
    pub realized_pnl: f64,
}

impl PaperPosition {
    fn apply_fill(&mut self, side: OrderSide, quantity: f64, price: f64) {
        let signed = match side {
            OrderSide::Buy => quantity,
            OrderSide::Sell => -quantity,
        };

        if self.size == 0.0 || self.size.signum() == signed.signum() {
            let total = self.entry_price * self.size.abs() + price * quantity;
            self.size += signed;
            self.entry_price = total / self.size.abs();
            return;
        }

        let closed = quantity.min(self.size.abs());
        self.realized_pnl += if self.size > 0.0 {
            (price - self.entry_price) * closed
        } else {
            (self.entry_price - price) * closed
        };
        self.size += signed;

        if self.size.abs() < f64::EPSILON {
            self.size = 0.0;
            self.entry_price = 0.0;
        } else if self.size.signum() == signed.signum() {
            // Flipped through zero, the remainder opens at this price
            self.entry_price = price;
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.size
    }
}

#[derive(Debug)]
struct PaperBook {
    price: Option<f64>,
    orders: HashMap<String, ExchangeOrder>,
    fills: Vec<PaperFill>,
    position: PaperPosition,
    balance: f64,
    total_fees: f64,
    fee_rate: f64,
    subscribers: Vec<mpsc::UnboundedSender<GridResult<f64>>>,
}

impl PaperBook {
    fn crosses(order: &ExchangeOrder, price: f64) -> bool {
        match order.side {
            OrderSide::Buy => price <= order.price,
            OrderSide::Sell => price >= order.price,
        }
    }

    fn match_orders(&mut self, price: f64) {
        let crossed: Vec<String> = self
            .orders
            .values()
            .filter(|o| Self::crosses(o, price))
            .map(|o| o.order_id.clone())
            .collect();

        for order_id in crossed {
            if let Some(order) = self.orders.remove(&order_id) {
                self.execute_fill(order);
            }
        }
    }

    fn execute_fill(&mut self, order: ExchangeOrder) {
        let quantity = order.remaining_quantity;
        let notional = quantity * order.price;
        let fee = notional * self.fee_rate;

        match order.side {
            OrderSide::Buy => self.balance -= notional + fee,
            OrderSide::Sell => self.balance += notional - fee,
        }
        self.total_fees += fee;
        self.position.apply_fill(order.side, quantity, order.price);

        info!(
            "Paper fill: {} {} at {} (fee: {:.4}) id={}",
            order.side, quantity, order.price, fee, order.order_id
        );
        self.fills.push(PaperFill {
            order_id: order.order_id,
            side: order.side,
            price: order.price,
            quantity,
            fee,
        });
    }

    fn broadcast(&mut self, price: f64) {
        self.subscribers.retain(|tx| tx.send(Ok(price)).is_ok());
    }
}

/// In-process exchange for dry runs
pub struct PaperExchange {
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(initial_balance: f64, fee_rate: f64) -> Self {
        info!("Paper exchange started with balance: {}", initial_balance);
        Self {
            book: Mutex::new(PaperBook {
                price: None,
                orders: HashMap::new(),
                fills: Vec::new(),
                position: PaperPosition::default(),
                balance: initial_balance,
                total_fees: 0.0,
                fee_rate,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn from_config(config: &PaperConfig) -> Self {
        Self::new(config.initial_balance, config.fee_rate)
    }

    /// Move the simulated price, fill crossed orders and notify subscribers
    pub async fn set_price(&self, price: f64) {
        let mut book = self.book.lock().await;
        book.price = Some(price);
        book.match_orders(price);
        book.broadcast(price);
    }

    pub async fn current_price(&self) -> Option<f64> {
        self.book.lock().await.price
    }

    pub async fn fills(&self) -> Vec<PaperFill> {
        self.book.lock().await.fills.clone()
    }

    pub async fn position(&self) -> PaperPosition {
        self.book.lock().await.position.clone()
    }

    pub async fn balance(&self) -> f64 {
        self.book.lock().await.balance
    }

    pub async fn total_fees(&self) -> f64 {
        self.book.lock().await.total_fees
    }

    pub async fn open_order_count(&self) -> usize {
        self.book.lock().await.orders.len()
    }

    /// Balance plus the position marked at the current price
    pub async fn account_value(&self) -> f64 {
        let book = self.book.lock().await;
        let price = book.price.unwrap_or(book.position.entry_price);
        book.balance + book.position.size * price
    }
}

#[async_trait]
impl GridExchange for PaperExchange {
    async fn get_ticker(&self, _symbol: &str) -> GridResult<f64> {
        self.book.lock().await.price.ok_or(GridError::NoPriceAvailable)
    }

    async fn subscribe_ticker(&self, symbol: &str) -> GridResult<TickerStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut book = self.book.lock().await;
        if let Some(price) = book.price {
            let _ = tx.send(Ok(price));
        }
        book.subscribers.push(tx);
        debug!("Paper ticker subscription for {}", symbol);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream.boxed())
    }

    async fn place_limit_order(
        &self,
        _symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> GridResult<String> {
        if !(price > 0.0 && quantity > 0.0) {
            return Err(GridError::Exchange(format!(
                "Invalid order: {} {} @ {}",
                side, quantity, price
            )));
        }

        let order_id = Uuid::new_v4().to_string();
        let mut book = self.book.lock().await;
        debug!("Paper order {}: {} {} @ {}", order_id, side, quantity, price);
        book.orders
            .insert(order_id.clone(), ExchangeOrder::new(order_id.clone(), side, price, quantity));

        // Marketable on arrival
        if let Some(current) = book.price {
            book.match_orders(current);
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GridResult<()> {
        match self.book.lock().await.orders.remove(order_id) {
            Some(_) => {
                debug!("Paper order {} cancelled", order_id);
                Ok(())
            }
            None => Err(GridError::Exchange(format!("Unknown order {}", order_id))),
        }
    }

    async fn cancel_all_orders(&self, _symbol: &str) -> GridResult<usize> {
        let mut book = self.book.lock().await;
        let count = book.orders.len();
        book.orders.clear();
        Ok(count)
    }

    async fn get_open_orders(&self, _symbol: &str) -> GridResult<Vec<ExchangeOrder>> {
        Ok(self.book.lock().await.orders.values().cloned().collect())
    }
}
