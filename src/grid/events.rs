//! Engine events and the listener interface
//!
//! The engine owns a single listener and invokes it synchronously. Components
//! that need the events asynchronously can use [`ChannelListener`].

use log::{info, warn};
use serde::Serialize;
use tokio::sync::mpsc;

use super::types::{EngineStats, GridLevel, OrderSide, PauseReason};

/// Notifications emitted by the engine
#[derive(Debug, Clone, Serialize)]
pub enum GridEvent {
    GridInitialized {
        levels: Vec<GridLevel>,
    },
    OrderPlaced {
        level: usize,
        side: OrderSide,
        price: f64,
        quantity: f64,
        order_id: String,
    },
    OrderFilled {
        level: usize,
        side: OrderSide,
        price: f64,
        quantity: f64,
        order_id: String,
    },
    RiskPaused {
        reason: PauseReason,
    },
    RiskResumed,
    EngineShutdown {
        final_stats: EngineStats,
    },
}

/// Receives engine notifications
pub trait GridEventListener: Send {
    fn on_event(&mut self, event: &GridEvent);
}

/// A no-op listener for testing or when notifications aren't needed
#[derive(Debug, Default)]
pub struct NoOpListener;

impl GridEventListener for NoOpListener {
    fn on_event(&mut self, _event: &GridEvent) {
        // No-op
    }
}

/// Writes every event to the log
#[derive(Debug, Default)]
pub struct LoggingListener;

impl GridEventListener for LoggingListener {
    fn on_event(&mut self, event: &GridEvent) {
        match event {
            GridEvent::GridInitialized { levels } => {
                let (low, high) = match (levels.first(), levels.last()) {
                    (Some(l), Some(h)) => (l.price, h.price),
                    _ => (0.0, 0.0),
                };
                info!("Grid initialized: {} levels from {:.8} to {:.8}", levels.len(), low, high);
            }
            GridEvent::OrderPlaced {
                level,
                side,
                price,
                quantity,
                order_id,
            } => info!(
                "Order placed: level={} side={} price={:.8} qty={} id={}",
                level, side, price, quantity, order_id
            ),
            GridEvent::OrderFilled {
                level,
                side,
                price,
                quantity,
                order_id,
            } => info!(
                "Order filled: level={} side={} price={:.8} qty={} id={}",
                level, side, price, quantity, order_id
            ),
            GridEvent::RiskPaused { reason } => warn!("Trading paused: {}", reason),
            GridEvent::RiskResumed => info!("Trading resumed"),
            GridEvent::EngineShutdown { final_stats } => match serde_json::to_string(final_stats) {
                Ok(json) => info!("Engine shut down: {}", json),
                Err(_) => info!("Engine shut down after {} cycles", final_stats.cycles),
            },
        }
    }
}

/// Forwards events to a tokio channel
#[derive(Debug)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<GridEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<GridEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl GridEventListener for ChannelListener {
    fn on_event(&mut self, event: &GridEvent) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(event.clone());
    }
}
