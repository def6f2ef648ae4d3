//! Exchange abstraction for grid trading - enables mocking for tests

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use log::warn;

use super::config::RetryConfig;
use super::errors::{GridError, GridResult};
use super::types::{ExchangeOrder, OrderSide};

/// Push stream of ticker prices. Ends or yields an error when the connection drops.
pub type TickerStream = BoxStream<'static, GridResult<f64>>;

/// Exchange operations trait - can be mocked for testing
#[async_trait]
pub trait GridExchange: Send + Sync {
    /// Last traded price
    async fn get_ticker(&self, symbol: &str) -> GridResult<f64>;

    /// Open a streaming ticker subscription
    async fn subscribe_ticker(&self, symbol: &str) -> GridResult<TickerStream>;

    /// Place a limit order and return its exchange id
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
    ) -> GridResult<String>;

    /// Cancel an order by exchange id
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> GridResult<()>;

    /// Bulk cancel all orders for a symbol, returning how many were cancelled
    async fn cancel_all_orders(&self, symbol: &str) -> GridResult<usize>;

    /// Orders currently resting for a symbol
    async fn get_open_orders(&self, symbol: &str) -> GridResult<Vec<ExchangeOrder>>;
}

/// Bounded retry with exponential delay
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after the `attempt`-th failure
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Execute with exponential backoff retry.
///
/// Only retryable errors are retried. Anything else, `Auth` included, is
/// returned immediately. After the last attempt the last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> GridResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = GridResult<T>>,
{
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempts += 1;
                if attempts >= policy.max_attempts {
                    return Err(e);
                }

                let delay = policy.delay_for(attempts);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {}ms: {}",
                    label,
                    attempts,
                    policy.max_attempts,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Collapse a retry failure into the placement error reported for a level
pub fn placement_error(attempts: u32, err: &GridError) -> GridError {
    GridError::OrderPlacementFailed {
        attempts,
        reason: err.to_string(),
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Mock exchange for exercising the engine without a real exchange connection.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;

    use futures_util::StreamExt;
    use tokio::sync::{mpsc, Mutex};

    /// A placement the mock accepted
    #[derive(Debug, Clone, PartialEq)]
    pub struct PlacedOrder {
        pub order_id: String,
        pub side: OrderSide,
        pub price: f64,
        pub quantity: f64,
    }

    /// Mock exchange with fill simulation and failure injection
    pub struct MockExchange {
        pub ticker: Arc<Mutex<f64>>,
        pub open_orders: Arc<Mutex<Vec<ExchangeOrder>>>,
        pub placed: Arc<Mutex<Vec<PlacedOrder>>>,
        pub cancelled_ids: Arc<Mutex<Vec<String>>>,
        place_failures: Arc<Mutex<VecDeque<GridError>>>,
        ticker_failures: Arc<Mutex<VecDeque<GridError>>>,
        open_orders_failures: Arc<Mutex<VecDeque<GridError>>>,
        /// Remaining cancel failures per order id
        cancel_failures: Arc<Mutex<HashMap<String, u32>>>,
        /// Orders no cancel path can remove
        stuck_orders: Arc<Mutex<HashSet<String>>>,
        stream_tx: Arc<Mutex<Option<mpsc::UnboundedSender<GridResult<f64>>>>>,
        subscribe_fails: AtomicBool,
        subscribe_hangs: AtomicBool,
        pub subscribe_calls: AtomicUsize,
        pub ticker_calls: AtomicUsize,
        pub cancel_all_calls: AtomicUsize,
        next_id: AtomicU64,
    }

    impl MockExchange {
        pub fn new(price: f64) -> Self {
            Self {
                ticker: Arc::new(Mutex::new(price)),
                open_orders: Arc::new(Mutex::new(Vec::new())),
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled_ids: Arc::new(Mutex::new(Vec::new())),
                place_failures: Arc::new(Mutex::new(VecDeque::new())),
                ticker_failures: Arc::new(Mutex::new(VecDeque::new())),
                open_orders_failures: Arc::new(Mutex::new(VecDeque::new())),
                cancel_failures: Arc::new(Mutex::new(HashMap::new())),
                stuck_orders: Arc::new(Mutex::new(HashSet::new())),
                stream_tx: Arc::new(Mutex::new(None)),
                subscribe_fails: AtomicBool::new(false),
                subscribe_hangs: AtomicBool::new(false),
                subscribe_calls: AtomicUsize::new(0),
                ticker_calls: AtomicUsize::new(0),
                cancel_all_calls: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }
        }

        pub async fn set_ticker(&self, price: f64) {
            *self.ticker.lock().await = price;
        }

        /// Simulate a complete fill: the order disappears from the book
        pub async fn fill_order(&self, order_id: &str) -> Option<ExchangeOrder> {
            let mut orders = self.open_orders.lock().await;
            let pos = orders.iter().position(|o| o.order_id == order_id)?;
            Some(orders.remove(pos))
        }

        /// Simulate a partial fill
        pub async fn partial_fill(&self, order_id: &str, remaining: f64) {
            let mut orders = self.open_orders.lock().await;
            if let Some(order) = orders.iter_mut().find(|o| o.order_id == order_id) {
                order.remaining_quantity = remaining;
            }
        }

        /// Add an order the engine did not place
        pub async fn inject_open_order(&self, order: ExchangeOrder) {
            self.open_orders.lock().await.push(order);
        }

        /// Queue an error for the next placement
        pub async fn fail_next_place(&self, err: GridError) {
            self.place_failures.lock().await.push_back(err);
        }

        /// Queue an error for the next ticker poll
        pub async fn fail_next_ticker(&self, err: GridError) {
            self.ticker_failures.lock().await.push_back(err);
        }

        /// Queue an error for the next open-orders query
        pub async fn fail_next_open_orders(&self, err: GridError) {
            self.open_orders_failures.lock().await.push_back(err);
        }

        /// Fail the next `times` cancels of an order
        pub async fn fail_cancel(&self, order_id: &str, times: u32) {
            self.cancel_failures.lock().await.insert(order_id.to_string(), times);
        }

        /// Make an order impossible to cancel
        pub async fn stick_order(&self, order_id: &str) {
            self.stuck_orders.lock().await.insert(order_id.to_string());
        }

        pub fn set_subscribe_fails(&self, fail: bool) {
            self.subscribe_fails.store(fail, Ordering::SeqCst);
        }

        /// Make subscriptions never complete, like a connect that stalls
        pub fn set_subscribe_hangs(&self, hang: bool) {
            self.subscribe_hangs.store(hang, Ordering::SeqCst);
        }

        /// Push a price into the active ticker stream
        pub async fn push_price(&self, price: f64) -> bool {
            match self.stream_tx.lock().await.as_ref() {
                Some(tx) => tx.send(Ok(price)).is_ok(),
                None => false,
            }
        }

        /// Push an error into the active ticker stream
        pub async fn push_stream_error(&self, err: GridError) -> bool {
            match self.stream_tx.lock().await.as_ref() {
                Some(tx) => tx.send(Err(err)).is_ok(),
                None => false,
            }
        }

        /// End the active ticker stream
        pub async fn close_stream(&self) {
            self.stream_tx.lock().await.take();
        }

        pub async fn open_order_ids(&self) -> Vec<String> {
            self.open_orders.lock().await.iter().map(|o| o.order_id.clone()).collect()
        }

        pub async fn placed_count(&self) -> usize {
            self.placed.lock().await.len()
        }
    }

    #[async_trait]
    impl GridExchange for MockExchange {
        async fn get_ticker(&self, _symbol: &str) -> GridResult<f64> {
            self.ticker_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.ticker_failures.lock().await.pop_front() {
                return Err(err);
            }
            Ok(*self.ticker.lock().await)
        }

        async fn subscribe_ticker(&self, _symbol: &str) -> GridResult<TickerStream> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            if self.subscribe_hangs.load(Ordering::SeqCst) {
                futures_util::future::pending::<()>().await;
            }
            if self.subscribe_fails.load(Ordering::SeqCst) {
                return Err(GridError::Stream("Mock subscribe failure".into()));
            }

            let (tx, rx) = mpsc::unbounded_channel();
            *self.stream_tx.lock().await = Some(tx);

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
            if let Some(err) = self.place_failures.lock().await.pop_front() {
                return Err(err);
            }

            let order_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.open_orders
                .lock()
                .await
                .push(ExchangeOrder::new(order_id.clone(), side, price, quantity));
            self.placed.lock().await.push(PlacedOrder {
                order_id: order_id.clone(),
                side,
                price,
                quantity,
            });
            Ok(order_id)
        }

        async fn cancel_order(&self, _symbol: &str, order_id: &str) -> GridResult<()> {
            if self.stuck_orders.lock().await.contains(order_id) {
                return Err(GridError::TransientExchange(format!("Mock cannot cancel {}", order_id)));
            }
            {
                let mut failures = self.cancel_failures.lock().await;
                if let Some(remaining) = failures.get_mut(order_id) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(GridError::TransientExchange("Mock cancel failure".into()));
                    }
                }
            }

            let mut orders = self.open_orders.lock().await;
            match orders.iter().position(|o| o.order_id == order_id) {
                Some(pos) => {
                    orders.remove(pos);
                    self.cancelled_ids.lock().await.push(order_id.to_string());
                    Ok(())
                }
                None => Err(GridError::Exchange(format!("Unknown order {}", order_id))),
            }
        }

        async fn cancel_all_orders(&self, _symbol: &str) -> GridResult<usize> {
            self.cancel_all_calls.fetch_add(1, Ordering::SeqCst);
            let stuck = self.stuck_orders.lock().await.clone();
            let mut orders = self.open_orders.lock().await;
            let before = orders.len();
            orders.retain(|o| stuck.contains(&o.order_id));
            Ok(before - orders.len())
        }

        async fn get_open_orders(&self, _symbol: &str) -> GridResult<Vec<ExchangeOrder>> {
            if let Some(err) = self.open_orders_failures.lock().await.pop_front() {
                return Err(err);
            }
            Ok(self.open_orders.lock().await.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockExchange;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_policy(), "ticker", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GridError::TransientExchange("timeout".into()))
                } else {
                    Ok(42.0)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42.0));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_never_retries_auth() {
        let calls = AtomicU32::new(0);
        let result: GridResult<()> = with_retry(&fast_policy(), "place", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GridError::Auth("invalid key".into())) }
        })
        .await;

        assert!(matches!(result, Err(GridError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: GridResult<()> = with_retry(&fast_policy(), "open orders", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GridError::TransientExchange("rate limited".into())) }
        })
        .await;

        assert!(matches!(result, Err(GridError::TransientExchange(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_mock_fill_removes_order() {
        let exchange = MockExchange::new(100.0);
        let id = exchange
            .place_limit_order("BTC/USDT", OrderSide::Buy, 95.0, 1.0)
            .await
            .unwrap();

        assert_eq!(exchange.get_open_orders("BTC/USDT").await.unwrap().len(), 1);
        assert!(exchange.fill_order(&id).await.is_some());
        assert!(exchange.get_open_orders("BTC/USDT").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_stream_delivers_prices() {
        use futures_util::StreamExt;

        let exchange = MockExchange::new(100.0);
        let mut stream = exchange.subscribe_ticker("BTC/USDT").await.unwrap();
        assert!(exchange.push_price(101.5).await);

        assert_eq!(stream.next().await, Some(Ok(101.5)));
        exchange.close_stream().await;
        assert_eq!(stream.next().await, None);
    }
}
