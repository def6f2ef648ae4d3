//! Price feed - latest-price cell fed by a streaming subscription with polling fallback
//!
//! The subscription task is the only writer of the price cell. Readers take a
//! snapshot through [`PriceFeed::current`], which never blocks. When the stream
//! keeps failing the task degrades to polling `get_ticker` until a later stream
//! attempt succeeds.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::FeedConfig;
use super::errors::{GridError, GridResult};
use super::executor::{with_retry, GridExchange, RetryPolicy, TickerStream};
use super::shutdown::{ShutdownHandle, ShutdownSignal};
use super::types::{PriceSample, PriceSource};

/// Upper bound on waiting for the subscription task in [`PriceFeed::stop`]
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Subscription task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribed,
    /// Degraded mode, prices come from periodic polls
    Polling,
    Stopped,
}

/// Exponential backoff for reconnection attempts.
///
/// Formula: min(max_delay, base * 2^attempt)
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max_delay: Duration,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay,
            attempt: 0,
        }
    }

    /// Calculate the next delay and increment the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.max_delay);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Reset the attempt counter (call after a successful connection).
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

/// Handle to the latest price and the task that maintains it
pub struct PriceFeed {
    symbol: String,
    sample_rx: watch::Receiver<Option<PriceSample>>,
    state_rx: watch::Receiver<FeedState>,
    stale_after: Duration,
    stop: ShutdownHandle,
    task: Option<JoinHandle<()>>,
}

impl PriceFeed {
    /// Start the subscription task for `symbol`
    pub fn spawn<E: GridExchange + 'static>(
        exchange: Arc<E>,
        symbol: impl Into<String>,
        config: FeedConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        let symbol = symbol.into();
        let (sample_tx, sample_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(FeedState::Disconnected);
        let stop = ShutdownHandle::new();
        let stale_after = config.stale_after();

        let task = FeedTask {
            exchange,
            symbol: symbol.clone(),
            config,
            sample_tx,
            state_tx,
            shutdown,
            stop: stop.subscribe(),
        };

        Self {
            symbol,
            sample_rx,
            state_rx,
            stale_after,
            stop,
            task: Some(tokio::spawn(task.run())),
        }
    }

    /// Latest sample. Never blocks.
    pub fn current(&self) -> GridResult<PriceSample> {
        (*self.sample_rx.borrow()).ok_or(GridError::NoPriceAvailable)
    }

    /// Latest sample, or `StaleFeed` when it is older than the allowed age
    pub fn check_fresh(&self) -> GridResult<PriceSample> {
        let sample = self.current()?;
        if sample.is_stale(self.stale_after) {
            return Err(GridError::StaleFeed {
                age_ms: sample.age().as_millis() as u64,
            });
        }
        Ok(sample)
    }

    pub fn is_stale(&self) -> bool {
        self.check_fresh().is_err()
    }

    pub fn state(&self) -> FeedState {
        *self.state_rx.borrow()
    }

    /// A fresh price, polling the exchange when the cell is empty or stale.
    ///
    /// The polled sample goes to the caller only; the cell keeps a single writer.
    pub async fn fresh_sample<E: GridExchange + ?Sized>(
        &self,
        exchange: &E,
        retry: &RetryPolicy,
    ) -> GridResult<PriceSample> {
        match self.check_fresh() {
            Ok(sample) => Ok(sample),
            Err(reason) => {
                warn!("{} for {}, polling ticker", reason, self.symbol);
                let price = with_retry(retry, "Ticker poll", || exchange.get_ticker(&self.symbol)).await?;
                if !is_valid_price(price) {
                    return Err(GridError::Exchange(format!("Ticker returned invalid price {}", price)));
                }
                Ok(PriceSample::new(price, PriceSource::Poll))
            }
        }
    }

    /// Stop the subscription task and wait for it to finish, aborting it after [`STOP_TIMEOUT`]
    pub async fn stop(&mut self) {
        self.stop.trigger();
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Price feed task for {} ended abnormally: {}", self.symbol, e),
                Err(_) => {
                    warn!(
                        "Price feed task for {} did not stop within {}ms, aborting",
                        self.symbol,
                        STOP_TIMEOUT.as_millis()
                    );
                    task.abort();
                }
            }
        }
    }
}

impl Drop for PriceFeed {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}

fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

enum StreamEnd {
    Stopped,
    Failed(String),
}

struct FeedTask<E: GridExchange> {
    exchange: Arc<E>,
    symbol: String,
    config: FeedConfig,
    sample_tx: watch::Sender<Option<PriceSample>>,
    state_tx: watch::Sender<FeedState>,
    shutdown: ShutdownSignal,
    stop: ShutdownSignal,
}

impl<E: GridExchange + 'static> FeedTask<E> {
    async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(self.config.reconnect_base(), self.config.reconnect_max());
        let mut failures: u32 = 0;

        loop {
            if self.stopping() {
                break;
            }

            self.set_state(FeedState::Connecting);
            let subscribed = tokio::select! {
                result = self.exchange.subscribe_ticker(&self.symbol) => result,
                _ = self.shutdown.wait() => break,
                _ = self.stop.wait() => break,
            };

            match subscribed {
                Ok(stream) => {
                    info!("Ticker stream subscribed for {}", self.symbol);
                    self.set_state(FeedState::Subscribed);
                    match self.consume(stream, &mut backoff, &mut failures).await {
                        StreamEnd::Stopped => break,
                        StreamEnd::Failed(reason) => {
                            warn!("Ticker stream for {} dropped: {}", self.symbol, reason)
                        }
                    }
                }
                Err(e) => warn!("Ticker subscribe for {} failed: {}", self.symbol, e),
            }

            failures += 1;
            self.set_state(FeedState::Disconnected);
            let delay = backoff.next_delay();

            let stopped = if failures >= self.config.max_stream_failures {
                warn!(
                    "{} consecutive stream failures for {}, polling for {}ms before next attempt",
                    failures,
                    self.symbol,
                    delay.as_millis()
                );
                self.poll_until(Instant::now() + delay).await
            } else {
                debug!("Reconnecting ticker stream in {}ms", delay.as_millis());
                self.pause(delay).await
            };

            if stopped {
                break;
            }
        }

        self.set_state(FeedState::Stopped);
        info!("Price feed for {} stopped", self.symbol);
    }

    async fn consume(
        &mut self,
        mut stream: TickerStream,
        backoff: &mut ExponentialBackoff,
        failures: &mut u32,
    ) -> StreamEnd {
        let idle = self.config.stream_idle_timeout();

        loop {
            let next = tokio::select! {
                item = tokio::time::timeout(idle, stream.next()) => item,
                _ = self.shutdown.wait() => return StreamEnd::Stopped,
                _ = self.stop.wait() => return StreamEnd::Stopped,
            };

            match next {
                Err(_) => return StreamEnd::Failed(format!("no update for {}ms", idle.as_millis())),
                Ok(None) => return StreamEnd::Failed("stream ended".into()),
                Ok(Some(Err(e))) => return StreamEnd::Failed(e.to_string()),
                Ok(Some(Ok(price))) => {
                    if self.publish(price, PriceSource::Stream) {
                        backoff.reset();
                        *failures = 0;
                    }
                }
            }
        }
    }

    /// Poll the ticker until `deadline`. Returns true when stopped.
    async fn poll_until(&mut self, deadline: Instant) -> bool {
        self.set_state(FeedState::Polling);

        loop {
            let polled = tokio::select! {
                result = self.exchange.get_ticker(&self.symbol) => result,
                _ = self.shutdown.wait() => return true,
                _ = self.stop.wait() => return true,
            };

            match polled {
                Ok(price) => {
                    self.publish(price, PriceSource::Poll);
                }
                Err(e) => warn!("Ticker poll for {} failed: {}", self.symbol, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = self.config.poll_interval().min(deadline - now);
            if self.pause(wait).await {
                return true;
            }
        }
    }

    /// Sleep unless stopped first. Returns true when stopped.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.wait() => true,
            _ = self.stop.wait() => true,
        }
    }

    fn publish(&self, price: f64, source: PriceSource) -> bool {
        if !is_valid_price(price) {
            warn!("Rejected invalid price {} for {}", price, self.symbol);
            return false;
        }
        self.sample_tx.send_replace(Some(PriceSample::new(price, source)));
        true
    }

    fn set_state(&self, state: FeedState) {
        self.state_tx.send_replace(state);
    }

    fn stopping(&self) -> bool {
        self.shutdown.is_triggered() || self.stop.is_triggered()
    }
}
