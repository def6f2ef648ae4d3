//! Grid engine - the control loop tying feed, risk and orders together

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{error, info, warn};
use tokio::time::{interval, MissedTickBehavior};

use super::calculator::{boundary_status, BoundaryStatus, GridCalculator};
use super::config::GridConfig;
use super::errors::GridResult;
use super::events::{GridEvent, GridEventListener, LoggingListener};
use super::executor::{with_retry, GridExchange, RetryPolicy};
use super::feed::{ExponentialBackoff, PriceFeed};
use super::order_manager::{OrderManager, ShutdownReport};
use super::risk::{PriceHistory, RiskManager};
use super::shutdown::ShutdownHandle;
use super::types::{EngineStats, EngineStatus, GridLevel, RiskState};

/// Edge margin, as a fraction of the ladder width, that triggers a boundary warning
const BOUNDARY_WARNING_THRESHOLD: f64 = 0.1;

/// Orchestrates one grid on one symbol
pub struct GridEngine<E: GridExchange + 'static> {
    exchange: Arc<E>,
    config: GridConfig,
    calculator: GridCalculator,
    retry: RetryPolicy,
    listener: Box<dyn GridEventListener>,
    shutdown: ShutdownHandle,
    risk: RiskManager,
    history: PriceHistory,
    status: EngineStatus,
    boundary: BoundaryStatus,
    stats: EngineStats,
}

impl<E: GridExchange + 'static> GridEngine<E> {
    pub fn new(exchange: Arc<E>, config: GridConfig) -> GridResult<Self> {
        config.validate()?;

        Ok(Self {
            exchange,
            calculator: GridCalculator::new(config.spacing),
            retry: RetryPolicy::from(&config.retry),
            listener: Box::new(LoggingListener),
            shutdown: ShutdownHandle::new(),
            risk: RiskManager::new(config.risk.clone()),
            history: PriceHistory::for_atr_period(config.risk.atr_period),
            status: EngineStatus::Stopped,
            boundary: BoundaryStatus::Inside,
            stats: EngineStats {
                symbol: config.symbol.clone(),
                ..EngineStats::default()
            },
            config,
        })
    }

    /// Builder: replace the default logging listener
    pub fn with_listener(mut self, listener: impl GridEventListener + 'static) -> Self {
        self.listener = Box::new(listener);
        self
    }

    /// Handle that stops the engine from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Where the last observed price sat relative to the ladder
    pub fn boundary(&self) -> BoundaryStatus {
        self.boundary
    }

    pub fn risk_state(&self) -> RiskState {
        self.risk.state()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Run until shutdown is requested, the duration elapses, or a fatal error.
    ///
    /// Startup is retried through transient failures. The cancel sweep always
    /// runs before returning, including on error.
    pub async fn run(&mut self) -> GridResult<EngineStats> {
        info!(
            "Starting grid engine for {} ({} levels, {:?} spacing)",
            self.config.symbol, self.config.grid_num, self.config.spacing
        );
        self.status = EngineStatus::Initializing;
        self.stats = EngineStats {
            symbol: self.config.symbol.clone(),
            started_at: Some(Utc::now()),
            ..EngineStats::default()
        };

        let mut feed = PriceFeed::spawn(
            Arc::clone(&self.exchange),
            self.config.symbol.clone(),
            self.config.feed.clone(),
            self.shutdown.subscribe(),
        );

        let mut orders = None;
        let outcome = self.start_and_run(&feed, &mut orders).await;
        if let Err(e) = &outcome {
            error!("Grid engine halted on {} error: {}", e.category(), e);
        }

        self.status = EngineStatus::Stopping;
        let report = match orders.as_mut() {
            Some(manager) => {
                let report = manager.shutdown(self.exchange.as_ref()).await;
                self.forward_events(manager);
                Some(report)
            }
            None => self.sweep_without_state().await,
        };
        feed.stop().await;

        self.record_final_stats(orders.as_ref(), report);
        self.status = EngineStatus::Stopped;

        let final_stats = self.stats.clone();
        self.emit(GridEvent::EngineShutdown {
            final_stats: final_stats.clone(),
        });
        outcome.map(|()| final_stats)
    }

    async fn start_and_run(&mut self, feed: &PriceFeed, orders: &mut Option<OrderManager>) -> GridResult<()> {
        let mut backoff = ExponentialBackoff::new(self.config.feed.reconnect_base(), self.config.feed.reconnect_max());
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if shutdown.is_triggered() {
                info!("Shutdown requested during startup");
                return Ok(());
            }

            match self.start(feed, orders).await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Startup attempt {} failed, retrying in {}ms: {}",
                        backoff.attempt(),
                        delay.as_millis(),
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => {
                            info!("Shutdown requested during startup");
                            return Ok(());
                        }
                    }
                }
            }
        }

        match orders.as_mut() {
            Some(manager) => self.run_loop(feed, manager).await,
            None => Ok(()),
        }
    }

    /// One startup attempt. Retryable failures happen before any order is touched.
    async fn start(&mut self, feed: &PriceFeed, orders: &mut Option<OrderManager>) -> GridResult<()> {
        let exchange = Arc::clone(&self.exchange);
        let symbol = self.config.symbol.clone();

        let sample = feed.fresh_sample(exchange.as_ref(), &self.retry).await?;
        let levels = self.calculator.compute_for_config(&self.config, sample.price)?;
        if let Some(top) = levels.last() {
            self.config.check_order_quantity(top.price)?;
        }
        let open = with_retry(&self.retry, "Open orders fetch", || exchange.get_open_orders(&symbol)).await?;

        self.history.push_price(sample.price);
        self.stats.last_price = Some(sample.price);
        self.check_boundary(&levels, sample.price);

        let manager = orders.insert(OrderManager::new(self.config.clone(), levels.clone()));
        manager.initialize(exchange.as_ref(), open).await?;
        self.emit(GridEvent::GridInitialized { levels });

        let risk = self.evaluate_risk(manager, sample.price);
        manager.place_initial_grid(exchange.as_ref(), &risk).await?;
        self.forward_events(manager);
        Ok(())
    }

    async fn run_loop(&mut self, feed: &PriceFeed, manager: &mut OrderManager) -> GridResult<()> {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately, the first cycle waits a full interval
        ticker.tick().await;

        let mut shutdown = self.shutdown.subscribe();
        let deadline = self.config.duration().map(|d| Instant::now() + d);
        let mut consecutive_errors: u32 = 0;
        let mut backoff = ExponentialBackoff::new(self.retry.base_delay, self.config.feed.reconnect_max());

        loop {
            if shutdown.is_triggered() {
                info!("Shutdown requested");
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.wait() => {
                    info!("Shutdown requested");
                    break;
                }
            }

            match self.run_cycle(feed, manager).await {
                Ok(()) => {
                    consecutive_errors = 0;
                    backoff.reset();
                }
                Err(e) if e.is_fatal() => return Err(e),
                // Transient failures never halt the engine, they only delay the next cycle
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Cycle {} hit a transient error, backing off {}ms: {}",
                        self.stats.cycles,
                        delay.as_millis(),
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => {
                            info!("Shutdown requested");
                            break;
                        }
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        "Cycle {} failed ({}/{}): {}",
                        self.stats.cycles, consecutive_errors, self.config.max_consecutive_errors, e
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        error!("Too many errors, shutting down");
                        return Err(e);
                    }
                }
            }

            if deadline.map_or(false, |d| Instant::now() >= d) {
                info!("Run duration of {}s reached", self.config.duration_secs);
                self.shutdown.trigger();
                break;
            }
        }

        Ok(())
    }

    /// One evaluation pass. Never interrupted by shutdown once started.
    async fn run_cycle(&mut self, feed: &PriceFeed, manager: &mut OrderManager) -> GridResult<()> {
        let exchange = Arc::clone(&self.exchange);
        let symbol = self.config.symbol.clone();
        self.stats.cycles += 1;

        let sample = feed.fresh_sample(exchange.as_ref(), &self.retry).await?;
        self.stats.last_price = Some(sample.price);
        self.check_boundary(manager.levels(), sample.price);

        let open = with_retry(&self.retry, "Open orders fetch", || exchange.get_open_orders(&symbol)).await?;
        let report = manager.reconcile(exchange.as_ref(), open, &self.risk.state()).await?;
        self.forward_events(manager);
        if report.orphans_cancelled > 0 || report.adopted > 0 {
            warn!(
                "Cycle {}: {} orphans cancelled, {} orders adopted",
                self.stats.cycles, report.orphans_cancelled, report.adopted
            );
        }

        self.history.push_price(sample.price);
        let risk = self.evaluate_risk(manager, sample.price);
        if !risk.paused {
            manager.retry_pending(exchange.as_ref(), &risk).await?;
            self.forward_events(manager);
        }

        let summary = manager.summary();
        let profit = manager.profit();
        info!(
            "[cycle {}] price={:.8} ({:?}) feed={:?} buys={} sells={} pending={} fills={} pnl={:.4} dd={:.2}%{}",
            self.stats.cycles,
            sample.price,
            sample.source,
            feed.state(),
            summary.open_buys,
            summary.open_sells,
            summary.pending + summary.failed,
            profit.total_fills(),
            profit.realized_pnl,
            risk.current_drawdown * 100.0,
            if risk.paused { " PAUSED" } else { "" }
        );

        Ok(())
    }

    /// Log when the price moves near or beyond the edge of the ladder
    fn check_boundary(&mut self, levels: &[GridLevel], price: f64) {
        let status = boundary_status(levels, price, BOUNDARY_WARNING_THRESHOLD);
        if status == self.boundary {
            return;
        }

        let lower = levels.first().map_or(0.0, |l| l.price);
        let upper = levels.last().map_or(0.0, |l| l.price);
        match status {
            BoundaryStatus::Outside => error!(
                "Price {} is outside the grid [{}, {}], orders on one side only",
                price, lower, upper
            ),
            BoundaryStatus::NearEdge => warn!("Price {} is close to the grid boundary [{}, {}]", price, lower, upper),
            BoundaryStatus::Inside => info!("Price {} is back inside the grid", price),
        }
        self.boundary = status;
    }

    /// Bulk cancel when startup never got far enough to track orders
    async fn sweep_without_state(&self) -> Option<ShutdownReport> {
        match self.exchange.cancel_all_orders(&self.config.symbol).await {
            Ok(count) => {
                info!("Bulk cancel swept {} orders", count);
                Some(ShutdownReport {
                    swept: count,
                    ..ShutdownReport::default()
                })
            }
            Err(e) => {
                warn!("Bulk cancel failed: {}", e);
                None
            }
        }
    }

    fn evaluate_risk(&mut self, manager: &OrderManager, price: f64) -> RiskState {
        let was_paused = self.risk.is_paused();
        let state = self.risk.evaluate(manager.equity(price), &self.history);

        match (was_paused, state.pause_reason) {
            (false, Some(reason)) => self.emit(GridEvent::RiskPaused { reason }),
            (true, None) => self.emit(GridEvent::RiskResumed),
            _ => {}
        }

        self.status = if state.paused {
            EngineStatus::Paused
        } else {
            EngineStatus::Running
        };
        state
    }

    fn record_final_stats(&mut self, manager: Option<&OrderManager>, report: Option<ShutdownReport>) {
        let risk = self.risk.state();
        self.stats.stopped_at = Some(Utc::now());
        self.stats.peak_equity = risk.peak_equity;
        self.stats.max_drawdown = self.risk.max_drawdown_seen();
        self.stats.pauses = self.risk.pause_count();
        self.stats.final_equity = self.config.risk.initial_equity;

        if let Some(manager) = manager {
            self.stats.profit = manager.profit().clone();
            if let Some(price) = self.stats.last_price {
                self.stats.final_equity = manager.equity(price);
            }
        }

        if let Some(report) = report {
            self.stats.cancelled_on_shutdown = report.cancelled + report.swept;
            self.stats.residual_orders = report.residual;
        }
    }

    fn forward_events(&mut self, manager: &mut OrderManager) {
        for event in manager.drain_events() {
            self.emit(event);
        }
    }

    fn emit(&mut self, event: GridEvent) {
        self.listener.on_event(&event);
    }
}
