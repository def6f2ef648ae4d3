//! Order manager - owns the level-to-order mapping and keeps it in sync with the exchange
//!
//! Reconciliation is one-way: the exchange's open orders are the truth and local
//! state is corrected to match. Every mutation goes through `&mut self`, so two
//! requests for the same level can never be in flight at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use log::{debug, error, info, warn};

use super::calculator::{nearest_level, next_level_down, next_level_up};
use super::config::GridConfig;
use super::errors::{GridError, GridResult};
use super::events::GridEvent;
use super::executor::{placement_error, with_retry, GridExchange, RetryPolicy};
use super::state::{GridState, GridStateSummary};
use super::types::{ExchangeOrder, GridLevel, GridProfit, ManagedOrder, OrderSide, OrderStatus, RiskState};

/// Result of matching exchange orders to levels at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitReport {
    pub matched: usize,
    pub side_conflicts: usize,
    pub orphans_cancelled: usize,
    pub orphans_failed: usize,
}

/// Result of placing the initial grid
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementReport {
    pub placed: usize,
    pub deferred: usize,
    pub failed: usize,
}

/// What a rebalance did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceOutcome {
    /// Opposite order placed at the target level
    Placed { level: usize },
    /// Risk paused, target recorded as Pending
    Deferred { level: usize },
    /// Placement failed, target marked for retry
    Failed { level: usize },
    /// Target already holds a live or pending order
    Occupied { level: usize },
    /// No level beyond the edge of the grid
    OutOfRange,
    /// This fill was rebalanced before
    AlreadyProcessed,
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub fills: Vec<ManagedOrder>,
    pub cancelled_confirmed: usize,
    pub adopted: usize,
    pub orphans_cancelled: usize,
    pub partially_filled: usize,
    pub rebalances: Vec<RebalanceOutcome>,
}

/// Result of the shutdown sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub cancelled: usize,
    pub swept: usize,
    /// Order ids still open on the exchange
    pub residual: Vec<String>,
}

/// Filled order ids remembered per level for rebalance deduplication
const REBALANCE_MEMORY_PER_LEVEL: usize = 8;

/// Insertion-ordered id set that forgets its oldest entries past `capacity`
#[derive(Debug, Clone)]
struct RecentIds {
    ids: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// False when `id` is already remembered
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Core order manager
pub struct OrderManager {
    config: GridConfig,
    retry: RetryPolicy,
    levels: Vec<GridLevel>,
    state: GridState,
    /// Ids we asked the exchange to cancel. Their disappearance is not a fill.
    /// Dropped once the exchange no longer lists them.
    cancel_records: HashSet<String>,
    /// Recently filled order ids that already produced their replacement
    rebalanced: RecentIds,
    profit: GridProfit,
    events: Vec<GridEvent>,
}

impl OrderManager {
    pub fn new(config: GridConfig, levels: Vec<GridLevel>) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            config,
            retry,
            state: GridState::new(levels.clone()),
            cancel_records: HashSet::new(),
            rebalanced: RecentIds::new(levels.len() * REBALANCE_MEMORY_PER_LEVEL),
            levels,
            profit: GridProfit::default(),
            events: Vec::new(),
        }
    }

    /// Match pre-existing exchange orders to levels and cancel the rest
    pub async fn initialize<E: GridExchange + ?Sized>(
        &mut self,
        exchange: &E,
        open_orders: Vec<ExchangeOrder>,
    ) -> GridResult<InitReport> {
        let mut report = InitReport::default();
        let mut orphans = Vec::new();

        for order in open_orders {
            let level = match self.match_level(order.price) {
                Some(level) if self.state.slot(level).map_or(false, |s| s.order.is_none()) => level,
                _ => {
                    orphans.push(order);
                    continue;
                }
            };

            let assigned = self.state.slot(level).map(|s| s.side).unwrap_or(order.side);
            if assigned != order.side {
                let conflict = GridError::ReconciliationConflict {
                    level,
                    reason: format!(
                        "exchange has {} order {} where {} was expected",
                        order.side, order.order_id, assigned
                    ),
                };
                warn!("{}; keeping exchange side", conflict);
                report.side_conflicts += 1;
            }

            let mut managed = ManagedOrder::open(level, order.order_id.clone(), order.side, order.price, order.quantity);
            managed.remaining_quantity = order.remaining_quantity;
            self.state.set_order(managed);
            report.matched += 1;
        }

        for orphan in orphans {
            match self.cancel_orphan(exchange, &orphan).await {
                Ok(()) => report.orphans_cancelled += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(_) => report.orphans_failed += 1,
            }
        }

        info!(
            "Initialized order state: {} matched, {} side conflicts, {} orphans cancelled, {} orphan cancels failed",
            report.matched, report.side_conflicts, report.orphans_cancelled, report.orphans_failed
        );
        Ok(report)
    }

    /// Place an order on every empty level, or defer them all while paused
    pub async fn place_initial_grid<E: GridExchange + ?Sized>(
        &mut self,
        exchange: &E,
        risk: &RiskState,
    ) -> GridResult<PlacementReport> {
        let mut report = PlacementReport::default();
        let targets: Vec<(usize, OrderSide)> =
            self.state.empty_levels().map(|s| (s.level.index, s.side)).collect();

        for (level, side) in targets {
            if risk.paused {
                let price = self.level_price(level);
                let quantity = self.config.order_quantity(price);
                self.state.set_order(ManagedOrder::pending(level, side, price, quantity));
                report.deferred += 1;
                continue;
            }

            if self.place_at(exchange, level, side, None).await? {
                report.placed += 1;
            } else {
                report.failed += 1;
            }
        }

        info!(
            "Placed {}/{} grid orders ({} deferred, {} failed)",
            report.placed,
            report.placed + report.deferred + report.failed,
            report.deferred,
            report.failed
        );
        Ok(report)
    }

    /// Diff exchange open orders against local state, detect fills and rebalance them
    pub async fn reconcile<E: GridExchange + ?Sized>(
        &mut self,
        exchange: &E,
        open_orders: Vec<ExchangeOrder>,
        risk: &RiskState,
    ) -> GridResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let live: HashMap<&str, &ExchangeOrder> =
            open_orders.iter().map(|o| (o.order_id.as_str(), o)).collect();

        for (level, order_id) in self.state.open_order_ids() {
            if let Some(exchange_order) = live.get(order_id.as_str()) {
                if let Some(order) = self.state.slot_mut(level).and_then(|s| s.order.as_mut()) {
                    if exchange_order.remaining_quantity < order.remaining_quantity {
                        debug!(
                            "Order {} at level {} partially filled, {} remaining",
                            order_id, level, exchange_order.remaining_quantity
                        );
                        report.partially_filled += 1;
                    }
                    order.remaining_quantity = exchange_order.remaining_quantity;
                }
                continue;
            }

            let Some(mut order) = self.state.clear_order(level) else {
                continue;
            };

            if self.cancel_records.remove(&order_id) {
                debug!("Order {} at level {} confirmed cancelled", order_id, level);
                report.cancelled_confirmed += 1;
                continue;
            }

            order.mark_filled();
            self.record_fill(&order);
            report.fills.push(order);
        }

        for exchange_order in &open_orders {
            if self.state.find_level_by_order(&exchange_order.order_id).is_some()
                || self.cancel_records.contains(&exchange_order.order_id)
            {
                continue;
            }

            match self.adoptable_level(exchange_order) {
                Some(level) => {
                    let origin = self.state.slot(level).and_then(|s| s.order.as_ref()).and_then(|o| o.origin_price);
                    let mut managed = ManagedOrder::open(
                        level,
                        exchange_order.order_id.clone(),
                        exchange_order.side,
                        exchange_order.price,
                        exchange_order.quantity,
                    )
                    .with_origin(origin);
                    managed.remaining_quantity = exchange_order.remaining_quantity;
                    info!("Adopted untracked order {} at level {}", exchange_order.order_id, level);
                    self.state.set_order(managed);
                    report.adopted += 1;
                }
                None => match self.cancel_orphan(exchange, exchange_order).await {
                    Ok(()) => report.orphans_cancelled += 1,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(_) => {}
                },
            }
        }

        for filled in &report.fills {
            let outcome = self.rebalance(exchange, filled, risk).await?;
            report.rebalances.push(outcome);
        }

        let before = self.cancel_records.len();
        self.cancel_records.retain(|id| live.contains_key(id.as_str()));
        if self.cancel_records.len() < before {
            debug!("Dropped {} settled cancel records", before - self.cancel_records.len());
        }

        Ok(report)
    }

    /// Place the opposite order one level away from a fill.
    ///
    /// Idempotent per filled order id, and a no-op when the target level
    /// already holds a non-failed order.
    pub async fn rebalance<E: GridExchange + ?Sized>(
        &mut self,
        exchange: &E,
        filled: &ManagedOrder,
        risk: &RiskState,
    ) -> GridResult<RebalanceOutcome> {
        if let Some(id) = &filled.exchange_order_id {
            if !self.rebalanced.insert(id) {
                debug!("Fill {} already rebalanced", id);
                return Ok(RebalanceOutcome::AlreadyProcessed);
            }
        }

        let target = match filled.side {
            OrderSide::Buy => next_level_up(&self.levels, filled.level_index),
            OrderSide::Sell => next_level_down(&self.levels, filled.level_index),
        };
        let Some(target) = target else {
            info!(
                "{} fill at edge level {}, no replacement",
                filled.side, filled.level_index
            );
            return Ok(RebalanceOutcome::OutOfRange);
        };

        let side = filled.side.opposite();
        if let Some(existing) = self.state.slot(target).and_then(|s| s.order.as_ref()) {
            if existing.status != OrderStatus::Failed {
                debug!(
                    "Level {} already holds a {:?} {} order, skipping replacement",
                    target, existing.status, existing.side
                );
                return Ok(RebalanceOutcome::Occupied { level: target });
            }
        }

        let origin = Some(filled.price);
        if risk.paused {
            let price = self.level_price(target);
            let quantity = self.config.order_quantity(price);
            let attempts = self.carried_attempts(target);
            let mut pending = ManagedOrder::pending(target, side, price, quantity).with_origin(origin);
            pending.attempts = attempts;
            self.state.set_order(pending);
            info!("Risk paused, {} at level {} deferred", side, target);
            return Ok(RebalanceOutcome::Deferred { level: target });
        }

        if self.place_at(exchange, target, side, origin).await? {
            Ok(RebalanceOutcome::Placed { level: target })
        } else {
            Ok(RebalanceOutcome::Failed { level: target })
        }
    }

    /// Place Pending levels and Failed levels whose retry time has come
    pub async fn retry_pending<E: GridExchange + ?Sized>(
        &mut self,
        exchange: &E,
        risk: &RiskState,
    ) -> GridResult<usize> {
        if risk.paused {
            return Ok(0);
        }

        let now = Instant::now();
        let due: Vec<(usize, OrderSide, Option<f64>)> = self
            .state
            .awaiting_levels()
            .filter_map(|s| s.order.as_ref())
            .filter(|o| o.is_due(now))
            .map(|o| (o.level_index, o.side, o.origin_price))
            .collect();

        let mut placed = 0;
        for (level, side, origin) in due {
            if self.place_at(exchange, level, side, origin).await? {
                placed += 1;
            }
        }

        if placed > 0 {
            info!("Placed {} deferred orders", placed);
        }
        Ok(placed)
    }

    /// Cancel the order resting at a level. On error the cancel record is kept,
    /// so a later disappearance of the order is not taken for a fill.
    async fn cancel_level<E: GridExchange + ?Sized>(&mut self, exchange: &E, level: usize) -> GridResult<bool> {
        let Some(order_id) = self
            .state
            .slot(level)
            .filter(|s| s.has_open_order())
            .and_then(|s| s.order_id())
            .map(str::to_string)
        else {
            return Ok(false);
        };

        self.cancel_records.insert(order_id.clone());
        let symbol = self.config.symbol.clone();
        with_retry(&self.retry, "Order cancel", || exchange.cancel_order(&symbol, &order_id)).await?;

        self.cancel_records.remove(&order_id);
        if let Some(mut order) = self.state.clear_order(level) {
            order.mark_cancelled();
        }
        Ok(true)
    }

    /// Cancel every open order, retry failures once, then sweep with a bulk cancel.
    ///
    /// Failures are logged, never raised. Orders still open at the end are reported.
    pub async fn shutdown<E: GridExchange + ?Sized>(&mut self, exchange: &E) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let symbol = self.config.symbol.clone();

        for slot in self.state.awaiting_levels().map(|s| s.level.index).collect::<Vec<_>>() {
            self.state.clear_order(slot);
        }

        let mut failed = Vec::new();
        for (level, order_id) in self.state.open_order_ids() {
            match self.cancel_level(exchange, level).await {
                Ok(true) => report.cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed to cancel order {} at level {}: {}", order_id, level, e);
                    failed.push((level, order_id));
                }
            }
        }

        if !failed.is_empty() {
            let mut still_failed = Vec::new();
            for (level, order_id) in failed {
                match exchange.cancel_order(&symbol, &order_id).await {
                    Ok(()) => {
                        self.state.clear_order(level);
                        report.cancelled += 1;
                    }
                    Err(e) => {
                        warn!("Retry cancel of order {} failed: {}", order_id, e);
                        still_failed.push((level, order_id));
                    }
                }
            }
            failed = still_failed;
        }

        if !failed.is_empty() {
            match exchange.cancel_all_orders(&symbol).await {
                Ok(count) => {
                    info!("Bulk cancel swept {} orders", count);
                    report.swept = count;
                }
                Err(e) => warn!("Bulk cancel failed: {}", e),
            }

            let remaining: HashSet<String> = match exchange.get_open_orders(&symbol).await {
                Ok(orders) => orders.into_iter().map(|o| o.order_id).collect(),
                Err(e) => {
                    warn!("Could not verify open orders after sweep: {}", e);
                    failed.iter().map(|(_, id)| id.clone()).collect()
                }
            };

            for (level, order_id) in failed {
                if remaining.contains(&order_id) {
                    report.residual.push(order_id);
                } else {
                    self.state.clear_order(level);
                }
            }
        }

        if report.residual.is_empty() {
            info!("Shutdown complete: {} orders cancelled", report.cancelled + report.swept);
        } else {
            error!(
                "Shutdown left {} orders open: {:?}",
                report.residual.len(),
                report.residual
            );
        }
        report
    }

    /// Place one order. Ok(false) means it failed and the level awaits retry.
    async fn place_at<E: GridExchange + ?Sized>(
        &mut self,
        exchange: &E,
        level: usize,
        side: OrderSide,
        origin: Option<f64>,
    ) -> GridResult<bool> {
        let price = self.level_price(level);
        let quantity = self.config.order_quantity(price);
        let symbol = self.config.symbol.clone();

        let result = with_retry(&self.retry, "Order placement", || {
            exchange.place_limit_order(&symbol, side, price, quantity)
        })
        .await;

        match result {
            Ok(order_id) => {
                debug!("Placed {} at level {} price {} qty {} id {}", side, level, price, quantity, order_id);
                self.state
                    .set_order(ManagedOrder::open(level, order_id.clone(), side, price, quantity).with_origin(origin));
                self.events.push(GridEvent::OrderPlaced {
                    level,
                    side,
                    price,
                    quantity,
                    order_id,
                });
                Ok(true)
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                let mut order = ManagedOrder::pending(level, side, price, quantity).with_origin(origin);
                order.attempts = self.carried_attempts(level);
                let retry_at = Instant::now() + self.config.retry.placement_delay(order.attempts + 1);
                order.mark_failed(retry_at);
                error!("Level {}: {}", level, placement_error(order.attempts, &e));
                self.state.set_order(order);
                Ok(false)
            }
        }
    }

    async fn cancel_orphan<E: GridExchange + ?Sized>(&mut self, exchange: &E, order: &ExchangeOrder) -> GridResult<()> {
        warn!(
            "Cancelling orphan {} order {} at {}",
            order.side, order.order_id, order.price
        );
        self.cancel_records.insert(order.order_id.clone());
        let symbol = self.config.symbol.clone();
        let result = with_retry(&self.retry, "Orphan cancel", || exchange.cancel_order(&symbol, &order.order_id)).await;
        if let Err(e) = &result {
            warn!("Failed to cancel orphan {}: {}", order.order_id, e);
        }
        result
    }

    fn record_fill(&mut self, order: &ManagedOrder) {
        self.profit.record_fill(order.side, order.price, order.quantity);
        if let Some(origin) = order.origin_price {
            self.profit.complete_round_trip(order.side, origin, order.price, order.quantity);
        }

        let order_id = order.exchange_order_id.clone().unwrap_or_default();
        info!(
            "Fill detected: level={} side={} price={} qty={} id={}",
            order.level_index, order.side, order.price, order.quantity, order_id
        );
        self.events.push(GridEvent::OrderFilled {
            level: order.level_index,
            side: order.side,
            price: order.price,
            quantity: order.quantity,
            order_id,
        });
    }

    /// Nearest level within the relative price tolerance
    fn match_level(&self, price: f64) -> Option<usize> {
        let nearest = self.levels.get(nearest_level(&self.levels, price)?)?;
        let tolerance = nearest.price.abs() * self.config.price_tolerance;
        ((nearest.price - price).abs() <= tolerance).then_some(nearest.index)
    }

    /// Level an untracked order can be adopted into: free, same assigned side
    fn adoptable_level(&self, order: &ExchangeOrder) -> Option<usize> {
        let level = self.match_level(order.price)?;
        let slot = self.state.slot(level)?;
        (slot.is_free() && slot.side == order.side).then_some(level)
    }

    fn carried_attempts(&self, level: usize) -> u32 {
        self.state
            .slot(level)
            .and_then(|s| s.order.as_ref())
            .filter(|o| o.awaiting_placement())
            .map_or(0, |o| o.attempts)
    }

    fn level_price(&self, level: usize) -> f64 {
        self.levels.get(level).map_or(0.0, |l| l.price)
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<GridEvent> {
        std::mem::take(&mut self.events)
    }

    /// Mark-to-market equity at `price`
    pub fn equity(&self, price: f64) -> f64 {
        self.profit.equity(self.config.risk.initial_equity, price)
    }

    pub fn profit(&self) -> &GridProfit {
        &self.profit
    }

    /// The ladder, lowest price first
    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn summary(&self) -> GridStateSummary {
        self.state.summary()
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::calculator::GridCalculator;
    use crate::grid::executor::mock::MockExchange;
    use crate::grid::types::PauseReason;

    const SYMBOL: &str = "BTC/USDT";

    fn test_config() -> GridConfig {
        GridConfig::new(SYMBOL, 100.0, 150.0, 6, 1.0).with_retry_config(2, 1)
    }

    /// Levels 100, 110, 120, 130, 140, 150 with reference 125: buys 0..=2, sells 3..=5
    fn create_test_manager() -> (OrderManager, MockExchange) {
        let config = test_config();
        let levels = GridCalculator::arithmetic().compute(100.0, 150.0, 6, 125.0).unwrap();
        (OrderManager::new(config, levels), MockExchange::new(125.0))
    }

    fn running() -> RiskState {
        RiskState::unrestricted()
    }

    fn paused() -> RiskState {
        RiskState {
            paused: true,
            pause_reason: Some(PauseReason::Drawdown {
                drawdown: 0.1,
                limit: 0.05,
            }),
            ..RiskState::default()
        }
    }

    async fn reconcile(manager: &mut OrderManager, exchange: &MockExchange, risk: &RiskState) -> ReconcileReport {
        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        manager.reconcile(exchange, open, risk).await.unwrap()
    }

    fn order_at(manager: &OrderManager, level: usize) -> Option<&ManagedOrder> {
        manager.state().slot(level).and_then(|s| s.order.as_ref())
    }

    #[tokio::test]
    async fn test_place_initial_grid() {
        let (mut manager, exchange) = create_test_manager();
        let report = manager.place_initial_grid(&exchange, &running()).await.unwrap();

        assert_eq!(report.placed, 6);
        assert_eq!(exchange.placed_count().await, 6);
        let summary = manager.summary();
        assert_eq!(summary.open_buys, 3);
        assert_eq!(summary.open_sells, 3);
        assert!(manager.state().verify().is_ok());

        let placed = manager.drain_events();
        assert_eq!(placed.len(), 6);
        assert!(manager.drain_events().is_empty());
    }

    #[tokio::test]
    async fn test_no_placements_while_paused() {
        let (mut manager, exchange) = create_test_manager();
        let report = manager.place_initial_grid(&exchange, &paused()).await.unwrap();

        assert_eq!(report.placed, 0);
        assert_eq!(report.deferred, 6);
        assert_eq!(exchange.placed_count().await, 0);
        assert_eq!(manager.retry_pending(&exchange, &paused()).await.unwrap(), 0);
        assert_eq!(exchange.placed_count().await, 0);

        // Once risk clears the deferred levels go out
        assert_eq!(manager.retry_pending(&exchange, &running()).await.unwrap(), 6);
        assert_eq!(exchange.placed_count().await, 6);
    }

    #[tokio::test]
    async fn test_failed_placement_does_not_abort_grid() {
        let (mut manager, exchange) = create_test_manager();
        exchange.fail_next_place(GridError::Exchange("insufficient balance".into())).await;

        let report = manager.place_initial_grid(&exchange, &running()).await.unwrap();
        assert_eq!(report.placed, 5);
        assert_eq!(report.failed, 1);

        let failed = order_at(&manager, 0).unwrap();
        assert_eq!(failed.status, OrderStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.retry_at.is_some());

        // Not due yet: retry_at is a second away by default
        assert_eq!(manager.retry_pending(&exchange, &running()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_placement_error_is_retried_inline() {
        let (mut manager, exchange) = create_test_manager();
        exchange.fail_next_place(GridError::TransientExchange("timeout".into())).await;

        let report = manager.place_initial_grid(&exchange, &running()).await.unwrap();
        assert_eq!(report.placed, 6);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_auth_error_is_fatal() {
        let (mut manager, exchange) = create_test_manager();
        exchange.fail_next_place(GridError::Auth("invalid signature".into())).await;

        let result = manager.place_initial_grid(&exchange, &running()).await;
        assert!(matches!(result, Err(GridError::Auth(_))));
        assert_eq!(exchange.placed_count().await, 0);
    }

    #[tokio::test]
    async fn test_buy_fill_places_sell_one_level_up() {
        let (mut manager, exchange) = create_test_manager();
        exchange.inject_open_order(ExchangeOrder::new("ext-3", OrderSide::Buy, 130.0, 1.0)).await;

        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        let init = manager.initialize(&exchange, open).await.unwrap();
        assert_eq!(init.matched, 1);
        assert_eq!(init.side_conflicts, 1);

        exchange.fill_order("ext-3").await.unwrap();
        let report = reconcile(&mut manager, &exchange, &running()).await;

        assert_eq!(report.fills.len(), 1);
        assert_eq!(report.rebalances, vec![RebalanceOutcome::Placed { level: 4 }]);

        let placed = exchange.placed.lock().await.clone();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(placed[0].price, 140.0);

        let sell = order_at(&manager, 4).unwrap();
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.origin_price, Some(130.0));
        assert!(order_at(&manager, 3).is_none());
        assert!(manager.state().verify().is_ok());
    }

    #[tokio::test]
    async fn test_sell_fill_places_buy_one_level_down_and_closes_round_trip() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();

        // Buy at level 2 fills, target level 3 holds the initial sell
        let buy_id = order_at(&manager, 2).unwrap().exchange_order_id.clone().unwrap();
        exchange.fill_order(&buy_id).await;
        let report = reconcile(&mut manager, &exchange, &running()).await;
        assert_eq!(report.rebalances, vec![RebalanceOutcome::Occupied { level: 3 }]);

        // Sell at level 3 fills, level 2 is free again
        let sell_id = order_at(&manager, 3).unwrap().exchange_order_id.clone().unwrap();
        exchange.fill_order(&sell_id).await;
        let report = reconcile(&mut manager, &exchange, &running()).await;
        assert_eq!(report.rebalances, vec![RebalanceOutcome::Placed { level: 2 }]);

        let rebuy = order_at(&manager, 2).unwrap();
        assert_eq!(rebuy.side, OrderSide::Buy);
        assert_eq!(rebuy.origin_price, Some(130.0));

        // The new buy filling completes a sell->buy round trip
        let rebuy_id = rebuy.exchange_order_id.clone().unwrap();
        exchange.fill_order(&rebuy_id).await;
        reconcile(&mut manager, &exchange, &running()).await;

        let profit = manager.profit();
        assert_eq!(profit.total_fills(), 3);
        assert_eq!(profit.num_round_trips, 1);
        assert!((profit.realized_pnl - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rebalance_is_idempotent() {
        let (mut manager, exchange) = create_test_manager();
        exchange.inject_open_order(ExchangeOrder::new("ext-1", OrderSide::Buy, 110.0, 1.0)).await;
        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        manager.initialize(&exchange, open).await.unwrap();

        exchange.fill_order("ext-1").await;
        let report = reconcile(&mut manager, &exchange, &running()).await;
        let filled = report.fills[0].clone();

        let again = manager.rebalance(&exchange, &filled, &running()).await.unwrap();
        assert_eq!(again, RebalanceOutcome::AlreadyProcessed);
        assert_eq!(exchange.placed_count().await, 1);

        // A second reconcile with the same exchange view changes nothing
        let report = reconcile(&mut manager, &exchange, &running()).await;
        assert!(report.fills.is_empty());
        assert_eq!(exchange.placed_count().await, 1);
    }

    #[tokio::test]
    async fn test_rebalance_deferred_while_paused() {
        let (mut manager, exchange) = create_test_manager();
        exchange.inject_open_order(ExchangeOrder::new("ext-1", OrderSide::Buy, 110.0, 1.0)).await;
        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        manager.initialize(&exchange, open).await.unwrap();

        exchange.fill_order("ext-1").await;
        let report = reconcile(&mut manager, &exchange, &paused()).await;
        assert_eq!(report.rebalances, vec![RebalanceOutcome::Deferred { level: 2 }]);
        assert_eq!(exchange.placed_count().await, 0);
        assert_eq!(order_at(&manager, 2).unwrap().status, OrderStatus::Pending);

        assert_eq!(manager.retry_pending(&exchange, &running()).await.unwrap(), 1);
        let sell = order_at(&manager, 2).unwrap();
        assert_eq!(sell.status, OrderStatus::Open);
        assert_eq!(sell.side, OrderSide::Sell);
        assert_eq!(sell.origin_price, Some(110.0));
    }

    #[tokio::test]
    async fn test_edge_fill_has_no_replacement() {
        let (mut manager, exchange) = create_test_manager();
        exchange.inject_open_order(ExchangeOrder::new("top", OrderSide::Buy, 150.0, 1.0)).await;
        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        manager.initialize(&exchange, open).await.unwrap();

        exchange.fill_order("top").await;
        let report = reconcile(&mut manager, &exchange, &running()).await;
        assert_eq!(report.rebalances, vec![RebalanceOutcome::OutOfRange]);
    }

    #[tokio::test]
    async fn test_initialize_cancels_duplicates_and_unmatched() {
        let (mut manager, exchange) = create_test_manager();
        exchange.inject_open_order(ExchangeOrder::new("a", OrderSide::Buy, 100.05, 1.0)).await;
        exchange.inject_open_order(ExchangeOrder::new("dup", OrderSide::Buy, 100.0, 1.0)).await;
        exchange.inject_open_order(ExchangeOrder::new("stray", OrderSide::Sell, 137.0, 1.0)).await;

        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        let report = manager.initialize(&exchange, open).await.unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.orphans_cancelled, 2);
        assert_eq!(exchange.open_order_ids().await, vec!["a".to_string()]);
        assert_eq!(manager.state().find_level_by_order("a"), Some(0));

        // Remaining levels are filled by the initial grid only
        manager.place_initial_grid(&exchange, &running()).await.unwrap();
        assert_eq!(exchange.open_order_ids().await.len(), 6);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_or_cancels_untracked_orders() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();

        // Free level 1 by filling its buy; the sell replacement at level 2 is occupied
        let id = order_at(&manager, 1).unwrap().exchange_order_id.clone().unwrap();
        exchange.fill_order(&id).await;
        reconcile(&mut manager, &exchange, &running()).await;
        assert!(order_at(&manager, 1).is_none());

        exchange.inject_open_order(ExchangeOrder::new("manual-buy", OrderSide::Buy, 110.0, 1.0)).await;
        exchange.inject_open_order(ExchangeOrder::new("manual-sell", OrderSide::Sell, 120.0, 1.0)).await;
        let report = reconcile(&mut manager, &exchange, &running()).await;

        assert_eq!(report.adopted, 1);
        assert_eq!(report.orphans_cancelled, 1);
        assert_eq!(manager.state().find_level_by_order("manual-buy"), Some(1));
        assert!(!exchange.open_order_ids().await.contains(&"manual-sell".to_string()));
        assert!(manager.state().verify().is_ok());
    }

    #[tokio::test]
    async fn test_partial_fill_tracks_remaining() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();
        let id = order_at(&manager, 0).unwrap().exchange_order_id.clone().unwrap();

        exchange.partial_fill(&id, 0.4).await;
        let report = reconcile(&mut manager, &exchange, &running()).await;

        assert_eq!(report.partially_filled, 1);
        assert!(report.fills.is_empty());
        assert_eq!(order_at(&manager, 0).unwrap().remaining_quantity, 0.4);
    }

    #[tokio::test]
    async fn test_cancelled_order_is_not_a_fill() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();
        let id = order_at(&manager, 5).unwrap().exchange_order_id.clone().unwrap();

        // Cancel request errors out but the exchange removes the order anyway
        exchange.fail_cancel(&id, 5).await;
        assert!(manager.cancel_level(&exchange, 5).await.is_err());
        exchange.fill_order(&id).await;

        let report = reconcile(&mut manager, &exchange, &running()).await;
        assert!(report.fills.is_empty());
        assert_eq!(report.cancelled_confirmed, 1);
        assert_eq!(manager.profit().total_fills(), 0);
    }

    #[tokio::test]
    async fn test_rebalance_memory_is_bounded() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();
        let capacity = 6 * REBALANCE_MEMORY_PER_LEVEL;

        // Buys at level 2 whose replacement level 3 is occupied: nothing is placed
        for i in 0..1000 {
            let mut filled = ManagedOrder::open(2, format!("fill-{}", i), OrderSide::Buy, 120.0, 1.0);
            filled.mark_filled();
            let outcome = manager.rebalance(&exchange, &filled, &running()).await.unwrap();
            assert_eq!(outcome, RebalanceOutcome::Occupied { level: 3 });
        }

        assert_eq!(manager.rebalanced.len(), capacity);
        assert_eq!(exchange.placed_count().await, 6);

        // Recent fills are still deduplicated
        let mut recent = ManagedOrder::open(2, "fill-999", OrderSide::Buy, 120.0, 1.0);
        recent.mark_filled();
        let again = manager.rebalance(&exchange, &recent, &running()).await.unwrap();
        assert_eq!(again, RebalanceOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn test_cancel_records_dropped_once_gone_from_exchange() {
        let (mut manager, exchange) = create_test_manager();
        exchange.inject_open_order(ExchangeOrder::new("stray", OrderSide::Sell, 137.0, 1.0)).await;
        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        manager.initialize(&exchange, open).await.unwrap();
        assert!(manager.cancel_records.contains("stray"));

        reconcile(&mut manager, &exchange, &running()).await;
        assert!(manager.cancel_records.is_empty());

        // A record for an order still listed is kept
        manager.place_initial_grid(&exchange, &running()).await.unwrap();
        let id = order_at(&manager, 5).unwrap().exchange_order_id.clone().unwrap();
        exchange.stick_order(&id).await;
        assert!(manager.cancel_level(&exchange, 5).await.is_err());
        reconcile(&mut manager, &exchange, &running()).await;
        assert!(manager.cancel_records.contains(&id));
    }

    #[tokio::test]
    async fn test_never_two_orders_per_level() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();

        for _ in 0..3 {
            for level in [2, 3, 1, 4] {
                if let Some(id) = order_at(&manager, level).and_then(|o| o.exchange_order_id.clone()) {
                    exchange.fill_order(&id).await;
                    reconcile(&mut manager, &exchange, &running()).await;
                }
            }
        }

        let open = exchange.get_open_orders(SYMBOL).await.unwrap();
        let mut seen = HashSet::new();
        for order in &open {
            let level = manager.state().find_level_by_order(&order.order_id).unwrap();
            assert!(seen.insert(level), "two open orders at level {}", level);
        }
        assert!(manager.state().verify().is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();

        let report = manager.shutdown(&exchange).await;
        assert_eq!(report.cancelled, 6);
        assert!(report.residual.is_empty());
        assert!(exchange.open_order_ids().await.is_empty());
        assert_eq!(exchange.cancel_all_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_retries_then_sweeps_and_reports_residual() {
        let (mut manager, exchange) = create_test_manager();
        manager.place_initial_grid(&exchange, &running()).await.unwrap();

        let flaky = order_at(&manager, 0).unwrap().exchange_order_id.clone().unwrap();
        let swept = order_at(&manager, 1).unwrap().exchange_order_id.clone().unwrap();
        let stuck = order_at(&manager, 2).unwrap().exchange_order_id.clone().unwrap();
        // Fails the retried first attempt (2 tries) then succeeds on the second pass
        exchange.fail_cancel(&flaky, 2).await;
        // Fails every individual cancel but the bulk sweep removes it
        exchange.fail_cancel(&swept, 10).await;
        exchange.stick_order(&stuck).await;

        let report = manager.shutdown(&exchange).await;

        assert_eq!(report.cancelled, 4);
        assert_eq!(report.swept, 1);
        assert_eq!(report.residual, vec![stuck.clone()]);
        assert_eq!(exchange.open_order_ids().await, vec![stuck]);
    }
}
