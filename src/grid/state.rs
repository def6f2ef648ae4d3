//! Grid state - level slots and the order id index

use std::collections::HashMap;

use serde::Serialize;

use super::types::{GridLevel, ManagedOrder, OrderSide, OrderStatus};

/// A level together with its current side assignment and order
#[derive(Debug, Clone)]
pub struct LevelSlot {
    pub level: GridLevel,
    /// Current assignment. Starts at `level.side`, changed by rebalancing.
    pub side: OrderSide,
    pub order: Option<ManagedOrder>,
}

impl LevelSlot {
    fn new(level: GridLevel) -> Self {
        Self {
            side: level.side,
            level,
            order: None,
        }
    }

    /// No order, or only a placeholder that was never sent
    pub fn is_free(&self) -> bool {
        self.order.as_ref().map_or(true, |o| o.awaiting_placement())
    }

    pub fn has_open_order(&self) -> bool {
        self.order.as_ref().map_or(false, |o| o.is_open())
    }

    pub fn order_id(&self) -> Option<&str> {
        self.order.as_ref().and_then(|o| o.exchange_order_id.as_deref())
    }
}

/// Live mapping of grid level to at most one order
#[derive(Debug, Clone)]
pub struct GridState {
    slots: Vec<LevelSlot>,
    /// Mapping from exchange order id to level index (for fast lookup on fills)
    order_to_level: HashMap<String, usize>,
}

impl GridState {
    pub fn new(levels: Vec<GridLevel>) -> Self {
        Self {
            slots: levels.into_iter().map(LevelSlot::new).collect(),
            order_to_level: HashMap::new(),
        }
    }

    pub fn slot(&self, index: usize) -> Option<&LevelSlot> {
        self.slots.get(index)
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> Option<&mut LevelSlot> {
        self.slots.get_mut(index)
    }

    /// Find level index by exchange order id
    pub fn find_level_by_order(&self, order_id: &str) -> Option<usize> {
        self.order_to_level.get(order_id).copied()
    }

    /// Put `order` on its level, replacing whatever was there.
    ///
    /// The level's side assignment follows the order.
    pub fn set_order(&mut self, order: ManagedOrder) {
        let index = order.level_index;
        self.clear_order(index);

        if let Some(slot) = self.slots.get_mut(index) {
            if let Some(id) = &order.exchange_order_id {
                self.order_to_level.insert(id.clone(), index);
            }
            slot.side = order.side;
            slot.order = Some(order);
        }
    }

    /// Remove and return the order at a level
    pub fn clear_order(&mut self, index: usize) -> Option<ManagedOrder> {
        let order = self.slots.get_mut(index)?.order.take()?;
        if let Some(id) = &order.exchange_order_id {
            self.order_to_level.remove(id);
        }
        Some(order)
    }

    /// (level, order id) of every order resting on the exchange
    pub fn open_order_ids(&self) -> Vec<(usize, String)> {
        self.slots
            .iter()
            .filter(|s| s.has_open_order())
            .filter_map(|s| s.order_id().map(|id| (s.level.index, id.to_string())))
            .collect()
    }

    /// Levels with no order at all
    pub fn empty_levels(&self) -> impl Iterator<Item = &LevelSlot> {
        self.slots.iter().filter(|s| s.order.is_none())
    }

    /// Levels waiting for a placement (Pending or Failed)
    pub fn awaiting_levels(&self) -> impl Iterator<Item = &LevelSlot> {
        self.slots
            .iter()
            .filter(|s| s.order.as_ref().map_or(false, |o| o.awaiting_placement()))
    }

    pub fn count_open(&self, side: OrderSide) -> usize {
        self.slots
            .iter()
            .filter(|s| s.has_open_order() && s.side == side)
            .count()
    }

    pub fn count_status(&self, status: OrderStatus) -> usize {
        self.slots
            .iter()
            .filter(|s| s.order.as_ref().map_or(false, |o| o.status == status))
            .count()
    }

    /// Check the structural invariants, returning the first violation
    pub fn verify(&self) -> Result<(), String> {
        for slot in &self.slots {
            if let Some(order) = &slot.order {
                if order.level_index != slot.level.index {
                    return Err(format!(
                        "order on level {} claims level {}",
                        slot.level.index, order.level_index
                    ));
                }
                if order.side != slot.side {
                    return Err(format!(
                        "level {} assigned {} holds a {} order",
                        slot.level.index, slot.side, order.side
                    ));
                }
                if let Some(id) = &order.exchange_order_id {
                    if self.order_to_level.get(id) != Some(&slot.level.index) {
                        return Err(format!("order {} missing from index", id));
                    }
                }
            }
        }
        if self.order_to_level.len() != self.slots.iter().filter(|s| s.order_id().is_some()).count() {
            return Err("order index out of sync with levels".into());
        }
        Ok(())
    }

    pub fn summary(&self) -> GridStateSummary {
        GridStateSummary {
            num_levels: self.slots.len(),
            open_buys: self.count_open(OrderSide::Buy),
            open_sells: self.count_open(OrderSide::Sell),
            pending: self.count_status(OrderStatus::Pending),
            failed: self.count_status(OrderStatus::Failed),
        }
    }
}

/// Summary of grid state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridStateSummary {
    pub num_levels: usize,
    pub open_buys: usize,
    pub open_sells: usize,
    pub pending: usize,
    pub failed: usize,
}
