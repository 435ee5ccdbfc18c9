//! Grid position store
//!
//! Owns the four level slots, every position ever opened and every pending
//! order ever placed. Closed positions and terminal orders are kept as
//! history; the cooldown rule reads them back.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::debug;

use crate::config::LevelAllocation;
use crate::error::StoreError;
use crate::oms::types::{
    ExitPlan, ExitReason, FundStatus, GridLevelSlot, OrderId, OrderStatus, PendingOrder, Position,
    PositionId, PositionStatus, SlotStatus,
};
use crate::zones::{LevelName, ZoneSide};
use crate::Side;

/// Everything needed to open a position
#[derive(Debug, Clone)]
pub struct EntryFill {
    pub level: LevelName,
    pub price: Decimal,
    /// Committed cash, entry fee included
    pub amount: Decimal,
    pub fee_rate: Decimal,
    pub time: DateTime<Utc>,
    pub bar: usize,
    pub exit_plan: ExitPlan,
}

/// Everything needed to rest a limit order
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub level: LevelName,
    pub limit_price: Decimal,
    pub locked_amount: Decimal,
    pub time: DateTime<Utc>,
    pub bar: usize,
    pub expire_time: DateTime<Utc>,
    pub exit_plan: ExitPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridPositionStore {
    slots: BTreeMap<LevelName, GridLevelSlot>,
    positions: Vec<Position>,
    orders: Vec<PendingOrder>,
    cooldown_bars: usize,
    reentry_tolerance: Decimal,
}

impl GridPositionStore {
    pub fn new(
        allocation: &LevelAllocation,
        enable_short: bool,
        cooldown_bars: usize,
        reentry_tolerance: Decimal,
    ) -> Self {
        let slots = LevelName::ALL
            .iter()
            .map(|&level| {
                let slot = GridLevelSlot {
                    level_name: level,
                    side: level.position_side(),
                    allocated_fraction: allocation.fraction(level),
                    status: SlotStatus::Available,
                    enabled: enable_short || level.zone_side() == ZoneSide::Support,
                };
                (level, slot)
            })
            .collect();
        Self {
            slots,
            positions: Vec::new(),
            orders: Vec::new(),
            cooldown_bars,
            reentry_tolerance,
        }
    }

    pub fn slot(&self, level: LevelName) -> Option<&GridLevelSlot> {
        self.slots.get(&level)
    }

    pub fn slots(&self) -> impl Iterator<Item = &GridLevelSlot> {
        self.slots.values()
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn orders(&self) -> &[PendingOrder] {
        &self.orders
    }

    pub fn position(&self, id: PositionId) -> Result<&Position, StoreError> {
        self.positions.get(id.0).ok_or(StoreError::UnknownPosition(id))
    }

    pub fn order(&self, id: OrderId) -> Result<&PendingOrder, StoreError> {
        self.orders.get(id.0).ok_or(StoreError::UnknownOrder(id))
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.is_open())
    }

    pub fn pending_orders(&self) -> impl Iterator<Item = &PendingOrder> {
        self.orders.iter().filter(|o| o.is_pending())
    }

    pub fn open_position_ids(&self) -> Vec<PositionId> {
        self.open_positions().map(|p| p.id).collect()
    }

    pub fn pending_order_ids(&self) -> Vec<OrderId> {
        self.pending_orders().map(|o| o.id).collect()
    }

    /// Pending orders whose expiry is due at `bar_time`
    pub fn orders_due(&self, bar_time: DateTime<Utc>) -> Vec<OrderId> {
        self.orders
            .iter()
            .filter(|o| o.is_due(bar_time))
            .map(|o| o.id)
            .collect()
    }

    /// Cost basis of open positions per level
    pub fn open_cost_by_level(&self) -> BTreeMap<LevelName, Decimal> {
        let mut totals = BTreeMap::new();
        for p in self.open_positions() {
            *totals.entry(p.level_name).or_insert(Decimal::ZERO) += p.cost_basis;
        }
        totals
    }

    /// Locked amounts of pending orders per level
    pub fn pending_locked_by_level(&self) -> BTreeMap<LevelName, Decimal> {
        let mut totals = BTreeMap::new();
        for o in self.pending_orders() {
            *totals.entry(o.level_name).or_insert(Decimal::ZERO) += o.locked_amount;
        }
        totals
    }

    /// Reject entries into a busy or disabled slot, or back into a level
    /// that closed within the cooldown at nearly the same entry price
    pub fn can_enter(
        &self,
        level: LevelName,
        candidate_price: Decimal,
        bar: usize,
    ) -> Result<(), StoreError> {
        let slot = self.slot(level).ok_or(StoreError::SlotDisabled(level))?;
        if !slot.enabled {
            return Err(StoreError::SlotDisabled(level));
        }
        if slot.status != SlotStatus::Available {
            return Err(StoreError::SlotOccupied {
                level,
                status: slot.status,
            });
        }
        if let Some(recent) = self.cooldown_blocker(level, slot.side, candidate_price, bar) {
            return Err(StoreError::CooldownActive {
                level,
                position: recent.id,
                closed_bar: recent.close_bar.unwrap_or(bar),
            });
        }
        Ok(())
    }

    fn cooldown_blocker(
        &self,
        level: LevelName,
        side: Side,
        candidate_price: Decimal,
        bar: usize,
    ) -> Option<&Position> {
        self.positions.iter().rev().find(|p| {
            let Some(closed) = p.close_bar else {
                return false;
            };
            if p.level_name != level || p.side != side {
                return false;
            }
            if bar < closed || bar >= closed + self.cooldown_bars {
                return false;
            }
            p.entry_price > Decimal::ZERO
                && (candidate_price - p.entry_price).abs() / p.entry_price <= self.reentry_tolerance
        })
    }

    /// Open a position directly (immediate entries)
    pub fn open_position(&mut self, fill: EntryFill) -> Result<PositionId, StoreError> {
        self.can_enter(fill.level, fill.price, fill.bar)?;
        Ok(self.insert_position(fill, None))
    }

    fn insert_position(&mut self, fill: EntryFill, order: Option<OrderId>) -> PositionId {
        let id = PositionId(self.positions.len());
        let quantity = fill.amount / (fill.price * (Decimal::ONE + fill.fee_rate));
        let side = fill.level.position_side();
        self.positions.push(Position {
            id,
            side,
            level_name: fill.level,
            entry_price: fill.price,
            entry_time: fill.time,
            entry_bar: fill.bar,
            quantity,
            cost_basis: fill.amount,
            target_price: fill.exit_plan.target_price,
            stop_price: fill.exit_plan.stop_price,
            protective_level: fill.exit_plan.protective_level,
            status: PositionStatus::Open,
            close_price: None,
            close_time: None,
            close_bar: None,
            realized_pnl: None,
            exit_reason: None,
            stop_warnings: 0,
            order,
        });
        if let Some(slot) = self.slots.get_mut(&fill.level) {
            slot.status = SlotStatus::Filled;
        }
        debug!(position = %id, level = %fill.level, side = %side, price = %fill.price, "Position opened");
        id
    }

    /// Record a close and free the slot
    pub fn close_position(
        &mut self,
        id: PositionId,
        price: Decimal,
        time: DateTime<Utc>,
        bar: usize,
        reason: ExitReason,
        pnl: Decimal,
    ) -> Result<&Position, StoreError> {
        let position = self
            .positions
            .get_mut(id.0)
            .ok_or(StoreError::UnknownPosition(id))?;
        if !position.is_open() {
            return Err(StoreError::PositionAlreadyClosed(id));
        }
        position.status = PositionStatus::Closed;
        position.close_price = Some(price);
        position.close_time = Some(time);
        position.close_bar = Some(bar);
        position.realized_pnl = Some(pnl);
        position.exit_reason = Some(reason);
        if let Some(slot) = self.slots.get_mut(&position.level_name) {
            slot.status = SlotStatus::Available;
        }
        Ok(&self.positions[id.0])
    }

    /// Count a warned close for the two-stage stop; returns the new count
    pub fn warn_stop(&mut self, id: PositionId) -> Result<u32, StoreError> {
        let position = self.open_position_mut(id)?;
        position.stop_warnings += 1;
        Ok(position.stop_warnings)
    }

    pub fn clear_stop_warnings(&mut self, id: PositionId) -> Result<(), StoreError> {
        self.open_position_mut(id)?.stop_warnings = 0;
        Ok(())
    }

    fn open_position_mut(&mut self, id: PositionId) -> Result<&mut Position, StoreError> {
        let position = self
            .positions
            .get_mut(id.0)
            .ok_or(StoreError::UnknownPosition(id))?;
        if !position.is_open() {
            return Err(StoreError::PositionAlreadyClosed(id));
        }
        Ok(position)
    }

    /// Rest a limit order; the slot is reserved until the order resolves
    pub fn create_order(&mut self, request: OrderRequest) -> Result<OrderId, StoreError> {
        self.can_enter(request.level, request.limit_price, request.bar)?;
        let id = OrderId(self.orders.len());
        self.orders.push(PendingOrder {
            id,
            order_type: request.level.position_side().entry_order(),
            level_name: request.level,
            target_price: request.limit_price,
            locked_amount: request.locked_amount,
            created_time: request.time,
            created_bar: request.bar,
            expire_time: request.expire_time,
            status: OrderStatus::Pending,
            fund_status: FundStatus::Locked,
            exit_plan: request.exit_plan,
            resolved_time: None,
            position: None,
        });
        if let Some(slot) = self.slots.get_mut(&request.level) {
            slot.status = SlotStatus::Pending;
        }
        Ok(id)
    }

    /// Mark a pending order filled and open its position at `price`
    pub fn fill_order(
        &mut self,
        id: OrderId,
        price: Decimal,
        fee_rate: Decimal,
        time: DateTime<Utc>,
        bar: usize,
    ) -> Result<PositionId, StoreError> {
        let order = self.resolve(id, OrderStatus::Filled, time)?;
        let fill = EntryFill {
            level: order.level_name,
            price,
            amount: order.locked_amount,
            fee_rate,
            time,
            bar,
            exit_plan: order.exit_plan,
        };
        let position = self.insert_position(fill, Some(id));
        self.orders[id.0].position = Some(position);
        Ok(position)
    }

    /// Expire a pending order; returns it so the caller can release its funds
    pub fn expire_order(&mut self, id: OrderId, time: DateTime<Utc>) -> Result<&PendingOrder, StoreError> {
        self.resolve(id, OrderStatus::Expired, time)?;
        self.free_slot(id);
        Ok(&self.orders[id.0])
    }

    pub fn cancel_order(&mut self, id: OrderId, time: DateTime<Utc>) -> Result<&PendingOrder, StoreError> {
        self.resolve(id, OrderStatus::Cancelled, time)?;
        self.free_slot(id);
        Ok(&self.orders[id.0])
    }

    /// Single pending -> terminal transition; funds flip to released here and only here
    fn resolve(
        &mut self,
        id: OrderId,
        status: OrderStatus,
        time: DateTime<Utc>,
    ) -> Result<PendingOrder, StoreError> {
        let order = self
            .orders
            .get_mut(id.0)
            .ok_or(StoreError::UnknownOrder(id))?;
        if order.status != OrderStatus::Pending || order.fund_status != FundStatus::Locked {
            return Err(StoreError::OrderNotPending {
                id,
                status: order.status,
            });
        }
        order.status = status;
        order.fund_status = FundStatus::Released;
        order.resolved_time = Some(time);
        Ok(order.clone())
    }

    fn free_slot(&mut self, id: OrderId) {
        let level = self.orders[id.0].level_name;
        if let Some(slot) = self.slots.get_mut(&level) {
            slot.status = SlotStatus::Available;
        }
    }
}
