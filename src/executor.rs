//! Grid executor
//!
//! One pass per bar, always in this order:
//! 1. recompute the zone set
//! 2. expire pending orders, releasing their locks
//! 3. fill pending orders the bar traded through
//! 4. stop-loss on breakouts beyond the protective level
//! 5. take-profit at the fixed target
//! 6. new entries on available slots
//!
//! then snapshot the books and verify capital conservation. A bar either
//! completes every step or leaves no trace: on a fatal error the ledger,
//! the store and the event log are restored to their state before the bar.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{Config, GridConfig, StopLossMode};
use crate::error::{EngineError, LedgerError, StoreError};
use crate::events::{EngineEvent, EventLog};
use crate::oms::{
    EntryFill, ExitPlan, ExitReason, FundLedger, GridPositionStore, OrderId, OrderRequest,
    PositionId, SlotStatus,
};
use crate::signals::{self, EntryContext, EntryKind, EntrySignal};
use crate::types::CandleValidationError;
use crate::zones::{LevelName, ZoneSet, ZoneSide, ZoneSource};
use crate::{Candle, Side, Symbol};

/// Steps 2-6 of the bar pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BarStep {
    Expire,
    Fill,
    StopLoss,
    TakeProfit,
    Enter,
}

pub(crate) const BAR_STEPS: [BarStep; 5] = [
    BarStep::Expire,
    BarStep::Fill,
    BarStep::StopLoss,
    BarStep::TakeProfit,
    BarStep::Enter,
];

/// Books at the end of one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BarSnapshot {
    pub bar: usize,
    pub time: DateTime<Utc>,
    pub close: Decimal,
    pub cash: Decimal,
    pub free_cash: Decimal,
    pub locked: Decimal,
    pub invested: Decimal,
    pub realized_pnl: Decimal,
    /// Cash plus open positions marked at the close
    pub equity: Decimal,
    pub open_positions: usize,
    pub pending_orders: usize,
    pub zone_count: usize,
}

pub struct GridExecutor {
    symbol: Symbol,
    grid: GridConfig,
    initial_capital: Decimal,
    bar_interval: Duration,
    zones: Box<dyn ZoneSource>,
    ledger: FundLedger,
    store: GridPositionStore,
    events: EventLog,
    snapshots: Vec<BarSnapshot>,
    current_zones: Option<ZoneSet>,
    last_bar: Option<(usize, Candle)>,
}

impl GridExecutor {
    pub fn new(config: &Config, bar_interval: Duration, zones: Box<dyn ZoneSource>) -> Self {
        let grid = config.grid.clone();
        let store = GridPositionStore::new(
            &grid.level_allocation,
            grid.enable_short,
            grid.cooldown_bars as usize,
            grid.reentry_tolerance_pct,
        );
        Self {
            symbol: config.symbol(),
            initial_capital: config.initial_capital,
            bar_interval,
            zones,
            ledger: FundLedger::new(config.initial_capital),
            store,
            events: EventLog::new(),
            snapshots: Vec::new(),
            current_zones: None,
            last_bar: None,
            grid,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn ledger(&self) -> &FundLedger {
        &self.ledger
    }

    pub fn store(&self) -> &GridPositionStore {
        &self.store
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn snapshots(&self) -> &[BarSnapshot] {
        &self.snapshots
    }

    pub fn current_zones(&self) -> Option<&ZoneSet> {
        self.current_zones.as_ref()
    }

    /// Hand back the books once the run is over
    pub fn into_parts(self) -> (FundLedger, GridPositionStore, EventLog, Vec<BarSnapshot>) {
        (self.ledger, self.store, self.events, self.snapshots)
    }

    /// Run the full six-step pass for `bar`
    pub fn process_bar(&mut self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        self.process_bar_with_order(idx, bar, &BAR_STEPS)
    }

    pub(crate) fn process_bar_with_order(
        &mut self,
        idx: usize,
        bar: &Candle,
        steps: &[BarStep],
    ) -> Result<(), EngineError> {
        self.check_bar(idx, bar)?;

        let saved = (self.ledger.clone(), self.store.clone(), self.current_zones.clone());
        let events_len = self.events.len();

        match self.run_steps(idx, bar, steps) {
            Ok(()) => {
                self.last_bar = Some((idx, bar.clone()));
                Ok(())
            }
            Err(err) => {
                error!(symbol = %self.symbol, bar = idx, error = %err, "Halting run; bar rolled back");
                (self.ledger, self.store, self.current_zones) = saved;
                self.events.truncate(events_len);
                Err(err)
            }
        }
    }

    fn check_bar(&self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        bar.validate()
            .map_err(|source| EngineError::MalformedBar { bar_index: idx, source })?;
        if let Some((_, last)) = &self.last_bar {
            if bar.datetime <= last.datetime {
                return Err(EngineError::MalformedBar {
                    bar_index: idx,
                    source: CandleValidationError::NonMonotonicTimestamp {
                        previous: last.datetime,
                        current: bar.datetime,
                    },
                });
            }
        }
        Ok(())
    }

    fn run_steps(&mut self, idx: usize, bar: &Candle, steps: &[BarStep]) -> Result<(), EngineError> {
        self.recompute_zones(idx, bar);
        for step in steps {
            match step {
                BarStep::Expire => self.expire_orders(idx, bar)?,
                BarStep::Fill => self.fill_orders(idx, bar)?,
                BarStep::StopLoss => self.check_stop_losses(idx, bar)?,
                BarStep::TakeProfit => self.check_take_profits(idx, bar)?,
                BarStep::Enter => self.enter_positions(idx, bar)?,
            }
        }
        let snapshot = self.snapshot(idx, bar);
        self.verify_books(idx)?;
        self.snapshots.push(snapshot);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Step 1: zones
    // ---------------------------------------------------------------------

    fn recompute_zones(&mut self, idx: usize, bar: &Candle) {
        let zones = self.zones.zones_at(bar.datetime, bar.close);
        debug!(bar = idx, levels = zones.len(), "Zones recomputed");
        self.events.push(EngineEvent::ZoneRecomputed {
            bar: idx,
            time: bar.datetime,
            current_price: zones.current_price,
            levels: zones.levels.clone(),
        });
        self.current_zones = Some(zones);
    }

    // ---------------------------------------------------------------------
    // Step 2: expiry
    // ---------------------------------------------------------------------

    fn expire_orders(&mut self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        for id in self.store.orders_due(bar.datetime) {
            let order = self
                .store
                .expire_order(id, bar.datetime)
                .cloned()
                .map_err(|e| self.store_error(idx, e))?;
            self.ledger
                .release(order.level_name, order.locked_amount)
                .map_err(|e| self.ledger_error(idx, e))?;
            info!(
                bar = idx,
                order = %id,
                level = %order.level_name,
                released = %order.locked_amount,
                "Pending order expired"
            );
            self.events.push(EngineEvent::OrderExpired {
                bar: idx,
                time: bar.datetime,
                order: id,
                level: order.level_name,
                released: order.locked_amount,
            });
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Step 3: fills
    // ---------------------------------------------------------------------

    fn fill_orders(&mut self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        for id in self.store.pending_order_ids() {
            let order = self.store.order(id).map_err(|e| self.store_error(idx, e))?;
            // Orders rest from the bar after they were placed
            if order.created_bar >= idx {
                continue;
            }
            let Some(price) = order.fill_price(bar.open, bar.high, bar.low) else {
                continue;
            };
            let (level, amount) = (order.level_name, order.locked_amount);

            self.ledger
                .commit(level, amount)
                .map_err(|e| self.ledger_error(idx, e))?;
            let position = self
                .store
                .fill_order(id, price, self.grid.fee_rate, bar.datetime, idx)
                .map_err(|e| self.store_error(idx, e))?;

            info!(bar = idx, order = %id, position = %position, level = %level, price = %price, "Pending order filled");
            self.events.push(EngineEvent::OrderFilled {
                bar: idx,
                time: bar.datetime,
                order: id,
                position,
                level,
                fill_price: price,
                amount,
            });
            self.push_opened(idx, bar.datetime, position)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Step 4: stop-loss
    // ---------------------------------------------------------------------

    fn check_stop_losses(&mut self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        for id in self.store.open_position_ids() {
            let position = self
                .store
                .position(id)
                .map_err(|e| self.store_error(idx, e))?;
            let (side, level, stop, protective) = (
                position.side,
                position.level_name,
                position.stop_price,
                position.protective_level,
            );

            let hard_breakout = match side {
                Side::Long => bar.low < stop,
                Side::Short => bar.high > stop,
            };
            if hard_breakout {
                self.close_position(idx, bar.datetime, id, stop, ExitReason::StopLoss)?;
                continue;
            }

            let StopLossMode::TwoStage { confirm_bars } = self.grid.stop_loss_mode else {
                continue;
            };
            let closed_beyond = match side {
                Side::Long => bar.close < protective,
                Side::Short => bar.close > protective,
            };
            if !closed_beyond {
                if position.stop_warnings > 0 {
                    self.store
                        .clear_stop_warnings(id)
                        .map_err(|e| self.store_error(idx, e))?;
                }
                continue;
            }

            let warnings = self
                .store
                .warn_stop(id)
                .map_err(|e| self.store_error(idx, e))?;
            if warnings >= confirm_bars {
                self.close_position(idx, bar.datetime, id, bar.close, ExitReason::StopLoss)?;
            } else {
                warn!(bar = idx, position = %id, level = %level, close = %bar.close, warnings, "Close beyond protective level");
                self.events.push(EngineEvent::StopWarning {
                    bar: idx,
                    time: bar.datetime,
                    position: id,
                    level,
                    close: bar.close,
                    warnings,
                });
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Step 5: take-profit
    // ---------------------------------------------------------------------

    fn check_take_profits(&mut self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        for id in self.store.open_position_ids() {
            let position = self
                .store
                .position(id)
                .map_err(|e| self.store_error(idx, e))?;
            let target = position.target_price;
            let reached = match position.side {
                Side::Long => bar.high >= target,
                Side::Short => bar.low <= target,
            };
            if reached {
                self.close_position(idx, bar.datetime, id, target, ExitReason::TakeProfit)?;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Step 6: entries
    // ---------------------------------------------------------------------

    fn enter_positions(&mut self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        let Some(zones) = self.current_zones.clone() else {
            return Ok(());
        };
        if let Err(err) = zones.ensure_usable() {
            debug!(bar = idx, %err, "No entries this bar");
            return Ok(());
        }

        for zone in &zones.levels {
            let level = zone.name;
            let Some(slot) = self.store.slot(level) else {
                continue;
            };
            if !slot.enabled || slot.status != SlotStatus::Available {
                continue;
            }
            let ctx = EntryContext {
                level,
                level_price: zone.price,
                bar,
            };
            let Some(signal) = signals::evaluate(&self.grid.entry_rule, &ctx) else {
                continue;
            };

            match self.store.can_enter(level, signal.price, idx) {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => {
                    self.skip_entry(idx, bar.datetime, level, err.to_string());
                    continue;
                }
                Err(err) => return Err(self.store_error(idx, err)),
            }

            let cap = self.grid.level_allocation.fraction(level) * self.initial_capital;
            let amount = self.ledger.available_to_enter(level, cap);
            if amount <= Decimal::ZERO || amount < self.grid.min_order_value {
                let err = LedgerError::InsufficientFunds {
                    level,
                    requested: self.grid.min_order_value,
                    available: amount,
                };
                self.skip_entry(idx, bar.datetime, level, err.to_string());
                continue;
            }

            let plan = self.exit_plan(&zones, &signal);
            match signal.kind {
                EntryKind::Immediate => self.enter_now(idx, bar, &signal, amount, cap, plan)?,
                EntryKind::Pending => self.place_order(idx, bar, &signal, amount, cap, plan)?,
            }
        }
        Ok(())
    }

    fn enter_now(
        &mut self,
        idx: usize,
        bar: &Candle,
        signal: &EntrySignal,
        amount: Decimal,
        cap: Decimal,
        plan: ExitPlan,
    ) -> Result<(), EngineError> {
        match self.ledger.enter_direct(signal.level, amount, cap) {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                self.skip_entry(idx, bar.datetime, signal.level, err.to_string());
                return Ok(());
            }
            Err(err) => return Err(self.ledger_error(idx, err)),
        }
        let position = self
            .store
            .open_position(EntryFill {
                level: signal.level,
                price: signal.price,
                amount,
                fee_rate: self.grid.fee_rate,
                time: bar.datetime,
                bar: idx,
                exit_plan: plan,
            })
            .map_err(|e| self.store_error(idx, e))?;
        self.push_opened(idx, bar.datetime, position)
    }

    fn place_order(
        &mut self,
        idx: usize,
        bar: &Candle,
        signal: &EntrySignal,
        amount: Decimal,
        cap: Decimal,
        plan: ExitPlan,
    ) -> Result<(), EngineError> {
        match self.ledger.lock(signal.level, amount, cap) {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                self.skip_entry(idx, bar.datetime, signal.level, err.to_string());
                return Ok(());
            }
            Err(err) => return Err(self.ledger_error(idx, err)),
        }
        let expire_time = bar.datetime + self.bar_interval * self.grid.pending_order_ttl_bars as i32;
        let order = self
            .store
            .create_order(OrderRequest {
                level: signal.level,
                limit_price: signal.price,
                locked_amount: amount,
                time: bar.datetime,
                bar: idx,
                expire_time,
                exit_plan: plan,
            })
            .map_err(|e| self.store_error(idx, e))?;

        info!(bar = idx, order = %order, level = %signal.level, limit = %signal.price, locked = %amount, "Pending order placed");
        self.events.push(EngineEvent::OrderCreated {
            bar: idx,
            time: bar.datetime,
            order,
            level: signal.level,
            side: signal.side.entry_order(),
            limit_price: signal.price,
            locked_amount: amount,
            expire_time,
        });
        Ok(())
    }

    /// Target is the nearest level on the far side, else its outer level,
    /// else a fixed distance; the stop guards the outer level of the own side
    fn exit_plan(&self, zones: &ZoneSet, signal: &EntrySignal) -> ExitPlan {
        let side = signal.level.zone_side();
        let opposite = side.opposite();
        let entry = signal.price;
        let in_profit = |price: Decimal| match signal.side {
            Side::Long => price > entry,
            Side::Short => price < entry,
        };

        let target_price = [LevelName::inner(opposite), LevelName::outer(opposite)]
            .into_iter()
            .filter_map(|name| zones.price(name))
            .find(|price| in_profit(*price))
            .unwrap_or_else(|| match signal.side {
                Side::Long => entry * (Decimal::ONE + self.grid.fallback_target_pct),
                Side::Short => entry * (Decimal::ONE - self.grid.fallback_target_pct),
            });

        let protective_level = zones
            .furthest(side)
            .map(|z| z.price)
            .unwrap_or(entry);
        let buffer = self.grid.stop_loss_buffer_pct;
        let stop_price = match side {
            ZoneSide::Support => protective_level * (Decimal::ONE - buffer),
            ZoneSide::Resistance => protective_level * (Decimal::ONE + buffer),
        };

        ExitPlan {
            target_price,
            protective_level,
            stop_price,
        }
    }

    // ---------------------------------------------------------------------
    // Settlement
    // ---------------------------------------------------------------------

    /// Cancel what is still pending and close what is still open at the last
    /// processed close. The last snapshot is replaced by the settled books.
    pub fn finish(&mut self) -> Result<(), EngineError> {
        let Some((idx, bar)) = self.last_bar.clone() else {
            return Ok(());
        };
        let saved = (self.ledger.clone(), self.store.clone());
        let events_len = self.events.len();

        let result = self.settle(idx, &bar);
        if let Err(err) = result {
            error!(symbol = %self.symbol, bar = idx, error = %err, "Settlement failed; books rolled back");
            (self.ledger, self.store) = saved;
            self.events.truncate(events_len);
            return Err(err);
        }
        Ok(())
    }

    fn settle(&mut self, idx: usize, bar: &Candle) -> Result<(), EngineError> {
        for id in self.store.pending_order_ids() {
            self.cancel_order(idx, bar.datetime, id)?;
        }
        for id in self.store.open_position_ids() {
            self.close_position(idx, bar.datetime, id, bar.close, ExitReason::EndOfData)?;
        }
        let snapshot = self.snapshot(idx, bar);
        self.verify_books(idx)?;
        match self.snapshots.last_mut() {
            Some(last) if last.bar == idx => *last = snapshot,
            _ => self.snapshots.push(snapshot),
        }
        Ok(())
    }

    fn cancel_order(&mut self, idx: usize, time: DateTime<Utc>, id: OrderId) -> Result<(), EngineError> {
        let order = self
            .store
            .cancel_order(id, time)
            .cloned()
            .map_err(|e| self.store_error(idx, e))?;
        self.ledger
            .release(order.level_name, order.locked_amount)
            .map_err(|e| self.ledger_error(idx, e))?;
        debug!(bar = idx, order = %id, released = %order.locked_amount, "Pending order cancelled");
        self.events.push(EngineEvent::OrderCancelled {
            bar: idx,
            time,
            order: id,
            level: order.level_name,
            released: order.locked_amount,
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Shared helpers
    // ---------------------------------------------------------------------

    fn close_position(
        &mut self,
        idx: usize,
        time: DateTime<Utc>,
        id: PositionId,
        price: Decimal,
        reason: ExitReason,
    ) -> Result<(), EngineError> {
        let position = self
            .store
            .position(id)
            .map_err(|e| self.store_error(idx, e))?;
        let (level, side, cost_basis) = (position.level_name, position.side, position.cost_basis);
        let proceeds = position.exit_proceeds(price, self.grid.fee_rate);

        let pnl = self
            .ledger
            .realize(level, cost_basis, proceeds)
            .map_err(|e| self.ledger_error(idx, e))?;
        self.store
            .close_position(id, price, time, idx, reason, pnl)
            .map(|_| ())
            .map_err(|e| self.store_error(idx, e))?;

        info!(
            bar = idx,
            position = %id,
            level = %level,
            side = %side,
            price = %price,
            pnl = %pnl,
            reason = %reason,
            "Position closed"
        );
        self.events.push(EngineEvent::PositionClosed {
            bar: idx,
            time,
            position: id,
            level,
            side,
            close_price: price,
            pnl,
            reason,
        });
        Ok(())
    }

    fn push_opened(&mut self, idx: usize, time: DateTime<Utc>, id: PositionId) -> Result<(), EngineError> {
        let p = self
            .store
            .position(id)
            .map_err(|e| self.store_error(idx, e))?;
        info!(
            bar = idx,
            position = %id,
            level = %p.level_name,
            side = %p.side,
            price = %p.entry_price,
            cost = %p.cost_basis,
            target = %p.target_price,
            stop = %p.stop_price,
            "Position opened"
        );
        let event = EngineEvent::PositionOpened {
            bar: idx,
            time,
            position: id,
            level: p.level_name,
            side: p.side,
            entry_price: p.entry_price,
            quantity: p.quantity,
            cost_basis: p.cost_basis,
            target_price: p.target_price,
            stop_price: p.stop_price,
        };
        self.events.push(event);
        Ok(())
    }

    fn skip_entry(&mut self, idx: usize, time: DateTime<Utc>, level: LevelName, reason: String) {
        debug!(bar = idx, level = %level, reason = %reason, "Entry skipped");
        self.events.push(EngineEvent::EntrySkipped {
            bar: idx,
            time,
            level,
            reason,
        });
    }

    fn snapshot(&self, idx: usize, bar: &Candle) -> BarSnapshot {
        let marked: Decimal = self
            .store
            .open_positions()
            .map(|p| p.market_value(bar.close))
            .sum();
        BarSnapshot {
            bar: idx,
            time: bar.datetime,
            close: bar.close,
            cash: self.ledger.cash(),
            free_cash: self.ledger.free_cash(),
            locked: self.ledger.total_locked(),
            invested: self.ledger.total_invested(),
            realized_pnl: self.ledger.realized_pnl(),
            equity: self.ledger.cash() + marked,
            open_positions: self.store.open_positions().count(),
            pending_orders: self.store.pending_orders().count(),
            zone_count: self.current_zones.as_ref().map_or(0, ZoneSet::len),
        }
    }

    /// Ledger totals must balance and agree with the store, level by level
    fn verify_books(&self, idx: usize) -> Result<(), EngineError> {
        let violation = |detail: String| EngineError::InvariantViolation {
            bar_index: idx,
            snapshot: self.ledger.snapshot(),
            detail,
        };
        self.ledger.check_conservation().map_err(violation)?;

        let open_cost = self.store.open_cost_by_level();
        let pending = self.store.pending_locked_by_level();
        for level in LevelName::ALL {
            let cost = open_cost.get(&level).copied().unwrap_or_default();
            if cost != self.ledger.invested(level) {
                return Err(violation(format!(
                    "{level}: open cost basis {cost} != invested {}",
                    self.ledger.invested(level)
                )));
            }
            let locked = pending.get(&level).copied().unwrap_or_default();
            if locked != self.ledger.locked(level) {
                return Err(violation(format!(
                    "{level}: pending locks {locked} != locked {}",
                    self.ledger.locked(level)
                )));
            }
        }
        Ok(())
    }

    fn ledger_error(&self, idx: usize, source: LedgerError) -> EngineError {
        EngineError::Ledger {
            bar_index: idx,
            snapshot: self.ledger.snapshot(),
            source,
        }
    }

    fn store_error(&self, idx: usize, source: StoreError) -> EngineError {
        EngineError::Store {
            bar_index: idx,
            snapshot: self.ledger.snapshot(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::EntryRule;
    use crate::zones::StaticZones;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t(bar: usize) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::hours(bar as i64)
    }

    fn candle(bar: usize, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle::new_unchecked(t(bar), open, high, low, close, dec!(10))
    }

    fn config(rule: EntryRule) -> Config {
        let mut config: Config = serde_json::from_str(
            r#"{ "symbol": "BTCUSDT", "interval": "1h", "initial_capital": 10000 }"#,
        )
        .unwrap();
        config.grid.entry_rule = rule;
        config
    }

    fn executor(rule: EntryRule, levels: Vec<(LevelName, Decimal)>) -> GridExecutor {
        GridExecutor::new(
            &config(rule),
            Duration::hours(1),
            Box::new(StaticZones::new(levels)),
        )
    }

    fn grid_levels() -> Vec<(LevelName, Decimal)> {
        vec![
            (LevelName::Support2, dec!(90)),
            (LevelName::Support1, dec!(100)),
            (LevelName::Resistance1, dec!(110)),
        ]
    }

    #[test]
    fn test_touch_opens_long_with_zone_exits() {
        let mut ex = executor(EntryRule::Touch, grid_levels());
        ex.process_bar(0, &candle(0, dec!(101), dec!(102), dec!(99.5), dec!(101)))
            .unwrap();

        let position = ex.store().open_positions().next().unwrap().clone();
        assert_eq!(position.level_name, LevelName::Support1);
        assert_eq!(position.entry_price, dec!(100));
        assert_eq!(position.cost_basis, dec!(2000));
        assert_eq!(position.target_price, dec!(110));
        assert_eq!(position.protective_level, dec!(90));
        assert_eq!(position.stop_price, dec!(87.30));
        assert_eq!(ex.ledger().cash(), dec!(8000));
        assert_eq!(ex.snapshots().len(), 1);
    }

    #[test]
    fn test_take_profit_at_target() {
        let mut ex = executor(EntryRule::Touch, grid_levels());
        ex.process_bar(0, &candle(0, dec!(101), dec!(102), dec!(99.5), dec!(101)))
            .unwrap();
        ex.process_bar(1, &candle(1, dec!(104), dec!(109), dec!(103), dec!(108)))
            .unwrap();
        assert_eq!(ex.store().open_positions().count(), 1);

        ex.process_bar(2, &candle(2, dec!(105), dec!(110.5), dec!(104), dec!(105)))
            .unwrap();
        let closed = &ex.store().positions()[0];
        assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
        assert_eq!(closed.close_price, Some(dec!(110)));
        assert!(closed.realized_pnl.unwrap() > Decimal::ZERO);

        // The same bar reaches resistance_1 after the long is out
        let short = &ex.store().positions()[1];
        assert_eq!(short.side, Side::Short);
        assert_eq!(short.entry_price, dec!(110));
        assert_eq!(short.target_price, dec!(100));
        assert_eq!(short.stop_price, dec!(113.30));
    }

    #[test]
    fn test_two_stage_stop_confirms_after_warnings() {
        let mut ex = executor(EntryRule::Touch, grid_levels());
        ex.process_bar(0, &candle(0, dec!(101), dec!(102), dec!(99.5), dec!(101)))
            .unwrap();
        // Closes under 90 without reaching the 87.3 hard stop. The long that
        // support_2 opens on bar 1 collects warnings of its own.
        for bar in 1..=3 {
            ex.process_bar(bar, &candle(bar, dec!(91), dec!(91.5), dec!(88), dec!(89)))
                .unwrap();
        }
        let first = &ex.store().positions()[0];
        assert_eq!(first.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(first.close_price, Some(dec!(89)));
        assert_eq!(first.close_bar, Some(3));
        assert_eq!(ex.events().count("stop_warning"), 4);
    }

    #[test]
    fn test_single_threshold_ignores_closes() {
        let mut cfg = config(EntryRule::Touch);
        cfg.grid.stop_loss_mode = StopLossMode::SingleThreshold;
        let mut ex = GridExecutor::new(&cfg, Duration::hours(1), Box::new(StaticZones::new(grid_levels())));
        ex.process_bar(0, &candle(0, dec!(101), dec!(102), dec!(99.5), dec!(101)))
            .unwrap();
        for bar in 1..=5 {
            ex.process_bar(bar, &candle(bar, dec!(91), dec!(91.5), dec!(88), dec!(89)))
                .unwrap();
        }
        assert!(ex.store().positions()[0].is_open());
        assert_eq!(ex.events().count("stop_warning"), 0);
    }

    #[test]
    fn test_malformed_bar_halts_without_side_effects() {
        let mut ex = executor(EntryRule::Touch, grid_levels());
        ex.process_bar(0, &candle(0, dec!(101), dec!(102), dec!(99.5), dec!(101)))
            .unwrap();
        let before = ex.ledger().clone();

        let bad = candle(1, dec!(100), dec!(95), dec!(99), dec!(98));
        let err = ex.process_bar(1, &bad).unwrap_err();
        assert!(matches!(err, EngineError::MalformedBar { bar_index: 1, .. }));

        let stale = candle(0, dec!(100), dec!(101), dec!(99), dec!(100));
        assert!(matches!(
            ex.process_bar(1, &stale),
            Err(EngineError::MalformedBar { .. })
        ));
        assert_eq!(ex.ledger(), &before);
        assert_eq!(ex.snapshots().len(), 1);
    }

    #[test]
    fn test_open_below_low_is_malformed() {
        let mut ex = executor(EntryRule::Touch, grid_levels());
        let impossible = candle(0, dec!(50), dec!(110), dec!(99), dec!(105));
        let err = ex.process_bar(0, &impossible).unwrap_err();
        assert!(matches!(
            err,
            EngineError::MalformedBar {
                bar_index: 0,
                source: CandleValidationError::OpenOutOfRange { .. },
                ..
            }
        ));
        assert!(ex.store().positions().is_empty());
        assert_eq!(ex.ledger().cash(), dec!(10000));
        assert!(ex.snapshots().is_empty());
    }

    #[test]
    fn test_no_zones_still_runs_exits() {
        let mut ex = executor(EntryRule::Touch, Vec::new());
        ex.process_bar(0, &candle(0, dec!(101), dec!(102), dec!(99.5), dec!(101)))
            .unwrap();
        assert_eq!(ex.store().positions().len(), 0);
        assert_eq!(ex.snapshots()[0].zone_count, 0);
    }

    #[test]
    fn test_finish_cancels_and_closes() {
        let mut ex = executor(EntryRule::Proximity { pct: dec!(0.02) }, grid_levels());
        // Close 101 sits within 2% of support_1: a buy limit rests at 100
        ex.process_bar(0, &candle(0, dec!(101), dec!(101.5), dec!(100.5), dec!(101)))
            .unwrap();
        assert_eq!(ex.ledger().total_locked(), dec!(2000));

        ex.finish().unwrap();
        assert_eq!(ex.ledger().total_locked(), Decimal::ZERO);
        assert_eq!(ex.ledger().cash(), dec!(10000));
        assert_eq!(ex.events().count("order_cancelled"), 1);
        assert_eq!(ex.snapshots().len(), 1);
        assert_eq!(ex.snapshots()[0].locked, Decimal::ZERO);
    }

    #[test]
    fn test_expiry_before_entries_matters() {
        let levels = vec![(LevelName::Support1, dec!(100)), (LevelName::Resistance1, dec!(120))];
        let rule = EntryRule::Proximity { pct: dec!(0.02) };
        let bars: Vec<Candle> = (0..3)
            .map(|i| candle(i, dec!(101), dec!(101.5), dec!(100.5), dec!(101)))
            .collect();

        let mut cfg = config(rule);
        cfg.grid.pending_order_ttl_bars = 2;

        let mut ordered = GridExecutor::new(&cfg, Duration::hours(1), Box::new(StaticZones::new(levels.clone())));
        let mut reordered = GridExecutor::new(&cfg, Duration::hours(1), Box::new(StaticZones::new(levels)));
        let wrong = [
            BarStep::Enter,
            BarStep::Expire,
            BarStep::Fill,
            BarStep::StopLoss,
            BarStep::TakeProfit,
        ];
        for (i, bar) in bars.iter().enumerate() {
            ordered.process_bar(i, bar).unwrap();
            reordered.process_bar_with_order(i, bar, &wrong).unwrap();
        }

        // Expiring first frees the slot for a fresh order on the same bar
        assert_eq!(ordered.ledger().total_locked(), dec!(2000));
        assert_eq!(ordered.store().orders().len(), 2);
        assert_eq!(reordered.ledger().total_locked(), Decimal::ZERO);
        assert_eq!(reordered.store().orders().len(), 1);
    }

    #[test]
    fn test_stop_loss_before_take_profit_matters() {
        let wide = candle(1, dec!(100), dec!(111), dec!(85), dec!(100));
        let open = candle(0, dec!(101), dec!(102), dec!(99.5), dec!(101));

        let mut ordered = executor(EntryRule::Touch, grid_levels());
        ordered.process_bar(0, &open).unwrap();
        ordered.process_bar(1, &wide).unwrap();

        let mut reordered = executor(EntryRule::Touch, grid_levels());
        reordered.process_bar(0, &open).unwrap();
        reordered
            .process_bar_with_order(
                1,
                &wide,
                &[
                    BarStep::Expire,
                    BarStep::Fill,
                    BarStep::TakeProfit,
                    BarStep::StopLoss,
                    BarStep::Enter,
                ],
            )
            .unwrap();

        let first = &ordered.store().positions()[0];
        assert_eq!(first.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(first.close_price, Some(dec!(87.30)));
        assert_eq!(
            reordered.store().positions()[0].exit_reason,
            Some(ExitReason::TakeProfit)
        );
        assert_ne!(
            ordered.ledger().realized_pnl(),
            reordered.ledger().realized_pnl()
        );
    }
}
