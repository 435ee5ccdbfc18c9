//! Core OMS types
//!
//! Positions and pending orders live in id-indexed tables inside the
//! position store; ids are the row index, so they are dense, deterministic
//! and never reused. All money is `Decimal`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::zones::LevelName;
use crate::{OrderSide, Side};

/// Position ID - index into the store's position table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(pub usize);

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Order ID - index into the store's order table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub usize);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "O{}", self.0)
    }
}

/// Level slot state machine: Available -> Pending -> Filled -> Available,
/// or Available -> Filled directly for immediate entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Available,
    /// Reserved by a pending order
    Pending,
    /// Holding an open position
    Filled,
}

/// One fixed capital bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevelSlot {
    pub level_name: LevelName,
    pub side: Side,
    pub allocated_fraction: Decimal,
    pub status: SlotStatus,
    /// Short slots are disabled when shorting is off
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    /// Closed at the last close when the data ran out
    EndOfData,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "stop_loss"),
            ExitReason::TakeProfit => write!(f, "take_profit"),
            ExitReason::EndOfData => write!(f, "end_of_data"),
        }
    }
}

/// Exit levels fixed when the entry decision is made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub target_price: Decimal,
    /// Outer zone level the position is protected by
    pub protective_level: Decimal,
    /// Hard breakout price, `protective_level` pushed out by the stop buffer
    pub stop_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub side: Side,
    pub level_name: LevelName,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub entry_bar: usize,
    pub quantity: Decimal,
    /// Cash committed, entry fee included
    pub cost_basis: Decimal,
    pub target_price: Decimal,
    pub stop_price: Decimal,
    pub protective_level: Decimal,
    pub status: PositionStatus,
    pub close_price: Option<Decimal>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_bar: Option<usize>,
    pub realized_pnl: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    /// Consecutive closes beyond the protective level (two-stage stop)
    pub stop_warnings: u32,
    /// Order this position was filled from, if any
    pub order: Option<OrderId>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Value returned to cash when closing at `exit_price`, exit fee deducted.
    /// A short's payout is its collateral plus the price difference and
    /// cannot go below zero.
    pub fn exit_proceeds(&self, exit_price: Decimal, fee_rate: Decimal) -> Decimal {
        let exit_fee = self.quantity * exit_price * fee_rate;
        let gross = match self.side {
            Side::Long => self.quantity * exit_price,
            Side::Short => self.quantity * (self.entry_price * Decimal::TWO - exit_price),
        };
        (gross - exit_fee).max(Decimal::ZERO)
    }

    /// Mark-to-market value at `price`, ignoring exit fees
    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.exit_proceeds(price, Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Filled,
    Expired,
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        self != OrderStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundStatus {
    Locked,
    Released,
}

/// Resting limit order whose notional is locked but not yet invested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: OrderId,
    pub order_type: OrderSide,
    pub level_name: LevelName,
    /// Limit price
    pub target_price: Decimal,
    pub locked_amount: Decimal,
    pub created_time: DateTime<Utc>,
    pub created_bar: usize,
    pub expire_time: DateTime<Utc>,
    pub status: OrderStatus,
    pub fund_status: FundStatus,
    pub exit_plan: ExitPlan,
    pub resolved_time: Option<DateTime<Utc>>,
    pub position: Option<PositionId>,
}

impl PendingOrder {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }

    /// Expiry is due once the bar time reaches `expire_time`
    pub fn is_due(&self, bar_time: DateTime<Utc>) -> bool {
        self.is_pending() && self.expire_time <= bar_time
    }

    /// Gap-aware limit fill: a buy fills at the open when the bar opens at or
    /// below the limit, otherwise at the limit once the low reaches it.
    /// Sells mirror this against the high.
    pub fn fill_price(&self, open: Decimal, high: Decimal, low: Decimal) -> Option<Decimal> {
        match self.order_type {
            OrderSide::Buy if low <= self.target_price => Some(open.min(self.target_price)),
            OrderSide::Sell if high >= self.target_price => Some(open.max(self.target_price)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn position(side: Side, entry: Decimal, qty: Decimal) -> Position {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Position {
            id: PositionId(0),
            side,
            level_name: LevelName::Support1,
            entry_price: entry,
            entry_time: t,
            entry_bar: 0,
            quantity: qty,
            cost_basis: entry * qty,
            target_price: entry,
            stop_price: entry,
            protective_level: entry,
            status: PositionStatus::Open,
            close_price: None,
            close_time: None,
            close_bar: None,
            realized_pnl: None,
            exit_reason: None,
            stop_warnings: 0,
            order: None,
        }
    }

    #[test]
    fn test_long_and_short_proceeds() {
        let long = position(Side::Long, dec!(100), dec!(2));
        assert_eq!(long.exit_proceeds(dec!(110), Decimal::ZERO), dec!(220));
        assert_eq!(long.exit_proceeds(dec!(110), dec!(0.01)), dec!(217.8));

        let short = position(Side::Short, dec!(100), dec!(2));
        assert_eq!(short.exit_proceeds(dec!(90), Decimal::ZERO), dec!(220));
        assert_eq!(short.exit_proceeds(dec!(110), Decimal::ZERO), dec!(180));
        assert_eq!(short.exit_proceeds(dec!(250), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_limit_fill_is_gap_aware() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let plan = ExitPlan {
            target_price: dec!(110),
            protective_level: dec!(90),
            stop_price: dec!(87.3),
        };
        let mut order = PendingOrder {
            id: OrderId(0),
            order_type: OrderSide::Buy,
            level_name: LevelName::Support1,
            target_price: dec!(100),
            locked_amount: dec!(1000),
            created_time: t,
            created_bar: 0,
            expire_time: t,
            status: OrderStatus::Pending,
            fund_status: FundStatus::Locked,
            exit_plan: plan,
            resolved_time: None,
            position: None,
        };
        assert_eq!(order.fill_price(dec!(105), dec!(106), dec!(99)), Some(dec!(100)));
        assert_eq!(order.fill_price(dec!(97), dec!(101), dec!(96)), Some(dec!(97)));
        assert_eq!(order.fill_price(dec!(105), dec!(106), dec!(101)), None);

        order.order_type = OrderSide::Sell;
        assert_eq!(order.fill_price(dec!(95), dec!(101), dec!(94)), Some(dec!(100)));
        assert_eq!(order.fill_price(dec!(103), dec!(104), dec!(99)), Some(dec!(103)));
    }
}
