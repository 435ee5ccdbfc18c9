//! Order Management System (OMS)
//!
//! Capital and lifecycle bookkeeping for the grid:
//! - `ledger`: cash, per-level invested and locked capital
//! - `store`: level slots, positions, pending limit orders
//! - `types`: the records both of them hand out

pub mod ledger;
pub mod store;
pub mod types;

// Re-export core types
pub use ledger::{FundLedger, LedgerSnapshot};
pub use store::{EntryFill, GridPositionStore, OrderRequest};
pub use types::{
    ExitPlan, ExitReason, FundStatus, GridLevelSlot, OrderId, OrderStatus, PendingOrder, Position,
    PositionId, PositionStatus, SlotStatus,
};
