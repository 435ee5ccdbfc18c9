//! Error types for the engine
//!
//! Recoverable conditions (insufficient funds for one entry, a blocked slot,
//! no usable zones) are reported to the caller and logged; everything else
//! halts the run with the bar index and a ledger snapshot attached.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::oms::ledger::LedgerSnapshot;
use crate::oms::types::{OrderId, OrderStatus, PositionId, SlotStatus};
use crate::types::CandleValidationError;
use crate::zones::LevelName;

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("initial capital must be positive, got {0}")]
    NonPositiveCapital(Decimal),

    #[error("unknown interval '{0}' (expected e.g. 15m, 1h, 1d)")]
    UnknownInterval(String),

    #[error("allocation for {level} must be in (0, 1], got {fraction}")]
    AllocationOutOfRange { level: LevelName, fraction: Decimal },

    #[error("level allocations sum to {0}, more than the initial capital")]
    AllocationExceedsCapital(Decimal),

    #[error("{field} is out of range: {value}")]
    OutOfRange { field: &'static str, value: Decimal },

    #[error("price_resolution_pct {value} is finer than the minimum {min}")]
    ResolutionTooFine { value: Decimal, min: Decimal },

    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),

    #[error("at least one zone timeframe is required")]
    NoTimeframes,

    #[error("timeframe '{0}' needs a positive weight and lookback")]
    InvalidTimeframe(String),
}

/// Fund ledger failures. Only `InsufficientFunds` is recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("insufficient funds at {level}: requested {requested}, available {available}")]
    InsufficientFunds {
        level: LevelName,
        requested: Decimal,
        available: Decimal,
    },

    #[error("commit of {requested} at {level} exceeds locked {locked}")]
    DoubleCommit {
        level: LevelName,
        requested: Decimal,
        locked: Decimal,
    },

    #[error("release of {requested} at {level} exceeds locked {locked}")]
    DoubleRelease {
        level: LevelName,
        requested: Decimal,
        locked: Decimal,
    },

    #[error("realizing cost basis {requested} at {level} exceeds invested {invested}")]
    InvestedUnderflow {
        level: LevelName,
        requested: Decimal,
        invested: Decimal,
    },

    #[error("amount at {level} must be positive, got {amount}")]
    NonPositiveAmount { level: LevelName, amount: Decimal },
}

impl LedgerError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LedgerError::InsufficientFunds { .. })
    }
}

/// Position store failures. Slot and cooldown rejections are recoverable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("slot {level} is {status:?}")]
    SlotOccupied { level: LevelName, status: SlotStatus },

    #[error("{level} is cooling down after position {position} closed at bar {closed_bar}")]
    CooldownActive {
        level: LevelName,
        position: PositionId,
        closed_bar: usize,
    },

    #[error("slot {0} is disabled")]
    SlotDisabled(LevelName),

    #[error("unknown position {0}")]
    UnknownPosition(PositionId),

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("position {0} is already closed")]
    PositionAlreadyClosed(PositionId),

    #[error("order {id} is {status:?}, not pending")]
    OrderNotPending { id: OrderId, status: OrderStatus },
}

impl StoreError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::SlotOccupied { .. }
                | StoreError::CooldownActive { .. }
                | StoreError::SlotDisabled(_)
        )
    }
}

/// Zone set cannot support new entries this bar
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ZoneError {
    #[error("no usable zone on either side of {current_price}")]
    InvalidZoneConfiguration { current_price: Decimal },
}

/// Unrecoverable engine failures; the run stops at `bar_index`
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("malformed bar at index {bar_index}: {source}")]
    MalformedBar {
        bar_index: usize,
        #[source]
        source: CandleValidationError,
    },

    #[error("fund ledger failure at bar {bar_index}: {source} [{snapshot}]")]
    Ledger {
        bar_index: usize,
        snapshot: LedgerSnapshot,
        #[source]
        source: LedgerError,
    },

    #[error("position store failure at bar {bar_index}: {source} [{snapshot}]")]
    Store {
        bar_index: usize,
        snapshot: LedgerSnapshot,
        #[source]
        source: StoreError,
    },

    #[error("capital invariant violated at bar {bar_index}: {detail} [{snapshot}]")]
    InvariantViolation {
        bar_index: usize,
        snapshot: LedgerSnapshot,
        detail: String,
    },
}

impl EngineError {
    pub fn bar_index(&self) -> usize {
        match self {
            EngineError::MalformedBar { bar_index, .. }
            | EngineError::Ledger { bar_index, .. }
            | EngineError::Store { bar_index, .. }
            | EngineError::InvariantViolation { bar_index, .. } => *bar_index,
        }
    }
}
