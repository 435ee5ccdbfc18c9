//! Volume-Zone Grid Engine
//!
//! Derives support and resistance zones from multi-timeframe volume clusters
//! and trades a bidirectional grid around them: longs at support, shorts at
//! resistance, with every unit of capital accounted for on every bar.

pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod executor;
pub mod indicators;
pub mod journal;
pub mod market;
pub mod oms;
pub mod signals;
pub mod types;
pub mod zones;

pub use config::Config;
pub use error::{ConfigError, EngineError, LedgerError, StoreError, ZoneError};
pub use executor::{BarSnapshot, GridExecutor};
pub use types::*;
