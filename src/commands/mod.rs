//! Subcommand implementations

pub mod backtest;
pub mod zones;
