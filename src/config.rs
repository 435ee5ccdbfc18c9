//! Configuration management
//!
//! Handles loading and parsing of JSON configuration files. Directory
//! settings may be overridden from the environment (a `.env` file is loaded by
//! the binary before the config is read).

use anyhow::{Context, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::signals::EntryRule;
use crate::zones::{LevelName, ZoneConfig};
use crate::Symbol;

/// Main configuration structure.
///
/// This is the plain struct the engine consumes; the CLI only fills it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub symbol: String,
    /// Bar interval of the primary series, e.g. "1h"
    pub interval: String,
    pub initial_capital: Decimal,
    #[serde(default)]
    pub zones: ZoneConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
}

impl Config {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        if let Ok(data_dir) = std::env::var("ZONE_GRID_DATA_DIR") {
            config.backtest.data_dir = data_dir;
        }
        if let Ok(results_dir) = std::env::var("ZONE_GRID_RESULTS_DIR") {
            config.backtest.results_dir = results_dir;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.symbol)
    }

    /// Duration of one primary bar
    pub fn bar_interval(&self) -> Result<Duration, ConfigError> {
        parse_interval(&self.interval).ok_or_else(|| ConfigError::UnknownInterval(self.interval.clone()))
    }

    /// Check every parameter range the engine relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(ConfigError::NonPositiveCapital(self.initial_capital));
        }
        self.bar_interval()?;
        self.zones.validate()?;
        self.grid.validate()?;
        for tf in &self.zones.timeframes {
            if let Some(interval) = &tf.interval {
                if parse_interval(interval).is_none() {
                    return Err(ConfigError::UnknownInterval(interval.clone()));
                }
            }
        }
        Ok(())
    }

    /// SHA-256 of the serialized config, used to group journal runs
    pub fn fingerprint(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        hex::encode(Sha256::digest(json.as_bytes()))
    }
}

/// Parse interval strings such as "15m", "1h", "4h", "1d", "1w"
pub fn parse_interval(interval: &str) -> Option<Duration> {
    let interval = interval.trim();
    if interval.len() < 2 {
        return None;
    }
    let (amount, unit) = interval.split_at(interval.len() - 1);
    let amount: i64 = amount.parse().ok().filter(|n| *n > 0)?;
    match unit {
        "m" => Some(Duration::minutes(amount)),
        "h" => Some(Duration::hours(amount)),
        "d" => Some(Duration::days(amount)),
        "w" => Some(Duration::weeks(amount)),
        _ => None,
    }
}

/// Fraction of initial capital assigned to each level slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LevelAllocation {
    pub support_2: Decimal,
    pub support_1: Decimal,
    pub resistance_1: Decimal,
    pub resistance_2: Decimal,
}

impl LevelAllocation {
    pub fn fraction(&self, level: LevelName) -> Decimal {
        match level {
            LevelName::Support2 => self.support_2,
            LevelName::Support1 => self.support_1,
            LevelName::Resistance1 => self.resistance_1,
            LevelName::Resistance2 => self.resistance_2,
        }
    }

    pub fn total(&self) -> Decimal {
        self.support_2 + self.support_1 + self.resistance_1 + self.resistance_2
    }
}

impl Default for LevelAllocation {
    fn default() -> Self {
        Self {
            support_2: dec!(0.30),
            support_1: dec!(0.20),
            resistance_1: dec!(0.20),
            resistance_2: dec!(0.30),
        }
    }
}

/// Breakout stop-loss policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopLossMode {
    /// Close once price trades beyond `level × (1 ± buffer)`
    SingleThreshold,
    /// Warn when a bar closes beyond the protective level; confirm on a hard
    /// breakout or after `confirm_bars` consecutive warned closes
    TwoStage { confirm_bars: u32 },
}

impl Default for StopLossMode {
    fn default() -> Self {
        StopLossMode::TwoStage { confirm_bars: 3 }
    }
}

/// Grid execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub level_allocation: LevelAllocation,
    /// Open shorts at resistance levels; support levels always open longs
    pub enable_short: bool,
    pub entry_rule: EntryRule,
    /// Bars a pending order stays live before it expires
    pub pending_order_ttl_bars: u32,
    pub stop_loss_mode: StopLossMode,
    pub stop_loss_buffer_pct: Decimal,
    pub cooldown_bars: u32,
    /// Re-entry is blocked inside the cooldown when the new entry is within this distance of the old one
    pub reentry_tolerance_pct: Decimal,
    pub fee_rate: Decimal,
    /// Target distance used when the opposite side has no zone at entry time
    pub fallback_target_pct: Decimal,
    /// Entries smaller than this notional are skipped
    pub min_order_value: Decimal,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            level_allocation: LevelAllocation::default(),
            enable_short: true,
            entry_rule: EntryRule::default(),
            pending_order_ttl_bars: 3,
            stop_loss_mode: StopLossMode::default(),
            stop_loss_buffer_pct: dec!(0.03),
            cooldown_bars: 5,
            reentry_tolerance_pct: dec!(0.05),
            fee_rate: dec!(0.001),
            fallback_target_pct: dec!(0.05),
            min_order_value: dec!(10),
        }
    }
}

impl GridConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for level in LevelName::ALL {
            let fraction = self.level_allocation.fraction(level);
            if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
                return Err(ConfigError::AllocationOutOfRange { level, fraction });
            }
        }
        let total = self.level_allocation.total();
        if total > Decimal::ONE {
            return Err(ConfigError::AllocationExceedsCapital(total));
        }
        check_fraction("stop_loss_buffer_pct", self.stop_loss_buffer_pct)?;
        check_fraction("reentry_tolerance_pct", self.reentry_tolerance_pct)?;
        check_fraction("fallback_target_pct", self.fallback_target_pct)?;
        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            return Err(ConfigError::OutOfRange {
                field: "fee_rate",
                value: self.fee_rate,
            });
        }
        if self.pending_order_ttl_bars == 0 {
            return Err(ConfigError::ZeroCount("pending_order_ttl_bars"));
        }
        if let StopLossMode::TwoStage { confirm_bars: 0 } = self.stop_loss_mode {
            return Err(ConfigError::ZeroCount("confirm_bars"));
        }
        self.entry_rule.validate()?;
        Ok(())
    }
}

/// Require a value in the open-closed interval (0, 1]
pub(crate) fn check_fraction(field: &'static str, value: Decimal) -> Result<(), ConfigError> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(ConfigError::OutOfRange { field, value });
    }
    Ok(())
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
    /// Leading bars that only feed zone history
    pub warmup_bars: usize,
    /// SQLite journal; no journal is written when unset
    pub journal_path: Option<String>,
    /// Write `{results_dir}/{symbol}_events.jsonl`
    pub write_events: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            warmup_bars: 0,
            journal_path: None,
            write_events: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{ "symbol": "BTCUSDT", "interval": "1h", "initial_capital": 10000 }"#
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.initial_capital, dec!(10000));
        assert_eq!(config.grid.level_allocation, LevelAllocation::default());
        assert_eq!(config.grid.cooldown_bars, 5);
        assert_eq!(config.zones.timeframes.len(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("15m"), Some(Duration::minutes(15)));
        assert_eq!(parse_interval("4h"), Some(Duration::hours(4)));
        assert_eq!(parse_interval("1d"), Some(Duration::days(1)));
        assert_eq!(parse_interval("0h"), None);
        assert_eq!(parse_interval("h"), None);
        assert_eq!(parse_interval("3x"), None);
    }

    #[test]
    fn test_over_allocation_rejected() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.grid.level_allocation.support_2 = dec!(0.5);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AllocationExceedsCapital(_))
        ));
    }

    #[test]
    fn test_price_resolution_floor() {
        let mut config: Config = serde_json::from_str(minimal_json()).unwrap();
        config.zones.price_resolution_pct = dec!(0.000000001);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ResolutionTooFine { .. })
        ));

        config.zones.price_resolution_pct = dec!(0.0001);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stop_loss_mode_serde() {
        let json = r#"{ "type": "two_stage", "confirm_bars": 2 }"#;
        let mode: StopLossMode = serde_json::from_str(json).unwrap();
        assert_eq!(mode, StopLossMode::TwoStage { confirm_bars: 2 });

        let single: StopLossMode = serde_json::from_str(r#"{ "type": "single_threshold" }"#).unwrap();
        assert_eq!(single, StopLossMode::SingleThreshold);
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let config: Config = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.fingerprint(), config.clone().fingerprint());
        assert_eq!(config.fingerprint().len(), 64);
    }
}
