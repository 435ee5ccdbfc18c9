//! Core data types used across the engine

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: Decimal, low: Decimal },

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: Decimal, low: Decimal, high: Decimal },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: Decimal, low: Decimal, high: Decimal },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(Decimal),

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    },

    #[error("timestamp {current} does not advance past {previous}")]
    NonMonotonicTimestamp {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

/// OHLCV bar. Prices and volume are decimals so that money derived from them
/// never passes through binary floating point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub datetime: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        datetime: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self::new_unchecked(datetime, open, high, low, close, volume);
        candle.validate()?;
        Ok(candle)
    }

    /// Create a candle without validation (the executor validates every bar it consumes)
    pub fn new_unchecked(
        datetime: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
    ) -> Self {
        Self {
            datetime,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate the candle data
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        if self.open <= Decimal::ZERO
            || self.high <= Decimal::ZERO
            || self.low <= Decimal::ZERO
            || self.close <= Decimal::ZERO
        {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.open < self.low || self.open > self.high {
            return Err(CandleValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        if self.volume < Decimal::ZERO {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Check that a series is individually valid and strictly increasing in time.
///
/// Returns the index of the first offending bar alongside the error.
pub fn validate_series(candles: &[Candle]) -> Result<(), (usize, CandleValidationError)> {
    let mut previous: Option<DateTime<Utc>> = None;
    for (idx, candle) in candles.iter().enumerate() {
        candle.validate().map_err(|e| (idx, e))?;
        if let Some(prev) = previous {
            if candle.datetime <= prev {
                return Err((
                    idx,
                    CandleValidationError::NonMonotonicTimestamp {
                        previous: prev,
                        current: candle.datetime,
                    },
                ));
            }
        }
        previous = Some(candle.datetime);
    }
    Ok(())
}

/// Trading pair symbol using Arc<str> for cheap cloning
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction
    pub fn entry_order(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "long"),
            Side::Short => write!(f, "short"),
        }
    }
}

/// Order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// End-of-run statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Percent return on initial capital
    pub total_return: f64,
    /// Largest peak-to-trough equity decline, in percent
    pub max_drawdown: f64,
    /// Percent of closed trades with positive pnl
    pub win_rate: f64,
    pub trade_count: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub stop_loss_exits: usize,
    pub take_profit_exits: usize,
    pub final_equity: Decimal,
    pub realized_pnl: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_valid_candle() {
        let candle = Candle::new(t0(), dec!(100), dec!(110), dec!(95), dec!(105), dec!(10));
        assert!(candle.is_ok());
    }

    #[test]
    fn test_high_below_low_rejected() {
        let err = Candle::new(t0(), dec!(100), dec!(90), dec!(95), dec!(92), dec!(10)).unwrap_err();
        assert_eq!(
            err,
            CandleValidationError::HighLessThanLow {
                high: dec!(90),
                low: dec!(95)
            }
        );
    }

    #[test]
    fn test_open_outside_range_rejected() {
        let err = Candle::new(t0(), dec!(50), dec!(110), dec!(99), dec!(105), dec!(10)).unwrap_err();
        assert_eq!(
            err,
            CandleValidationError::OpenOutOfRange {
                open: dec!(50),
                low: dec!(99),
                high: dec!(110)
            }
        );
    }

    #[test]
    fn test_close_outside_range_rejected() {
        let err = Candle::new(t0(), dec!(100), dec!(110), dec!(95), dec!(111), dec!(10)).unwrap_err();
        assert_eq!(
            err,
            CandleValidationError::CloseOutOfRange {
                close: dec!(111),
                low: dec!(95),
                high: dec!(110)
            }
        );
    }

    #[test]
    fn test_negative_volume_rejected() {
        let err =
            Candle::new(t0(), dec!(100), dec!(110), dec!(95), dec!(105), dec!(-1)).unwrap_err();
        assert_eq!(err, CandleValidationError::NegativeVolume(dec!(-1)));
    }

    #[test]
    fn test_series_rejects_duplicate_timestamp() {
        let a = Candle::new_unchecked(t0(), dec!(1), dec!(2), dec!(1), dec!(1), dec!(1));
        let b = Candle::new_unchecked(
            t0() + Duration::hours(1),
            dec!(1),
            dec!(2),
            dec!(1),
            dec!(1),
            dec!(1),
        );
        let c = Candle::new_unchecked(
            t0() + Duration::hours(1),
            dec!(1),
            dec!(2),
            dec!(1),
            dec!(1),
            dec!(1),
        );
        let (idx, err) = validate_series(&[a, b, c]).unwrap_err();
        assert_eq!(idx, 2);
        assert!(matches!(
            err,
            CandleValidationError::NonMonotonicTimestamp { .. }
        ));
    }

    #[test]
    fn test_symbol_serde() {
        let symbol = Symbol::new("BTCUSDT");
        let json = serde_json::to_string(&symbol).unwrap();
        assert_eq!(json, "\"BTCUSDT\"");
        let parsed: Symbol = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, symbol);
    }

    #[test]
    fn test_side_order_mapping() {
        assert_eq!(Side::Long.entry_order(), OrderSide::Buy);
        assert_eq!(Side::Short.entry_order(), OrderSide::Sell);
    }
}
