//! Zone Analysis Configuration

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::check_fraction;
use crate::error::ConfigError;

/// Finest heatmap resolution, i.e. at most 10,000 buckets per heatmap
pub const MIN_PRICE_RESOLUTION_PCT: Decimal = dec!(0.0001);

/// One volume-history timeframe feeding the heatmap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeframeSpec {
    /// Label, e.g. "long"
    pub name: String,

    /// Bar interval of this timeframe's series; the primary series is used when unset
    #[serde(default)]
    pub interval: Option<String>,

    /// Rolling lookback ending at the current bar
    pub lookback_hours: i64,

    /// Volume multiplier applied to this timeframe's histogram
    pub weight: Decimal,
}

impl TimeframeSpec {
    pub fn new(name: &str, lookback_hours: i64, weight: Decimal) -> Self {
        Self {
            name: name.to_string(),
            interval: None,
            lookback_hours,
            weight,
        }
    }

    pub fn lookback(&self) -> Duration {
        Duration::hours(self.lookback_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Timeframes in priority order; the first is the default moving-average source
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<TimeframeSpec>,

    /// Bucket width as a fraction of the observed price range (default: 0.1%)
    #[serde(default = "default_price_resolution_pct")]
    pub price_resolution_pct: Decimal,

    /// Buckets per sliding window (default: 5)
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Windows centered further than this from the current price are discarded (default: 15%)
    #[serde(default = "default_deviation_pct")]
    pub deviation_pct: Decimal,

    /// Minimum relative gap between accepted zones on one side (default: 5%)
    #[serde(default = "default_min_distance_pct")]
    pub min_distance_pct: Decimal,

    /// Boundaries within this distance of the long MA snap onto it (default: 2%)
    #[serde(default = "default_adjustment_threshold")]
    pub adjustment_threshold: Decimal,

    /// Long moving average period, in bars of `ma_timeframe` (default: 50)
    #[serde(default = "default_ma_period")]
    pub ma_period: usize,

    /// Timeframe whose closes feed the moving average (default: first timeframe)
    #[serde(default)]
    pub ma_timeframe: Option<String>,
}

fn default_timeframes() -> Vec<TimeframeSpec> {
    vec![
        TimeframeSpec::new("long", 30 * 24, dec!(1.5)),
        TimeframeSpec::new("mid", 10 * 24, dec!(1.2)),
        TimeframeSpec::new("short", 3 * 24, dec!(1.0)),
    ]
}

fn default_price_resolution_pct() -> Decimal {
    dec!(0.001)
}

fn default_window_size() -> usize {
    5
}

fn default_deviation_pct() -> Decimal {
    dec!(0.15)
}

fn default_min_distance_pct() -> Decimal {
    dec!(0.05)
}

fn default_adjustment_threshold() -> Decimal {
    dec!(0.02)
}

fn default_ma_period() -> usize {
    50
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            timeframes: default_timeframes(),
            price_resolution_pct: default_price_resolution_pct(),
            window_size: default_window_size(),
            deviation_pct: default_deviation_pct(),
            min_distance_pct: default_min_distance_pct(),
            adjustment_threshold: default_adjustment_threshold(),
            ma_period: default_ma_period(),
            ma_timeframe: None,
        }
    }
}

impl ZoneConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeframes.is_empty() {
            return Err(ConfigError::NoTimeframes);
        }
        for tf in &self.timeframes {
            if tf.weight <= Decimal::ZERO || tf.lookback_hours <= 0 {
                return Err(ConfigError::InvalidTimeframe(tf.name.clone()));
            }
        }
        if let Some(name) = &self.ma_timeframe {
            if !self.timeframes.iter().any(|tf| &tf.name == name) {
                return Err(ConfigError::InvalidTimeframe(name.clone()));
            }
        }
        check_fraction("price_resolution_pct", self.price_resolution_pct)?;
        if self.price_resolution_pct < MIN_PRICE_RESOLUTION_PCT {
            return Err(ConfigError::ResolutionTooFine {
                value: self.price_resolution_pct,
                min: MIN_PRICE_RESOLUTION_PCT,
            });
        }
        check_fraction("deviation_pct", self.deviation_pct)?;
        check_fraction("min_distance_pct", self.min_distance_pct)?;
        check_fraction("adjustment_threshold", self.adjustment_threshold)?;
        if self.window_size == 0 {
            return Err(ConfigError::ZeroCount("window_size"));
        }
        if self.ma_period == 0 {
            return Err(ConfigError::ZeroCount("ma_period"));
        }
        Ok(())
    }

    /// Name of the timeframe that feeds the moving average
    pub fn ma_source(&self) -> Option<&str> {
        self.ma_timeframe
            .as_deref()
            .or_else(|| self.timeframes.first().map(|tf| tf.name.as_str()))
    }

    /// Longest lookback across all timeframes
    pub fn max_lookback(&self) -> Duration {
        self.timeframes
            .iter()
            .map(TimeframeSpec::lookback)
            .max()
            .unwrap_or_else(Duration::zero)
    }
}
