//! Multi-Timeframe Market Data
//!
//! Bars of one symbol keyed by interval. Zone timeframes read rolling windows
//! from their own interval series, or from the primary series when they have
//! none. Windows are borrowed slices, never copies.
//!
//! Bars are stamped with their open time. The primary bar at `t` is processed
//! at its close, `t + primary step`, so a window at `t` only holds bars that
//! have closed by then: for a 4h series on 1h bars, the 12:00 bar becomes
//! visible at the 15:00 primary bar.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::config::parse_interval;
use crate::error::ConfigError;
use crate::zones::{TimeframeSpec, TimeframeWindow};
use crate::Candle;

#[derive(Debug, Clone)]
struct Series {
    step: Duration,
    candles: Vec<Candle>,
}

#[derive(Debug, Clone)]
pub struct MarketData {
    /// Key: interval string (e.g. "1h", "4h")
    series: HashMap<String, Series>,
    /// Interval the executor steps through
    primary_interval: String,
    primary_step: Duration,
    /// First primary bar that is traded; earlier bars only feed zone windows
    trade_from: usize,
}

impl MarketData {
    pub fn new(primary_interval: impl Into<String>, primary: Vec<Candle>) -> Result<Self, ConfigError> {
        let primary_interval = primary_interval.into();
        let primary_step = step_of(&primary_interval)?;
        let mut series = HashMap::new();
        series.insert(
            primary_interval.clone(),
            Series {
                step: primary_step,
                candles: primary,
            },
        );
        Ok(Self {
            series,
            primary_interval,
            primary_step,
            trade_from: 0,
        })
    }

    /// Add (or replace) the series for `interval`
    pub fn add_series(&mut self, interval: impl Into<String>, candles: Vec<Candle>) -> Result<(), ConfigError> {
        let interval = interval.into();
        let step = step_of(&interval)?;
        self.series.insert(interval, Series { step, candles });
        Ok(())
    }

    pub fn get(&self, interval: &str) -> Option<&[Candle]> {
        self.series.get(interval).map(|s| s.candles.as_slice())
    }

    /// Full primary series, history before the trade start included
    pub fn primary(&self) -> &[Candle] {
        self.get(&self.primary_interval).unwrap_or(&[])
    }

    pub fn primary_interval(&self) -> &str {
        &self.primary_interval
    }

    /// Trade only primary bars at or after `start`
    pub fn set_trade_start(&mut self, start: DateTime<Utc>) {
        self.trade_from = self.primary().partition_point(|c| c.datetime < start);
    }

    /// Primary bars the executor steps through
    pub fn traded(&self) -> &[Candle] {
        let primary = self.primary();
        &primary[self.trade_from.min(primary.len())..]
    }

    pub fn len(&self) -> usize {
        self.traded().len()
    }

    pub fn is_empty(&self) -> bool {
        self.traded().is_empty()
    }

    /// Series a timeframe reads from, with its bar length
    fn series_for(&self, spec: &TimeframeSpec) -> (&[Candle], Duration) {
        let series = spec
            .interval
            .as_deref()
            .and_then(|interval| self.series.get(interval))
            .or_else(|| self.series.get(&self.primary_interval));
        match series {
            Some(s) => (s.candles.as_slice(), s.step),
            None => (&[], self.primary_step),
        }
    }

    /// Rolling windows for the primary bar opened at `time`, one per
    /// timeframe, in config order. Each holds the closed bars opened in
    /// `(time - lookback, ...]`.
    pub fn windows_ending_at<'a>(
        &'a self,
        time: DateTime<Utc>,
        timeframes: &'a [TimeframeSpec],
    ) -> Vec<TimeframeWindow<'a>> {
        let known = time + self.primary_step;
        timeframes
            .iter()
            .map(|spec| {
                let (series, step) = self.series_for(spec);
                let candles = slice_window(series, time - spec.lookback(), known - step);
                TimeframeWindow::new(&spec.name, spec.weight, candles)
            })
            .collect()
    }
}

fn step_of(interval: &str) -> Result<Duration, ConfigError> {
    parse_interval(interval).ok_or_else(|| ConfigError::UnknownInterval(interval.to_string()))
}

/// Bars with `start < datetime <= end` from a time-ordered series
pub fn slice_window(candles: &[Candle], start: DateTime<Utc>, end: DateTime<Utc>) -> &[Candle] {
    let from = candles.partition_point(|c| c.datetime <= start);
    let to = candles.partition_point(|c| c.datetime <= end);
    if from >= to {
        return &[];
    }
    &candles[from..to]
}

/// Drop bars of length `step` still open at `cutoff`
pub fn closed_by(candles: Vec<Candle>, step: Duration, cutoff: DateTime<Utc>) -> Vec<Candle> {
    candles
        .into_iter()
        .filter(|c| c.datetime + step <= cutoff)
        .collect()
}
