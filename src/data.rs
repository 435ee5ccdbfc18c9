//! Data loading and management
//!
//! Loads OHLCV bars from CSV files into decimal candles and assembles the
//! multi-timeframe market store. Files are named `{symbol}_{interval}.csv`
//! with columns `datetime,open,high,low,close,volume`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::parse_interval;
use crate::error::ConfigError;
use crate::market::{closed_by, MarketData};
use crate::types::validate_series;
use crate::{Candle, Config};

// =============================================================================
// CSV Data Loading
// =============================================================================

/// Load OHLCV data from CSV file
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut candles = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let datetime =
            parse_datetime(dt_str).with_context(|| format!("Failed to parse datetime: {}", dt_str))?;

        let field = |idx: usize, name: &str| -> Result<Decimal> {
            let raw = record
                .get(idx)
                .with_context(|| format!("Missing {} column", name))?
                .trim();
            Decimal::from_str(raw)
                .or_else(|_| Decimal::from_scientific(raw))
                .with_context(|| format!("Failed to parse {} on row {}: {}", name, row_idx + 1, raw))
        };

        candles.push(Candle::new_unchecked(
            datetime,
            field(1, "open")?,
            field(2, "high")?,
            field(3, "low")?,
            field(4, "close")?,
            field(5, "volume")?,
        ));
    }

    Ok(candles)
}

/// Write candles in the layout `load_csv` reads
pub fn write_csv(candles: &[Candle], path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file {}", path.display()))?;
    writer.write_record(["datetime", "open", "high", "low", "close", "volume"])?;
    for c in candles {
        writer.write_record([
            c.datetime.to_rfc3339(),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// RFC 3339, `%Y-%m-%d %H:%M:%S` (UTC), or epoch milliseconds
pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = s.parse::<DateTime<Utc>>() {
        return Ok(dt);
    }
    if let Ok(ndt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
    }
    if let Ok(millis) = s.parse::<i64>() {
        if let Some(dt) = Utc.timestamp_millis_opt(millis).single() {
            return Ok(dt);
        }
    }
    anyhow::bail!("unrecognised datetime format")
}

/// Parse a CLI date: `YYYY-MM-DD` (midnight UTC) or any format `parse_datetime` takes
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d") {
        if let Some(ndt) = date.and_hms_opt(0, 0, 0) {
            return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
        }
    }
    parse_datetime(s).with_context(|| format!("Invalid date: {}", s))
}

/// Keep bars with `start <= datetime <= end`
pub fn filter_range(
    candles: Vec<Candle>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Vec<Candle> {
    candles
        .into_iter()
        .filter(|c| start.map_or(true, |s| c.datetime >= s))
        .filter(|c| end.map_or(true, |e| c.datetime <= e))
        .collect()
}

/// Reject a series with a malformed or out-of-order bar
pub fn validate(candles: &[Candle], label: &str) -> Result<()> {
    validate_series(candles)
        .map_err(|(idx, err)| anyhow::anyhow!("{}: bar {} is malformed: {}", label, idx, err))
}

// =============================================================================
// Market Assembly
// =============================================================================

/// Load the primary series plus every interval a zone timeframe names.
///
/// `end` trims every series: primary bars opened after it are dropped, and a
/// higher-timeframe bar is kept only if it closed by the close of the last
/// primary bar. `start` only marks the first traded bar; earlier primary bars
/// stay loaded so zone windows can reach into history before it.
pub fn load_market(
    config: &Config,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<MarketData> {
    let data_dir = Path::new(&config.backtest.data_dir);
    let symbol = config.symbol.as_str();
    let primary_step = config.bar_interval()?;

    let primary_path = data_dir.join(format!("{}_{}.csv", symbol, config.interval));
    let primary = load_csv(&primary_path)
        .with_context(|| format!("Failed to load data for {}", symbol))?;
    let primary = filter_range(primary, None, end);
    validate(&primary, &format!("{} {}", symbol, config.interval))?;
    let Some(last) = primary.last() else {
        anyhow::bail!("No {} bars for {} in the requested range", config.interval, symbol);
    };
    let cutoff = last.datetime + primary_step;
    info!("Loaded {} {} candles for {}", primary.len(), config.interval, symbol);

    let mut market = MarketData::new(config.interval.clone(), primary)?;
    if let Some(start) = start {
        market.set_trade_start(start);
        if market.is_empty() {
            anyhow::bail!("No {} bars for {} after {}", config.interval, symbol, start);
        }
        info!(
            "Trading {} bars from {}; {} earlier bars feed zone windows only",
            market.len(),
            start,
            market.primary().len() - market.len()
        );
    }

    for interval in config.zones.timeframes.iter().filter_map(|tf| tf.interval.as_deref()) {
        if market.get(interval).is_some() {
            continue;
        }
        let path = data_dir.join(format!("{}_{}.csv", symbol, interval));
        if !path.exists() {
            warn!(
                "Data file not found: {}; timeframe falls back to {}",
                path.display(),
                config.interval
            );
            continue;
        }
        let step = parse_interval(interval)
            .ok_or_else(|| ConfigError::UnknownInterval(interval.to_string()))?;
        let candles = closed_by(load_csv(&path)?, step, cutoff);
        validate(&candles, &format!("{} {}", symbol, interval))?;
        info!("Loaded {} {} candles for {}", candles.len(), interval, symbol);
        market.add_series(interval, candles)?;
    }

    Ok(market)
}

// =============================================================================
// Tests
// =============================================================================
