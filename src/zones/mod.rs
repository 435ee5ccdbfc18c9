//! Volume-Cluster Price Zones
//!
//! Pipeline run on every bar:
//! 1. `cluster` folds the weighted volume of every timeframe into one price
//!    heatmap and ranks fixed-width windows near the current price
//! 2. `select` keeps at most two well-separated windows per side
//! 3. `boundary` publishes a conservative edge of each window, snapped onto
//!    the long moving average when it sits close to it
//!
//! The result is a fresh `ZoneSet` of zero to four named levels.

pub mod boundary;
pub mod cluster;
mod config;
pub mod select;

pub use boundary::{adjust_boundary, boundary_price, snap_to_ma, AdjustedBoundary};
pub use cluster::{Heatmap, PriceBucket, TimeframeWindow, VolumeInterval, ZoneClusterer};
pub use config::{TimeframeSpec, ZoneConfig, MIN_PRICE_RESOLUTION_PCT};
pub use select::{Selection, ZoneSelector};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::ZoneError;
use crate::indicators;
use crate::market::MarketData;
use crate::Side;

/// Which side of the current price a zone sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneSide {
    Support,
    Resistance,
}

impl ZoneSide {
    pub fn opposite(self) -> Self {
        match self {
            ZoneSide::Support => ZoneSide::Resistance,
            ZoneSide::Resistance => ZoneSide::Support,
        }
    }
}

/// Named grid level, ordered from lowest to highest price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LevelName {
    #[serde(rename = "support_2")]
    Support2,
    #[serde(rename = "support_1")]
    Support1,
    #[serde(rename = "resistance_1")]
    Resistance1,
    #[serde(rename = "resistance_2")]
    Resistance2,
}

impl LevelName {
    pub const ALL: [LevelName; 4] = [
        LevelName::Support2,
        LevelName::Support1,
        LevelName::Resistance1,
        LevelName::Resistance2,
    ];

    pub fn zone_side(self) -> ZoneSide {
        match self {
            LevelName::Support2 | LevelName::Support1 => ZoneSide::Support,
            LevelName::Resistance1 | LevelName::Resistance2 => ZoneSide::Resistance,
        }
    }

    /// Supports are bought, resistances are sold short
    pub fn position_side(self) -> Side {
        match self.zone_side() {
            ZoneSide::Support => Side::Long,
            ZoneSide::Resistance => Side::Short,
        }
    }

    /// Level nearest the current price on `side`
    pub fn inner(side: ZoneSide) -> Self {
        match side {
            ZoneSide::Support => LevelName::Support1,
            ZoneSide::Resistance => LevelName::Resistance1,
        }
    }

    /// Level furthest from the current price on `side`
    pub fn outer(side: ZoneSide) -> Self {
        match side {
            ZoneSide::Support => LevelName::Support2,
            ZoneSide::Resistance => LevelName::Resistance2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LevelName::Support2 => "support_2",
            LevelName::Support1 => "support_1",
            LevelName::Resistance1 => "resistance_1",
            LevelName::Resistance2 => "resistance_2",
        }
    }
}

impl fmt::Display for LevelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published support/resistance level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneLevel {
    pub name: LevelName,
    pub price: Decimal,
    pub zone_low: Decimal,
    pub zone_high: Decimal,
    pub volume_strength: Decimal,
    /// Price was snapped onto the long moving average
    pub ma_adjusted: bool,
}

/// Zone snapshot for one bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneSet {
    pub time: DateTime<Utc>,
    pub current_price: Decimal,
    /// Sorted by level name, lowest first
    pub levels: Vec<ZoneLevel>,
}

impl ZoneSet {
    pub fn empty(time: DateTime<Utc>, current_price: Decimal) -> Self {
        Self {
            time,
            current_price,
            levels: Vec::new(),
        }
    }

    pub fn get(&self, name: LevelName) -> Option<&ZoneLevel> {
        self.levels.iter().find(|l| l.name == name)
    }

    pub fn price(&self, name: LevelName) -> Option<Decimal> {
        self.get(name).map(|l| l.price)
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Outer level of `side`, falling back to the inner one
    pub fn furthest(&self, side: ZoneSide) -> Option<&ZoneLevel> {
        self.get(LevelName::outer(side))
            .or_else(|| self.get(LevelName::inner(side)))
    }

    /// Entries need at least one level on either side
    pub fn ensure_usable(&self) -> Result<(), ZoneError> {
        if self.is_empty() {
            return Err(ZoneError::InvalidZoneConfiguration {
                current_price: self.current_price,
            });
        }
        Ok(())
    }
}

/// Produces the zone set the executor trades against on each bar
pub trait ZoneSource: Send {
    fn zones_at(&self, time: DateTime<Utc>, current_price: Decimal) -> ZoneSet;
}

/// Clusterer, selector and boundary adjuster wired together
#[derive(Debug, Clone)]
pub struct ZoneEngine {
    config: ZoneConfig,
    clusterer: ZoneClusterer,
    selector: ZoneSelector,
}

impl ZoneEngine {
    pub fn new(config: ZoneConfig) -> Self {
        let clusterer = ZoneClusterer::new(
            config.price_resolution_pct,
            config.window_size,
            config.deviation_pct,
        );
        let selector = ZoneSelector::new(config.min_distance_pct);
        Self {
            config,
            clusterer,
            selector,
        }
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    /// Long moving average over the configured source window
    pub fn long_ma(&self, windows: &[TimeframeWindow<'_>]) -> Option<Decimal> {
        let source = self.config.ma_source()?;
        let window = windows.iter().find(|w| w.name == source)?;
        let closes: Vec<Decimal> = window.candles.iter().map(|c| c.close).collect();
        indicators::sma_last(&closes, self.config.ma_period)
    }

    /// Run the full pipeline over windows ending at `time`
    pub fn compute(
        &self,
        time: DateTime<Utc>,
        windows: &[TimeframeWindow<'_>],
        current_price: Decimal,
    ) -> ZoneSet {
        let intervals = self.clusterer.cluster(windows, current_price);
        let selection = self.selector.select(&intervals, current_price);
        let long_ma = self.long_ma(windows);

        let mut levels = Vec::with_capacity(4);
        for side in [ZoneSide::Support, ZoneSide::Resistance] {
            let mut adjusted: Vec<(Decimal, bool, &VolumeInterval)> = Vec::with_capacity(2);
            for interval in selection.side(side) {
                let boundary = adjust_boundary(
                    interval,
                    side,
                    long_ma,
                    self.config.adjustment_threshold,
                );
                let on_side = match side {
                    ZoneSide::Support => boundary.price < current_price,
                    ZoneSide::Resistance => boundary.price > current_price,
                };
                if !on_side {
                    debug!(
                        side = ?side,
                        boundary = %boundary.price,
                        current_price = %current_price,
                        "Dropping zone whose boundary crosses the current price"
                    );
                    continue;
                }
                adjusted.push((boundary.price, boundary.adjusted, interval));
            }

            // Names follow the published price, which the MA snap may reorder
            adjusted.sort_by(|a, b| a.0.cmp(&b.0));
            let names: &[LevelName] = match (side, adjusted.len()) {
                (ZoneSide::Support, 2) => &[LevelName::Support2, LevelName::Support1],
                (ZoneSide::Support, _) => &[LevelName::Support1],
                (ZoneSide::Resistance, 2) => &[LevelName::Resistance1, LevelName::Resistance2],
                (ZoneSide::Resistance, _) => &[LevelName::Resistance1],
            };
            for (name, (price, ma_adjusted, interval)) in names.iter().zip(adjusted) {
                levels.push(ZoneLevel {
                    name: *name,
                    price,
                    zone_low: interval.price_low,
                    zone_high: interval.price_high,
                    volume_strength: interval.volume_strength,
                    ma_adjusted,
                });
            }
        }
        levels.sort_by_key(|l| l.name);

        ZoneSet {
            time,
            current_price,
            levels,
        }
    }
}

/// Zone engine fed from a preloaded multi-timeframe store
pub struct MarketZones {
    engine: ZoneEngine,
    market: Arc<MarketData>,
}

impl MarketZones {
    pub fn new(engine: ZoneEngine, market: Arc<MarketData>) -> Self {
        Self { engine, market }
    }
}

impl ZoneSource for MarketZones {
    fn zones_at(&self, time: DateTime<Utc>, current_price: Decimal) -> ZoneSet {
        let windows = self.market.windows_ending_at(time, &self.engine.config().timeframes);
        self.engine.compute(time, &windows, current_price)
    }
}

/// Hand-drawn levels replayed unchanged on every bar
#[derive(Debug, Clone, Default)]
pub struct StaticZones {
    levels: Vec<(LevelName, Decimal)>,
}

impl StaticZones {
    pub fn new(levels: impl IntoIterator<Item = (LevelName, Decimal)>) -> Self {
        let mut levels: Vec<(LevelName, Decimal)> = levels.into_iter().collect();
        levels.sort_by_key(|(name, _)| *name);
        levels.dedup_by_key(|(name, _)| *name);
        Self { levels }
    }
}

impl ZoneSource for StaticZones {
    fn zones_at(&self, time: DateTime<Utc>, current_price: Decimal) -> ZoneSet {
        let levels = self
            .levels
            .iter()
            .map(|&(name, price)| ZoneLevel {
                name,
                price,
                zone_low: price,
                zone_high: price,
                volume_strength: Decimal::ONE,
                ma_adjusted: false,
            })
            .collect();
        ZoneSet {
            time,
            current_price,
            levels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Candle;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Flat bars at `price` carrying `volume`
    fn cluster_bars(price: Decimal, volume: Decimal, count: usize, start: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| {
                Candle::new_unchecked(
                    t0() + Duration::hours((start + i) as i64),
                    price,
                    price,
                    price,
                    price,
                    volume,
                )
            })
            .collect()
    }

    #[test]
    fn test_level_name_serde_and_order() {
        let json = serde_json::to_string(&LevelName::Support2).unwrap();
        assert_eq!(json, "\"support_2\"");
        let parsed: LevelName = serde_json::from_str("\"resistance_1\"").unwrap();
        assert_eq!(parsed, LevelName::Resistance1);
        assert!(LevelName::Support2 < LevelName::Support1);
        assert!(LevelName::Resistance1 < LevelName::Resistance2);
        assert_eq!(LevelName::Resistance2.position_side(), Side::Short);
    }

    #[test]
    fn test_engine_names_levels_by_price() {
        let mut bars = Vec::new();
        bars.extend(cluster_bars(dec!(80), dec!(50), 5, 0));
        bars.extend(cluster_bars(dec!(90), dec!(100), 5, 5));
        bars.extend(cluster_bars(dec!(110), dec!(90), 5, 10));
        bars.extend(cluster_bars(dec!(120), dec!(40), 5, 15));

        let config = ZoneConfig {
            deviation_pct: dec!(0.25),
            ..ZoneConfig::default()
        };
        let engine = ZoneEngine::new(config);
        let windows = [TimeframeWindow::new("long", dec!(1), &bars)];
        let zones = engine.compute(t0(), &windows, dec!(100));

        assert_eq!(zones.len(), 4);
        let s2 = zones.price(LevelName::Support2).unwrap();
        let s1 = zones.price(LevelName::Support1).unwrap();
        let r1 = zones.price(LevelName::Resistance1).unwrap();
        let r2 = zones.price(LevelName::Resistance2).unwrap();
        assert!(s2 < s1 && s1 < dec!(100) && dec!(100) < r1 && r1 < r2);
        assert!((s2 - dec!(80)).abs() < dec!(1));
        assert!((r2 - dec!(120)).abs() < dec!(1));
    }

    #[test]
    fn test_single_interval_per_side_uses_inner_name() {
        let mut bars = Vec::new();
        bars.extend(cluster_bars(dec!(90), dec!(100), 5, 0));
        bars.extend(cluster_bars(dec!(110), dec!(100), 5, 5));

        let engine = ZoneEngine::new(ZoneConfig::default());
        let windows = [TimeframeWindow::new("long", dec!(1), &bars)];
        let zones = engine.compute(t0(), &windows, dec!(100));

        assert_eq!(zones.len(), 2);
        assert!(zones.get(LevelName::Support1).is_some());
        assert!(zones.get(LevelName::Resistance1).is_some());
        assert!(zones.get(LevelName::Support2).is_none());
    }

    #[test]
    fn test_empty_history_yields_empty_set() {
        let engine = ZoneEngine::new(ZoneConfig::default());
        let zones = engine.compute(t0(), &[], dec!(100));
        assert!(zones.is_empty());
        assert!(zones.ensure_usable().is_err());
    }
}
