//! Weighted volume heatmap and sliding-window interval extraction

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use super::config::MIN_PRICE_RESOLUTION_PCT;
use crate::Candle;

/// Bars of one timeframe covering its lookback, plus the timeframe weight
#[derive(Debug, Clone, Copy)]
pub struct TimeframeWindow<'a> {
    pub name: &'a str,
    pub weight: Decimal,
    pub candles: &'a [Candle],
}

impl<'a> TimeframeWindow<'a> {
    pub fn new(name: &'a str, weight: Decimal, candles: &'a [Candle]) -> Self {
        Self {
            name,
            weight,
            candles,
        }
    }
}

/// One histogram row; `price` is the bucket's lower edge
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBucket {
    pub price: Decimal,
    pub volume: Decimal,
}

/// Candidate zone produced by one window of buckets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInterval {
    pub price_low: Decimal,
    pub price_high: Decimal,
    pub center: Decimal,
    pub total_volume: Decimal,
    /// `total_volume` relative to the strongest interval of the same pass
    pub volume_strength: Decimal,
}

/// Dense, price-ordered histogram over the combined range of all timeframes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Heatmap {
    pub bucket_size: Decimal,
    pub buckets: Vec<PriceBucket>,
}

impl Heatmap {
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn total_volume(&self) -> Decimal {
        self.buckets.iter().map(|b| b.volume).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ZoneClusterer {
    resolution_pct: Decimal,
    window_size: usize,
    deviation_pct: Decimal,
}

impl ZoneClusterer {
    /// `resolution_pct` is clamped to `MIN_PRICE_RESOLUTION_PCT`
    pub fn new(resolution_pct: Decimal, window_size: usize, deviation_pct: Decimal) -> Self {
        Self {
            resolution_pct: resolution_pct.max(MIN_PRICE_RESOLUTION_PCT),
            window_size: window_size.max(1),
            deviation_pct,
        }
    }

    /// Heatmap followed by ranked intervals around `current_price`
    pub fn cluster(
        &self,
        windows: &[TimeframeWindow<'_>],
        current_price: Decimal,
    ) -> Vec<VolumeInterval> {
        let heatmap = self.build_heatmap(windows);
        self.extract_intervals(&heatmap, current_price)
    }

    /// Spread each bar's volume over the buckets its [low, high] range
    /// overlaps, proportional to overlap width, scaled by the timeframe weight
    pub fn build_heatmap(&self, windows: &[TimeframeWindow<'_>]) -> Heatmap {
        let mut bars = windows
            .iter()
            .flat_map(|w| w.candles.iter())
            .peekable();
        if bars.peek().is_none() {
            return Heatmap::default();
        }

        let (min_low, max_high) = bars.fold((Decimal::MAX, Decimal::MIN), |(lo, hi), c| {
            (lo.min(c.low), hi.max(c.high))
        });
        let range = max_high - min_low;

        // A single traded price collapses to one bucket
        if range <= Decimal::ZERO {
            let volume = windows
                .iter()
                .flat_map(|w| w.candles.iter().map(move |c| c.volume * w.weight))
                .sum();
            return Heatmap {
                bucket_size: Decimal::ZERO,
                buckets: vec![PriceBucket {
                    price: min_low,
                    volume,
                }],
            };
        }

        let bucket_size = range * self.resolution_pct;
        let count = (Decimal::ONE / self.resolution_pct)
            .ceil()
            .to_usize()
            .unwrap_or(1)
            .max(1);
        let mut volumes = vec![Decimal::ZERO; count];

        let index_of = |price: Decimal| -> usize {
            ((price - min_low) / bucket_size)
                .floor()
                .to_usize()
                .unwrap_or(0)
                .min(count - 1)
        };

        for window in windows {
            for candle in window.candles {
                let weighted = candle.volume * window.weight;
                if weighted.is_zero() {
                    continue;
                }
                let lo = index_of(candle.low);
                let hi = index_of(candle.high);
                let span = candle.high - candle.low;
                if lo == hi || span.is_zero() {
                    volumes[lo] += weighted;
                    continue;
                }
                let per_unit = weighted / span;
                for (idx, volume) in volumes.iter_mut().enumerate().take(hi + 1).skip(lo) {
                    let bucket_low = min_low + bucket_size * Decimal::from(idx);
                    let bucket_high = if idx == count - 1 {
                        max_high.max(bucket_low + bucket_size)
                    } else {
                        bucket_low + bucket_size
                    };
                    let overlap = candle.high.min(bucket_high) - candle.low.max(bucket_low);
                    if overlap > Decimal::ZERO {
                        *volume += per_unit * overlap;
                    }
                }
            }
        }

        let buckets = volumes
            .into_iter()
            .enumerate()
            .map(|(idx, volume)| PriceBucket {
                price: min_low + bucket_size * Decimal::from(idx),
                volume,
            })
            .collect();

        Heatmap {
            bucket_size,
            buckets,
        }
    }

    /// Slide a fixed-size window over the heatmap and rank the windows whose
    /// center lies within the deviation band around `current_price`
    pub fn extract_intervals(&self, heatmap: &Heatmap, current_price: Decimal) -> Vec<VolumeInterval> {
        let n = self.window_size;
        if heatmap.len() < n {
            return Vec::new();
        }

        let band_low = current_price * (Decimal::ONE - self.deviation_pct);
        let band_high = current_price * (Decimal::ONE + self.deviation_pct);
        let two = Decimal::TWO;

        let mut intervals = Vec::new();
        let mut running: Decimal = heatmap.buckets[..n].iter().map(|b| b.volume).sum();
        for start in 0..=heatmap.len() - n {
            if start > 0 {
                running += heatmap.buckets[start + n - 1].volume - heatmap.buckets[start - 1].volume;
            }
            let price_low = heatmap.buckets[start].price;
            let price_high = heatmap.buckets[start + n - 1].price + heatmap.bucket_size;
            let center = (price_low + price_high) / two;
            if center < band_low || center > band_high || running <= Decimal::ZERO {
                continue;
            }
            intervals.push(VolumeInterval {
                price_low,
                price_high,
                center,
                total_volume: running,
                volume_strength: Decimal::ZERO,
            });
        }

        intervals.sort_by(|a, b| rank(a, b, current_price));

        if let Some(max) = intervals.first().map(|i| i.total_volume) {
            for interval in &mut intervals {
                interval.volume_strength = interval.total_volume / max;
            }
        }
        intervals
    }
}

/// Heavier first; ties go to the window nearer the current price, then the lower one
fn rank(a: &VolumeInterval, b: &VolumeInterval, current_price: Decimal) -> Ordering {
    b.total_volume
        .cmp(&a.total_volume)
        .then_with(|| {
            (a.center - current_price)
                .abs()
                .cmp(&(b.center - current_price).abs())
        })
        .then_with(|| a.center.cmp(&b.center))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn bar(low: Decimal, high: Decimal, volume: Decimal) -> Candle {
        Candle::new_unchecked(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            low,
            high,
            low,
            high,
            volume,
        )
    }

    #[test]
    fn test_volume_spread_by_overlap() {
        // Range 100..110 with 10% resolution gives ten 1.0-wide buckets
        let bars = vec![bar(dec!(100), dec!(110), dec!(10)), bar(dec!(102), dec!(104), dec!(4))];
        let clusterer = ZoneClusterer::new(dec!(0.1), 2, dec!(0.15));
        let heatmap = clusterer.build_heatmap(&[TimeframeWindow::new("tf", dec!(1), &bars)]);

        assert_eq!(heatmap.len(), 10);
        assert_eq!(heatmap.bucket_size, dec!(1));
        assert_eq!(heatmap.buckets[0].volume, dec!(1));
        assert_eq!(heatmap.buckets[2].volume, dec!(3));
        assert_eq!(heatmap.buckets[3].volume, dec!(3));
        assert_eq!(heatmap.buckets[4].volume, dec!(1));
        assert_eq!(heatmap.total_volume(), dec!(14));
    }

    #[test]
    fn test_resolution_clamped_to_floor() {
        let bars = vec![bar(dec!(100), dec!(110), dec!(10))];
        let clusterer = ZoneClusterer::new(dec!(0.000000001), 5, dec!(0.15));
        let heatmap = clusterer.build_heatmap(&[TimeframeWindow::new("tf", dec!(1), &bars)]);

        assert_eq!(heatmap.len(), 10_000);
        assert_eq!(heatmap.bucket_size, dec!(0.001));
        assert_eq!(heatmap.total_volume(), dec!(10));
    }

    #[test]
    fn test_timeframe_weight_scales_volume() {
        let bars = vec![bar(dec!(100), dec!(110), dec!(10))];
        let clusterer = ZoneClusterer::new(dec!(0.1), 2, dec!(0.15));
        let heatmap = clusterer.build_heatmap(&[
            TimeframeWindow::new("long", dec!(1.5), &bars),
            TimeframeWindow::new("short", dec!(1.0), &bars),
        ]);
        assert_eq!(heatmap.total_volume(), dec!(25));
        assert_eq!(heatmap.buckets[7].volume, dec!(2.5));
    }

    #[test]
    fn test_fewer_buckets_than_window_yields_nothing() {
        let bars = vec![bar(dec!(100), dec!(100), dec!(10))];
        let clusterer = ZoneClusterer::new(dec!(0.001), 5, dec!(0.15));
        let heatmap = clusterer.build_heatmap(&[TimeframeWindow::new("tf", dec!(1), &bars)]);
        assert_eq!(heatmap.len(), 1);
        assert!(clusterer.extract_intervals(&heatmap, dec!(100)).is_empty());
    }

    #[test]
    fn test_intervals_ranked_and_normalized() {
        let bars = vec![
            bar(dec!(100), dec!(101), dec!(30)),
            bar(dec!(105), dec!(106), dec!(10)),
            bar(dec!(109), dec!(110), dec!(20)),
        ];
        let clusterer = ZoneClusterer::new(dec!(0.1), 1, dec!(0.15));
        let intervals = clusterer.cluster(&[TimeframeWindow::new("tf", dec!(1), &bars)], dec!(105));

        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[0].total_volume, dec!(30));
        assert_eq!(intervals[0].volume_strength, dec!(1));
        assert_eq!(intervals[1].total_volume, dec!(20));
        assert_eq!(intervals[2].center, dec!(105.5));
        for pair in intervals.windows(2) {
            assert!(pair[0].total_volume >= pair[1].total_volume);
        }
    }

    #[test]
    fn test_deviation_band_filters_far_windows() {
        let bars = vec![bar(dec!(50), dec!(51), dec!(100)), bar(dec!(99), dec!(100), dec!(1))];
        let clusterer = ZoneClusterer::new(dec!(0.02), 1, dec!(0.15));
        let intervals = clusterer.cluster(&[TimeframeWindow::new("tf", dec!(1), &bars)], dec!(100));
        assert!(!intervals.is_empty());
        assert!(intervals.iter().all(|i| i.center >= dec!(85)));
    }

    #[test]
    fn test_equal_volume_prefers_nearer_window() {
        let bars = vec![bar(dec!(90), dec!(91), dec!(10)), bar(dec!(109), dec!(110), dec!(10))];
        let clusterer = ZoneClusterer::new(dec!(0.05), 1, dec!(0.25));
        let intervals = clusterer.cluster(&[TimeframeWindow::new("tf", dec!(1), &bars)], dec!(101));
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].center, dec!(109.5));
        assert_eq!(intervals[1].center, dec!(90.5));
    }
}
