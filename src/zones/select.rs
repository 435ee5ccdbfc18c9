//! Greedy per-side zone selection with minimum separation

use rust_decimal::Decimal;
use tracing::trace;

use super::cluster::VolumeInterval;
use super::{LevelName, ZoneSide};

/// Levels kept per side of the current price
const MAX_PER_SIDE: usize = 2;

/// Accepted intervals on each side, ascending by center
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub below: Vec<VolumeInterval>,
    pub above: Vec<VolumeInterval>,
}

impl Selection {
    pub fn side(&self, side: ZoneSide) -> &[VolumeInterval] {
        match side {
            ZoneSide::Support => &self.below,
            ZoneSide::Resistance => &self.above,
        }
    }

    pub fn len(&self) -> usize {
        self.below.len() + self.above.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Map accepted intervals to level names by center price. A lone
    /// interval on one side takes the inner name.
    pub fn named(&self) -> Vec<(LevelName, &VolumeInterval)> {
        let mut named = Vec::with_capacity(self.len());
        match self.below.as_slice() {
            [only] => named.push((LevelName::Support1, only)),
            [lower, upper] => {
                named.push((LevelName::Support2, lower));
                named.push((LevelName::Support1, upper));
            }
            _ => {}
        }
        match self.above.as_slice() {
            [only] => named.push((LevelName::Resistance1, only)),
            [lower, upper] => {
                named.push((LevelName::Resistance1, lower));
                named.push((LevelName::Resistance2, upper));
            }
            _ => {}
        }
        named
    }
}

#[derive(Debug, Clone)]
pub struct ZoneSelector {
    min_distance_pct: Decimal,
}

impl ZoneSelector {
    pub fn new(min_distance_pct: Decimal) -> Self {
        Self { min_distance_pct }
    }

    /// `ranked` must be ordered strongest first, as the clusterer returns it
    pub fn select(&self, ranked: &[VolumeInterval], current_price: Decimal) -> Selection {
        let mut selection = Selection::default();

        for interval in ranked {
            let accepted = if interval.center < current_price {
                &mut selection.below
            } else if interval.center > current_price {
                &mut selection.above
            } else {
                continue;
            };
            if accepted.len() >= MAX_PER_SIDE {
                continue;
            }
            if accepted.iter().all(|a| self.far_enough(a.center, interval.center)) {
                accepted.push(interval.clone());
            } else {
                trace!(center = %interval.center, "Interval too close to an accepted zone");
            }
            if selection.below.len() >= MAX_PER_SIDE && selection.above.len() >= MAX_PER_SIDE {
                break;
            }
        }

        selection.below.sort_by(|a, b| a.center.cmp(&b.center));
        selection.above.sort_by(|a, b| a.center.cmp(&b.center));
        selection
    }

    fn far_enough(&self, accepted: Decimal, candidate: Decimal) -> bool {
        if accepted.is_zero() {
            return candidate != accepted;
        }
        (candidate - accepted).abs() / accepted >= self.min_distance_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn interval(center: Decimal, volume: Decimal) -> VolumeInterval {
        VolumeInterval {
            price_low: center - dec!(0.5),
            price_high: center + dec!(0.5),
            center,
            total_volume: volume,
            volume_strength: Decimal::ONE,
        }
    }

    #[test]
    fn test_two_per_side_named_ascending() {
        let ranked = vec![
            interval(dec!(95), dec!(100)),
            interval(dec!(108), dec!(90)),
            interval(dec!(85), dec!(80)),
            interval(dec!(120), dec!(70)),
            interval(dec!(75), dec!(60)),
        ];
        let selection = ZoneSelector::new(dec!(0.05)).select(&ranked, dec!(100));
        let named = selection.named();

        assert_eq!(named.len(), 4);
        assert_eq!(named[0], (LevelName::Support2, &ranked[2]));
        assert_eq!(named[1], (LevelName::Support1, &ranked[0]));
        assert_eq!(named[2], (LevelName::Resistance1, &ranked[1]));
        assert_eq!(named[3], (LevelName::Resistance2, &ranked[3]));
    }

    #[test]
    fn test_close_intervals_collapse_to_one() {
        // 110 and 112 are under 3% apart: only the heavier survives
        let ranked = vec![
            interval(dec!(110), dec!(100)),
            interval(dec!(90), dec!(90)),
            interval(dec!(112), dec!(80)),
            interval(dec!(80), dec!(70)),
        ];
        let selection = ZoneSelector::new(dec!(0.05)).select(&ranked, dec!(100));

        assert_eq!(selection.len(), 3);
        assert_eq!(selection.above.len(), 1);
        assert_eq!(selection.above[0].center, dec!(110));
        let names: Vec<LevelName> = selection.named().iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec![LevelName::Support2, LevelName::Support1, LevelName::Resistance1]
        );
    }

    #[test]
    fn test_empty_side_is_valid() {
        let ranked = vec![interval(dec!(90), dec!(10))];
        let selection = ZoneSelector::new(dec!(0.05)).select(&ranked, dec!(100));
        assert!(selection.above.is_empty());
        assert_eq!(selection.named(), vec![(LevelName::Support1, &ranked[0])]);
    }

    #[test]
    fn test_interval_at_current_price_is_ignored() {
        let ranked = vec![interval(dec!(100), dec!(10))];
        assert!(ZoneSelector::new(dec!(0.05)).select(&ranked, dec!(100)).is_empty());
    }
}
