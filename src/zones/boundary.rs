//! Conservative zone boundaries with long-MA magnet

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::cluster::VolumeInterval;
use super::ZoneSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustedBoundary {
    pub price: Decimal,
    pub adjusted: bool,
}

/// Edge of the interval that is harder to reach from the current price:
/// the bottom of a resistance zone, the top of a support zone
pub fn boundary_price(interval: &VolumeInterval, side: ZoneSide) -> Decimal {
    match side {
        ZoneSide::Resistance => interval.price_low,
        ZoneSide::Support => interval.price_high,
    }
}

/// Replace `boundary` with `long_ma` when the two are closer than `threshold`
/// (relative to the boundary). Snapping an already snapped price is a no-op.
pub fn snap_to_ma(boundary: Decimal, long_ma: Option<Decimal>, threshold: Decimal) -> AdjustedBoundary {
    let unchanged = AdjustedBoundary {
        price: boundary,
        adjusted: false,
    };
    let Some(ma) = long_ma else {
        return unchanged;
    };
    if boundary <= Decimal::ZERO {
        return unchanged;
    }
    let distance = (boundary - ma).abs() / boundary;
    if distance < threshold {
        AdjustedBoundary {
            price: ma,
            adjusted: true,
        }
    } else {
        unchanged
    }
}

pub fn adjust_boundary(
    interval: &VolumeInterval,
    side: ZoneSide,
    long_ma: Option<Decimal>,
    threshold: Decimal,
) -> AdjustedBoundary {
    snap_to_ma(boundary_price(interval, side), long_ma, threshold)
}
