//! Technical indicators
//!
//! Decimal moving averages used by the zone pipeline. Prices stay in
//! `Decimal` so snapped zone prices compare exactly against bar prices.

use rust_decimal::Decimal;

/// Simple moving average of the last `period` values, if there are enough
pub fn sma_last(values: &[Decimal], period: usize) -> Option<Decimal> {
    if period == 0 || values.len() < period {
        return None;
    }
    let window = &values[values.len() - period..];
    Some(window.iter().sum::<Decimal>() / Decimal::from(period))
}
