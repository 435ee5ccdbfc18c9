//! Entry rules
//!
//! The ways a level can trigger an entry form one closed enum, dispatched by
//! a single pure function. A rule only looks at the level and the current
//! bar; funds, slots and cooldowns are checked by the executor afterwards.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::check_fraction;
use crate::error::ConfigError;
use crate::zones::LevelName;
use crate::{Candle, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryRule {
    /// Enter at the level as soon as the bar trades through it
    #[default]
    Touch,
    /// Enter at the close once the bar pierces the level and closes back on the entry side
    Rejection,
    /// Rest a limit order at the level when the close comes within `pct` of it
    Proximity { pct: Decimal },
}

impl EntryRule {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            EntryRule::Proximity { pct } => check_fraction("entry_rule.pct", *pct),
            EntryRule::Touch | EntryRule::Rejection => Ok(()),
        }
    }
}

/// What a rule sees for one level on one bar
#[derive(Debug, Clone, Copy)]
pub struct EntryContext<'a> {
    pub level: LevelName,
    pub level_price: Decimal,
    pub bar: &'a Candle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Lock and commit now at `price`
    Immediate,
    /// Rest a limit order at `price`
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySignal {
    pub level: LevelName,
    pub side: Side,
    pub price: Decimal,
    pub kind: EntryKind,
}

pub fn evaluate(rule: &EntryRule, ctx: &EntryContext<'_>) -> Option<EntrySignal> {
    let side = ctx.level.position_side();
    let level = ctx.level_price;
    let bar = ctx.bar;
    if level <= Decimal::ZERO {
        return None;
    }

    let (price, kind) = match (rule, side) {
        (EntryRule::Touch, Side::Long) if bar.low <= level => {
            (bar.open.min(level), EntryKind::Immediate)
        }
        (EntryRule::Touch, Side::Short) if bar.high >= level => {
            (bar.open.max(level), EntryKind::Immediate)
        }
        (EntryRule::Rejection, Side::Long) if bar.low <= level && bar.close > level => {
            (bar.close, EntryKind::Immediate)
        }
        (EntryRule::Rejection, Side::Short) if bar.high >= level && bar.close < level => {
            (bar.close, EntryKind::Immediate)
        }
        (EntryRule::Proximity { pct }, Side::Long)
            if bar.close > level && bar.close <= level * (Decimal::ONE + *pct) =>
        {
            (level, EntryKind::Pending)
        }
        (EntryRule::Proximity { pct }, Side::Short)
            if bar.close < level && bar.close >= level * (Decimal::ONE - *pct) =>
        {
            (level, EntryKind::Pending)
        }
        _ => return None,
    };

    Some(EntrySignal {
        level: ctx.level,
        side,
        price,
        kind,
    })
}
