//! Engine events
//!
//! Every state transition the executor makes is appended here, in order.
//! The log is the engine's output contract: reports, the run journal and the
//! JSON-lines export all read from it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::oms::types::{ExitReason, OrderId, PositionId};
use crate::zones::{LevelName, ZoneLevel};
use crate::{OrderSide, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    ZoneRecomputed {
        bar: usize,
        time: DateTime<Utc>,
        current_price: Decimal,
        levels: Vec<ZoneLevel>,
    },
    OrderCreated {
        bar: usize,
        time: DateTime<Utc>,
        order: OrderId,
        level: LevelName,
        side: OrderSide,
        limit_price: Decimal,
        locked_amount: Decimal,
        expire_time: DateTime<Utc>,
    },
    OrderFilled {
        bar: usize,
        time: DateTime<Utc>,
        order: OrderId,
        position: PositionId,
        level: LevelName,
        fill_price: Decimal,
        amount: Decimal,
    },
    OrderExpired {
        bar: usize,
        time: DateTime<Utc>,
        order: OrderId,
        level: LevelName,
        released: Decimal,
    },
    OrderCancelled {
        bar: usize,
        time: DateTime<Utc>,
        order: OrderId,
        level: LevelName,
        released: Decimal,
    },
    PositionOpened {
        bar: usize,
        time: DateTime<Utc>,
        position: PositionId,
        level: LevelName,
        side: Side,
        entry_price: Decimal,
        quantity: Decimal,
        cost_basis: Decimal,
        target_price: Decimal,
        stop_price: Decimal,
    },
    PositionClosed {
        bar: usize,
        time: DateTime<Utc>,
        position: PositionId,
        level: LevelName,
        side: Side,
        close_price: Decimal,
        pnl: Decimal,
        reason: ExitReason,
    },
    /// A level triggered but no entry was made
    EntrySkipped {
        bar: usize,
        time: DateTime<Utc>,
        level: LevelName,
        reason: String,
    },
    /// First stage of the two-stage stop
    StopWarning {
        bar: usize,
        time: DateTime<Utc>,
        position: PositionId,
        level: LevelName,
        close: Decimal,
        warnings: u32,
    },
}

impl EngineEvent {
    pub fn bar(&self) -> usize {
        match self {
            EngineEvent::ZoneRecomputed { bar, .. }
            | EngineEvent::OrderCreated { bar, .. }
            | EngineEvent::OrderFilled { bar, .. }
            | EngineEvent::OrderExpired { bar, .. }
            | EngineEvent::OrderCancelled { bar, .. }
            | EngineEvent::PositionOpened { bar, .. }
            | EngineEvent::PositionClosed { bar, .. }
            | EngineEvent::EntrySkipped { bar, .. }
            | EngineEvent::StopWarning { bar, .. } => *bar,
        }
    }

    /// Snake-case tag, as written in the `event` field
    pub fn kind(&self) -> &'static str {
        match self {
            EngineEvent::ZoneRecomputed { .. } => "zone_recomputed",
            EngineEvent::OrderCreated { .. } => "order_created",
            EngineEvent::OrderFilled { .. } => "order_filled",
            EngineEvent::OrderExpired { .. } => "order_expired",
            EngineEvent::OrderCancelled { .. } => "order_cancelled",
            EngineEvent::PositionOpened { .. } => "position_opened",
            EngineEvent::PositionClosed { .. } => "position_closed",
            EngineEvent::EntrySkipped { .. } => "entry_skipped",
            EngineEvent::StopWarning { .. } => "stop_warning",
        }
    }
}

/// Append-only event sequence
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<EngineEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn as_slice(&self) -> &[EngineEvent] {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineEvent> {
        self.events.iter()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events.iter().filter(|e| e.kind() == kind).count()
    }

    /// Drop events appended by a bar that was rolled back
    pub(crate) fn truncate(&mut self, len: usize) {
        self.events.truncate(len);
    }

    /// One JSON object per line
    pub fn write_jsonl(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create event log directory")?;
        }
        let file = File::create(path)
            .with_context(|| format!("Failed to create event log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for event in &self.events {
            serde_json::to_writer(&mut writer, event).context("Failed to serialize event")?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}
