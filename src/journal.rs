// Run Journal
// SQLite record of finished backtests
//
// Every run is stored with the SHA-256 fingerprint of its effective config,
// its full event log and one row per closed trade. Money columns are stored
// as decimal text so nothing is rounded on the way in or out.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::backtest::BacktestResult;
use crate::Config;

// =============================================================================
// Data Models
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub symbol: String,
    pub config_hash: String,
    pub recorded_at: String,
    pub bars: i64,
    pub trade_count: i64,
    pub total_return: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub final_equity: String,
    pub realized_pnl: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub position_id: i64,
    pub level: String,
    pub side: String,
    pub entry_time: String,
    pub entry_price: String,
    pub exit_time: Option<String>,
    pub exit_price: Option<String>,
    pub quantity: String,
    pub cost_basis: String,
    pub pnl: Option<String>,
    pub exit_reason: Option<String>,
}

// =============================================================================
// Journal Implementation
// =============================================================================

pub struct RunJournal {
    conn: Connection,
}

impl RunJournal {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open journal: {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let journal = Self { conn };
        journal.create_tables()?;
        info!("Run journal opened at {}", db_path.display());
        Ok(journal)
    }

    /// In-memory journal, mostly for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let journal = Self { conn };
        journal.create_tables()?;
        Ok(journal)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                config_hash TEXT NOT NULL,
                config_json TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                bars INTEGER NOT NULL,
                trade_count INTEGER NOT NULL,
                total_return REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                win_rate REAL NOT NULL,
                final_equity TEXT NOT NULL,
                realized_pnl TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                bar INTEGER NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                position_id INTEGER NOT NULL,
                level TEXT NOT NULL,
                side TEXT NOT NULL,
                entry_time TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                exit_time TEXT,
                exit_price TEXT,
                quantity TEXT NOT NULL,
                cost_basis TEXT NOT NULL,
                pnl TEXT,
                exit_reason TEXT
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_runs_config_hash ON runs(config_hash)",
            [],
        )?;
        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, seq)",
            [],
        )?;

        debug!("Journal schema created/verified");
        Ok(())
    }

    /// Store a finished run in one transaction; returns the run id
    pub fn record_run(&mut self, config: &Config, result: &BacktestResult) -> Result<i64> {
        let config_json = serde_json::to_string(config)?;
        let summary = &result.summary;
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO runs
             (symbol, config_hash, config_json, recorded_at, bars, trade_count,
              total_return, max_drawdown, win_rate, final_equity, realized_pnl)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                result.symbol.as_str(),
                config.fingerprint(),
                config_json,
                Utc::now().to_rfc3339(),
                result.snapshots.len() as i64,
                summary.trade_count as i64,
                summary.total_return,
                summary.max_drawdown,
                summary.win_rate,
                summary.final_equity.to_string(),
                summary.realized_pnl.to_string(),
            ],
        )?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx.prepare(
                "INSERT INTO events (run_id, seq, bar, kind, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (seq, event) in result.events.iter().enumerate() {
                stmt.execute(params![
                    run_id,
                    seq as i64,
                    event.bar() as i64,
                    event.kind(),
                    serde_json::to_string(event)?,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO trades
                 (run_id, position_id, level, side, entry_time, entry_price, exit_time,
                  exit_price, quantity, cost_basis, pnl, exit_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for p in result.closed_positions() {
                stmt.execute(params![
                    run_id,
                    p.id.0 as i64,
                    p.level_name.as_str(),
                    p.side.to_string(),
                    p.entry_time.to_rfc3339(),
                    p.entry_price.to_string(),
                    p.close_time.map(|t| t.to_rfc3339()),
                    p.close_price.map(|d| d.to_string()),
                    p.quantity.to_string(),
                    p.cost_basis.to_string(),
                    p.realized_pnl.map(|d| d.to_string()),
                    p.exit_reason.map(|r| r.to_string()),
                ])?;
            }
        }

        tx.commit()?;
        info!(
            "Run recorded: #{} {} | {} trades | {} events | return {:+.2}%",
            run_id,
            result.symbol,
            summary.trade_count,
            result.events.len(),
            summary.total_return
        );
        Ok(run_id)
    }

    /// Earlier runs of the same effective config, newest first
    pub fn runs_for(&self, config_hash: &str) -> Result<Vec<RunRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, symbol, config_hash, recorded_at, bars, trade_count, total_return,
                    max_drawdown, win_rate, final_equity, realized_pnl
             FROM runs WHERE config_hash = ?1 ORDER BY id DESC",
        )?;
        let runs = stmt
            .query_map(params![config_hash], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    config_hash: row.get(2)?,
                    recorded_at: row.get(3)?,
                    bars: row.get(4)?,
                    trade_count: row.get(5)?,
                    total_return: row.get(6)?,
                    max_drawdown: row.get(7)?,
                    win_rate: row.get(8)?,
                    final_equity: row.get(9)?,
                    realized_pnl: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Loaded {} runs for config {}", runs.len(), config_hash);
        Ok(runs)
    }

    pub fn trades(&self, run_id: i64) -> Result<Vec<TradeRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT position_id, level, side, entry_time, entry_price, exit_time, exit_price,
                    quantity, cost_basis, pnl, exit_reason
             FROM trades WHERE run_id = ?1 ORDER BY position_id",
        )?;
        let trades = stmt
            .query_map(params![run_id], |row| {
                Ok(TradeRow {
                    position_id: row.get(0)?,
                    level: row.get(1)?,
                    side: row.get(2)?,
                    entry_time: row.get(3)?,
                    entry_price: row.get(4)?,
                    exit_time: row.get(5)?,
                    exit_price: row.get(6)?,
                    quantity: row.get(7)?,
                    cost_basis: row.get(8)?,
                    pnl: row.get(9)?,
                    exit_reason: row.get(10)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(trades)
    }

    /// Number of journaled events of `kind` for a run
    pub fn event_count(&self, run_id: i64, kind: &str) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM events WHERE run_id = ?1 AND kind = ?2",
            params![run_id, kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
