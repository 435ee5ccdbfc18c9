//! Backtesting engine
//!
//! Replays a bar series through the grid executor and reduces the resulting
//! books to a `RunSummary`. Symbols are independent units of state, so a
//! batch of them can be replayed in parallel.

use std::sync::Arc;

use chrono::Duration;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ConfigError, EngineError};
use crate::events::EventLog;
use crate::executor::{BarSnapshot, GridExecutor};
use crate::market::MarketData;
use crate::oms::{ExitReason, PendingOrder, Position};
use crate::zones::{MarketZones, ZoneEngine, ZoneSource};
use crate::{Candle, Config, RunSummary, Symbol};

/// Backtest engine for one symbol
pub struct Backtester {
    config: Config,
    bar_interval: Duration,
}

impl Backtester {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        let bar_interval = config.bar_interval()?;
        Ok(Backtester {
            config,
            bar_interval,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run against zones computed from `market` on every bar
    pub fn run(&self, market: MarketData) -> Result<BacktestResult, EngineError> {
        let market = Arc::new(market);
        let engine = ZoneEngine::new(self.config.zones.clone());
        let zones = MarketZones::new(engine, Arc::clone(&market));
        self.run_with_zones(market.traded(), Box::new(zones))
    }

    /// Run `candles` against any zone source
    pub fn run_with_zones(
        &self,
        candles: &[Candle],
        zones: Box<dyn ZoneSource>,
    ) -> Result<BacktestResult, EngineError> {
        let symbol = self.config.symbol();
        let mut executor = GridExecutor::new(&self.config, self.bar_interval, zones);

        let start = self.config.backtest.warmup_bars.min(candles.len());
        if start == candles.len() {
            warn!(%symbol, bars = candles.len(), "No bars left after warmup");
        }
        for (idx, bar) in candles.iter().enumerate().skip(start) {
            executor.process_bar(idx, bar)?;
        }
        executor.finish()?;

        let (ledger, store, events, snapshots) = executor.into_parts();
        let mut summary = calculate_summary(self.config.initial_capital, store.positions(), &snapshots);
        summary.final_equity = snapshots
            .last()
            .map(|s| s.equity)
            .unwrap_or_else(|| ledger.cash());
        summary.realized_pnl = ledger.realized_pnl();

        info!(
            %symbol,
            bars = snapshots.len(),
            trades = summary.trade_count,
            total_return = summary.total_return,
            "Backtest finished"
        );

        Ok(BacktestResult {
            symbol,
            summary,
            snapshots,
            positions: store.positions().to_vec(),
            orders: store.orders().to_vec(),
            events,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub symbol: Symbol,
    pub summary: RunSummary,
    /// One entry per processed bar; the last one reflects end-of-run settlement
    pub snapshots: Vec<BarSnapshot>,
    pub positions: Vec<Position>,
    pub orders: Vec<PendingOrder>,
    #[serde(skip)]
    pub events: EventLog,
}

impl BacktestResult {
    pub fn closed_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| !p.is_open())
    }
}

/// Reduce closed positions and the equity curve to summary statistics
pub fn calculate_summary(
    initial_capital: Decimal,
    positions: &[Position],
    snapshots: &[BarSnapshot],
) -> RunSummary {
    let initial = initial_capital.to_f64().unwrap_or(0.0);
    let final_equity = snapshots.last().map_or(initial_capital, |s| s.equity);
    let final_value = final_equity.to_f64().unwrap_or(initial);

    let total_return = if initial > 0.0 {
        ((final_value - initial) / initial) * 100.0
    } else {
        0.0
    };

    let pnls: Vec<f64> = positions
        .iter()
        .filter_map(|p| p.realized_pnl)
        .map(|pnl| pnl.to_f64().unwrap_or(0.0))
        .collect();

    let winning: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losing: Vec<f64> = pnls.iter().copied().filter(|p| *p <= 0.0).collect();

    let win_rate = if !pnls.is_empty() {
        (winning.len() as f64 / pnls.len() as f64) * 100.0
    } else {
        0.0
    };

    let gross_profits: f64 = winning.iter().sum();
    let gross_losses: f64 = losing.iter().map(|p| p.abs()).sum();

    let profit_factor = if gross_losses > 0.0 {
        gross_profits / gross_losses
    } else if gross_profits > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let avg_win = if !winning.is_empty() {
        gross_profits / winning.len() as f64
    } else {
        0.0
    };

    let avg_loss = if !losing.is_empty() {
        gross_losses / losing.len() as f64
    } else {
        0.0
    };

    let largest_win = winning.iter().copied().fold(0.0, f64::max);
    let largest_loss = losing.iter().copied().fold(0.0, f64::min);

    // Peak-to-trough on marked-to-market equity
    let mut peak = initial;
    let mut max_dd = 0.0;
    for snapshot in snapshots {
        let equity = snapshot.equity.to_f64().unwrap_or(peak);
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }

    let exits = |reason: ExitReason| {
        positions
            .iter()
            .filter(|p| p.exit_reason == Some(reason))
            .count()
    };

    RunSummary {
        total_return,
        max_drawdown: max_dd * 100.0,
        win_rate,
        trade_count: pnls.len(),
        winning_trades: winning.len(),
        losing_trades: losing.len(),
        profit_factor,
        avg_win,
        avg_loss,
        largest_win,
        largest_loss,
        stop_loss_exits: exits(ExitReason::StopLoss),
        take_profit_exits: exits(ExitReason::TakeProfit),
        final_equity,
        realized_pnl: positions.iter().filter_map(|p| p.realized_pnl).sum(),
    }
}

/// One symbol's configuration and history
pub struct BacktestJob {
    pub config: Config,
    pub market: MarketData,
}

/// Replay independent symbols in parallel, one result per job in input order
pub fn run_parallel(
    jobs: Vec<BacktestJob>,
    show_progress: bool,
) -> Vec<(Symbol, anyhow::Result<BacktestResult>)> {
    let pb = if show_progress {
        ProgressBar::new(jobs.len() as u64)
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let results: Vec<(Symbol, anyhow::Result<BacktestResult>)> = jobs
        .into_par_iter()
        .map(|job| {
            let symbol = job.config.symbol();
            let result = Backtester::new(job.config)
                .map_err(anyhow::Error::from)
                .and_then(|bt| bt.run(job.market).map_err(anyhow::Error::from));
            pb.set_message(symbol.to_string());
            pb.inc(1);
            (symbol, result)
        })
        .collect();

    pb.finish_with_message("done");
    results
}
