//! Backtest command implementation

use anyhow::{Context, Result};
use itertools::Itertools;
use rust_decimal::Decimal;
use std::path::Path;
use tracing::{debug, error, info};

use zone_grid::backtest::{run_parallel, BacktestJob, BacktestResult};
use zone_grid::journal::RunJournal;
use zone_grid::{data, Config};

/// Values from the command line that replace config file settings
pub struct Overrides {
    pub config_path: String,
    pub symbols: Option<String>,
    pub interval: Option<String>,
    pub capital: Option<Decimal>,
    pub stop_buffer: Option<Decimal>,
    pub ttl: Option<u32>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub write_events: bool,
    pub journal: Option<String>,
}

pub fn run(overrides: Overrides) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::from_file(&overrides.config_path)?;
    info!("Loaded configuration from: {}", overrides.config_path);

    if let Some(interval) = overrides.interval {
        info!("Overriding interval to: {}", interval);
        config.interval = interval;
    }
    if let Some(capital) = overrides.capital {
        info!("Overriding initial capital to: {}", capital);
        config.initial_capital = capital;
    }
    if let Some(buffer) = overrides.stop_buffer {
        info!("Overriding stop-loss buffer to: {}", buffer);
        config.grid.stop_loss_buffer_pct = buffer;
    }
    if let Some(ttl) = overrides.ttl {
        info!("Overriding pending order TTL to: {} bars", ttl);
        config.grid.pending_order_ttl_bars = ttl;
    }
    if overrides.write_events {
        config.backtest.write_events = true;
    }
    if let Some(journal) = overrides.journal {
        config.backtest.journal_path = Some(journal);
    }
    config.validate().context("Invalid configuration after overrides")?;

    let start = overrides.start.as_deref().map(data::parse_date).transpose()?;
    let end = overrides.end.as_deref().map(data::parse_date).transpose()?;

    let symbols: Vec<String> = match overrides.symbols {
        Some(list) => list
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .unique()
            .collect(),
        None => vec![config.symbol.clone()],
    };
    debug!("Symbols: {:?}", symbols);

    let mut jobs = Vec::with_capacity(symbols.len());
    for symbol in &symbols {
        let mut symbol_config = config.clone();
        symbol_config.symbol = symbol.clone();
        let market = data::load_market(&symbol_config, start, end)?;
        jobs.push(BacktestJob {
            config: symbol_config,
            market,
        });
    }
    let configs: Vec<Config> = jobs.iter().map(|job| job.config.clone()).collect();

    info!("Running backtest for {} symbol(s)...", jobs.len());
    let results = run_parallel(jobs, symbols.len() > 1);

    let mut journal = match &config.backtest.journal_path {
        Some(path) => Some(RunJournal::open(path)?),
        None => None,
    };

    let mut failures = 0;
    for ((symbol, result), symbol_config) in results.into_iter().zip(&configs) {
        let result = match result {
            Ok(result) => result,
            Err(e) => {
                error!("Backtest for {} failed: {:#}", symbol, e);
                failures += 1;
                continue;
            }
        };

        print_result(symbol_config, &result);

        if symbol_config.backtest.write_events {
            let path = Path::new(&symbol_config.backtest.results_dir)
                .join(format!("{}_events.jsonl", symbol));
            result.events.write_jsonl(&path)?;
            info!("Events written to: {}", path.display());
        }
        if let Some(journal) = journal.as_mut() {
            journal.record_run(symbol_config, &result)?;
        }
    }

    if failures > 0 {
        anyhow::bail!("{} of {} backtests failed", failures, symbols.len());
    }

    info!("Backtest completed successfully");
    Ok(())
}

fn print_result(config: &Config, result: &BacktestResult) {
    let m = &result.summary;
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS: {} ({})", result.symbol, config.interval);
    println!("{}", "=".repeat(60));
    println!("Initial Capital:    {:.2}", config.initial_capital);
    println!("Final Equity:       {:.2}", m.final_equity);
    println!("Realized PnL:       {:.2}", m.realized_pnl);
    println!("Total Return:       {:.2}%", m.total_return);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Profit Factor:      {:.2}", m.profit_factor);
    println!("Total Trades:       {}", m.trade_count);
    println!("Winning Trades:     {}", m.winning_trades);
    println!("Losing Trades:      {}", m.losing_trades);
    println!("Stop-Loss Exits:    {}", m.stop_loss_exits);
    println!("Take-Profit Exits:  {}", m.take_profit_exits);
    println!("Average Win:        {:.2}", m.avg_win);
    println!("Average Loss:       {:.2}", m.avg_loss);
    println!("Largest Win:        {:.2}", m.largest_win);
    println!("Largest Loss:       {:.2}", m.largest_loss);
    println!("{}", "=".repeat(60));
}
