//! Zone grid - main entry point
//!
//! This binary provides two subcommands:
//! - backtest: Replay the grid over historical bars for one or more symbols
//! - zones: Print the zone set computed at a point in time

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

#[derive(Parser, Debug)]
#[command(name = "zone-grid")]
#[command(about = "Volume-cluster zones and a bidirectional grid backtester", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run grid backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/btcusdt_1h.json")]
        config: String,

        /// Symbols to run (comma-separated, overrides config file). E.g., "BTCUSDT,ETHUSDT"
        #[arg(short, long)]
        symbols: Option<String>,

        /// Primary bar interval. E.g., "1h", "4h"
        #[arg(short, long)]
        interval: Option<String>,

        /// Initial capital
        #[arg(long)]
        capital: Option<Decimal>,

        /// Stop-loss buffer beyond the protective level, as a fraction. E.g., 0.03
        #[arg(long)]
        stop_buffer: Option<Decimal>,

        /// Bars a pending order stays live
        #[arg(long)]
        ttl: Option<u32>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Write the event log as JSON lines into the results directory
        #[arg(long)]
        events: bool,

        /// SQLite journal path (overrides config file)
        #[arg(long)]
        journal: Option<String>,
    },

    /// Show the zones computed at a given time
    Zones {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/btcusdt_1h.json")]
        config: String,

        /// Symbol (overrides config file)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Bar time to evaluate (defaults to the last bar)
        #[arg(long)]
        at: Option<String>,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Keep the console clean for the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        // Same format as the console, without colors
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // Several symbols run in parallel behind a progress bar
    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { symbols, .. } => (
            "backtest",
            symbols.as_deref().is_some_and(|s| s.contains(',')),
        ),
        Commands::Zones { .. } => ("zones", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Backtest {
            config,
            symbols,
            interval,
            capital,
            stop_buffer,
            ttl,
            start,
            end,
            events,
            journal,
        } => commands::backtest::run(commands::backtest::Overrides {
            config_path: config,
            symbols,
            interval,
            capital,
            stop_buffer,
            ttl,
            start,
            end,
            write_events: events,
            journal,
        }),

        Commands::Zones { config, symbol, at } => commands::zones::run(config, symbol, at),
    }
}
