//! Zones command implementation

use anyhow::{Context, Result};
use tracing::info;

use zone_grid::zones::ZoneEngine;
use zone_grid::{data, Config};

pub fn run(config_path: String, symbol: Option<String>, at: Option<String>) -> Result<()> {
    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    if let Some(symbol) = symbol {
        config.symbol = symbol.to_uppercase();
    }

    let at = at.as_deref().map(data::parse_date).transpose()?;
    let market = data::load_market(&config, None, at)?;
    let bar = market
        .primary()
        .last()
        .context("No bar at or before the requested time")?;

    let engine = ZoneEngine::new(config.zones.clone());
    let windows = market.windows_ending_at(bar.datetime, &engine.config().timeframes);
    for window in &windows {
        info!(
            "Timeframe {}: {} bars, weight {}",
            window.name,
            window.candles.len(),
            window.weight
        );
    }
    let long_ma = engine.long_ma(&windows);
    let zones = engine.compute(bar.datetime, &windows, bar.close);

    println!("\n{}", "=".repeat(72));
    println!("ZONES: {} {} @ {}", config.symbol, config.interval, bar.datetime);
    println!("{}", "=".repeat(72));
    println!("Current Price:  {}", bar.close);
    match long_ma {
        Some(ma) => println!("Long MA:        {:.4}", ma),
        None => println!("Long MA:        n/a"),
    }
    println!("{}", "-".repeat(72));
    println!(
        "{:<14} {:>14} {:>14} {:>14} {:>8} {:>4}",
        "Level", "Price", "Zone Low", "Zone High", "Strength", "MA"
    );
    for level in zones.levels.iter().rev() {
        println!(
            "{:<14} {:>14.4} {:>14.4} {:>14.4} {:>8.3} {:>4}",
            level.name.as_str(),
            level.price,
            level.zone_low,
            level.zone_high,
            level.volume_strength,
            if level.ma_adjusted { "yes" } else { "" }
        );
    }
    if zones.is_empty() {
        println!("(no usable zones)");
    }
    println!("{}", "=".repeat(72));

    Ok(())
}
