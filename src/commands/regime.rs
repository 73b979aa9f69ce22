//! Regime command implementation

use anyhow::{bail, Result};
use tracing::{info, warn};
use tradex_engine::data::{self, DateRange};
use tradex_engine::engine::TradingEngine;
use tradex_engine::{Config, Symbol};

pub fn run(config_path: String, symbol: Option<String>) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    let symbols = match symbol {
        Some(s) => vec![Symbol::new(s)],
        None => config.trading.symbols(),
    };

    let data = data::load_directory(
        &config.backtest.data_dir,
        &symbols,
        Some(config.trading.timeframe.as_str()),
        &DateRange::default(),
    )?;
    let engine = TradingEngine::from_config(&config);

    println!("\n{}", "=".repeat(60));
    println!("CURRENT REGIME");
    println!("{}", "=".repeat(60));

    let mut shown = 0;
    for (symbol, series) in data.iter() {
        let (regime, decision) = match engine.evaluate(series) {
            Ok(result) => result,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Cannot evaluate symbol");
                continue;
            }
        };
        shown += 1;

        let fmt_opt = |v: Option<f64>| v.map(|x| format!("{:.4}", x)).unwrap_or_else(|| "n/a".into());
        println!("{} @ {}", symbol, decision.timestamp.format("%Y-%m-%d %H:%M"));
        println!("  Regime:           {}", regime.label);
        println!("  Volatility:       {}", fmt_opt(regime.volatility));
        println!("  Trend Strength:   {}", fmt_opt(regime.trend_strength));
        println!(
            "  Decision:         {} ({:.2})",
            decision.direction, decision.confidence
        );
        println!("  Rationale:        {}", decision.rationale);
    }
    println!("{}", "=".repeat(60));

    if shown == 0 {
        bail!("No symbol had enough data to evaluate");
    }
    Ok(())
}
