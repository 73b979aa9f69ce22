//! Paper trading command implementation

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::info;
use tradex_engine::data::CsvDirectoryProvider;
use tradex_engine::session::{self, TradingSession};
use tradex_engine::Config;

pub fn run(config_path: String, interval_override: Option<u64>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(config_path, interval_override))
}

async fn run_async(config_path: String, interval_override: Option<u64>) -> Result<()> {
    let mut config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    if let Some(secs) = interval_override {
        config.session.interval_secs = secs;
    }
    config.validate()?;

    println!("{}", "=".repeat(60));
    println!("PAPER TRADING");
    println!("{}", "=".repeat(60));
    println!("Symbols:            {}", config.trading.symbols.join(", "));
    println!("Timeframe:          {}", config.trading.timeframe);
    println!("Initial Capital:    {:.2}", config.trading.initial_capital);
    println!("Cycle Interval:     {} seconds", config.session.interval_secs);
    println!("Data Directory:     {}", config.backtest.data_dir);
    println!("{}", "=".repeat(60));

    let provider = CsvDirectoryProvider::new(
        &config.backtest.data_dir,
        config.trading.symbols(),
        Some(config.trading.timeframe.clone()),
    );
    let mut session = TradingSession::from_config(&config, provider)
        .with_interval(Duration::from_secs(config.session.interval_secs));

    let final_state = session.run_until(session::ctrl_c()).await;

    println!("\n{}", "=".repeat(60));
    println!("SESSION CLOSED");
    println!("{}", "=".repeat(60));
    println!("Final Equity:       {:.2}", final_state.equity);
    println!("Realized P&L:       {}", final_state.realized_pnl);
    println!("Commission Paid:    {}", final_state.total_commission);
    println!("Fills:              {}", final_state.total_fills);
    println!("{}", "=".repeat(60));

    info!("Paper trading stopped");
    Ok(())
}
