//! Backtest command implementation

use anyhow::Result;
use tracing::{debug, info};
use tradex_engine::backtest::{print_summary, Backtester};
use tradex_engine::data::{self, DateRange};
use tradex_engine::{report, Config};

pub fn run(
    config_path: String,
    capital_override: Option<f64>,
    start_override: Option<String>,
    end_override: Option<String>,
    run_name: Option<String>,
) -> Result<()> {
    info!("Starting backtest");

    let mut config = Config::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    if let Some(capital) = capital_override {
        info!("Overriding initial capital to: {:.2}", capital);
        config.trading.initial_capital = capital;
    }

    if let Some(start) = start_override {
        info!("Overriding start date to: {}", start);
        config.backtest.start_date = Some(start);
    }

    if let Some(end) = end_override {
        info!("Overriding end date to: {}", end);
        config.backtest.end_date = Some(end);
    }
    config.validate()?;

    let range = DateRange::parse(
        config.backtest.start_date.as_deref(),
        config.backtest.end_date.as_deref(),
    )?;

    info!("Loading data from: {}", config.backtest.data_dir);
    let symbols = config.trading.symbols();
    debug!("Symbols: {:?}", symbols);

    let data = data::load_directory(
        &config.backtest.data_dir,
        &symbols,
        Some(config.trading.timeframe.as_str()),
        &range,
    )?;
    info!("Loaded data for {} symbols", data.len());

    let backtester = Backtester::new(&config);

    info!("Running backtest...");
    let result = backtester.run(&data);

    print_summary(&result);

    let run_name = run_name
        .unwrap_or_else(|| format!("backtest_{}", chrono::Local::now().format("%Y%m%d_%H%M%S")));
    let paths = report::write_report(&config.backtest.results_dir, &run_name, &result, &config)?;
    println!("Trades written to:  {}", paths.trades.display());
    println!("Summary written to: {}", paths.summary.display());

    info!("Backtest completed successfully");

    Ok(())
}
