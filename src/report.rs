//! Backtest report files
//!
//! For a run named `<run>` the writer produces, in the results directory:
//!
//! - `<run>_trades.csv`: one row per executed fill
//! - `<run>_daily_equity.csv`: end-of-day equity
//! - `<run>_summary.json`: metrics, final ledger and the config used

use anyhow::{Context, Result};
use csv::Writer;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::backtest::{BacktestResult, DailyEquity};
use crate::config::Config;
use crate::ledger::LedgerSnapshot;
use crate::{PerformanceMetrics, TradeRecord};

/// Paths of the files written for one run
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPaths {
    pub trades: PathBuf,
    pub daily_equity: PathBuf,
    pub summary: PathBuf,
}

impl ReportPaths {
    pub fn new(results_dir: impl AsRef<Path>, run: &str) -> Self {
        let dir = results_dir.as_ref();
        Self {
            trades: dir.join(format!("{}_trades.csv", run)),
            daily_equity: dir.join(format!("{}_daily_equity.csv", run)),
            summary: dir.join(format!("{}_summary.json", run)),
        }
    }
}

#[derive(Serialize)]
struct Summary<'a> {
    run: &'a str,
    metrics: &'a PerformanceMetrics,
    ledger: &'a LedgerSnapshot,
    failed_ticks: usize,
    config: &'a Config,
}

/// Write every report file for `result`
pub fn write_report(
    results_dir: impl AsRef<Path>,
    run: &str,
    result: &BacktestResult,
    config: &Config,
) -> Result<ReportPaths> {
    let results_dir = results_dir.as_ref();
    fs::create_dir_all(results_dir)
        .with_context(|| format!("Failed to create results directory {}", results_dir.display()))?;
    let paths = ReportPaths::new(results_dir, run);

    write_trades(&paths.trades, &result.trades)?;
    write_daily_equity(&paths.daily_equity, &result.daily_equity)?;

    let summary = Summary {
        run,
        metrics: &result.metrics,
        ledger: &result.ledger,
        failed_ticks: result.failed_ticks,
        config,
    };
    let json = serde_json::to_string_pretty(&summary).context("Failed to serialize summary")?;
    fs::write(&paths.summary, json)
        .with_context(|| format!("Failed to write {}", paths.summary.display()))?;

    info!(
        trades = %paths.trades.display(),
        summary = %paths.summary.display(),
        "Report written"
    );
    Ok(paths)
}

pub fn write_trades(path: &Path, trades: &[TradeRecord]) -> Result<()> {
    let mut wtr = Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    wtr.write_record([
        "timestamp",
        "symbol",
        "side",
        "action",
        "price",
        "quantity",
        "entry_price",
        "realized_pnl",
        "commission",
        "return_pct",
        "exit_reason",
    ])?;

    for t in trades {
        wtr.write_record(&[
            t.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            t.symbol.to_string(),
            t.side.to_string(),
            format!("{:?}", t.action).to_uppercase(),
            t.price.to_string(),
            t.quantity.to_string(),
            t.entry_price.to_string(),
            t.realized_pnl.map(|p| p.to_string()).unwrap_or_default(),
            t.commission.to_string(),
            t.return_pct().map(|r| format!("{:.4}", r)).unwrap_or_default(),
            t.exit_reason.map(|r| r.to_string()).unwrap_or_default(),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn write_daily_equity(path: &Path, days: &[DailyEquity]) -> Result<()> {
    let mut wtr = Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    wtr.write_record(["date", "equity"])?;
    for day in days {
        wtr.write_record(&[day.date.to_string(), day.equity.to_string()])?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::calculate_metrics;
    use crate::clock::SimulatedClock;
    use crate::ledger::PortfolioLedger;
    use crate::risk::Stops;
    use crate::{ExitReason, Money, PositionSide, Symbol};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn test_write_report_files() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut ledger = PortfolioLedger::new(1_000.0, Arc::new(SimulatedClock::new(ts)));
        let symbol = Symbol::new("BTCUSDT");
        let stops = Stops {
            stop_loss: 98.0,
            take_profit: 104.0,
        };
        ledger
            .open_position(&symbol, PositionSide::Long, 100.0, 1.0, stops, ts, Money::ZERO)
            .unwrap();
        ledger
            .close_position(&symbol, 104.0, ts, ExitReason::TakeProfit, Money::from_f64(0.1))
            .unwrap();

        let trades = ledger.trade_history().to_vec();
        let daily = vec![DailyEquity {
            date: ts.date_naive(),
            equity: 1_003.9,
        }];
        let result = BacktestResult {
            metrics: calculate_metrics(1_000.0, &trades, &daily, 1_003.9),
            trades,
            equity_curve: vec![(ts, 1_003.9)],
            daily_equity: daily,
            ledger: ledger.snapshot(),
            failed_ticks: 0,
        };

        let dir = std::env::temp_dir().join(format!("tradex_report_{}", std::process::id()));
        let paths = write_report(&dir, "unit", &result, &Config::default()).unwrap();

        let csv = fs::read_to_string(&paths.trades).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("OPEN"));
        assert!(lines[2].contains("Take Profit"));

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.summary).unwrap()).unwrap();
        assert_eq!(summary["metrics"]["total_trades"], 1);
        assert!(summary["metrics"]["profit_factor"].is_null());
        assert_eq!(summary["run"], "unit");

        assert!(fs::read_to_string(&paths.daily_equity).unwrap().starts_with("date,equity"));
        fs::remove_dir_all(&dir).ok();
    }
}
