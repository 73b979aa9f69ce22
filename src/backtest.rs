//! Backtesting engine
//!
//! Replays the trading pipeline over historical snapshots, one timestamp at a
//! time, with commission and slippage charged by a [`PaperBroker`].
//!
//! - Timestamps are the sorted union over all symbols; symbols are processed
//!   in sorted order at each one.
//! - A symbol is evaluated only at timestamps where it has a bar and only
//!   once it has `warmup_bars` bars of history. Evaluation sees bars up to the
//!   current timestamp and nothing later.
//! - Positions still open after the last timestamp are closed at their last
//!   price (`END_OF_RUN`).
//!
//! The run is deterministic: the same data and config produce the same trades
//! and metrics.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::broker::PaperBroker;
use crate::clock::{SessionClock, SimulatedClock};
use crate::config::Config;
use crate::data::MarketData;
use crate::engine::{TickAction, TradingEngine};
use crate::ledger::{LedgerSnapshot, PortfolioLedger};
use crate::safety::{EmergencyStop, EmergencyStopConfig, RecoveryOutcome};
use crate::signals::DirectionalModel;
use crate::{ExitReason, PerformanceMetrics, TradeAction, TradeRecord};

const DAYS_PER_YEAR: f64 = 365.0;

/// Equity at the end of a session day
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DailyEquity {
    pub date: NaiveDate,
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    /// Every executed fill, in execution order
    pub trades: Vec<TradeRecord>,
    /// Marked-to-market equity after each timestamp
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub daily_equity: Vec<DailyEquity>,
    pub metrics: PerformanceMetrics,
    pub ledger: LedgerSnapshot,
    /// Ticks whose processing failed unexpectedly
    pub failed_ticks: usize,
}

/// Backtest engine
pub struct Backtester {
    engine: TradingEngine,
    initial_capital: f64,
    warmup_bars: usize,
    fee_rate: f64,
    slippage: f64,
    safety: EmergencyStopConfig,
}

impl Backtester {
    pub fn new(config: &Config) -> Self {
        Self::with_engine(config, TradingEngine::from_config(config))
    }

    pub fn with_model(config: &Config, model: Arc<dyn DirectionalModel>) -> Self {
        Self::with_engine(config, TradingEngine::with_model(config, model))
    }

    pub fn with_engine(config: &Config, engine: TradingEngine) -> Self {
        Backtester {
            engine,
            initial_capital: config.trading.initial_capital,
            warmup_bars: config.backtest.warmup_bars.max(1),
            fee_rate: config.execution.fee_rate,
            slippage: config.execution.slippage,
            // simulated time does not wait for cooldowns
            safety: config.safety.clone().with_recovery_cooldown(Duration::ZERO),
        }
    }

    pub fn engine(&self) -> &TradingEngine {
        &self.engine
    }

    /// Run backtest on multi-symbol data
    pub fn run(&self, data: &MarketData) -> BacktestResult {
        let timestamps = data.timestamps();
        let start = timestamps
            .first()
            .copied()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let clock = Arc::new(SimulatedClock::new(start));
        let mut ledger = PortfolioLedger::new(self.initial_capital, clock.clone());
        let mut broker = PaperBroker::new(self.fee_rate, self.slippage);
        let mut emergency = EmergencyStop::new(self.safety.clone());

        let mut equity_curve = Vec::with_capacity(timestamps.len());
        let mut daily_equity: Vec<DailyEquity> = Vec::new();
        let mut current_day: Option<NaiveDate> = None;
        let mut last_equity = self.initial_capital;
        let mut failed_ticks = 0usize;

        info!(
            symbols = data.len(),
            timestamps = timestamps.len(),
            warmup = self.warmup_bars,
            "Running backtest"
        );

        for &ts in &timestamps {
            clock.advance_to(ts);
            let day = clock.today();
            if let Some(prev) = current_day.filter(|d| *d != day) {
                daily_equity.push(DailyEquity {
                    date: prev,
                    equity: last_equity,
                });
            }
            current_day = Some(day);

            if emergency.is_halted() {
                if let RecoveryOutcome::Recovered = emergency.attempt_recovery(|| true) {
                    info!(%ts, "Trading resumed after emergency stop");
                }
            }

            for symbol in data.symbols() {
                let visible = data.history_until(symbol, ts);
                let Some(latest) = visible.last() else {
                    continue;
                };
                if latest.timestamp != ts {
                    continue;
                }
                if visible.len() < self.warmup_bars {
                    ledger.mark_to_market(&BTreeMap::from([(symbol.clone(), latest.close)]));
                    continue;
                }

                match self.engine.process_symbol_with_peers(
                    visible,
                    data,
                    &mut ledger,
                    &mut broker,
                    emergency.allows_orders(),
                ) {
                    Ok(tick) => {
                        emergency.record_success();
                        if let Some(exit) = &tick.exit {
                            debug!(%symbol, reason = ?exit.exit_reason, price = exit.price, "Exit triggered");
                        }
                        match &tick.action {
                            TickAction::Opened(t) | TickAction::Added(t) | TickAction::Closed(t) => {
                                debug!(
                                    %symbol,
                                    action = ?t.action,
                                    price = t.price,
                                    quantity = t.quantity,
                                    confidence = tick.decision.confidence,
                                    regime = %tick.decision.regime,
                                    "Trade executed"
                                );
                            }
                            _ => {}
                        }
                    }
                    Err(e) if e.is_expected() => {
                        debug!(%symbol, %ts, error = %e, "Tick skipped");
                    }
                    Err(e) => {
                        failed_ticks += 1;
                        emergency.record_failure(&format!("{}: {}", symbol, e));
                    }
                }
            }

            last_equity = ledger.mark_to_market(&BTreeMap::new());
            equity_curve.push((ts, last_equity));
        }

        // Close any remaining positions
        if let Some(&end) = timestamps.last() {
            let closed = self
                .engine
                .close_all(end, ExitReason::EndOfRun, &mut ledger, &mut broker);
            if !closed.is_empty() {
                info!(count = closed.len(), "Closed remaining positions at end of run");
            }
            last_equity = ledger.mark_to_market(&BTreeMap::new());
            if let Some(last) = equity_curve.last_mut() {
                last.1 = last_equity;
            }
        }
        if let Some(day) = current_day {
            daily_equity.push(DailyEquity {
                date: day,
                equity: last_equity,
            });
        }

        if failed_ticks > 0 {
            warn!(failed_ticks, "Backtest completed with failed ticks");
        }
        if emergency.is_halted() {
            error!("Backtest ended with the emergency stop engaged");
        }

        let trades = ledger.trade_history().to_vec();
        let metrics = calculate_metrics(self.initial_capital, &trades, &daily_equity, last_equity);

        BacktestResult {
            trades,
            equity_curve,
            daily_equity,
            metrics,
            ledger: ledger.snapshot(),
            failed_ticks,
        }
    }
}

/// Performance metrics from the fills and the end-of-day equity series.
///
/// The daily series is prefixed with the initial capital. Volatility is the
/// population standard deviation of daily returns annualized over 365 days.
pub fn calculate_metrics(
    initial_capital: f64,
    trades: &[TradeRecord],
    daily_equity: &[DailyEquity],
    final_equity: f64,
) -> PerformanceMetrics {
    let pnls: Vec<f64> = trades
        .iter()
        .filter(|t| t.action == TradeAction::Close)
        .filter_map(|t| t.net_pnl())
        .map(|p| p.to_f64())
        .collect();
    let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
    let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();

    let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().mean() };
    let avg_loss = if losses.is_empty() { 0.0 } else { losses.iter().mean() };
    let profit_factor = if losses.is_empty() || avg_loss == 0.0 {
        f64::INFINITY
    } else {
        (avg_win * wins.len() as f64 / (avg_loss * losses.len() as f64)).abs()
    };

    let mut balances = Vec::with_capacity(daily_equity.len() + 1);
    balances.push(initial_capital);
    balances.extend(daily_equity.iter().map(|d| d.equity));

    let returns: Vec<f64> = balances
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    let (volatility, sharpe_ratio) = if returns.is_empty() {
        (0.0, 0.0)
    } else {
        let volatility = returns.iter().population_std_dev() * DAYS_PER_YEAR.sqrt();
        let sharpe = if volatility > 0.0 {
            returns.iter().mean() * DAYS_PER_YEAR / volatility
        } else {
            0.0
        };
        (volatility, sharpe)
    };

    let mut peak = initial_capital;
    let mut max_drawdown: f64 = 0.0;
    for &balance in &balances {
        peak = peak.max(balance);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - balance) / peak);
        }
    }

    let total_return = final_equity - initial_capital;
    let total_return_pct = if initial_capital > 0.0 {
        total_return / initial_capital * 100.0
    } else {
        0.0
    };
    let win_rate = if pnls.is_empty() {
        0.0
    } else {
        wins.len() as f64 / pnls.len() as f64 * 100.0
    };

    PerformanceMetrics {
        initial_capital,
        final_equity,
        total_return,
        total_return_pct,
        total_trades: pnls.len(),
        total_executions: trades.len(),
        winning_trades: wins.len(),
        losing_trades: losses.len(),
        win_rate,
        total_pnl: pnls.iter().sum(),
        avg_win,
        avg_loss,
        profit_factor,
        volatility,
        sharpe_ratio,
        max_drawdown,
        total_commission: trades.iter().map(|t| t.commission.to_f64()).sum(),
    }
}

/// Print the results box to stdout
pub fn print_summary(result: &BacktestResult) {
    let m = &result.metrics;
    let profit_factor = if m.profit_factor.is_finite() {
        format!("{:.2}", m.profit_factor)
    } else {
        "inf".to_string()
    };

    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS");
    println!("{}", "=".repeat(60));
    println!("Initial Capital:    {:.2}", m.initial_capital);
    println!("Final Equity:       {:.2}", m.final_equity);
    println!("Total Return:       {:.2} ({:.2}%)", m.total_return, m.total_return_pct);
    println!("Sharpe Ratio:       {:.2}", m.sharpe_ratio);
    println!("Volatility:         {:.4}", m.volatility);
    println!("Max Drawdown:       {:.2}%", m.max_drawdown * 100.0);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Profit Factor:      {}", profit_factor);
    println!("Total Trades:       {}", m.total_trades);
    println!("Executions:         {}", m.total_executions);
    println!("Winning Trades:     {}", m.winning_trades);
    println!("Losing Trades:      {}", m.losing_trades);
    println!("Average Win:        {:.2}", m.avg_win);
    println!("Average Loss:       {:.2}", m.avg_loss);
    println!("Commission Paid:    {:.2}", m.total_commission);
    if result.failed_ticks > 0 {
        println!("Failed Ticks:       {}", result.failed_ticks);
    }
    println!("{}", "=".repeat(60));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Money, PositionSide, Symbol};
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn close(pnl: f64) -> TradeRecord {
        TradeRecord {
            symbol: Symbol::new("BTCUSDT"),
            side: PositionSide::Long,
            action: TradeAction::Close,
            price: 100.0,
            quantity: 1.0,
            entry_price: 100.0,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            realized_pnl: Some(Money::from_f64(pnl)),
            commission: Money::ZERO,
            exit_reason: Some(ExitReason::Signal),
        }
    }

    fn days(values: &[f64]) -> Vec<DailyEquity> {
        values
            .iter()
            .enumerate()
            .map(|(i, &equity)| DailyEquity {
                date: NaiveDate::from_ymd_opt(2024, 1, 1 + i as u32).unwrap(),
                equity,
            })
            .collect()
    }

    #[test]
    fn test_metrics_from_trades() {
        let trades = vec![close(30.0), close(-10.0), close(10.0), close(-20.0)];
        let m = calculate_metrics(1000.0, &trades, &days(&[1010.0]), 1010.0);

        assert_eq!(m.total_trades, 4);
        assert_eq!(m.winning_trades, 2);
        assert_eq!(m.losing_trades, 2);
        assert_relative_eq!(m.win_rate, 50.0);
        assert_relative_eq!(m.avg_win, 20.0);
        assert_relative_eq!(m.avg_loss, -15.0);
        assert_relative_eq!(m.profit_factor, 40.0 / 30.0, epsilon = 1e-12);
        assert_relative_eq!(m.total_pnl, 10.0);
        assert_relative_eq!(m.total_return_pct, 1.0);
    }

    #[test]
    fn test_profit_factor_infinite_without_losses() {
        let m = calculate_metrics(1000.0, &[close(5.0)], &days(&[1005.0]), 1005.0);
        assert!(m.profit_factor.is_infinite());
        let json = serde_json::to_value(&m).unwrap();
        assert!(json["profit_factor"].is_null());
    }

    #[test]
    fn test_risk_metrics_from_daily_equity() {
        // returns: +10%, -10%
        let m = calculate_metrics(100.0, &[], &days(&[110.0, 99.0]), 99.0);
        let std = 0.1f64;
        assert_relative_eq!(m.volatility, std * 365f64.sqrt(), epsilon = 1e-9);
        assert_relative_eq!(m.sharpe_ratio, 0.0, epsilon = 1e-9);
        assert_relative_eq!(m.max_drawdown, 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_flat_equity_has_zero_sharpe() {
        let m = calculate_metrics(100.0, &[], &days(&[100.0, 100.0]), 100.0);
        assert_eq!(m.volatility, 0.0);
        assert_eq!(m.sharpe_ratio, 0.0);
        assert_eq!(m.max_drawdown, 0.0);
    }

    #[test]
    fn test_empty_data_runs_from_epoch() {
        let backtester = Backtester::new(&Config::default());
        let first = backtester.run(&MarketData::new());
        let second = backtester.run(&MarketData::new());

        assert!(first.trades.is_empty());
        assert!(first.equity_curve.is_empty());
        assert_eq!(
            first.ledger.session_day,
            NaiveDate::from_ymd_opt(1970, 1, 1)
        );
        assert_eq!(first.ledger, second.ledger);
        assert_relative_eq!(first.ledger.equity, 100_000.0);
    }
}
