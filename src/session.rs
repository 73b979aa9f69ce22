//! Paper trading session
//!
//! Runs the same [`TradingEngine`] as the backtester on a fixed interval:
//!
//! - each cycle refreshes the [`SnapshotProvider`] and evaluates every symbol
//!   that has a new bar
//! - the ledger lives behind a single-writer `tokio::sync::Mutex`
//! - repeated unexpected failures engage the [`EmergencyStop`]; exits keep
//!   running while new orders are halted
//! - on shutdown every open position is closed so the ledger is never left
//!   half-liquidated

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::broker::PaperBroker;
use crate::clock::{SessionClock, SystemClock};
use crate::config::Config;
use crate::data::SnapshotProvider;
use crate::engine::{SymbolTick, TickAction, TradingEngine};
use crate::error::EngineError;
use crate::ledger::{LedgerSnapshot, PortfolioLedger};
use crate::safety::{EmergencyStop, RecoveryOutcome};
use crate::{ExitReason, Symbol};

/// What one cycle did
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub ticks: Vec<SymbolTick>,
    pub failures: usize,
    pub equity: f64,
    pub halted: bool,
}

pub struct TradingSession<P: SnapshotProvider> {
    engine: TradingEngine,
    provider: P,
    ledger: Arc<Mutex<PortfolioLedger>>,
    broker: PaperBroker,
    emergency: EmergencyStop,
    clock: Arc<dyn SessionClock>,
    interval: Duration,
    history_bars: usize,
    warmup_bars: usize,
    /// Timestamp of the last bar evaluated per symbol
    last_seen: BTreeMap<Symbol, DateTime<Utc>>,
    cycle: u64,
    max_cycles: Option<u64>,
}

impl<P: SnapshotProvider> TradingSession<P> {
    /// Session on the wall clock
    pub fn from_config(config: &Config, provider: P) -> Self {
        Self::new(
            config,
            TradingEngine::from_config(config),
            provider,
            Arc::new(SystemClock),
        )
    }

    pub fn new(
        config: &Config,
        engine: TradingEngine,
        provider: P,
        clock: Arc<dyn SessionClock>,
    ) -> Self {
        let ledger = PortfolioLedger::new(config.trading.initial_capital, clock.clone());
        Self {
            engine,
            provider,
            ledger: Arc::new(Mutex::new(ledger)),
            broker: PaperBroker::new(config.execution.fee_rate, config.execution.slippage),
            emergency: EmergencyStop::new(config.safety.clone()),
            clock,
            interval: Duration::from_secs(config.session.interval_secs.max(1)),
            history_bars: config.session.history_bars.max(config.backtest.warmup_bars),
            warmup_bars: config.backtest.warmup_bars.max(1),
            last_seen: BTreeMap::new(),
            cycle: 0,
            max_cycles: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stop on its own after `cycles` cycles
    pub fn with_max_cycles(mut self, cycles: u64) -> Self {
        self.max_cycles = Some(cycles);
        self
    }

    /// Shared handle for readers; the session is the only writer
    pub fn ledger(&self) -> Arc<Mutex<PortfolioLedger>> {
        self.ledger.clone()
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.emergency
    }

    /// Run one cycle over every symbol
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        info!(cycle = self.cycle, "Trading cycle");

        let mut failures = 0;
        let data_ok = match self.provider.refresh() {
            Ok(()) => true,
            Err(e) => {
                failures += 1;
                self.emergency.record_failure(&format!("data refresh failed: {}", e));
                false
            }
        };

        if self.emergency.is_halted() {
            match self.emergency.attempt_recovery(|| data_ok) {
                RecoveryOutcome::Recovered => info!("Trading resumed after emergency stop"),
                RecoveryOutcome::NotHalted => {}
                outcome => {
                    let err = EngineError::ConsecutiveFailure {
                        count: self.emergency.consecutive_errors(),
                    };
                    error!(error = %err, ?outcome, "EMERGENCY STOP active, new orders halted");
                }
            }
        }

        let now = self.clock.now();
        let orders_allowed = self.emergency.allows_orders();
        let mut ticks = Vec::new();
        let mut ledger = self.ledger.lock().await;

        for symbol in self.provider.symbols() {
            let history = match self.provider.history(&symbol, now, self.history_bars) {
                Ok(h) => h,
                Err(e) => {
                    debug!(%symbol, error = %e, "No data for symbol");
                    continue;
                }
            };
            let Some(latest) = history.last().map(|s| s.timestamp) else {
                continue;
            };
            if self.last_seen.get(&symbol) == Some(&latest) {
                debug!(%symbol, %latest, "No new bar");
                continue;
            }
            self.last_seen.insert(symbol.clone(), latest);

            if history.len() < self.warmup_bars {
                debug!(%symbol, bars = history.len(), needed = self.warmup_bars, "Warming up");
                continue;
            }

            match self
                .engine
                .process_symbol_with_peers(
                    &history,
                    &self.provider,
                    &mut ledger,
                    &mut self.broker,
                    orders_allowed,
                )
            {
                Ok(tick) => {
                    self.emergency.record_success();
                    log_tick(&tick);
                    ticks.push(tick);
                }
                Err(e) if e.is_expected() => {
                    debug!(%symbol, error = %e, "Tick skipped");
                }
                Err(e) => {
                    failures += 1;
                    self.emergency.record_failure(&format!("{}: {}", symbol, e));
                }
            }
        }

        let equity = ledger.mark_to_market(&BTreeMap::new());
        info!(
            cycle = self.cycle,
            equity,
            positions = ledger.open_position_count(),
            drawdown = ledger.current_drawdown(),
            "Cycle complete"
        );

        CycleReport {
            cycle: self.cycle,
            ticks,
            failures,
            equity,
            halted: self.emergency.is_halted(),
        }
    }

    /// Run cycles on the interval until `shutdown` completes, then liquidate
    pub async fn run_until<F>(&mut self, shutdown: F) -> LedgerSnapshot
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = self.interval.as_secs_f64(), "Starting trading loop...");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    if report.failures > 0 {
                        warn!(cycle = report.cycle, failures = report.failures, "Cycle had failures");
                    }
                    if self.max_cycles.is_some_and(|max| self.cycle >= max) {
                        info!(cycles = self.cycle, "Cycle limit reached");
                        break;
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Close every open position at its last price
    pub async fn shutdown(&mut self) -> LedgerSnapshot {
        info!("Initiating graceful shutdown...");
        let mut ledger = self.ledger.lock().await;
        let closed = self.engine.close_all(
            self.clock.now(),
            ExitReason::Shutdown,
            &mut ledger,
            &mut self.broker,
        );
        for trade in &closed {
            warn!(symbol = %trade.symbol, price = trade.price, "Closed position due to shutdown");
        }

        let snapshot = ledger.snapshot();
        info!(
            "Shutdown complete. Final portfolio value: {:.2}",
            snapshot.equity
        );
        snapshot
    }
}

fn log_tick(tick: &SymbolTick) {
    match &tick.action {
        TickAction::Opened(t) | TickAction::Added(t) => info!(
            symbol = %tick.symbol,
            side = %t.side,
            price = t.price,
            quantity = t.quantity,
            confidence = tick.decision.confidence,
            regime = %tick.regime.label,
            "Position {}",
            if matches!(tick.action, TickAction::Opened(_)) { "opened" } else { "increased" }
        ),
        TickAction::Closed(t) => info!(symbol = %tick.symbol, price = t.price, "Position closed on signal"),
        TickAction::Blocked(reason) => debug!(symbol = %tick.symbol, %reason, "Decision blocked"),
        TickAction::Skipped(reason) => debug!(symbol = %tick.symbol, %reason, "Decision skipped"),
        TickAction::Hold => debug!(
            symbol = %tick.symbol,
            confidence = tick.decision.confidence,
            regime = %tick.regime.label,
            "Hold"
        ),
    }
}

/// Completes on Ctrl+C. If the handler cannot be installed it never completes.
pub async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown..."),
        Err(e) => {
            error!("Error setting up signal handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}
