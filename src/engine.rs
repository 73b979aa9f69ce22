//! Per-tick decision pipeline
//!
//! Shared by the backtest simulator and the paper session. For one symbol
//! at one tick:
//!
//! 1. mark the ledger to the latest close
//! 2. close the position if its stop-loss or take-profit was hit
//! 3. classify the regime, collect votes, aggregate into a [`Decision`]
//! 4. gate the decision and size the trade
//! 5. execute through the [`Broker`] and record the fill in the ledger
//!
//! A decision against the held side closes the position; it never reverses
//! it in the same tick.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregator::SignalAggregator;
use crate::broker::{Broker, OrderRequest, OrderResult};
use crate::config::Config;
use crate::data::SnapshotProvider;
use crate::error::{DataUnavailable, EngineError, ExecutionRejected, RiskRejection};
use crate::ledger::PortfolioLedger;
use crate::regime::{RegimeAssessment, RegimeClassifier};
use crate::risk::{self, RiskManager};
use crate::signals::{DirectionalModel, PrecomputedProbabilityModel, SignalSuite};
use crate::{Decision, Direction, ExitReason, MarketSnapshot, PositionSide, Symbol, TradeRecord};

/// What the engine did with a decision
#[derive(Debug, Clone, PartialEq)]
pub enum TickAction {
    Hold,
    /// Gate refused the decision; treated as HOLD
    Blocked(RiskRejection),
    /// Decision could not be acted on, e.g. a SELL with shorting disabled
    Skipped(ExecutionRejected),
    Opened(TradeRecord),
    Added(TradeRecord),
    Closed(TradeRecord),
}

/// Result of processing one symbol at one tick
#[derive(Debug, Clone)]
pub struct SymbolTick {
    pub symbol: Symbol,
    pub regime: RegimeAssessment,
    /// Stop-loss or take-profit exit executed before evaluation
    pub exit: Option<TradeRecord>,
    pub decision: Decision,
    pub action: TickAction,
}

#[derive(Debug)]
pub struct TradingEngine {
    classifier: RegimeClassifier,
    signals: SignalSuite,
    aggregator: SignalAggregator,
    risk: RiskManager,
    allow_short: bool,
}

impl TradingEngine {
    pub fn new(
        classifier: RegimeClassifier,
        signals: SignalSuite,
        aggregator: SignalAggregator,
        risk: RiskManager,
        allow_short: bool,
    ) -> Self {
        Self {
            classifier,
            signals,
            aggregator,
            risk,
            allow_short,
        }
    }

    /// Engine with the precomputed-probability model behind the ML source
    pub fn from_config(config: &Config) -> Self {
        let model = Arc::new(PrecomputedProbabilityModel::new(
            config.signals.ml_probability_band,
        ));
        Self::with_model(config, model)
    }

    pub fn with_model(config: &Config, model: Arc<dyn DirectionalModel>) -> Self {
        Self::new(
            RegimeClassifier::new(config.regime.clone()),
            SignalSuite::from_config(&config.signals, model),
            SignalAggregator::new(config.signals.base_weights),
            config.risk.clone().build(),
            config.trading.allow_short,
        )
    }

    pub fn classifier(&self) -> &RegimeClassifier {
        &self.classifier
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    /// Regime and aggregated decision for the latest bar, without trading
    pub fn evaluate(
        &self,
        history: &[MarketSnapshot],
    ) -> Result<(RegimeAssessment, Decision), DataUnavailable> {
        let latest = history.last().ok_or(DataUnavailable::InsufficientHistory {
            required: 1,
            available: 0,
        })?;

        let regime = self.classifier.classify(history);
        let votes = self.signals.collect_votes(history);
        let decision = self.aggregator.aggregate(
            &latest.symbol,
            votes,
            regime.label,
            &self.classifier,
            latest.timestamp,
        );
        Ok((regime, decision))
    }

    /// Run the full pipeline for the symbol of `history`'s latest snapshot.
    ///
    /// With `orders_allowed` false, exits still run but no decision is acted on.
    pub fn process_symbol(
        &self,
        history: &[MarketSnapshot],
        ledger: &mut PortfolioLedger,
        broker: &mut dyn Broker,
        orders_allowed: bool,
    ) -> Result<SymbolTick, EngineError> {
        self.process(history, None, ledger, broker, orders_allowed)
    }

    /// Like [`process_symbol`](Self::process_symbol), but new positions are
    /// also checked for return correlation against the other held symbols,
    /// whose history is read from `peers`.
    pub fn process_symbol_with_peers(
        &self,
        history: &[MarketSnapshot],
        peers: &dyn SnapshotProvider,
        ledger: &mut PortfolioLedger,
        broker: &mut dyn Broker,
        orders_allowed: bool,
    ) -> Result<SymbolTick, EngineError> {
        self.process(history, Some(peers), ledger, broker, orders_allowed)
    }

    fn process(
        &self,
        history: &[MarketSnapshot],
        peers: Option<&dyn SnapshotProvider>,
        ledger: &mut PortfolioLedger,
        broker: &mut dyn Broker,
        orders_allowed: bool,
    ) -> Result<SymbolTick, EngineError> {
        let latest = history.last().ok_or(DataUnavailable::InsufficientHistory {
            required: 1,
            available: 0,
        })?;
        latest.bar().validate()?;

        let symbol = latest.symbol.clone();
        let price = latest.close;
        let timestamp = latest.timestamp;
        ledger.mark_to_market(&BTreeMap::from([(symbol.clone(), price)]));

        let exit = self.process_exit(&symbol, price, timestamp, ledger, broker)?;
        let (regime, decision) = self.evaluate(history)?;

        if !decision.is_actionable() {
            return Ok(SymbolTick {
                symbol,
                regime,
                exit,
                decision,
                action: TickAction::Hold,
            });
        }

        let action = if !orders_allowed {
            TickAction::Blocked(RiskRejection::EmergencyStop)
        } else if let Err(rejection) = self.risk.check_trade_gate(&decision, ledger) {
            warn!(symbol = %symbol, direction = %decision.direction, %rejection, "Risk limit exceeded, holding");
            TickAction::Blocked(rejection)
        } else {
            self.act(&decision, price, regime, history, peers, ledger, broker)?
        };

        Ok(SymbolTick {
            symbol,
            regime,
            exit,
            decision,
            action,
        })
    }

    /// Close the position on `symbol` if a stop or target was hit at `price`
    pub fn process_exit(
        &self,
        symbol: &Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
        ledger: &mut PortfolioLedger,
        broker: &mut dyn Broker,
    ) -> Result<Option<TradeRecord>, EngineError> {
        let Some(position) = ledger.position(symbol) else {
            return Ok(None);
        };
        let Some(trigger) = RiskManager::check_exit_triggers(position, price) else {
            return Ok(None);
        };

        let record = self.close(symbol, price, timestamp, trigger.reason(), ledger, broker)?;
        Ok(Some(record))
    }

    /// Close every open position at its last marked price
    pub fn close_all(
        &self,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
        ledger: &mut PortfolioLedger,
        broker: &mut dyn Broker,
    ) -> Vec<TradeRecord> {
        let targets: Vec<(Symbol, f64)> = ledger
            .positions()
            .values()
            .map(|p| (p.symbol.clone(), ledger.mark(&p.symbol).unwrap_or(p.entry_price)))
            .collect();

        let mut closed = Vec::with_capacity(targets.len());
        for (symbol, price) in targets {
            match self.close(&symbol, price, timestamp, reason, ledger, broker) {
                Ok(record) => closed.push(record),
                Err(e) => error!(symbol = %symbol, error = %e, "Failed to close position"),
            }
        }
        if !closed.is_empty() {
            info!(count = closed.len(), reason = %reason, "Closed all positions");
        }
        closed
    }

    #[allow(clippy::too_many_arguments)]
    fn act(
        &self,
        decision: &Decision,
        price: f64,
        regime: RegimeAssessment,
        history: &[MarketSnapshot],
        peers: Option<&dyn SnapshotProvider>,
        ledger: &mut PortfolioLedger,
        broker: &mut dyn Broker,
    ) -> Result<TickAction, EngineError> {
        let symbol = &decision.symbol;
        let wanted = match decision.direction {
            Direction::Buy => PositionSide::Long,
            Direction::Sell => PositionSide::Short,
            Direction::Hold => return Ok(TickAction::Hold),
        };

        if let Some(held) = ledger.position(symbol).map(|p| p.side) {
            if held != wanted {
                let record = self.close(
                    symbol,
                    price,
                    decision.timestamp,
                    ExitReason::Signal,
                    ledger,
                    broker,
                )?;
                return Ok(TickAction::Closed(record));
            }
        } else {
            if wanted == PositionSide::Short && !self.allow_short {
                debug!(symbol = %symbol, "Short selling disabled, ignoring SELL");
                return Ok(TickAction::Skipped(ExecutionRejected::InvalidOrder(
                    "short selling disabled".to_string(),
                )));
            }
            if let Err(rejection) = self.risk.check_volatility(regime.volatility) {
                warn!(symbol = %symbol, %rejection, "Risk limit exceeded, holding");
                return Ok(TickAction::Blocked(rejection));
            }
            if let Some(peers) = peers {
                let correlations = self.held_correlations(history, peers, ledger);
                if let Err(rejection) = self.risk.check_correlation(symbol, &correlations) {
                    return Ok(TickAction::Blocked(rejection));
                }
            }
        }

        let profile = self
            .classifier
            .risk_profile(regime.label, self.risk.default_profile());
        let equity = ledger.equity(&BTreeMap::new());
        let quantity = self.risk.size_position(
            decision.confidence,
            price,
            &ledger.trade_stats(),
            &profile,
            equity,
            regime.volatility,
        );
        if quantity <= 0.0 {
            return Ok(TickAction::Skipped(ExecutionRejected::InvalidOrder(
                "position size is zero".to_string(),
            )));
        }

        let fill = submit(
            broker,
            OrderRequest {
                symbol: symbol.clone(),
                side: wanted.entry_side(),
                quantity,
                reference_price: price,
                timestamp: decision.timestamp,
            },
        )?;

        if ledger.position(symbol).is_some() {
            let average = ledger
                .average_into(symbol, wanted, fill.price, fill.quantity, fill.timestamp, fill.commission)?
                .entry_price;
            ledger.set_stops(symbol, RiskManager::compute_stops(average, wanted, &profile))?;
            let record = last_fill(ledger)?;
            Ok(TickAction::Added(record))
        } else {
            let stops = RiskManager::compute_stops(fill.price, wanted, &profile);
            ledger.open_position(
                symbol,
                wanted,
                fill.price,
                fill.quantity,
                stops,
                fill.timestamp,
                fill.commission,
            )?;
            let record = last_fill(ledger)?;
            Ok(TickAction::Opened(record))
        }
    }

    /// Return correlation of `history` with each other held symbol. Symbols
    /// without readable history are left out.
    fn held_correlations(
        &self,
        history: &[MarketSnapshot],
        peers: &dyn SnapshotProvider,
        ledger: &PortfolioLedger,
    ) -> Vec<(Symbol, f64)> {
        let (Some(latest), true) = (history.last(), self.risk.correlation_enabled()) else {
            return Vec::new();
        };
        let window = self.risk.config().correlation_window + 1;

        ledger
            .positions()
            .keys()
            .filter(|held| **held != latest.symbol)
            .filter_map(|held| match peers.history(held, latest.timestamp, window) {
                Ok(other) => {
                    let (a, b) = risk::aligned_closes(history, &other, window);
                    Some((held.clone(), risk::return_correlation(&a, &b)))
                }
                Err(e) => {
                    debug!(symbol = %held, error = %e, "No history for correlation");
                    None
                }
            })
            .collect()
    }

    fn close(
        &self,
        symbol: &Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
        ledger: &mut PortfolioLedger,
        broker: &mut dyn Broker,
    ) -> Result<TradeRecord, EngineError> {
        let (side, quantity) = ledger
            .position(symbol)
            .map(|p| (p.side, p.quantity))
            .ok_or_else(|| ExecutionRejected::NoPosition(symbol.clone()))?;

        let fill = submit(
            broker,
            OrderRequest {
                symbol: symbol.clone(),
                side: side.exit_side(),
                quantity,
                reference_price: price,
                timestamp,
            },
        )?;
        Ok(ledger.close_position(symbol, fill.price, fill.timestamp, reason, fill.commission)?)
    }
}

fn submit(broker: &mut dyn Broker, order: OrderRequest) -> Result<crate::broker::Fill, EngineError> {
    match broker.submit_order(&order) {
        OrderResult::Filled(fill) => Ok(fill),
        OrderResult::Rejected(reason) => {
            warn!(symbol = %order.symbol, %reason, "Order rejected by broker");
            Err(ExecutionRejected::Broker(reason).into())
        }
    }
}

fn last_fill(ledger: &PortfolioLedger) -> Result<TradeRecord, EngineError> {
    ledger
        .trade_history()
        .last()
        .cloned()
        .ok_or_else(|| ExecutionRejected::InvalidOrder("fill was not recorded".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::clock::SimulatedClock;
    use crate::data::MarketData;
    use crate::signals::NoModel;
    use crate::{Bar, TradeAction};
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn engine(config: &Config) -> TradingEngine {
        TradingEngine::with_model(config, Arc::new(NoModel))
    }

    /// Rising hourly series with ml-free signals: trend votes BUY
    fn rising(n: usize, symbol: &str) -> Vec<MarketSnapshot> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let c = 100.0 * 1.005f64.powi(i as i32);
                let bar = Bar {
                    timestamp: start + Duration::hours(i as i64),
                    open: c,
                    high: c * 1.002,
                    low: c * 0.998,
                    close: c,
                    volume: 10.0,
                };
                MarketSnapshot::from_bar(Symbol::new(symbol), &bar)
            })
            .collect()
    }

    fn only_trend() -> Config {
        let mut config = Config::default();
        config.signals.technical_enabled = false;
        config.signals.liquidity_enabled = false;
        config.signals.ml_enabled = false;
        config.risk.min_confidence = 0.5;
        config
    }

    fn ledger_at(ts: DateTime<Utc>) -> PortfolioLedger {
        PortfolioLedger::new(100_000.0, Arc::new(SimulatedClock::new(ts)))
    }

    #[test]
    fn test_buy_decision_opens_then_adds() {
        let config = only_trend();
        let engine = engine(&config);
        let history = rising(60, "BTCUSDT");
        let mut ledger = ledger_at(history[59].timestamp);
        let mut broker = PaperBroker::default();

        let tick = engine
            .process_symbol(&history, &mut ledger, &mut broker, true)
            .unwrap();
        assert_eq!(tick.decision.direction, Direction::Buy);
        let TickAction::Opened(open) = tick.action else {
            panic!("expected open, got {:?}", tick.action);
        };
        assert_eq!(open.action, TradeAction::Open);

        // Constant returns: SIDEWAYS_LOW profile, 1.5% stop
        let pos = ledger.position(&Symbol::new("BTCUSDT")).unwrap();
        assert_relative_eq!(pos.stop_loss_price, pos.entry_price * 0.985, epsilon = 1e-9);
        assert_eq!(tick.regime.label.key(), "SIDEWAYS_LOW");

        let tick = engine
            .process_symbol(&history, &mut ledger, &mut broker, true)
            .unwrap();
        assert!(matches!(tick.action, TickAction::Added(_)));
        assert_eq!(ledger.trade_history().len(), 2);
    }

    #[test]
    fn test_halted_engine_blocks_new_orders() {
        let config = only_trend();
        let engine = engine(&config);
        let history = rising(60, "BTCUSDT");
        let mut ledger = ledger_at(history[59].timestamp);
        let mut broker = PaperBroker::default();

        let tick = engine
            .process_symbol(&history, &mut ledger, &mut broker, false)
            .unwrap();
        assert_eq!(tick.action, TickAction::Blocked(RiskRejection::EmergencyStop));
        assert!(ledger.positions().is_empty());
    }

    #[test]
    fn test_sell_without_position_is_skipped_when_short_disabled() {
        let config = only_trend();
        let engine = engine(&config);
        let mut history = rising(60, "BTCUSDT");
        history.reverse();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for (i, snap) in history.iter_mut().enumerate() {
            snap.timestamp = start + Duration::hours(i as i64);
        }
        let mut ledger = ledger_at(history[59].timestamp);
        let mut broker = PaperBroker::default();

        let tick = engine
            .process_symbol(&history, &mut ledger, &mut broker, true)
            .unwrap();
        assert_eq!(tick.decision.direction, Direction::Sell);
        assert!(matches!(tick.action, TickAction::Skipped(_)));
        assert!(ledger.trade_history().is_empty());
    }

    #[test]
    fn test_stop_loss_exit_runs_before_evaluation() {
        let config = only_trend();
        let engine = engine(&config);
        let history = rising(60, "BTCUSDT");
        let ts = history[59].timestamp;
        let mut ledger = ledger_at(ts);
        let mut broker = PaperBroker::default();
        let symbol = Symbol::new("BTCUSDT");
        let close = history[59].close;

        ledger
            .open_position(
                &symbol,
                PositionSide::Long,
                close * 1.05,
                1.0,
                crate::risk::Stops {
                    stop_loss: close * 1.01,
                    take_profit: close * 1.2,
                },
                ts,
                crate::Money::ZERO,
            )
            .unwrap();

        let tick = engine
            .process_symbol(&history, &mut ledger, &mut broker, false)
            .unwrap();
        let exit = tick.exit.unwrap();
        assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
        assert!(exit.realized_pnl.unwrap().is_negative());
    }

    #[test]
    fn test_close_all_liquidates() {
        let config = only_trend();
        let engine = engine(&config);
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut ledger = ledger_at(ts);
        let mut broker = PaperBroker::default();
        for name in ["BTCUSDT", "ETHUSDT"] {
            ledger
                .open_position(
                    &Symbol::new(name),
                    PositionSide::Long,
                    100.0,
                    1.0,
                    crate::risk::Stops {
                        stop_loss: 98.0,
                        take_profit: 104.0,
                    },
                    ts,
                    crate::Money::ZERO,
                )
                .unwrap();
        }

        let closed = engine.close_all(ts, ExitReason::Shutdown, &mut ledger, &mut broker);
        assert_eq!(closed.len(), 2);
        assert!(ledger.positions().is_empty());
        assert_eq!(ledger.cash(), crate::Money::from_f64(100_000.0));
    }

    /// Rising series with a small oscillation so returns have variance
    fn wavy(n: usize, symbol: &str, amplitude: f64) -> Vec<MarketSnapshot> {
        rising(n, symbol)
            .into_iter()
            .enumerate()
            .map(|(i, mut snap)| {
                let c = 100.0 * 1.01f64.powi(i as i32) * (1.0 + amplitude * (i as f64 * 1.3).sin());
                snap.open = c;
                snap.high = c * 1.002;
                snap.low = c * 0.998;
                snap.close = c;
                snap
            })
            .collect()
    }

    #[test]
    fn test_correlated_peer_blocks_new_position() {
        let mut config = only_trend();
        config.risk.min_confidence = 0.0;
        let engine = engine(&config);
        let btc = wavy(60, "BTCUSDT", 0.002);
        let eth = wavy(60, "ETHUSDT", 0.002);
        let ts = btc[59].timestamp;

        let mut data = MarketData::new();
        data.insert(Symbol::new("BTCUSDT"), btc.clone());
        data.insert(Symbol::new("ETHUSDT"), eth.clone());

        let mut ledger = ledger_at(ts);
        let mut broker = PaperBroker::default();
        ledger
            .open_position(
                &Symbol::new("ETHUSDT"),
                PositionSide::Long,
                eth[59].close,
                1.0,
                crate::risk::Stops {
                    stop_loss: 1.0,
                    take_profit: 1e6,
                },
                ts,
                crate::Money::ZERO,
            )
            .unwrap();

        let tick = engine
            .process_symbol_with_peers(&btc, &data, &mut ledger, &mut broker, true)
            .unwrap();
        assert_eq!(tick.decision.direction, Direction::Buy);
        match tick.action {
            TickAction::Blocked(RiskRejection::CorrelationLimit {
                symbol,
                held,
                correlation,
                limit,
            }) => {
                assert_eq!(symbol, Symbol::new("BTCUSDT"));
                assert_eq!(held, Symbol::new("ETHUSDT"));
                assert_relative_eq!(correlation, 1.0, epsilon = 1e-9);
                assert_eq!(limit, 0.7);
            }
            other => panic!("expected correlation block, got {:?}", other),
        }
        assert!(ledger.position(&Symbol::new("BTCUSDT")).is_none());

        // Without peer data the same decision opens
        let tick = engine
            .process_symbol(&btc, &mut ledger, &mut broker, true)
            .unwrap();
        assert!(matches!(tick.action, TickAction::Opened(_)));
    }

    #[test]
    fn test_uncorrelated_peer_does_not_block() {
        let mut config = only_trend();
        config.risk.min_confidence = 0.0;
        let engine = engine(&config);
        let btc = wavy(60, "BTCUSDT", 0.002);
        // Constant returns have no variance and count as uncorrelated
        let eth = rising(60, "ETHUSDT");
        let ts = btc[59].timestamp;

        let mut data = MarketData::new();
        data.insert(Symbol::new("ETHUSDT"), eth.clone());

        let mut ledger = ledger_at(ts);
        let mut broker = PaperBroker::default();
        ledger
            .open_position(
                &Symbol::new("ETHUSDT"),
                PositionSide::Long,
                eth[59].close,
                1.0,
                crate::risk::Stops {
                    stop_loss: 1.0,
                    take_profit: 1e6,
                },
                ts,
                crate::Money::ZERO,
            )
            .unwrap();

        let tick = engine
            .process_symbol_with_peers(&btc, &data, &mut ledger, &mut broker, true)
            .unwrap();
        assert!(matches!(tick.action, TickAction::Opened(_)), "got {:?}", tick.action);
    }
}
