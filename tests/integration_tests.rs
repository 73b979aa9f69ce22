//! Integration tests for the trading engine
//!
//! These tests verify that the components work together correctly.

use std::collections::BTreeMap;
use std::sync::Arc;

use approx::assert_relative_eq;
use chrono::{DateTime, Duration, TimeZone, Utc};

use tradex_engine::aggregator::{SignalAggregator, SourceWeights};
use tradex_engine::backtest::Backtester;
use tradex_engine::broker::PaperBroker;
use tradex_engine::clock::SimulatedClock;
use tradex_engine::data::{self, DateRange, MarketData};
use tradex_engine::engine::{TickAction, TradingEngine};
use tradex_engine::ledger::{PortfolioLedger, TradeStats};
use tradex_engine::regime::{RegimeClassifier, RegimeConfig, RiskProfile};
use tradex_engine::risk::{RiskManager, RiskManagerConfig};
use tradex_engine::{
    Bar, Config, Decision, Direction, ExitReason, MarketSnapshot, Money, PositionSide,
    RegimeLabel, RiskRejection, SignalSource, SignalVote, Symbol, TradeAction,
};

// =============================================================================
// Test Utilities
// =============================================================================

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Hourly snapshots oscillating around `base_price`, with an `ml_probability`
/// column that flips between bullish and bearish every `period` bars
fn generate_snapshots(symbol: &str, count: usize, base_price: f64, period: usize) -> Vec<MarketSnapshot> {
    (0..count)
        .map(|i| {
            let close = base_price + 2.0 * (i as f64 / 6.0).sin();
            let bar = Bar {
                timestamp: start_time() + Duration::hours(i as i64),
                open: close,
                high: close * 1.002,
                low: close * 0.998,
                close,
                volume: 5_000.0,
            };
            let p = if (i / period) % 2 == 0 { 0.9 } else { 0.1 };
            MarketSnapshot::from_bar(Symbol::new(symbol), &bar).with_indicator("ml_probability", p)
        })
        .collect()
}

fn snapshot_at(symbol: &str, hour: i64, close: f64) -> MarketSnapshot {
    let bar = Bar {
        timestamp: start_time() + Duration::hours(hour),
        open: close,
        high: close * 1.005,
        low: close * 0.995,
        close,
        volume: 5_000.0,
    };
    MarketSnapshot::from_bar(Symbol::new(symbol), &bar)
}

fn ledger(capital: f64) -> PortfolioLedger {
    PortfolioLedger::new(capital, Arc::new(SimulatedClock::new(start_time())))
}

/// Engine config where only the precomputed ML source votes
fn ml_only_config() -> Config {
    let mut config = Config::default();
    config.signals.technical_enabled = false;
    config.signals.trend_enabled = false;
    config.signals.liquidity_enabled = false;
    config.execution.fee_rate = 0.0;
    config.backtest.warmup_bars = 30;
    config
}

fn write_csv(dir: &std::path::Path, symbol: &str, snapshots: &[MarketSnapshot]) {
    std::fs::create_dir_all(dir).unwrap();
    let mut wtr = csv::Writer::from_path(dir.join(format!("{}_1h.csv", symbol))).unwrap();
    wtr.write_record(["datetime", "open", "high", "low", "close", "volume", "ml_probability"])
        .unwrap();
    for s in snapshots {
        wtr.write_record(&[
            s.timestamp.to_rfc3339(),
            s.open.to_string(),
            s.high.to_string(),
            s.low.to_string(),
            s.close.to_string(),
            s.volume.to_string(),
            s.indicator("ml_probability").unwrap().to_string(),
        ])
        .unwrap();
    }
    wtr.flush().unwrap();
}

// =============================================================================
// Aggregation
// =============================================================================

#[test]
fn test_weighted_buy_votes_aggregate_to_weighted_mean() {
    let aggregator = SignalAggregator::new(SourceWeights::new(0.3, 0.3, 0.4, 0.0));
    let classifier = RegimeClassifier::new(RegimeConfig {
        adaptation: false,
        ..RegimeConfig::default()
    });
    let votes = vec![
        SignalVote::new(SignalSource::Technical, Direction::Buy, 0.8, "rsi"),
        SignalVote::new(SignalSource::Ml, Direction::Buy, 0.7, "model"),
        SignalVote::new(SignalSource::Trend, Direction::Buy, 0.9, "trend"),
    ];

    let decision = aggregator.aggregate(
        &Symbol::new("BTCUSDT"),
        votes,
        RegimeLabel::Unknown,
        &classifier,
        start_time(),
    );

    assert_eq!(decision.direction, Direction::Buy);
    assert_relative_eq!(decision.confidence, 0.81, epsilon = 1e-9);
    assert_eq!(decision.breakdown.len(), 3);
    assert!(decision.rationale.contains("Regime: UNKNOWN"));
}

#[test]
fn test_normalized_weights_sum_to_one_in_every_regime() {
    let aggregator = SignalAggregator::new(SourceWeights::new(0.30, 0.35, 0.20, 0.15));
    let classifier = RegimeClassifier::new(RegimeConfig::default());
    let subsets: [&[SignalSource]; 3] = [
        &[SignalSource::Technical],
        &[SignalSource::Ml, SignalSource::Liquidity],
        &SignalSource::ALL,
    ];

    for label in RegimeLabel::all_known().chain(std::iter::once(RegimeLabel::Unknown)) {
        let multipliers = classifier.weight_multipliers(label);
        for fired in subsets {
            let weights = aggregator.normalized_weights(&multipliers, fired);
            let total: f64 = weights.values().sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }
}

#[test]
fn test_empty_and_tied_votes_hold_at_half() {
    let aggregator = SignalAggregator::new(SourceWeights::uniform(0.25));
    let classifier = RegimeClassifier::new(RegimeConfig::default());
    let symbol = Symbol::new("ETHUSDT");

    let empty = aggregator.aggregate(&symbol, vec![], RegimeLabel::Unknown, &classifier, start_time());
    assert_eq!(empty.direction, Direction::Hold);
    assert_eq!(empty.confidence, 0.5);

    let tied = aggregator.aggregate(
        &symbol,
        vec![
            SignalVote::new(SignalSource::Technical, Direction::Buy, 0.7, "up"),
            SignalVote::new(SignalSource::Trend, Direction::Sell, 0.7, "down"),
        ],
        RegimeLabel::Unknown,
        &classifier,
        start_time(),
    );
    assert_eq!(tied.direction, Direction::Hold);
    assert_eq!(tied.confidence, 0.5);
}

#[test]
fn test_decision_confidence_bounded_over_replay() {
    let config = Config::default();
    let engine = TradingEngine::from_config(&config);
    let mut enriched = generate_snapshots("BTCUSDT", 150, 100.0, 12);
    tradex_engine::indicators::enrich(&mut enriched);

    for end in 1..=enriched.len() {
        let (_, decision) = engine.evaluate(&enriched[..end]).unwrap();
        assert!((0.0..=1.0).contains(&decision.confidence));
        let total: f64 = decision.breakdown.iter().map(|wv| wv.weight).sum();
        if !decision.breakdown.is_empty() {
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }
}

// =============================================================================
// Risk
// =============================================================================

#[test]
fn test_kelly_fraction_bounds() {
    let cases = [
        (0.9, 50.0, -10.0),
        (0.1, 10.0, -50.0),
        (0.5, 20.0, -20.0),
        (1.0, 5.0, -1.0),
        (0.0, 0.0, -5.0),
    ];
    for (win_rate, avg_win, avg_loss) in cases {
        let stats = TradeStats {
            total_trades: 10,
            win_rate,
            avg_win,
            avg_loss,
        };
        let k = RiskManager::kelly_fraction(&stats);
        assert!((0.0..=0.25).contains(&k), "kelly {} out of bounds", k);
    }

    let no_losses = TradeStats {
        total_trades: 3,
        win_rate: 1.0,
        avg_win: 10.0,
        avg_loss: 0.0,
    };
    assert_eq!(RiskManager::kelly_fraction(&no_losses), 0.5);
}

#[test]
fn test_daily_trade_limit_blocks_without_mutation() {
    let risk = RiskManagerConfig::default().with_daily_limits(10, 3.0).build();
    let symbol = Symbol::new("BTCUSDT");
    let mut ledger = ledger(10_000.0);
    let stops = RiskManager::compute_stops(100.0, PositionSide::Long, &RiskProfile::new(0.02, 2.0, 4.0));

    for _ in 0..5 {
        ledger
            .open_position(&symbol, PositionSide::Long, 100.0, 1.0, stops, start_time(), Money::ZERO)
            .unwrap();
        ledger
            .close_position(&symbol, 100.0, start_time(), ExitReason::Signal, Money::ZERO)
            .unwrap();
    }
    assert_eq!(ledger.daily_trade_count(), 10);

    let decision = Decision {
        symbol: symbol.clone(),
        direction: Direction::Buy,
        confidence: 0.9,
        regime: RegimeLabel::Unknown,
        breakdown: vec![],
        rationale: String::new(),
        timestamp: start_time(),
    };
    let before = ledger.snapshot();
    assert_eq!(
        risk.check_trade_gate(&decision, &ledger),
        Err(RiskRejection::DailyTradeLimit { count: 10, max: 10 })
    );
    assert_eq!(ledger.snapshot(), before);
}

#[test]
fn test_engine_downgrades_to_hold_at_daily_limit() {
    let mut config = ml_only_config();
    config.risk.max_daily_trades = 10;
    let engine = TradingEngine::from_config(&config);
    let mut broker = PaperBroker::new(0.0, 0.0);
    let symbol = Symbol::new("BTCUSDT");
    let mut ledger = ledger(10_000.0);
    let stops = RiskManager::compute_stops(100.0, PositionSide::Long, &RiskProfile::new(0.02, 2.0, 4.0));
    for _ in 0..5 {
        ledger
            .open_position(&symbol, PositionSide::Long, 100.0, 1.0, stops, start_time(), Money::ZERO)
            .unwrap();
        ledger
            .close_position(&symbol, 100.0, start_time(), ExitReason::Signal, Money::ZERO)
            .unwrap();
    }

    let history = vec![snapshot_at("BTCUSDT", 1, 100.0).with_indicator("ml_probability", 0.9)];
    let cash = ledger.cash();
    let fills = ledger.trade_history().len();

    let tick = engine.process_symbol(&history, &mut ledger, &mut broker, true).unwrap();

    assert_eq!(tick.decision.direction, Direction::Buy);
    assert!(matches!(
        tick.action,
        TickAction::Blocked(RiskRejection::DailyTradeLimit { count: 10, max: 10 })
    ));
    assert_eq!(ledger.cash(), cash);
    assert_eq!(ledger.trade_history().len(), fills);
    assert_eq!(ledger.open_position_count(), 0);
}

#[test]
fn test_stop_loss_closes_at_98() {
    let config = ml_only_config();
    let engine = TradingEngine::from_config(&config);
    let mut broker = PaperBroker::new(0.0, 0.0);
    let symbol = Symbol::new("BTCUSDT");
    let mut ledger = ledger(10_000.0);

    let stops = RiskManager::compute_stops(100.0, PositionSide::Long, &RiskProfile::new(0.02, 2.0, 4.0));
    assert_relative_eq!(stops.stop_loss, 98.0, epsilon = 1e-9);
    ledger
        .open_position(&symbol, PositionSide::Long, 100.0, 10.0, stops, start_time(), Money::ZERO)
        .unwrap();

    // Above the stop nothing happens
    let above = vec![snapshot_at("BTCUSDT", 1, 98.5)];
    let tick = engine.process_symbol(&above, &mut ledger, &mut broker, false).unwrap();
    assert!(tick.exit.is_none());
    assert!(ledger.position(&symbol).is_some());

    let at_stop = vec![snapshot_at("BTCUSDT", 2, 98.0)];
    let tick = engine.process_symbol(&at_stop, &mut ledger, &mut broker, false).unwrap();

    let exit = tick.exit.expect("stop-loss should fire");
    assert_eq!(exit.exit_reason, Some(ExitReason::StopLoss));
    assert_relative_eq!(exit.realized_pnl.unwrap().to_f64(), -20.0, epsilon = 1e-9);
    assert!(ledger.position(&symbol).is_none());
    assert_relative_eq!(ledger.cash().to_f64(), 9_980.0, epsilon = 1e-9);
}

// =============================================================================
// Ledger
// =============================================================================

#[test]
fn test_open_close_round_trip_restores_cash() {
    let symbol = Symbol::new("SOLUSDT");
    let mut ledger = ledger(5_000.0);
    let stops = RiskManager::compute_stops(20.0, PositionSide::Long, &RiskProfile::new(0.02, 2.0, 4.0));

    ledger
        .open_position(&symbol, PositionSide::Long, 20.0, 50.0, stops, start_time(), Money::ZERO)
        .unwrap();
    assert_eq!(ledger.cash(), Money::from_f64(4_000.0));
    ledger
        .close_position(&symbol, 20.0, start_time(), ExitReason::Signal, Money::ZERO)
        .unwrap();

    assert_eq!(ledger.cash(), Money::from_f64(5_000.0));
    assert_eq!(ledger.open_position_count(), 0);
    assert_eq!(ledger.trade_history().len(), 2);
}

#[test]
fn test_drawdown_bounded_and_peak_monotone() {
    let symbol = Symbol::new("BTCUSDT");
    let mut ledger = ledger(1_000.0);
    let stops = RiskManager::compute_stops(100.0, PositionSide::Long, &RiskProfile::new(0.5, 50.0, 100.0));
    ledger
        .open_position(&symbol, PositionSide::Long, 100.0, 9.0, stops, start_time(), Money::ZERO)
        .unwrap();

    let mut last_peak = ledger.peak_equity();
    for price in [110.0, 90.0, 60.0, 130.0, 10.0, 120.0] {
        ledger.mark_to_market(&BTreeMap::from([(symbol.clone(), price)]));
        let dd = ledger.current_drawdown();
        assert!((0.0..=1.0).contains(&dd), "drawdown {} out of range", dd);
        assert!(ledger.peak_equity() >= last_peak);
        last_peak = ledger.peak_equity();
    }
    assert_relative_eq!(last_peak, 1_270.0, epsilon = 1e-9);
}

// =============================================================================
// Backtest
// =============================================================================

#[test]
fn test_backtest_is_deterministic() {
    let config = ml_only_config();
    let mut data = MarketData::new();
    data.insert(Symbol::new("BTCUSDT"), generate_snapshots("BTCUSDT", 200, 100.0, 15));
    data.insert(Symbol::new("ETHUSDT"), generate_snapshots("ETHUSDT", 180, 50.0, 20));
    data.enrich();

    let first = Backtester::new(&config).run(&data);
    let second = Backtester::new(&config).run(&data);

    assert!(!first.trades.is_empty());
    assert_eq!(first.trades, second.trades);
    assert_eq!(first.metrics, second.metrics);
    assert_eq!(first.daily_equity, second.daily_equity);
}

#[test]
fn test_backtest_over_csv_directory() {
    let dir = std::env::temp_dir().join(format!("tradex_it_{}", std::process::id()));
    write_csv(&dir, "BTCUSDT", &generate_snapshots("BTCUSDT", 240, 100.0, 15));
    write_csv(&dir, "ETHUSDT", &generate_snapshots("ETHUSDT", 240, 40.0, 25));

    let mut config = ml_only_config();
    config.backtest.data_dir = dir.to_string_lossy().into_owned();
    let symbols = config.trading.symbols();
    let data = data::load_directory(&dir, &symbols, Some("1h"), &DateRange::default()).unwrap();
    assert_eq!(data.len(), 2);

    let result = Backtester::new(&config).run(&data);
    let m = &result.metrics;

    assert!(result.trades.iter().any(|t| t.action == TradeAction::Open));
    assert!(result.ledger.positions.is_empty());
    assert_eq!(result.failed_ticks, 0);
    assert_relative_eq!(result.ledger.equity, m.final_equity, epsilon = 1e-6);
    assert_relative_eq!(
        m.total_return,
        m.final_equity - config.trading.initial_capital,
        epsilon = 1e-6
    );
    assert!((0.0..=1.0).contains(&m.max_drawdown));
    assert!(m.winning_trades + m.losing_trades <= m.total_trades);
    assert!(result.daily_equity.len() >= 10);

    std::fs::remove_dir_all(&dir).ok();
}
