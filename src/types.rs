//! Core data types used across the decision engine
//!
//! Market observations ([`Bar`], [`MarketSnapshot`]), analyzer output
//! ([`SignalVote`], [`Decision`]) and ledger records ([`Position`],
//! [`TradeRecord`]). Monetary ledger values use [`Money`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use crate::regime::RegimeLabel;

/// Validation errors for bar data
#[derive(Debug, Error, PartialEq)]
pub enum BarValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive and finite: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Create a new bar with validation
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, BarValidationError> {
        let bar = Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        };
        bar.validate()?;
        Ok(bar)
    }

    pub fn validate(&self) -> Result<(), BarValidationError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(BarValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if !(self.volume >= 0.0) {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(BarValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(BarValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }
}

/// Trading pair symbol backed by `Arc<str>` so clones stay cheap
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side submitted to a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Direction of an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// Order side that opens (or adds to) this position
    pub fn entry_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Buy,
            PositionSide::Short => Side::Sell,
        }
    }

    /// Order side that closes this position
    pub fn exit_side(self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }

    /// The trade direction that agrees with holding this side
    pub fn direction(self) -> Direction {
        match self {
            PositionSide::Long => Direction::Buy,
            PositionSide::Short => Direction::Sell,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Trading direction produced by analyzers and the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Buy,
    Sell,
    Hold,
}

impl Direction {
    /// Fixed evaluation order, also used to break ties deterministically
    pub const ALL: [Direction; 3] = [Direction::Buy, Direction::Sell, Direction::Hold];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Buy => "BUY",
            Direction::Sell => "SELL",
            Direction::Hold => "HOLD",
        };
        f.write_str(s)
    }
}

/// One symbol at one timestamp: OHLCV plus precomputed indicators and pattern flags.
///
/// Indicator lookups never return NaN or infinite values; those are reported
/// as missing so analyzers treat them as unavailable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
    #[serde(default)]
    pub patterns: BTreeMap<String, bool>,
}

impl MarketSnapshot {
    pub fn from_bar(symbol: Symbol, bar: &Bar) -> Self {
        Self {
            symbol,
            timestamp: bar.timestamp,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            indicators: BTreeMap::new(),
            patterns: BTreeMap::new(),
        }
    }

    pub fn with_indicator(mut self, name: impl Into<String>, value: f64) -> Self {
        self.indicators.insert(name.into(), value);
        self
    }

    pub fn with_pattern(mut self, name: impl Into<String>, present: bool) -> Self {
        self.patterns.insert(name.into(), present);
        self
    }

    /// Finite indicator value, or `None` when missing or not a number
    pub fn indicator(&self, name: &str) -> Option<f64> {
        self.indicators.get(name).copied().filter(|v| v.is_finite())
    }

    pub fn pattern(&self, name: &str) -> bool {
        self.patterns.get(name).copied().unwrap_or(false)
    }

    pub fn bar(&self) -> Bar {
        Bar {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Analyzer category that produced a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalSource {
    Technical,
    Ml,
    Trend,
    Liquidity,
}

impl SignalSource {
    pub const ALL: [SignalSource; 4] = [
        SignalSource::Technical,
        SignalSource::Ml,
        SignalSource::Trend,
        SignalSource::Liquidity,
    ];
}

impl fmt::Display for SignalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalSource::Technical => "TECHNICAL",
            SignalSource::Ml => "ML",
            SignalSource::Trend => "TREND",
            SignalSource::Liquidity => "LIQUIDITY",
        };
        f.write_str(s)
    }
}

/// One analyzer's opinion about a symbol at a timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalVote {
    pub source: SignalSource,
    pub direction: Direction,
    pub confidence: f64,
    pub rationale: String,
}

impl SignalVote {
    /// Confidence is clamped into [0, 1]; NaN becomes 0.
    pub fn new(
        source: SignalSource,
        direction: Direction,
        confidence: f64,
        rationale: impl Into<String>,
    ) -> Self {
        let confidence = if confidence.is_nan() {
            0.0
        } else {
            confidence.clamp(0.0, 1.0)
        };
        Self {
            source,
            direction,
            confidence,
            rationale: rationale.into(),
        }
    }
}

/// A vote together with the normalized weight it carried in the aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedVote {
    pub vote: SignalVote,
    pub weight: f64,
}

/// Aggregated trading decision for one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub symbol: Symbol,
    pub direction: Direction,
    pub confidence: f64,
    pub regime: RegimeLabel,
    pub breakdown: Vec<WeightedVote>,
    pub rationale: String,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn is_actionable(&self) -> bool {
        self.direction != Direction::Hold
    }
}

/// Lifecycle status of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Active position; at most one per symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub status: PositionStatus,
    /// Fees paid on the opening and averaging fills
    pub entry_commission: Money,
}

impl Position {
    /// Unrealized P&L at the given price
    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        (current_price - self.entry_price) * self.quantity * self.side.sign()
    }

    /// Signed contribution to equity: long positions add value, shorts owe it
    pub fn market_value(&self, current_price: f64) -> f64 {
        self.quantity * current_price * self.side.sign()
    }
}

/// What a fill did to the position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    Open,
    Add,
    Close,
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Signal,
    EndOfRun,
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "Stop Loss",
            ExitReason::TakeProfit => "Take Profit",
            ExitReason::Signal => "Signal",
            ExitReason::EndOfRun => "End of backtest",
            ExitReason::Shutdown => "Shutdown",
        };
        f.write_str(s)
    }
}

/// Executed fill, appended to the ledger's trade history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub action: TradeAction,
    pub price: f64,
    pub quantity: f64,
    /// Average entry of the position at the time of the fill
    pub entry_price: f64,
    pub timestamp: DateTime<Utc>,
    pub realized_pnl: Option<Money>,
    pub commission: Money,
    pub exit_reason: Option<ExitReason>,
}

impl TradeRecord {
    /// Realized return in percent; `None` for opening and averaging fills
    pub fn return_pct(&self) -> Option<f64> {
        if self.action != TradeAction::Close || self.entry_price <= 0.0 {
            return None;
        }
        Some((self.price - self.entry_price) / self.entry_price * self.side.sign() * 100.0)
    }

    /// Realized P&L net of the closing commission
    pub fn net_pnl(&self) -> Option<Money> {
        self.realized_pnl.map(|pnl| pnl - self.commission)
    }
}

/// Backtest performance report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub initial_capital: f64,
    pub final_equity: f64,
    pub total_return: f64,
    pub total_return_pct: f64,
    /// Closed round trips
    pub total_trades: usize,
    /// Every executed fill, including opens and averaging adds
    pub total_executions: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Percentage of closed trades with positive P&L
    pub win_rate: f64,
    pub total_pnl: f64,
    pub avg_win: f64,
    /// Mean of losing trades; negative or zero
    pub avg_loss: f64,
    /// Serialized as `null` when there were no losing trades
    pub profit_factor: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub total_commission: f64,
}

// ============================================================================
// Money Type - Precise Decimal Arithmetic for Ledger Values
// ============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::ops::{Add, AddAssign, Mul, Neg, Sub, SubAssign};

/// Decimal-backed amount for cash, realized P&L and fees.
///
/// Prices and quantities stay `f64` for the analytics; they are converted at
/// the ledger boundary so an open followed by a close at the same price puts
/// cash back exactly where it started.
///
/// # Example
/// ```
/// use tradex_engine::Money;
/// let notional = Money::from_f64(100.50) * Money::from_f64(2.0);
/// assert_eq!(notional.to_f64(), 201.0);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// NaN and infinities map to zero.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Money::ZERO;
        }
        Money(
            Decimal::try_from(value)
                .or_else(|_| Decimal::from_f64_retain(value).ok_or(()))
                .unwrap_or(Decimal::ZERO),
        )
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn from_decimal(value: Decimal) -> Self {
        Money(value)
    }

    pub fn inner(self) -> Decimal {
        self.0
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }

    pub fn is_negative(self) -> bool {
        self.0 < Decimal::ZERO
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! money_binop {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident, $op:tt) => {
        impl $trait for Money {
            type Output = Money;
            fn $method(self, rhs: Money) -> Money {
                Money(self.0 $op rhs.0)
            }
        }

        impl $assign_trait for Money {
            fn $assign_method(&mut self, rhs: Money) {
                self.0 = self.0 $op rhs.0;
            }
        }
    };
}

money_binop!(Add, add, AddAssign, add_assign, +);
money_binop!(Sub, sub, SubAssign, sub_assign, -);

impl Mul for Money {
    type Output = Money;
    fn mul(self, rhs: Money) -> Money {
        Money(self.0 * rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl From<f64> for Money {
    fn from(value: f64) -> Self {
        Money::from_f64(value)
    }
}

impl From<Money> for f64 {
    fn from(value: Money) -> Self {
        value.to_f64()
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

impl<'a> std::iter::Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + *x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_bar_validation() {
        assert!(Bar::new(ts(), 100.0, 105.0, 95.0, 102.0, 10.0).is_ok());
        assert_eq!(
            Bar::new(ts(), 100.0, 95.0, 105.0, 100.0, 10.0).unwrap_err(),
            BarValidationError::HighLessThanLow {
                high: 95.0,
                low: 105.0
            }
        );
        assert!(matches!(
            Bar::new(ts(), 0.0, 105.0, 95.0, 100.0, 10.0),
            Err(BarValidationError::NonPositivePrice { .. })
        ));
        assert!(matches!(
            Bar::new(ts(), 100.0, 105.0, 95.0, 110.0, 10.0),
            Err(BarValidationError::CloseOutOfRange { .. })
        ));
        assert!(matches!(
            Bar::new(ts(), 100.0, 105.0, 95.0, 100.0, -1.0),
            Err(BarValidationError::NegativeVolume(_))
        ));
    }

    #[test]
    fn test_snapshot_hides_non_finite_indicators() {
        let bar = Bar::new(ts(), 100.0, 101.0, 99.0, 100.0, 1.0).unwrap();
        let snap = MarketSnapshot::from_bar(Symbol::new("BTCUSDT"), &bar)
            .with_indicator("rsi", f64::NAN)
            .with_indicator("adx", 30.0)
            .with_pattern("bull_flag", true);

        assert_eq!(snap.indicator("rsi"), None);
        assert_eq!(snap.indicator("adx"), Some(30.0));
        assert_eq!(snap.indicator("missing"), None);
        assert!(snap.pattern("bull_flag"));
        assert!(!snap.pattern("double_top"));
    }

    #[test]
    fn test_signal_vote_confidence_is_clamped() {
        let high = SignalVote::new(SignalSource::Trend, Direction::Buy, 1.7, "x");
        let low = SignalVote::new(SignalSource::Trend, Direction::Buy, -0.2, "x");
        let nan = SignalVote::new(SignalSource::Trend, Direction::Buy, f64::NAN, "x");
        assert_eq!(high.confidence, 1.0);
        assert_eq!(low.confidence, 0.0);
        assert_eq!(nan.confidence, 0.0);
    }

    #[test]
    fn test_position_pnl_sign() {
        let mut pos = Position {
            symbol: Symbol::new("ETHUSDT"),
            side: PositionSide::Long,
            entry_price: 100.0,
            quantity: 2.0,
            entry_time: ts(),
            stop_loss_price: 98.0,
            take_profit_price: 104.0,
            status: PositionStatus::Open,
            entry_commission: Money::ZERO,
        };
        assert_eq!(pos.unrealized_pnl(110.0), 20.0);
        assert_eq!(pos.market_value(110.0), 220.0);

        pos.side = PositionSide::Short;
        assert_eq!(pos.unrealized_pnl(110.0), -20.0);
        assert_eq!(pos.market_value(110.0), -220.0);
    }

    #[test]
    fn test_trade_record_return_pct() {
        let close = TradeRecord {
            symbol: Symbol::new("BTCUSDT"),
            side: PositionSide::Short,
            action: TradeAction::Close,
            price: 90.0,
            quantity: 1.0,
            entry_price: 100.0,
            timestamp: ts(),
            realized_pnl: Some(Money::from_f64(10.0)),
            commission: Money::ZERO,
            exit_reason: Some(ExitReason::TakeProfit),
        };
        assert_eq!(close.return_pct(), Some(10.0));

        let open = TradeRecord {
            action: TradeAction::Open,
            realized_pnl: None,
            exit_reason: None,
            ..close
        };
        assert_eq!(open.return_pct(), None);
    }

    #[test]
    fn test_money_precision() {
        let a = Money::from_f64(0.1);
        let b = Money::from_f64(0.2);
        assert_eq!(a + b, Money::from_f64(0.3));
        assert_eq!((a + b).inner(), dec!(0.3));
    }

    #[test]
    fn test_money_round_trip_restores_cash() {
        let start = Money::from_f64(100_000.0);
        let notional = Money::from_f64(0.123456) * Money::from_f64(43_210.987);
        let mut cash = start;
        cash -= notional;
        cash += notional;
        assert_eq!(cash, start);
    }

    #[test]
    fn test_money_non_finite_is_zero() {
        assert_eq!(Money::from_f64(f64::NAN), Money::ZERO);
        assert_eq!(Money::from_f64(f64::INFINITY), Money::ZERO);
    }

    #[test]
    fn test_money_serde() {
        let money = Money::from_f64(123.456);
        let json = serde_json::to_string(&money).unwrap();
        assert!(json.starts_with('"'));
        let parsed: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(money, parsed);
    }
}
