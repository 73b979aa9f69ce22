//! Portfolio ledger
//!
//! The single authoritative record of cash, open positions, fills and the
//! daily counters. State changes only through the lifecycle operations
//! ([`PortfolioLedger::open_position`], [`PortfolioLedger::average_into`],
//! [`PortfolioLedger::close_position`]); a rejected operation leaves the
//! ledger untouched.
//!
//! Opening and adding need the cash to pay for the fill. Closing never does:
//! buying back a short whose proceeds were spent elsewhere may take cash
//! negative, since refusing the exit would leave the risk on the book.
//!
//! Cash, realized P&L and fees are [`Money`]. Equity and drawdown are
//! reported as `f64` for analytics.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::SessionClock;
use crate::error::ExecutionRejected;
use crate::risk::Stops;
use crate::{
    ExitReason, Money, Position, PositionSide, PositionStatus, Symbol, TradeAction, TradeRecord,
};

/// Win rate and average outcome of closed trades, input to Kelly sizing
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TradeStats {
    pub total_trades: usize,
    /// Fraction in [0, 1]
    pub win_rate: f64,
    pub avg_win: f64,
    /// Mean of losing trades; zero or negative
    pub avg_loss: f64,
}

impl TradeStats {
    /// Statistics over net realized P&L of closing fills
    pub fn from_trades(trades: &[TradeRecord]) -> Self {
        let pnls: Vec<f64> = trades
            .iter()
            .filter_map(|t| t.net_pnl())
            .map(Money::to_f64)
            .collect();
        if pnls.is_empty() {
            return Self::default();
        }

        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p < 0.0).collect();
        let mean = |v: &[f64]| {
            if v.is_empty() {
                0.0
            } else {
                v.iter().sum::<f64>() / v.len() as f64
            }
        };

        Self {
            total_trades: pnls.len(),
            win_rate: wins.len() as f64 / pnls.len() as f64,
            avg_win: mean(&wins),
            avg_loss: mean(&losses),
        }
    }
}

/// Serializable view of the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub cash: Money,
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown: f64,
    pub positions: Vec<Position>,
    pub daily_trade_count: u32,
    pub daily_pnl: Money,
    pub session_day: Option<NaiveDate>,
    pub realized_pnl: Money,
    pub total_commission: Money,
    pub total_fills: usize,
}

#[derive(Debug)]
pub struct PortfolioLedger {
    initial_capital: Money,
    cash: Money,
    positions: BTreeMap<Symbol, Position>,
    trades: Vec<TradeRecord>,
    /// Latest price seen per symbol, used for valuation when a caller does
    /// not supply one
    marks: BTreeMap<Symbol, f64>,
    peak_equity: f64,
    drawdown: f64,
    daily_trade_count: u32,
    daily_pnl: Money,
    session_start_equity: Money,
    session_day: Option<NaiveDate>,
    clock: Arc<dyn SessionClock>,
}

impl PortfolioLedger {
    pub fn new(initial_capital: f64, clock: Arc<dyn SessionClock>) -> Self {
        let capital = Money::from_f64(initial_capital);
        let mut ledger = Self {
            initial_capital: capital,
            cash: capital,
            positions: BTreeMap::new(),
            trades: Vec::new(),
            marks: BTreeMap::new(),
            peak_equity: capital.to_f64().max(0.0),
            drawdown: 0.0,
            daily_trade_count: 0,
            daily_pnl: Money::ZERO,
            session_start_equity: capital,
            session_day: None,
            clock,
        };
        ledger.roll_session();
        ledger
    }

    pub fn initial_capital(&self) -> Money {
        self.initial_capital
    }

    pub fn cash(&self) -> Money {
        self.cash
    }

    pub fn positions(&self) -> &BTreeMap<Symbol, Position> {
        &self.positions
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn trade_history(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn daily_trade_count(&self) -> u32 {
        self.daily_trade_count
    }

    pub fn daily_pnl(&self) -> Money {
        self.daily_pnl
    }

    /// Realized P&L today as a percentage of equity at the session start
    pub fn daily_pnl_pct(&self) -> f64 {
        let base = self.session_start_equity.to_f64();
        if base <= 0.0 {
            return 0.0;
        }
        self.daily_pnl.to_f64() / base * 100.0
    }

    pub fn session_start_equity(&self) -> Money {
        self.session_start_equity
    }

    pub fn session_day(&self) -> Option<NaiveDate> {
        self.session_day
    }

    pub fn peak_equity(&self) -> f64 {
        self.peak_equity
    }

    /// Drawdown as of the last valuation
    pub fn current_drawdown(&self) -> f64 {
        self.drawdown
    }

    pub fn clock(&self) -> &Arc<dyn SessionClock> {
        &self.clock
    }

    pub fn trade_stats(&self) -> TradeStats {
        TradeStats::from_trades(&self.trades)
    }

    /// Reset the daily counters if the clock has moved into a new session
    /// day. Returns true when a reset happened.
    pub fn roll_session(&mut self) -> bool {
        let today = self.clock.today();
        if self.session_day == Some(today) {
            return false;
        }

        let equity = self.equity_money(&BTreeMap::new());
        if self.session_day.is_some() {
            info!(
                day = %today,
                trades = self.daily_trade_count,
                daily_pnl = %self.daily_pnl,
                "New session day, resetting daily counters"
            );
        }
        self.session_day = Some(today);
        self.daily_trade_count = 0;
        self.daily_pnl = Money::ZERO;
        self.session_start_equity = equity;
        true
    }

    /// Open a new position. Fees are paid from cash.
    #[allow(clippy::too_many_arguments)]
    pub fn open_position(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        price: f64,
        quantity: f64,
        stops: Stops,
        timestamp: DateTime<Utc>,
        fee: Money,
    ) -> Result<&Position, ExecutionRejected> {
        validate_order(price, quantity)?;
        if self.positions.contains_key(symbol) {
            return Err(ExecutionRejected::PositionExists(symbol.clone()));
        }

        let notional = Money::from_f64(price) * Money::from_f64(quantity);
        let cash_delta = match side {
            PositionSide::Long => -(notional + fee),
            PositionSide::Short => notional - fee,
        };
        self.ensure_cash(cash_delta)?;
        self.roll_session();

        self.cash += cash_delta;
        self.record_fill(TradeRecord {
            symbol: symbol.clone(),
            side,
            action: TradeAction::Open,
            price,
            quantity,
            entry_price: price,
            timestamp,
            realized_pnl: None,
            commission: fee,
            exit_reason: None,
        });
        self.marks.insert(symbol.clone(), price);

        info!(
            symbol = %symbol,
            side = %side,
            price,
            quantity,
            stop_loss = stops.stop_loss,
            take_profit = stops.take_profit,
            "Position opened"
        );

        let position = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(|| Position {
                symbol: symbol.clone(),
                side,
                entry_price: price,
                quantity,
                entry_time: timestamp,
                stop_loss_price: stops.stop_loss,
                take_profit_price: stops.take_profit,
                status: PositionStatus::Open,
                entry_commission: fee,
            });
        Ok(position)
    }

    /// Add to an existing position at a quantity-weighted average entry.
    /// Stops are left as they were; see [`PortfolioLedger::set_stops`].
    pub fn average_into(
        &mut self,
        symbol: &Symbol,
        side: PositionSide,
        price: f64,
        quantity: f64,
        timestamp: DateTime<Utc>,
        fee: Money,
    ) -> Result<&Position, ExecutionRejected> {
        validate_order(price, quantity)?;
        let (held_side, held_entry, held_quantity) = self
            .positions
            .get(symbol)
            .map(|p| (p.side, p.entry_price, p.quantity))
            .ok_or_else(|| ExecutionRejected::NoPosition(symbol.clone()))?;
        if held_side != side {
            return Err(ExecutionRejected::SideMismatch(symbol.clone()));
        }

        let notional = Money::from_f64(price) * Money::from_f64(quantity);
        let cash_delta = match side {
            PositionSide::Long => -(notional + fee),
            PositionSide::Short => notional - fee,
        };
        self.ensure_cash(cash_delta)?;
        self.roll_session();

        let total_quantity = held_quantity + quantity;
        let average_entry = (held_entry * held_quantity + price * quantity) / total_quantity;

        self.cash += cash_delta;
        self.record_fill(TradeRecord {
            symbol: symbol.clone(),
            side,
            action: TradeAction::Add,
            price,
            quantity,
            entry_price: average_entry,
            timestamp,
            realized_pnl: None,
            commission: fee,
            exit_reason: None,
        });
        self.marks.insert(symbol.clone(), price);

        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| ExecutionRejected::NoPosition(symbol.clone()))?;
        position.entry_price = average_entry;
        position.quantity = total_quantity;
        position.entry_commission += fee;

        debug!(
            symbol = %symbol,
            price,
            quantity,
            average_entry,
            total_quantity,
            "Averaged into position"
        );
        Ok(position)
    }

    /// Replace the stop-loss and take-profit of an open position
    pub fn set_stops(&mut self, symbol: &Symbol, stops: Stops) -> Result<(), ExecutionRejected> {
        let position = self
            .positions
            .get_mut(symbol)
            .ok_or_else(|| ExecutionRejected::NoPosition(symbol.clone()))?;
        position.stop_loss_price = stops.stop_loss;
        position.take_profit_price = stops.take_profit;
        Ok(())
    }

    /// Close the whole position at `price`. Never refused for lack of cash.
    pub fn close_position(
        &mut self,
        symbol: &Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
        reason: ExitReason,
        fee: Money,
    ) -> Result<TradeRecord, ExecutionRejected> {
        if !price.is_finite() || price <= 0.0 {
            return Err(ExecutionRejected::InvalidOrder(format!(
                "invalid exit price {}",
                price
            )));
        }
        let position = self
            .positions
            .get(symbol)
            .ok_or_else(|| ExecutionRejected::NoPosition(symbol.clone()))?;

        let sign = Money::from_f64(position.side.sign());
        let quantity = Money::from_f64(position.quantity);
        let entry = Money::from_f64(position.entry_price);
        let exit = Money::from_f64(price);
        let pnl = (exit - entry) * quantity * sign;
        let cash_delta = sign * exit * quantity - fee;
        self.roll_session();

        let mut closed = match self.positions.remove(symbol) {
            Some(p) => p,
            None => return Err(ExecutionRejected::NoPosition(symbol.clone())),
        };
        closed.status = PositionStatus::Closed;

        self.cash += cash_delta;
        self.daily_pnl += pnl - fee;
        self.marks.insert(symbol.clone(), price);

        let record = TradeRecord {
            symbol: symbol.clone(),
            side: closed.side,
            action: TradeAction::Close,
            price,
            quantity: closed.quantity,
            entry_price: closed.entry_price,
            timestamp,
            realized_pnl: Some(pnl),
            commission: fee,
            exit_reason: Some(reason),
        };
        self.record_fill(record.clone());
        self.revalue(&BTreeMap::new());

        info!(
            symbol = %symbol,
            side = %closed.side,
            entry = closed.entry_price,
            exit = price,
            pnl = %pnl,
            reason = %reason,
            "Position closed"
        );
        Ok(record)
    }

    /// Record the latest prices, revalue equity and update the peak
    pub fn mark_to_market(&mut self, prices: &BTreeMap<Symbol, f64>) -> f64 {
        for (symbol, &price) in prices {
            if price.is_finite() && price > 0.0 {
                self.marks.insert(symbol.clone(), price);
            }
        }
        self.roll_session();
        self.revalue(&BTreeMap::new())
    }

    /// Cash plus the signed market value of all positions. Prices missing
    /// from `prices` fall back to the last mark, then to the entry price.
    pub fn equity(&self, prices: &BTreeMap<Symbol, f64>) -> f64 {
        self.equity_money(prices).to_f64()
    }

    /// Drawdown of equity at `prices` from the recorded peak, in [0, 1]
    pub fn drawdown(&self, prices: &BTreeMap<Symbol, f64>) -> f64 {
        drawdown_from_peak(self.peak_equity, self.equity(prices))
    }

    /// Last valuation price of `symbol`
    pub fn mark(&self, symbol: &Symbol) -> Option<f64> {
        self.marks.get(symbol).copied()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let realized_pnl = self.trades.iter().filter_map(|t| t.realized_pnl).sum();
        let total_commission = self.trades.iter().map(|t| t.commission).sum();
        LedgerSnapshot {
            cash: self.cash,
            equity: self.equity(&BTreeMap::new()),
            peak_equity: self.peak_equity,
            drawdown: self.drawdown,
            positions: self.positions.values().cloned().collect(),
            daily_trade_count: self.daily_trade_count,
            daily_pnl: self.daily_pnl,
            session_day: self.session_day,
            realized_pnl,
            total_commission,
            total_fills: self.trades.len(),
        }
    }

    fn equity_money(&self, prices: &BTreeMap<Symbol, f64>) -> Money {
        let positions_value: Money = self
            .positions
            .values()
            .map(|p| {
                let price = prices
                    .get(&p.symbol)
                    .or_else(|| self.marks.get(&p.symbol))
                    .copied()
                    .unwrap_or(p.entry_price);
                Money::from_f64(p.side.sign()) * Money::from_f64(price) * Money::from_f64(p.quantity)
            })
            .sum();
        self.cash + positions_value
    }

    fn revalue(&mut self, prices: &BTreeMap<Symbol, f64>) -> f64 {
        let equity = self.equity(prices);
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.drawdown = drawdown_from_peak(self.peak_equity, equity);
        equity
    }

    fn record_fill(&mut self, record: TradeRecord) {
        self.daily_trade_count += 1;
        self.trades.push(record);
    }

    /// Reject fills that would leave cash negative
    fn ensure_cash(&self, delta: Money) -> Result<(), ExecutionRejected> {
        let after = self.cash + delta;
        if after.is_negative() {
            return Err(ExecutionRejected::InsufficientFunds {
                required: (-delta).to_f64(),
                available: self.cash.to_f64(),
            });
        }
        Ok(())
    }
}

fn validate_order(price: f64, quantity: f64) -> Result<(), ExecutionRejected> {
    if !price.is_finite() || price <= 0.0 {
        return Err(ExecutionRejected::InvalidOrder(format!("invalid price {}", price)));
    }
    if !quantity.is_finite() || quantity <= 0.0 {
        return Err(ExecutionRejected::InvalidOrder(format!(
            "invalid quantity {}",
            quantity
        )));
    }
    Ok(())
}

/// `(peak - equity) / peak` clamped to [0, 1]; zero when peak is not positive
pub fn drawdown_from_peak(peak: f64, equity: f64) -> f64 {
    if !(peak > 0.0) || !equity.is_finite() {
        return 0.0;
    }
    ((peak - equity) / peak).clamp(0.0, 1.0)
}
