//! Risk management
//!
//! Sizes positions with a bounded Kelly fraction and a volatility factor,
//! derives percentage stops from the regime's risk profile, and gates every
//! decision against the daily limits and the drawdown pause. A new position
//! is also refused when its recent returns move too closely with a symbol
//! already held.
//!
//! Position sizing formula:
//! ```text
//! kelly      = clamp((b*p - q) / b, 0, 0.25)      b = avg_win / |avg_loss|
//!            = 0.5                                 when avg_loss == 0
//! vol_factor = clamp(1 / (1 + volatility), 0.5, 1.5)
//! fraction   = profile.position_size * kelly * vol_factor * min(confidence, 1)
//! quantity   = clamp(equity * fraction / price, min_quantity, equity * max_position_size / price)
//! ```
//!
//! Degenerate arithmetic never raises. Each case resolves to one of the
//! fallback constants below, and all sizing is currency-agnostic as long as
//! equity and prices share a denomination.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::RiskRejection;
use crate::ledger::{PortfolioLedger, TradeStats};
use crate::regime::RiskProfile;
use crate::{Decision, ExitReason, MarketSnapshot, Position, PositionSide, Symbol};

/// Kelly fraction used when there are no recorded losses
pub const NO_LOSS_KELLY_FRACTION: f64 = 0.5;
/// Upper bound of the computed Kelly fraction
pub const MAX_KELLY_FRACTION: f64 = 0.25;
/// Volatility assumed when the measured value is unusable
pub const DEFAULT_VOLATILITY: f64 = 0.02;
pub const MIN_VOLATILITY_FACTOR: f64 = 0.5;
pub const MAX_VOLATILITY_FACTOR: f64 = 1.5;

/// Configuration for RiskManager using builder pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskManagerConfig {
    /// Profile used when the regime is unknown or adaptation is off
    pub default_profile: RiskProfile,
    pub kelly_enabled: bool,
    pub volatility_adjustment: bool,
    pub default_volatility: f64,
    /// Smallest order quantity
    pub min_quantity: f64,
    /// Largest position as a fraction of equity
    pub max_position_size: f64,
    pub max_daily_trades: u32,
    /// Daily loss limit in percent of session-start equity
    pub max_daily_loss: f64,
    pub max_drawdown: f64,
    /// New risk pauses once drawdown exceeds this share of `max_drawdown`
    pub drawdown_pause_ratio: f64,
    pub min_confidence: f64,
    pub max_concurrent_positions: usize,
    /// Recent return volatility above which no new positions are opened
    pub volatility_pause: f64,
    /// Absolute return correlation with a held symbol above which a new
    /// position is refused; 1.0 or more disables the check
    pub correlation_limit: f64,
    /// Bars of aligned history used for the correlation
    pub correlation_window: usize,
}

impl Default for RiskManagerConfig {
    fn default() -> Self {
        Self {
            default_profile: RiskProfile::new(0.02, 2.0, 4.0),
            kelly_enabled: true,
            volatility_adjustment: true,
            default_volatility: DEFAULT_VOLATILITY,
            min_quantity: 0.001,
            max_position_size: 0.10,
            max_daily_trades: 15,
            max_daily_loss: 3.0,
            max_drawdown: 0.15,
            drawdown_pause_ratio: 0.8,
            min_confidence: 0.6,
            max_concurrent_positions: 3,
            volatility_pause: 0.05,
            correlation_limit: 0.7,
            correlation_window: 30,
        }
    }
}

impl RiskManagerConfig {
    /// Set the fallback risk profile
    pub fn with_default_profile(mut self, profile: RiskProfile) -> Self {
        self.default_profile = profile;
        self
    }

    /// Enable or disable the Kelly and volatility factors
    pub fn with_sizing_factors(mut self, kelly: bool, volatility: bool) -> Self {
        self.kelly_enabled = kelly;
        self.volatility_adjustment = volatility;
        self
    }

    /// Set quantity bounds: minimum order size and max fraction of equity
    pub fn with_quantity_bounds(mut self, min_quantity: f64, max_position_size: f64) -> Self {
        self.min_quantity = min_quantity;
        self.max_position_size = max_position_size;
        self
    }

    /// Set daily trade count and daily loss (percent) limits
    pub fn with_daily_limits(mut self, max_trades: u32, max_loss_pct: f64) -> Self {
        self.max_daily_trades = max_trades;
        self.max_daily_loss = max_loss_pct;
        self
    }

    /// Set maximum drawdown and the share of it at which trading pauses
    pub fn with_drawdown_pause(mut self, max_drawdown: f64, pause_ratio: f64) -> Self {
        self.max_drawdown = max_drawdown;
        self.drawdown_pause_ratio = pause_ratio;
        self
    }

    /// Set minimum decision confidence
    pub fn with_min_confidence(mut self, min: f64) -> Self {
        self.min_confidence = min;
        self
    }

    /// Set maximum concurrent positions
    pub fn with_max_positions(mut self, max: usize) -> Self {
        self.max_concurrent_positions = max;
        self
    }

    /// Set the volatility above which new positions are paused
    pub fn with_volatility_pause(mut self, threshold: f64) -> Self {
        self.volatility_pause = threshold;
        self
    }

    /// Set the correlation limit and the window it is measured over
    pub fn with_correlation_limit(mut self, limit: f64, window: usize) -> Self {
        self.correlation_limit = limit;
        self.correlation_window = window;
        self
    }

    /// Build the RiskManager
    pub fn build(self) -> RiskManager {
        RiskManager::from_config(self)
    }
}

/// Stop-loss and take-profit prices for a position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stops {
    pub stop_loss: f64,
    pub take_profit: f64,
}

/// Exit condition hit by the current price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

impl ExitTrigger {
    pub fn reason(self) -> ExitReason {
        match self {
            ExitTrigger::StopLoss => ExitReason::StopLoss,
            ExitTrigger::TakeProfit => ExitReason::TakeProfit,
        }
    }
}

/// Stateless sizing and gating; all running state lives in the ledger
#[derive(Debug, Clone)]
pub struct RiskManager {
    config: RiskManagerConfig,
}

impl RiskManager {
    pub fn from_config(config: RiskManagerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskManagerConfig {
        &self.config
    }

    pub fn default_profile(&self) -> RiskProfile {
        self.config.default_profile
    }

    /// Bounded Kelly fraction from closed-trade statistics
    pub fn kelly_fraction(stats: &TradeStats) -> f64 {
        if stats.avg_loss == 0.0 {
            return NO_LOSS_KELLY_FRACTION;
        }

        let b = stats.avg_win / stats.avg_loss.abs();
        if !b.is_finite() || b == 0.0 {
            return 0.0;
        }
        let p = if stats.win_rate.is_finite() {
            stats.win_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let q = 1.0 - p;

        let f = (b * p - q) / b;
        if f.is_finite() {
            f.clamp(0.0, MAX_KELLY_FRACTION)
        } else {
            0.0
        }
    }

    /// 1 / (1 + volatility), bounded to [0.5, 1.5]
    pub fn volatility_factor(&self, volatility: Option<f64>) -> f64 {
        let vol = match volatility {
            Some(v) if v.is_finite() && v >= 0.0 => v,
            _ => self.config.default_volatility,
        };
        (1.0 / (1.0 + vol)).clamp(MIN_VOLATILITY_FACTOR, MAX_VOLATILITY_FACTOR)
    }

    /// Order quantity for a new position or an add, 0 when any input is
    /// degenerate.
    pub fn size_position(
        &self,
        confidence: f64,
        price: f64,
        stats: &TradeStats,
        profile: &RiskProfile,
        equity: f64,
        recent_volatility: Option<f64>,
    ) -> f64 {
        if !price.is_finite() || price <= 0.0 || !equity.is_finite() || equity <= 0.0 {
            return 0.0;
        }
        if !confidence.is_finite() || !profile.position_size.is_finite() {
            return 0.0;
        }

        let kelly = if self.config.kelly_enabled {
            Self::kelly_fraction(stats)
        } else {
            1.0
        };
        let vol_factor = if self.config.volatility_adjustment {
            self.volatility_factor(recent_volatility)
        } else {
            1.0
        };

        let fraction = profile.position_size * kelly * vol_factor * confidence.clamp(0.0, 1.0);
        let max_quantity = equity * self.config.max_position_size / price;
        let quantity = (equity * fraction / price).max(self.config.min_quantity);
        let quantity = quantity.min(max_quantity);

        debug!(
            kelly,
            vol_factor, fraction, quantity, max_quantity, "Position sizing"
        );

        if quantity.is_finite() && quantity > 0.0 {
            quantity
        } else {
            0.0
        }
    }

    /// Percentage stops around `entry` for the given side
    pub fn compute_stops(entry: f64, side: PositionSide, profile: &RiskProfile) -> Stops {
        let sl = profile.stop_loss_pct / 100.0;
        let tp = profile.take_profit_pct / 100.0;
        match side {
            PositionSide::Long => Stops {
                stop_loss: entry * (1.0 - sl),
                take_profit: entry * (1.0 + tp),
            },
            PositionSide::Short => Stops {
                stop_loss: entry * (1.0 + sl),
                take_profit: entry * (1.0 - tp),
            },
        }
    }

    /// Account-level limits that apply to any trade a decision would cause.
    /// Opening trades are additionally capped by the position count.
    pub fn check_trade_gate(
        &self,
        decision: &Decision,
        ledger: &PortfolioLedger,
    ) -> Result<(), RiskRejection> {
        let count = ledger.daily_trade_count();
        if count >= self.config.max_daily_trades {
            return Err(RiskRejection::DailyTradeLimit {
                count,
                max: self.config.max_daily_trades,
            });
        }

        let pnl_pct = ledger.daily_pnl_pct();
        if pnl_pct <= -self.config.max_daily_loss {
            return Err(RiskRejection::DailyLossLimit {
                pnl_pct,
                limit_pct: self.config.max_daily_loss,
            });
        }

        let drawdown = ledger.current_drawdown();
        let threshold = self.config.drawdown_pause_ratio * self.config.max_drawdown;
        if drawdown > threshold {
            return Err(RiskRejection::DrawdownPause {
                drawdown,
                threshold,
            });
        }

        if decision.confidence < self.config.min_confidence {
            return Err(RiskRejection::LowConfidence {
                confidence: decision.confidence,
                min: self.config.min_confidence,
            });
        }

        if ledger.position(&decision.symbol).is_none() {
            let open = ledger.open_position_count();
            if open >= self.config.max_concurrent_positions {
                return Err(RiskRejection::MaxPositions {
                    open,
                    max: self.config.max_concurrent_positions,
                });
            }
        }

        Ok(())
    }

    /// Pause for position-opening trades in very volatile markets
    pub fn check_volatility(&self, recent_volatility: Option<f64>) -> Result<(), RiskRejection> {
        match recent_volatility {
            Some(volatility) if volatility > self.config.volatility_pause => {
                Err(RiskRejection::VolatilityPause {
                    volatility,
                    threshold: self.config.volatility_pause,
                })
            }
            _ => Ok(()),
        }
    }

    pub fn correlation_enabled(&self) -> bool {
        self.config.correlation_limit < 1.0 && self.config.correlation_window >= 3
    }

    /// Refuse a new position on `candidate` when its return correlation with
    /// any held symbol exceeds the limit in absolute value
    pub fn check_correlation(
        &self,
        candidate: &Symbol,
        correlations: &[(Symbol, f64)],
    ) -> Result<(), RiskRejection> {
        if !self.correlation_enabled() {
            return Ok(());
        }
        let worst = correlations
            .iter()
            .filter(|(held, c)| held != candidate && c.is_finite())
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()));

        match worst {
            Some((held, correlation)) if correlation.abs() > self.config.correlation_limit => {
                warn!(
                    symbol = %candidate,
                    held = %held,
                    correlation = *correlation,
                    "High correlation with held position"
                );
                Err(RiskRejection::CorrelationLimit {
                    symbol: candidate.clone(),
                    held: held.clone(),
                    correlation: *correlation,
                    limit: self.config.correlation_limit,
                })
            }
            _ => Ok(()),
        }
    }

    /// Stop-loss is checked before take-profit
    pub fn check_exit_triggers(position: &Position, price: f64) -> Option<ExitTrigger> {
        match position.side {
            PositionSide::Long => {
                if price <= position.stop_loss_price {
                    Some(ExitTrigger::StopLoss)
                } else if price >= position.take_profit_price {
                    Some(ExitTrigger::TakeProfit)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if price >= position.stop_loss_price {
                    Some(ExitTrigger::StopLoss)
                } else if price <= position.take_profit_price {
                    Some(ExitTrigger::TakeProfit)
                } else {
                    None
                }
            }
        }
    }
}

/// Return dispersion below this is rounding noise on a flat or constant-growth series
const MIN_RETURN_STD: f64 = 1e-12;

/// Closes of `a` and `b` at their common timestamps, limited to the last
/// `window` of them
pub fn aligned_closes(
    a: &[MarketSnapshot],
    b: &[MarketSnapshot],
    window: usize,
) -> (Vec<f64>, Vec<f64>) {
    let b_by_time: BTreeMap<_, f64> = b.iter().map(|s| (s.timestamp, s.close)).collect();
    let pairs: Vec<(f64, f64)> = a
        .iter()
        .filter_map(|s| b_by_time.get(&s.timestamp).map(|&close| (s.close, close)))
        .collect();
    let start = pairs.len().saturating_sub(window);
    pairs[start..].iter().copied().unzip()
}

fn pct_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .map(|w| if w[0] > 0.0 { (w[1] - w[0]) / w[0] } else { 0.0 })
        .collect()
}

/// Pearson correlation of the percentage returns of two aligned close
/// series. Too few points, zero variance or a non-finite result give 0.
pub fn return_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n < 3 {
        return 0.0;
    }
    let ra = pct_returns(&a[a.len() - n..]);
    let rb = pct_returns(&b[b.len() - n..]);

    let (mean_a, mean_b) = (ra.iter().mean(), rb.iter().mean());
    let (std_a, std_b) = (
        ra.iter().population_std_dev(),
        rb.iter().population_std_dev(),
    );
    if !(std_a > MIN_RETURN_STD && std_b > MIN_RETURN_STD) {
        return 0.0;
    }

    let cov = ra
        .iter()
        .zip(&rb)
        .map(|(x, y)| (x - mean_a) * (y - mean_b))
        .sum::<f64>()
        / ra.len() as f64;
    let r = cov / (std_a * std_b);
    if r.is_finite() {
        r.clamp(-1.0, 1.0)
    } else {
        0.0
    }
}
