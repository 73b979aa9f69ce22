//! Error taxonomy for the decision pipeline
//!
//! Each category maps to one handling rule:
//! - [`DataUnavailable`]: the affected source or symbol is skipped for the tick
//! - [`RiskRejection`]: the decision is downgraded to HOLD and the reason logged
//! - [`ExecutionRejected`]: nothing is mutated, the attempt is logged
//! - [`EngineError::ConsecutiveFailure`]: the emergency stop is engaged
//!
//! Degenerate arithmetic is never an error; see the fallback constants in
//! [`crate::risk`].

use thiserror::Error;

use crate::{BarValidationError, Symbol};

/// Not enough (or unusable) data to produce a result
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DataUnavailable {
    #[error("insufficient history: need {required} bars, have {available}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("no snapshot for {symbol}")]
    NoSnapshot { symbol: Symbol },

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),
}

/// Reason the risk gate refused a decision
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RiskRejection {
    #[error("daily trade limit reached ({count}/{max})")]
    DailyTradeLimit { count: u32, max: u32 },

    #[error("daily loss limit reached ({pnl_pct:.2}% <= -{limit_pct:.2}%)")]
    DailyLossLimit { pnl_pct: f64, limit_pct: f64 },

    #[error("drawdown pause ({drawdown:.4} > {threshold:.4})")]
    DrawdownPause { drawdown: f64, threshold: f64 },

    #[error("confidence {confidence:.4} below minimum {min:.4}")]
    LowConfidence { confidence: f64, min: f64 },

    #[error("max concurrent positions reached ({open}/{max})")]
    MaxPositions { open: usize, max: usize },

    #[error("volatility pause ({volatility:.4} > {threshold:.4})")]
    VolatilityPause { volatility: f64, threshold: f64 },

    #[error("{symbol} correlates {correlation:.3} with held {held} (limit {limit:.2})")]
    CorrelationLimit {
        symbol: Symbol,
        held: Symbol,
        correlation: f64,
        limit: f64,
    },

    #[error("emergency stop engaged")]
    EmergencyStop,
}

/// Trade refused by the broker or the ledger
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionRejected {
    #[error("insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("position already open for {0}")]
    PositionExists(Symbol),

    #[error("no open position for {0}")]
    NoPosition(Symbol),

    #[error("side mismatch for {0}")]
    SideMismatch(Symbol),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("broker rejected order: {0}")]
    Broker(String),
}

/// Per-tick pipeline failure
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    DataUnavailable(#[from] DataUnavailable),

    #[error("risk limit exceeded: {0}")]
    RiskLimitExceeded(#[from] RiskRejection),

    #[error("execution rejected: {0}")]
    ExecutionRejected(#[from] ExecutionRejected),

    #[error("invalid market data: {0}")]
    InvalidBar(#[from] BarValidationError),

    #[error("{count} consecutive failures, emergency stop engaged")]
    ConsecutiveFailure { count: u32 },
}

impl EngineError {
    /// Errors that are part of normal operation and must not count toward
    /// the consecutive-failure limit
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::DataUnavailable(_)
                | EngineError::RiskLimitExceeded(_)
                | EngineError::ExecutionRejected(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages_carry_reason() {
        let err = RiskRejection::DailyTradeLimit { count: 10, max: 10 };
        assert_eq!(err.to_string(), "daily trade limit reached (10/10)");

        let engine: EngineError = err.into();
        assert!(engine.to_string().starts_with("risk limit exceeded"));
        assert!(engine.is_expected());
    }

    #[test]
    fn test_invalid_bar_is_unexpected() {
        let err: EngineError = BarValidationError::NegativeVolume(-1.0).into();
        assert!(!err.is_expected());
    }
}
