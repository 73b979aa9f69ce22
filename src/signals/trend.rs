//! Short-horizon price trend analyzer

use super::{Analyzer, SignalConfig};
use crate::error::DataUnavailable;
use crate::{Direction, MarketSnapshot, SignalSource, SignalVote};

/// Minimum closes in the window before a vote is produced
const MIN_CLOSES: usize = 3;
const MAX_CONFIDENCE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    window: usize,
    threshold: f64,
}

impl TrendAnalyzer {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            window: config.trend_window.max(MIN_CLOSES),
            threshold: config.trend_threshold,
        }
    }
}

impl Analyzer for TrendAnalyzer {
    fn source(&self) -> SignalSource {
        SignalSource::Trend
    }

    fn evaluate(&self, history: &[MarketSnapshot]) -> Result<SignalVote, DataUnavailable> {
        if history.len() < MIN_CLOSES {
            return Err(DataUnavailable::InsufficientHistory {
                required: MIN_CLOSES,
                available: history.len(),
            });
        }

        let recent = &history[history.len().saturating_sub(self.window)..];
        let first = recent[0].close;
        let last = recent[recent.len() - 1].close;
        if !(first > 0.0) || !last.is_finite() {
            return Err(DataUnavailable::MissingInput(
                "non-positive reference close".to_string(),
            ));
        }

        let change = (last - first) / first;
        let strength = (0.5 + change.abs() * 10.0).min(MAX_CONFIDENCE);

        let (direction, confidence) = if change > self.threshold {
            (Direction::Buy, strength)
        } else if change < -self.threshold {
            (Direction::Sell, strength)
        } else {
            (Direction::Hold, 0.5)
        };

        Ok(SignalVote::new(
            SignalSource::Trend,
            direction,
            confidence,
            format!("Trend: {:+.2}% over {} bars", change * 100.0, recent.len()),
        ))
    }
}
