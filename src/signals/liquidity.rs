//! Liquidity and range-volatility analyzer
//!
//! Rewards tight ranges in liquid markets; otherwise stays neutral with a
//! confidence that reflects how tradable the market looks.

use super::{Analyzer, SignalConfig};
use crate::error::DataUnavailable;
use crate::{Direction, MarketSnapshot, SignalSource, SignalVote};

#[derive(Debug, Clone)]
pub struct LiquidityAnalyzer {
    window: usize,
    min_volume: f64,
    min_quote_volume: f64,
    tight_range: f64,
    wide_range: f64,
}

impl LiquidityAnalyzer {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            window: config.liquidity_window.max(1),
            min_volume: config.min_volume,
            min_quote_volume: config.min_quote_volume,
            tight_range: config.tight_range,
            wide_range: config.wide_range,
        }
    }
}

impl Analyzer for LiquidityAnalyzer {
    fn source(&self) -> SignalSource {
        SignalSource::Liquidity
    }

    fn evaluate(&self, history: &[MarketSnapshot]) -> Result<SignalVote, DataUnavailable> {
        let latest = history.last().ok_or(DataUnavailable::InsufficientHistory {
            required: 1,
            available: 0,
        })?;
        if !(latest.close > 0.0) {
            return Err(DataUnavailable::MissingInput(
                "non-positive latest close".to_string(),
            ));
        }

        let recent = &history[history.len().saturating_sub(self.window)..];
        let volume: f64 = recent.iter().map(|s| s.volume).sum();
        let quote_volume = latest
            .indicator("quote_volume")
            .unwrap_or_else(|| recent.iter().map(|s| s.volume * s.close).sum());

        let high = recent.iter().map(|s| s.high).fold(f64::NEG_INFINITY, f64::max);
        let low = recent.iter().map(|s| s.low).fold(f64::INFINITY, f64::min);
        let range = (high - low) / latest.close;

        let liquid = volume > self.min_volume && quote_volume > self.min_quote_volume;
        let (direction, confidence) = if liquid {
            if range < self.tight_range {
                (Direction::Buy, 0.7)
            } else if range > self.wide_range {
                (Direction::Hold, 0.6)
            } else {
                (Direction::Hold, 0.5)
            }
        } else {
            (Direction::Hold, 0.4)
        };

        Ok(SignalVote::new(
            SignalSource::Liquidity,
            direction,
            confidence,
            format!(
                "Liquidity: volume {:.0}, quote {:.0}, range {:.2}%",
                volume,
                quote_volume,
                range * 100.0
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::test_support::snapshots;

    fn analyzer() -> LiquidityAnalyzer {
        LiquidityAnalyzer::new(&SignalConfig::default())
    }

    #[test]
    fn test_tight_liquid_market_buys() {
        // 24 bars x 500 volume x 100 close = 1.2M quote volume, 1% range
        let vote = analyzer().evaluate(&snapshots(&[100.0; 30], 500.0)).unwrap();
        assert_eq!(vote.direction, Direction::Buy);
        assert_eq!(vote.confidence, 0.7);
    }

    #[test]
    fn test_illiquid_market_is_neutral() {
        let vote = analyzer().evaluate(&snapshots(&[100.0; 30], 10.0)).unwrap();
        assert_eq!(vote.direction, Direction::Hold);
        assert_eq!(vote.confidence, 0.4);
    }

    #[test]
    fn test_wide_range_holds() {
        let closes: Vec<f64> = (0..24).map(|i| 100.0 + i as f64).collect();
        let vote = analyzer().evaluate(&snapshots(&closes, 1_000.0)).unwrap();
        assert_eq!(vote.direction, Direction::Hold);
        assert_eq!(vote.confidence, 0.6);
    }

    #[test]
    fn test_quote_volume_indicator_overrides_estimate() {
        let mut history = snapshots(&[100.0; 30], 500.0);
        let last = history.pop().unwrap().with_indicator("quote_volume", 10.0);
        history.push(last);
        let vote = analyzer().evaluate(&history).unwrap();
        assert_eq!(vote.confidence, 0.4);
    }
}
