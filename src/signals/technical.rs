//! Indicator-based analyzer
//!
//! Sub-rules over the latest snapshot's indicators. Each rule fires only when
//! its inputs are present; the vote is the most frequent direction among the
//! rules that fired, with the mean confidence of that direction.

use itertools::Itertools;

use super::{Analyzer, SignalConfig};
use crate::error::DataUnavailable;
use crate::{Direction, MarketSnapshot, SignalSource, SignalVote};

const RSI_CONFIDENCE: f64 = 0.8;
const MACD_CONFIDENCE: f64 = 0.7;
const BOLLINGER_CONFIDENCE: f64 = 0.6;
const SMA_CONFIDENCE: f64 = 0.6;
const NEUTRAL_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct TechnicalAnalyzer {
    rsi_oversold: f64,
    rsi_overbought: f64,
    bb_lower: f64,
    bb_upper: f64,
}

struct SubVote {
    direction: Direction,
    confidence: f64,
    reason: String,
}

impl TechnicalAnalyzer {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            rsi_oversold: config.rsi_oversold,
            rsi_overbought: config.rsi_overbought,
            bb_lower: config.bb_lower,
            bb_upper: config.bb_upper,
        }
    }

    fn rsi_rule(&self, snap: &MarketSnapshot) -> Option<SubVote> {
        let rsi = snap.indicator("rsi")?;
        let (direction, confidence) = if rsi < self.rsi_oversold {
            (Direction::Buy, RSI_CONFIDENCE)
        } else if rsi > self.rsi_overbought {
            (Direction::Sell, RSI_CONFIDENCE)
        } else {
            (Direction::Hold, NEUTRAL_CONFIDENCE)
        };
        Some(SubVote {
            direction,
            confidence,
            reason: format!("RSI {:.1}", rsi),
        })
    }

    fn macd_rule(&self, snap: &MarketSnapshot) -> Option<SubVote> {
        let macd = snap.indicator("macd")?;
        let signal = snap.indicator("macd_signal")?;
        let direction = if macd > signal {
            Direction::Buy
        } else {
            Direction::Sell
        };
        Some(SubVote {
            direction,
            confidence: MACD_CONFIDENCE,
            reason: format!("MACD {:.4} vs signal {:.4}", macd, signal),
        })
    }

    fn bollinger_rule(&self, snap: &MarketSnapshot) -> Option<SubVote> {
        let position = snap.indicator("bb_position")?;
        let (direction, confidence) = if position < self.bb_lower {
            (Direction::Buy, BOLLINGER_CONFIDENCE)
        } else if position > self.bb_upper {
            (Direction::Sell, BOLLINGER_CONFIDENCE)
        } else {
            (Direction::Hold, NEUTRAL_CONFIDENCE)
        };
        Some(SubVote {
            direction,
            confidence,
            reason: format!("BB position {:.2}", position),
        })
    }

    /// Close above/below the available moving averages, majority wins
    fn sma_rule(&self, snap: &MarketSnapshot) -> Option<SubVote> {
        let smas: Vec<f64> = ["sma_20", "sma_50", "sma_200"]
            .iter()
            .filter_map(|name| snap.indicator(name))
            .collect();
        if smas.is_empty() {
            return None;
        }
        let above = smas.iter().filter(|&&sma| snap.close > sma).count();
        let below = smas.iter().filter(|&&sma| snap.close < sma).count();
        let (direction, confidence) = match above.cmp(&below) {
            std::cmp::Ordering::Greater => (Direction::Buy, SMA_CONFIDENCE),
            std::cmp::Ordering::Less => (Direction::Sell, SMA_CONFIDENCE),
            std::cmp::Ordering::Equal => (Direction::Hold, NEUTRAL_CONFIDENCE),
        };
        Some(SubVote {
            direction,
            confidence,
            reason: format!("price above {}/{} SMAs", above, smas.len()),
        })
    }
}

impl Analyzer for TechnicalAnalyzer {
    fn source(&self) -> SignalSource {
        SignalSource::Technical
    }

    fn evaluate(&self, history: &[MarketSnapshot]) -> Result<SignalVote, DataUnavailable> {
        let snap = history.last().ok_or(DataUnavailable::InsufficientHistory {
            required: 1,
            available: 0,
        })?;

        let votes: Vec<SubVote> = [
            self.rsi_rule(snap),
            self.macd_rule(snap),
            self.bollinger_rule(snap),
            self.sma_rule(snap),
        ]
        .into_iter()
        .flatten()
        .collect();

        if votes.is_empty() {
            return Err(DataUnavailable::MissingInput(
                "no technical indicators".to_string(),
            ));
        }

        // Max by count; first in BUY, SELL, HOLD order wins ties
        let (winner, count) = Direction::ALL
            .iter()
            .map(|&d| (d, votes.iter().filter(|v| v.direction == d).count()))
            .fold((Direction::Hold, 0), |best, candidate| {
                if candidate.1 > best.1 {
                    candidate
                } else {
                    best
                }
            });

        let confidence = votes
            .iter()
            .filter(|v| v.direction == winner)
            .map(|v| v.confidence)
            .sum::<f64>()
            / count as f64;

        let rationale = format!(
            "Technical: {}",
            votes.iter().map(|v| v.reason.as_str()).join(", ")
        );

        Ok(SignalVote::new(
            SignalSource::Technical,
            winner,
            confidence,
            rationale,
        ))
    }
}
