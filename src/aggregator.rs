//! Weighted vote aggregation
//!
//! Base weights are scaled by the regime's multipliers and renormalized over
//! the sources that actually voted. Each direction scores the sum of
//! confidence × weight of its votes; the unique maximum wins, anything else
//! is HOLD at 0.5. The regime confidence modifier is applied last.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::regime::{RegimeClassifier, RegimeLabel};
use crate::{Decision, Direction, SignalSource, SignalVote, Symbol, WeightedVote};

/// Confidence reported for HOLD on ties and empty vote sets
pub const NEUTRAL_CONFIDENCE: f64 = 0.5;

/// Tolerance when comparing direction scores for a tie
const SCORE_EPSILON: f64 = 1e-12;

/// One value per signal source, used for base weights and regime multipliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceWeights {
    pub technical: f64,
    pub ml: f64,
    pub trend: f64,
    pub liquidity: f64,
}

impl SourceWeights {
    pub const fn new(technical: f64, ml: f64, trend: f64, liquidity: f64) -> Self {
        Self {
            technical,
            ml,
            trend,
            liquidity,
        }
    }

    pub const fn uniform(value: f64) -> Self {
        Self::new(value, value, value, value)
    }

    pub fn get(&self, source: SignalSource) -> f64 {
        match source {
            SignalSource::Technical => self.technical,
            SignalSource::Ml => self.ml,
            SignalSource::Trend => self.trend,
            SignalSource::Liquidity => self.liquidity,
        }
    }

    /// Element-wise product
    pub fn scaled(&self, multipliers: &SourceWeights) -> SourceWeights {
        SourceWeights::new(
            self.technical * multipliers.technical,
            self.ml * multipliers.ml,
            self.trend * multipliers.trend,
            self.liquidity * multipliers.liquidity,
        )
    }
}

/// Combines votes into one [`Decision`] per symbol and tick
#[derive(Debug, Clone)]
pub struct SignalAggregator {
    base_weights: SourceWeights,
}

impl SignalAggregator {
    pub fn new(base_weights: SourceWeights) -> Self {
        Self { base_weights }
    }

    pub fn base_weights(&self) -> SourceWeights {
        self.base_weights
    }

    /// Regime-adjusted weights of `fired` sources, summing to 1.
    ///
    /// Negative or non-finite weights count as zero; when nothing positive is
    /// left every fired source gets an equal share.
    pub fn normalized_weights(
        &self,
        multipliers: &SourceWeights,
        fired: &[SignalSource],
    ) -> BTreeMap<SignalSource, f64> {
        let adjusted = self.base_weights.scaled(multipliers);
        let raw: BTreeMap<SignalSource, f64> = fired
            .iter()
            .map(|&source| {
                let w = adjusted.get(source);
                (source, if w.is_finite() && w > 0.0 { w } else { 0.0 })
            })
            .collect();

        let total: f64 = raw.values().sum();
        if raw.is_empty() {
            return raw;
        }
        if total <= 0.0 {
            let equal = 1.0 / raw.len() as f64;
            return raw.into_keys().map(|source| (source, equal)).collect();
        }
        raw.into_iter().map(|(source, w)| (source, w / total)).collect()
    }

    /// Aggregate `votes` for `symbol` at `timestamp` under `regime`.
    pub fn aggregate(
        &self,
        symbol: &Symbol,
        votes: Vec<SignalVote>,
        regime: RegimeLabel,
        classifier: &RegimeClassifier,
        timestamp: DateTime<Utc>,
    ) -> Decision {
        let multipliers = classifier.weight_multipliers(regime);
        let fired: Vec<SignalSource> = votes.iter().map(|v| v.source).unique().collect();
        let weights = self.normalized_weights(&multipliers, &fired);

        let breakdown: Vec<WeightedVote> = votes
            .into_iter()
            .map(|vote| {
                let weight = weights.get(&vote.source).copied().unwrap_or(0.0);
                WeightedVote { vote, weight }
            })
            .collect();

        // Ties and empty vote sets stay at the neutral confidence
        let (direction, confidence) = match Self::score(&breakdown) {
            Some((direction, score)) => (
                direction,
                (score * classifier.confidence_modifier(regime)).clamp(0.0, 1.0),
            ),
            None => (Direction::Hold, NEUTRAL_CONFIDENCE),
        };

        let regime_note = format!("Regime: {}", regime);
        let rationale = breakdown
            .iter()
            .map(|wv| wv.vote.rationale.as_str())
            .chain(std::iter::once(regime_note.as_str()))
            .join(" | ");

        debug!(
            symbol = %symbol,
            %direction,
            confidence,
            regime = %regime,
            votes = breakdown.len(),
            "Aggregated decision"
        );

        Decision {
            symbol: symbol.clone(),
            direction,
            confidence,
            regime,
            breakdown,
            rationale,
            timestamp,
        }
    }

    /// Winning direction and its score before regime adjustment; `None` when
    /// nothing voted or the top score is shared
    pub fn score(breakdown: &[WeightedVote]) -> Option<(Direction, f64)> {
        if breakdown.is_empty() {
            return None;
        }

        let scores: Vec<(Direction, f64)> = Direction::ALL
            .iter()
            .map(|&d| {
                let score = breakdown
                    .iter()
                    .filter(|wv| wv.vote.direction == d)
                    .map(|wv| wv.vote.confidence * wv.weight)
                    .sum::<f64>();
                (d, score)
            })
            .collect();

        let &(best, top) = scores.iter().max_by_key(|(_, s)| OrderedFloat(*s))?;
        let leaders = scores
            .iter()
            .filter(|(_, s)| (top - s).abs() <= SCORE_EPSILON)
            .count();

        (leaders == 1 && top.is_finite()).then_some((best, top))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regime::{RegimeConfig, TrendBucket, VolatilityBucket};
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn vote(source: SignalSource, direction: Direction, confidence: f64) -> SignalVote {
        SignalVote::new(source, direction, confidence, format!("{}", source))
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn aggregator() -> SignalAggregator {
        SignalAggregator::new(SourceWeights::new(0.30, 0.35, 0.20, 0.15))
    }

    #[test]
    fn test_weights_renormalize_over_fired_sources() {
        let agg = aggregator();
        let bullish = RegimeClassifier::new(RegimeConfig::default())
            .weight_multipliers(RegimeLabel::new(TrendBucket::Bullish, VolatilityBucket::Medium));

        let weights = agg.normalized_weights(
            &bullish,
            &[SignalSource::Technical, SignalSource::Trend],
        );
        assert_eq!(weights.len(), 2);
        assert_relative_eq!(weights.values().sum::<f64>(), 1.0, epsilon = 1e-9);
        // 0.27 vs 0.24
        assert_relative_eq!(weights[&SignalSource::Technical], 0.27 / 0.51, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_weights_fall_back_to_equal() {
        let agg = SignalAggregator::new(SourceWeights::uniform(0.0));
        let weights = agg.normalized_weights(
            &SourceWeights::uniform(1.0),
            &[SignalSource::Ml, SignalSource::Liquidity],
        );
        assert_eq!(weights[&SignalSource::Ml], 0.5);
        assert_eq!(weights[&SignalSource::Liquidity], 0.5);
    }

    #[test]
    fn test_weighted_buy_scenario() {
        let breakdown = vec![
            WeightedVote {
                vote: vote(SignalSource::Technical, Direction::Buy, 0.8),
                weight: 0.3,
            },
            WeightedVote {
                vote: vote(SignalSource::Trend, Direction::Buy, 0.7),
                weight: 0.3,
            },
            WeightedVote {
                vote: vote(SignalSource::Ml, Direction::Buy, 0.9),
                weight: 0.4,
            },
        ];
        let (direction, confidence) = SignalAggregator::score(&breakdown).unwrap();
        assert_eq!(direction, Direction::Buy);
        assert_relative_eq!(confidence, 0.81, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_votes_hold() {
        let classifier = RegimeClassifier::new(RegimeConfig::default());
        let decision = aggregator().aggregate(
            &Symbol::new("BTCUSDT"),
            vec![],
            RegimeLabel::Unknown,
            &classifier,
            ts(),
        );
        assert_eq!(decision.direction, Direction::Hold);
        assert_eq!(decision.confidence, 0.5);
        assert_eq!(decision.rationale, "Regime: UNKNOWN");

        let low_vol = RegimeLabel::new(TrendBucket::Bullish, VolatilityBucket::Low);
        let decision =
            aggregator().aggregate(&Symbol::new("BTCUSDT"), vec![], low_vol, &classifier, ts());
        assert_eq!(decision.confidence, 0.5);
    }

    #[test]
    fn test_tie_is_hold() {
        let agg = SignalAggregator::new(SourceWeights::uniform(1.0));
        let classifier = RegimeClassifier::new(RegimeConfig::default());
        let decision = agg.aggregate(
            &Symbol::new("BTCUSDT"),
            vec![
                vote(SignalSource::Technical, Direction::Buy, 0.6),
                vote(SignalSource::Trend, Direction::Sell, 0.6),
            ],
            RegimeLabel::Unknown,
            &classifier,
            ts(),
        );
        assert_eq!(decision.direction, Direction::Hold);
        assert_eq!(decision.confidence, 0.5);
    }

    #[test]
    fn test_confidence_modifier_is_clamped() {
        let classifier = RegimeClassifier::new(RegimeConfig::default());
        let low_vol = RegimeLabel::new(TrendBucket::Sideways, VolatilityBucket::Low);
        let decision = aggregator().aggregate(
            &Symbol::new("BTCUSDT"),
            vec![vote(SignalSource::Ml, Direction::Sell, 0.95)],
            low_vol,
            &classifier,
            ts(),
        );
        assert_eq!(decision.direction, Direction::Sell);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.breakdown[0].weight, 1.0);
        assert!(decision.rationale.ends_with("Regime: SIDEWAYS_LOW"));
    }
}
