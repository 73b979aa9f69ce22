//! Model-backed analyzer
//!
//! The model itself is a collaborator behind [`DirectionalModel`]. Having no
//! model is a valid configuration: the analyzer simply never votes.

use std::sync::Arc;

use super::{Analyzer, FeatureVector};
use crate::error::DataUnavailable;
use crate::{Direction, MarketSnapshot, SignalSource, SignalVote};

/// Result of a model query
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Prediction { direction: Direction, probability: f64 },
    Unavailable(String),
}

/// Directional classifier consumed by [`MlAnalyzer`]
pub trait DirectionalModel: Send + Sync + std::fmt::Debug {
    fn direction_probability(&self, features: &FeatureVector) -> ModelOutput;
}

/// Placeholder used when no model is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModel;

impl DirectionalModel for NoModel {
    fn direction_probability(&self, _features: &FeatureVector) -> ModelOutput {
        ModelOutput::Unavailable("no model configured".to_string())
    }
}

/// Reads an up-move probability produced offline and stored in the
/// `ml_probability` indicator column.
#[derive(Debug, Clone)]
pub struct PrecomputedProbabilityModel {
    feature: String,
    band: f64,
}

impl PrecomputedProbabilityModel {
    pub const DEFAULT_FEATURE: &'static str = "ml_probability";

    pub fn new(band: f64) -> Self {
        Self {
            feature: Self::DEFAULT_FEATURE.to_string(),
            band: band.abs(),
        }
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = feature.into();
        self
    }
}

impl DirectionalModel for PrecomputedProbabilityModel {
    fn direction_probability(&self, features: &FeatureVector) -> ModelOutput {
        let p = match features.get(&self.feature) {
            Some(p) if (0.0..=1.0).contains(&p) => p,
            Some(p) => return ModelOutput::Unavailable(format!("probability out of range: {}", p)),
            None => return ModelOutput::Unavailable(format!("missing feature {}", self.feature)),
        };

        if p >= 0.5 + self.band {
            ModelOutput::Prediction {
                direction: Direction::Buy,
                probability: p,
            }
        } else if p <= 0.5 - self.band {
            ModelOutput::Prediction {
                direction: Direction::Sell,
                probability: 1.0 - p,
            }
        } else {
            ModelOutput::Prediction {
                direction: Direction::Hold,
                probability: 0.5,
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MlAnalyzer {
    model: Arc<dyn DirectionalModel>,
}

impl MlAnalyzer {
    pub fn new(model: Arc<dyn DirectionalModel>) -> Self {
        Self { model }
    }
}

impl Analyzer for MlAnalyzer {
    fn source(&self) -> SignalSource {
        SignalSource::Ml
    }

    fn evaluate(&self, history: &[MarketSnapshot]) -> Result<SignalVote, DataUnavailable> {
        let features = FeatureVector::from_history(history).ok_or(
            DataUnavailable::InsufficientHistory {
                required: 1,
                available: 0,
            },
        )?;

        match self.model.direction_probability(&features) {
            ModelOutput::Prediction {
                direction,
                probability,
            } => Ok(SignalVote::new(
                SignalSource::Ml,
                direction,
                probability,
                format!("ML: {} p={:.3}", direction, probability),
            )),
            ModelOutput::Unavailable(reason) => Err(DataUnavailable::ModelUnavailable(reason)),
        }
    }
}
