//! Signal sources
//!
//! Four independent analyzers each map a symbol's snapshot history (oldest
//! first, ending at the current tick) to at most one [`SignalVote`]:
//!
//! | Analyzer | Input | Votes |
//! |---|---|---|
//! | [`TechnicalAnalyzer`] | rsi, macd, bollinger, SMA stack | majority of sub-rules |
//! | [`TrendAnalyzer`] | last 6 closes | +/-2% change |
//! | [`LiquidityAnalyzer`] | last 24 bars | volume and range |
//! | [`MlAnalyzer`] | [`FeatureVector`] | [`DirectionalModel`] output |
//!
//! An analyzer that cannot run returns [`DataUnavailable`] and contributes
//! nothing to the aggregate.

pub mod liquidity;
pub mod ml;
pub mod technical;
pub mod trend;

pub use liquidity::LiquidityAnalyzer;
pub use ml::{DirectionalModel, MlAnalyzer, ModelOutput, NoModel, PrecomputedProbabilityModel};
pub use technical::TechnicalAnalyzer;
pub use trend::TrendAnalyzer;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::aggregator::SourceWeights;
use crate::error::DataUnavailable;
use crate::{MarketSnapshot, SignalSource, SignalVote};

/// A signal source evaluated once per tick
pub trait Analyzer: Send + Sync {
    fn source(&self) -> SignalSource;

    /// Evaluate the latest bar of `history`.
    fn evaluate(&self, history: &[MarketSnapshot]) -> Result<SignalVote, DataUnavailable>;
}

/// Analyzer thresholds and base weights
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Weights before regime adjustment and renormalization
    pub base_weights: SourceWeights,

    pub technical_enabled: bool,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub bb_lower: f64,
    pub bb_upper: f64,

    pub trend_enabled: bool,
    pub trend_window: usize,
    /// Fractional change over the window that counts as a trend
    pub trend_threshold: f64,

    pub liquidity_enabled: bool,
    pub liquidity_window: usize,
    pub min_volume: f64,
    pub min_quote_volume: f64,
    pub tight_range: f64,
    pub wide_range: f64,

    pub ml_enabled: bool,
    /// Dead zone around 0.5 inside which the model votes HOLD
    pub ml_probability_band: f64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            base_weights: SourceWeights::new(0.30, 0.35, 0.20, 0.15),
            technical_enabled: true,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            bb_lower: 0.2,
            bb_upper: 0.8,
            trend_enabled: true,
            trend_window: 6,
            trend_threshold: 0.02,
            liquidity_enabled: true,
            liquidity_window: 24,
            min_volume: 1_000.0,
            min_quote_volume: 1_000_000.0,
            tight_range: 0.05,
            wide_range: 0.10,
            ml_enabled: true,
            ml_probability_band: 0.05,
        }
    }
}

/// Named numeric features handed to a [`DirectionalModel`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeatureVector {
    values: BTreeMap<String, f64>,
}

impl FeatureVector {
    /// Features of the latest snapshot: OHLCV, one-bar return, every finite
    /// indicator and every pattern flag as 0/1 under `pattern_<name>`.
    pub fn from_history(history: &[MarketSnapshot]) -> Option<Self> {
        let latest = history.last()?;
        let mut values = BTreeMap::new();
        values.insert("open".to_string(), latest.open);
        values.insert("high".to_string(), latest.high);
        values.insert("low".to_string(), latest.low);
        values.insert("close".to_string(), latest.close);
        values.insert("volume".to_string(), latest.volume);

        if let [.., prev, _] = history {
            if prev.close > 0.0 {
                values.insert(
                    "return_1".to_string(),
                    (latest.close - prev.close) / prev.close,
                );
            }
        }

        for (name, value) in &latest.indicators {
            if value.is_finite() {
                values.insert(name.clone(), *value);
            }
        }
        for (name, present) in &latest.patterns {
            values.insert(format!("pattern_{}", name), if *present { 1.0 } else { 0.0 });
        }

        Some(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// The enabled analyzers, evaluated in a fixed order
pub struct SignalSuite {
    analyzers: Vec<Box<dyn Analyzer>>,
}

impl SignalSuite {
    pub fn new(analyzers: Vec<Box<dyn Analyzer>>) -> Self {
        Self { analyzers }
    }

    /// Build the enabled analyzers from configuration. The ML analyzer wraps
    /// `model`.
    pub fn from_config(config: &SignalConfig, model: Arc<dyn DirectionalModel>) -> Self {
        let mut analyzers: Vec<Box<dyn Analyzer>> = Vec::new();
        if config.technical_enabled {
            analyzers.push(Box::new(TechnicalAnalyzer::new(config)));
        }
        if config.ml_enabled {
            analyzers.push(Box::new(MlAnalyzer::new(model)));
        }
        if config.trend_enabled {
            analyzers.push(Box::new(TrendAnalyzer::new(config)));
        }
        if config.liquidity_enabled {
            analyzers.push(Box::new(LiquidityAnalyzer::new(config)));
        }
        Self { analyzers }
    }

    pub fn len(&self) -> usize {
        self.analyzers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.analyzers.is_empty()
    }

    /// Votes from every analyzer that could run
    pub fn collect_votes(&self, history: &[MarketSnapshot]) -> Vec<SignalVote> {
        self.analyzers
            .iter()
            .filter_map(|analyzer| match analyzer.evaluate(history) {
                Ok(vote) => Some(vote),
                Err(reason) => {
                    debug!(source = %analyzer.source(), %reason, "No vote");
                    None
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for SignalSuite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.analyzers.iter().map(|a| a.source()))
            .finish()
    }
}
