//! Market regime classification
//!
//! A regime is trend direction × volatility level, recomputed per symbol on
//! every tick from a rolling window of bars. The label selects a weight
//! adjustment for the aggregator, a confidence modifier and a risk profile
//! (position size, stop-loss and take-profit percentages).
//!
//! ```text
//! volatility      = stdev(pct returns over window)    LOW < 1.5% <= MEDIUM < 3% <= HIGH
//! trend_strength  = adx, or |SMA20 - SMA50| / SMA50 * 100
//! strong trend    = trend_strength > 25  ->  BULLISH if close > close[-20] else BEARISH
//! otherwise       = SIDEWAYS
//! ```

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::aggregator::SourceWeights;
use crate::MarketSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TrendBucket {
    Bullish,
    Bearish,
    Sideways,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VolatilityBucket {
    Low,
    Medium,
    High,
}

/// Nine trend × volatility labels plus `Unknown` when history is insufficient
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum RegimeLabel {
    Known {
        trend: TrendBucket,
        volatility: VolatilityBucket,
    },
    Unknown,
}

impl RegimeLabel {
    pub fn new(trend: TrendBucket, volatility: VolatilityBucket) -> Self {
        RegimeLabel::Known { trend, volatility }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, RegimeLabel::Known { .. })
    }

    pub fn trend(&self) -> Option<TrendBucket> {
        match self {
            RegimeLabel::Known { trend, .. } => Some(*trend),
            RegimeLabel::Unknown => None,
        }
    }

    pub fn volatility(&self) -> Option<VolatilityBucket> {
        match self {
            RegimeLabel::Known { volatility, .. } => Some(*volatility),
            RegimeLabel::Unknown => None,
        }
    }

    /// Configuration key, e.g. `BULLISH_LOW`
    pub fn key(&self) -> &'static str {
        use TrendBucket::*;
        use VolatilityBucket::*;
        match self {
            RegimeLabel::Known { trend, volatility } => match (trend, volatility) {
                (Bullish, Low) => "BULLISH_LOW",
                (Bullish, Medium) => "BULLISH_MEDIUM",
                (Bullish, High) => "BULLISH_HIGH",
                (Bearish, Low) => "BEARISH_LOW",
                (Bearish, Medium) => "BEARISH_MEDIUM",
                (Bearish, High) => "BEARISH_HIGH",
                (Sideways, Low) => "SIDEWAYS_LOW",
                (Sideways, Medium) => "SIDEWAYS_MEDIUM",
                (Sideways, High) => "SIDEWAYS_HIGH",
            },
            RegimeLabel::Unknown => "UNKNOWN",
        }
    }

    /// All nine known labels in a fixed order
    pub fn all_known() -> impl Iterator<Item = RegimeLabel> {
        [TrendBucket::Bullish, TrendBucket::Bearish, TrendBucket::Sideways]
            .into_iter()
            .flat_map(|trend| {
                [VolatilityBucket::Low, VolatilityBucket::Medium, VolatilityBucket::High]
                    .into_iter()
                    .map(move |volatility| RegimeLabel::new(trend, volatility))
            })
    }
}

impl fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for RegimeLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("UNKNOWN") {
            return Ok(RegimeLabel::Unknown);
        }
        RegimeLabel::all_known()
            .find(|label| label.key().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown regime label: {}", s))
    }
}

impl From<RegimeLabel> for String {
    fn from(label: RegimeLabel) -> Self {
        label.key().to_string()
    }
}

impl TryFrom<String> for RegimeLabel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Risk parameters selected by regime
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskProfile {
    /// Base fraction of equity committed per trade
    pub position_size: f64,
    /// Stop-loss distance in percent of entry
    pub stop_loss_pct: f64,
    /// Take-profit distance in percent of entry
    pub take_profit_pct: f64,
}

impl RiskProfile {
    pub fn new(position_size: f64, stop_loss_pct: f64, take_profit_pct: f64) -> Self {
        Self {
            position_size,
            stop_loss_pct,
            take_profit_pct,
        }
    }
}

/// Regime classifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// When false every tick is treated as `Unknown` for adaptation purposes
    pub adaptation: bool,
    pub min_history: usize,
    /// Bars used for the return volatility
    pub window: usize,
    pub low_volatility: f64,
    pub high_volatility: f64,
    pub trend_strength_threshold: f64,
    pub trend_lookback: usize,
    pub fast_ma: usize,
    pub slow_ma: usize,
    pub bullish_weights: SourceWeights,
    pub bearish_weights: SourceWeights,
    pub sideways_weights: SourceWeights,
    pub high_volatility_confidence: f64,
    pub low_volatility_confidence: f64,
    pub profiles: BTreeMap<String, RiskProfile>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        let profiles = [
            ("BULLISH_LOW", 0.03, 1.5, 6.0),
            ("BULLISH_MEDIUM", 0.025, 2.0, 5.0),
            ("BULLISH_HIGH", 0.02, 2.5, 4.0),
            ("BEARISH_LOW", 0.02, 2.0, 4.0),
            ("BEARISH_MEDIUM", 0.025, 2.5, 5.0),
            ("BEARISH_HIGH", 0.03, 3.0, 6.0),
            ("SIDEWAYS_LOW", 0.015, 1.5, 3.0),
            ("SIDEWAYS_MEDIUM", 0.02, 2.0, 4.0),
            ("SIDEWAYS_HIGH", 0.025, 2.5, 5.0),
        ]
        .into_iter()
        .map(|(key, size, sl, tp)| (key.to_string(), RiskProfile::new(size, sl, tp)))
        .collect();

        Self {
            adaptation: true,
            min_history: 20,
            window: 50,
            low_volatility: 0.015,
            high_volatility: 0.03,
            trend_strength_threshold: 25.0,
            trend_lookback: 20,
            fast_ma: 20,
            slow_ma: 50,
            bullish_weights: SourceWeights::new(0.9, 1.1, 1.2, 1.0),
            bearish_weights: SourceWeights::new(1.2, 0.9, 1.0, 1.1),
            sideways_weights: SourceWeights::new(1.3, 1.0, 0.8, 1.0),
            high_volatility_confidence: 0.8,
            low_volatility_confidence: 1.1,
            profiles,
        }
    }
}

/// Classification result with the measurements behind it
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegimeAssessment {
    pub label: RegimeLabel,
    /// Standard deviation of percentage returns over the window
    pub volatility: Option<f64>,
    pub trend_strength: Option<f64>,
}

impl RegimeAssessment {
    pub fn unknown() -> Self {
        Self {
            label: RegimeLabel::Unknown,
            volatility: None,
            trend_strength: None,
        }
    }
}

/// Maps recent history to a [`RegimeLabel`] and looks up its profiles
#[derive(Debug, Clone)]
pub struct RegimeClassifier {
    config: RegimeConfig,
}

impl RegimeClassifier {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RegimeConfig {
        &self.config
    }

    /// Classify the most recent bar of `history` (oldest first).
    pub fn classify(&self, history: &[MarketSnapshot]) -> RegimeAssessment {
        if self.config.trend_lookback == 0 {
            return RegimeAssessment::unknown();
        }
        let required = self
            .config
            .min_history
            .max(self.config.trend_lookback)
            .max(2);
        if history.len() < required {
            return RegimeAssessment::unknown();
        }

        let start = history.len().saturating_sub(self.config.window.max(2));
        let closes: Vec<f64> = history[start..].iter().map(|s| s.close).collect();
        let volatility = match return_volatility(&closes) {
            Some(v) => v,
            None => return RegimeAssessment::unknown(),
        };

        let trend_strength = match self.trend_strength(history) {
            Some(t) => t,
            None => {
                return RegimeAssessment {
                    label: RegimeLabel::Unknown,
                    volatility: Some(volatility),
                    trend_strength: None,
                }
            }
        };

        let vol_bucket = if volatility < self.config.low_volatility {
            VolatilityBucket::Low
        } else if volatility < self.config.high_volatility {
            VolatilityBucket::Medium
        } else {
            VolatilityBucket::High
        };

        let trend_bucket = if trend_strength > self.config.trend_strength_threshold {
            let latest = history[history.len() - 1].close;
            let reference = history[history.len() - self.config.trend_lookback].close;
            if latest > reference {
                TrendBucket::Bullish
            } else {
                TrendBucket::Bearish
            }
        } else {
            TrendBucket::Sideways
        };

        RegimeAssessment {
            label: RegimeLabel::new(trend_bucket, vol_bucket),
            volatility: Some(volatility),
            trend_strength: Some(trend_strength),
        }
    }

    /// ADX from the latest snapshot, else the normalized fast/slow SMA gap
    fn trend_strength(&self, history: &[MarketSnapshot]) -> Option<f64> {
        let latest = history.last()?;
        if let Some(adx) = latest.indicator("adx") {
            return Some(adx);
        }

        let (fast, slow) = (self.config.fast_ma, self.config.slow_ma);
        if fast == 0 || slow == 0 || history.len() < fast.max(slow) {
            return None;
        }
        let n = history.len();
        let sma_fast = history[n - fast..].iter().map(|s| s.close).mean();
        let sma_slow = history[n - slow..].iter().map(|s| s.close).mean();
        if !sma_slow.is_finite() || sma_slow == 0.0 || !sma_fast.is_finite() {
            return None;
        }
        Some((sma_fast - sma_slow).abs() / sma_slow * 100.0)
    }

    /// Multipliers applied to the base source weights
    pub fn weight_multipliers(&self, label: RegimeLabel) -> SourceWeights {
        if !self.config.adaptation {
            return SourceWeights::uniform(1.0);
        }
        match label.trend() {
            Some(TrendBucket::Bullish) => self.config.bullish_weights,
            Some(TrendBucket::Bearish) => self.config.bearish_weights,
            Some(TrendBucket::Sideways) => self.config.sideways_weights,
            None => SourceWeights::uniform(1.0),
        }
    }

    pub fn confidence_modifier(&self, label: RegimeLabel) -> f64 {
        if !self.config.adaptation {
            return 1.0;
        }
        match label.volatility() {
            Some(VolatilityBucket::High) => self.config.high_volatility_confidence,
            Some(VolatilityBucket::Low) => self.config.low_volatility_confidence,
            Some(VolatilityBucket::Medium) | None => 1.0,
        }
    }

    /// Profile for `label`, or `fallback` when unknown, unconfigured or
    /// adaptation is off
    pub fn risk_profile(&self, label: RegimeLabel, fallback: RiskProfile) -> RiskProfile {
        if !self.config.adaptation || !label.is_known() {
            return fallback;
        }
        self.config
            .profiles
            .get(label.key())
            .copied()
            .unwrap_or(fallback)
    }
}

/// Sample standard deviation of period-over-period percentage returns
pub fn return_volatility(closes: &[f64]) -> Option<f64> {
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let std = returns.iter().std_dev();
    std.is_finite().then_some(std)
}
