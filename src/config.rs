//! Configuration management
//!
//! One JSON file with a section per component. Every section has a `Default`
//! and `#[serde(default)]`, so a config only needs the values it changes.
//! A few deployment values can be overridden from the environment (a `.env`
//! file is honoured by the binary):
//!
//! - `TRADEX_INITIAL_CAPITAL`
//! - `TRADEX_DATA_DIR`
//! - `TRADEX_RESULTS_DIR`

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::regime::RegimeConfig;
use crate::risk::RiskManagerConfig;
use crate::safety::EmergencyStopConfig;
use crate::signals::SignalConfig;
use crate::Symbol;

pub const ENV_INITIAL_CAPITAL: &str = "TRADEX_INITIAL_CAPITAL";
pub const ENV_DATA_DIR: &str = "TRADEX_DATA_DIR";
pub const ENV_RESULTS_DIR: &str = "TRADEX_RESULTS_DIR";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub trading: TradingConfig,
    pub signals: SignalConfig,
    pub regime: RegimeConfig,
    pub risk: RiskManagerConfig,
    pub execution: ExecutionConfig,
    pub backtest: BacktestConfig,
    pub safety: EmergencyStopConfig,
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a JSON file, apply environment overrides and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(capital) = std::env::var(ENV_INITIAL_CAPITAL) {
            self.trading.initial_capital = capital
                .trim()
                .parse()
                .with_context(|| format!("{} is not a number: {}", ENV_INITIAL_CAPITAL, capital))?;
        }
        if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            self.backtest.data_dir = dir;
        }
        if let Ok(dir) = std::env::var(ENV_RESULTS_DIR) {
            self.backtest.results_dir = dir;
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.trading.symbols.is_empty() {
            bail!("trading.symbols must not be empty");
        }
        if !(self.trading.initial_capital > 0.0) {
            bail!(
                "trading.initial_capital must be positive, got {}",
                self.trading.initial_capital
            );
        }

        let weights = self.signals.base_weights;
        let all = [weights.technical, weights.ml, weights.trend, weights.liquidity];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            bail!("signals.base_weights must be finite and non-negative");
        }
        if self.signals.rsi_oversold >= self.signals.rsi_overbought {
            bail!("signals.rsi_oversold must be below signals.rsi_overbought");
        }
        if self.signals.trend_window < 3 {
            bail!("signals.trend_window must be at least 3");
        }
        if !(0.0..0.5).contains(&self.signals.ml_probability_band) {
            bail!("signals.ml_probability_band must be in [0, 0.5)");
        }

        let regime = &self.regime;
        if regime.low_volatility >= regime.high_volatility {
            bail!("regime.low_volatility must be below regime.high_volatility");
        }
        if regime.fast_ma == 0 || regime.fast_ma >= regime.slow_ma {
            bail!("regime.fast_ma must be positive and below regime.slow_ma");
        }
        if regime.min_history < 2 {
            bail!("regime.min_history must be at least 2");
        }
        if regime.window < 3 {
            bail!("regime.window must be at least 3");
        }
        if regime.trend_lookback == 0 {
            bail!("regime.trend_lookback must be positive");
        }

        let risk = &self.risk;
        if !(0.0..=1.0).contains(&risk.min_confidence) {
            bail!("risk.min_confidence must be in [0, 1]");
        }
        if !(risk.max_drawdown > 0.0 && risk.max_drawdown <= 1.0) {
            bail!("risk.max_drawdown must be in (0, 1]");
        }
        if !(risk.max_position_size > 0.0 && risk.max_position_size <= 1.0) {
            bail!("risk.max_position_size must be in (0, 1]");
        }
        if risk.max_daily_trades == 0 {
            bail!("risk.max_daily_trades must be positive");
        }
        if !(risk.correlation_limit >= 0.0) {
            bail!("risk.correlation_limit must be non-negative");
        }

        if self.execution.fee_rate < 0.0 || self.execution.slippage < 0.0 {
            bail!("execution.fee_rate and execution.slippage must be non-negative");
        }
        if self.safety.max_consecutive_errors == 0 {
            bail!("safety.max_consecutive_errors must be positive");
        }
        if self.session.interval_secs == 0 {
            bail!("session.interval_secs must be positive");
        }
        Ok(())
    }
}

/// Trading configuration
///
/// The engine is currency-agnostic: `initial_capital` must be in the same
/// currency as the price data. No conversion is performed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    pub initial_capital: f64,
    /// Open short positions on SELL decisions
    pub allow_short: bool,
    /// Used to find `<SYMBOL>_<timeframe>.csv` data files
    pub timeframe: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            initial_capital: 100_000.0,
            allow_short: false,
            timeframe: "1h".to_string(),
        }
    }
}

impl TradingConfig {
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.iter().map(Symbol::new).collect()
    }
}

/// Paper execution costs, as fractions of price
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub fee_rate: f64,
    pub slippage: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fee_rate: 0.001, // 0.1%
            slippage: 0.0,
        }
    }
}

/// Backtest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    pub data_dir: String,
    pub results_dir: String,
    /// Bars of history a symbol needs before it is evaluated
    pub warmup_bars: usize,
    /// `YYYY-MM-DD`, inclusive
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            results_dir: "results".to_string(),
            warmup_bars: 50,
            start_date: None,
            end_date: None,
        }
    }
}

/// Paper session loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub interval_secs: u64,
    /// Bars handed to the engine per symbol each cycle
    pub history_bars: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            history_bars: 250,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.backtest.warmup_bars, 50);
        assert_eq!(config.risk.max_daily_trades, 15);
        assert_eq!(config.trading.symbols().len(), 2);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{
            "trading": { "symbols": ["SOLUSDT"], "initial_capital": 5000 },
            "risk": { "min_confidence": 0.7 },
            "regime": { "adaptation": false }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.trading.symbols, vec!["SOLUSDT".to_string()]);
        assert_eq!(config.trading.initial_capital, 5000.0);
        assert_eq!(config.trading.timeframe, "1h");
        assert_eq!(config.risk.min_confidence, 0.7);
        assert_eq!(config.risk.max_concurrent_positions, 3);
        assert!(!config.regime.adaptation);
        assert_eq!(config.regime.profiles.len(), 9);
        assert_eq!(config.signals.base_weights.ml, 0.35);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.trading.initial_capital = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.regime.low_volatility = 0.05;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.signals.base_weights.trend = -1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.trading.symbols.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.risk.correlation_limit = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_regime_windows() {
        let mut config = Config::default();
        config.regime.trend_lookback = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("trend_lookback"));

        let mut config = Config::default();
        config.regime.window = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_shipped_config_loads() {
        let config = Config::from_file("configs/default.json").unwrap();
        assert_eq!(config.trading.timeframe, "1h");
        assert_eq!(config.signals.base_weights.ml, 0.35);
        assert_eq!(config.regime.profiles.len(), 9);
        assert_eq!(config.risk.correlation_limit, 0.7);
        assert_eq!(config.risk.correlation_window, 30);
    }

    #[test]
    fn test_from_file_reports_parse_errors() {
        let dir = std::env::temp_dir().join(format!("tradex_config_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config JSON"));
        assert!(Config::from_file(dir.join("missing.json")).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
