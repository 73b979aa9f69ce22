//! Regime-adaptive trading decision engine
//!
//! Turns market snapshots into BUY/SELL/HOLD decisions by combining several
//! independent signal sources with weights adapted to the market regime,
//! sizes positions with a bounded Kelly/volatility model under daily risk
//! limits, and replays the whole pipeline over historical data.
//!
//! - [`signals`]: technical, ML, trend and liquidity analyzers
//! - [`regime`]: trend × volatility classification and per-regime profiles
//! - [`aggregator`]: weighted vote aggregation into a [`Decision`]
//! - [`risk`]: sizing, stops and the trade gate
//! - [`ledger`]: cash, positions and trade history
//! - [`engine`]: the per-tick pipeline shared by [`backtest`] and [`session`]

pub mod aggregator;
pub mod backtest;
pub mod broker;
pub mod clock;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod indicators;
pub mod ledger;
pub mod regime;
pub mod report;
pub mod risk;
pub mod safety;
pub mod session;
pub mod signals;
pub mod types;

pub use config::Config;
pub use error::{DataUnavailable, EngineError, ExecutionRejected, RiskRejection};
pub use regime::RegimeLabel;
pub use types::*;
