//! Subcommand implementations

pub mod backtest;
pub mod paper;
pub mod regime;
