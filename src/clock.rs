//! Session clocks
//!
//! The ledger asks its clock for the current time to decide when the daily
//! counters roll over. Backtests drive a [`SimulatedClock`] from bar
//! timestamps; live sessions use [`SystemClock`]. Both share the same reset
//! logic in [`crate::ledger::PortfolioLedger`].

use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::sync::{Arc, RwLock};

/// Source of "now" and of the trading-session day
pub trait SessionClock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Calendar day a timestamp belongs to. UTC days by default.
    fn session_day(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.date_naive()
    }

    fn today(&self) -> NaiveDate {
        self.session_day(self.now())
    }
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SessionClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock shared between the simulator and the ledger.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl SimulatedClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    /// Move the clock to `ts`. Moving backwards is ignored.
    pub fn advance_to(&self, ts: DateTime<Utc>) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ts > *guard {
            *guard = ts;
        }
    }
}

impl SessionClock for SimulatedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.current.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
