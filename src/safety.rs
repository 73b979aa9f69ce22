//! Emergency stop
//!
//! Guards the order path against repeated unexpected failures.
//!
//! States:
//! - Normal: orders pass through
//! - Halted: too many consecutive failures, no new orders (exits still run)
//! - Recovering: a recovery check is in progress

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmergencyState {
    #[default]
    Normal,
    Halted,
    Recovering,
}

/// Outcome of [`EmergencyStop::attempt_recovery`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Not halted, nothing to do
    NotHalted,
    /// Cooldown since the last failure has not elapsed yet
    CoolingDown,
    Recovered,
    Failed { attempts: u32 },
    /// Recovery attempts used up; operator action required
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmergencyStopConfig {
    /// Consecutive failures that trip the stop
    pub max_consecutive_errors: u32,
    pub max_recovery_attempts: u32,
    /// Seconds to wait after the last failure before a recovery attempt
    pub recovery_cooldown_secs: u64,
}

impl Default for EmergencyStopConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            max_recovery_attempts: 10,
            recovery_cooldown_secs: 300,
        }
    }
}

impl EmergencyStopConfig {
    pub fn with_max_consecutive_errors(mut self, max: u32) -> Self {
        self.max_consecutive_errors = max;
        self
    }

    pub fn with_max_recovery_attempts(mut self, max: u32) -> Self {
        self.max_recovery_attempts = max;
        self
    }

    pub fn with_recovery_cooldown(mut self, cooldown: Duration) -> Self {
        self.recovery_cooldown_secs = cooldown.as_secs();
        self
    }

    pub fn recovery_cooldown(&self) -> Duration {
        Duration::from_secs(self.recovery_cooldown_secs)
    }
}

/// Consecutive-failure state machine
///
/// # Example
///
/// ```
/// use tradex_engine::safety::{EmergencyState, EmergencyStop, EmergencyStopConfig, RecoveryOutcome};
///
/// let config = EmergencyStopConfig::default()
///     .with_max_consecutive_errors(2)
///     .with_recovery_cooldown(std::time::Duration::ZERO);
/// let mut stop = EmergencyStop::new(config);
///
/// stop.record_failure("feed timeout");
/// stop.record_failure("feed timeout");
/// assert_eq!(stop.state(), EmergencyState::Halted);
/// assert!(!stop.allows_orders());
///
/// assert_eq!(stop.attempt_recovery(|| true), RecoveryOutcome::Recovered);
/// assert!(stop.allows_orders());
/// ```
#[derive(Debug)]
pub struct EmergencyStop {
    state: EmergencyState,
    consecutive_errors: u32,
    recovery_attempts: u32,
    last_failure: Option<Instant>,
    config: EmergencyStopConfig,
}

impl EmergencyStop {
    pub fn new(config: EmergencyStopConfig) -> Self {
        Self {
            state: EmergencyState::Normal,
            consecutive_errors: 0,
            recovery_attempts: 0,
            last_failure: None,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(EmergencyStopConfig::default())
    }

    pub fn state(&self) -> EmergencyState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    pub fn is_halted(&self) -> bool {
        self.state != EmergencyState::Normal
    }

    /// New orders are allowed only in the Normal state
    pub fn allows_orders(&self) -> bool {
        self.state == EmergencyState::Normal
    }

    /// Count an unexpected failure. Returns true if this call tripped the stop.
    pub fn record_failure(&mut self, reason: &str) -> bool {
        self.last_failure = Some(Instant::now());
        self.consecutive_errors += 1;

        if self.state == EmergencyState::Normal
            && self.consecutive_errors >= self.config.max_consecutive_errors
        {
            error!(
                errors = self.consecutive_errors,
                reason, "EMERGENCY STOP: consecutive failure limit reached, halting new orders"
            );
            self.state = EmergencyState::Halted;
            return true;
        }

        warn!(
            errors = self.consecutive_errors,
            max = self.config.max_consecutive_errors,
            reason,
            "Tick failed"
        );
        false
    }

    /// A clean tick resets the consecutive counter
    pub fn record_success(&mut self) {
        if self.state == EmergencyState::Normal {
            self.consecutive_errors = 0;
        }
    }

    /// Try to leave the Halted state by running `check`
    pub fn attempt_recovery<F>(&mut self, check: F) -> RecoveryOutcome
    where
        F: FnOnce() -> bool,
    {
        if self.state == EmergencyState::Normal {
            return RecoveryOutcome::NotHalted;
        }
        if self.recovery_attempts >= self.config.max_recovery_attempts {
            return RecoveryOutcome::Exhausted;
        }
        if let Some(last) = self.last_failure {
            if last.elapsed() < self.config.recovery_cooldown() {
                return RecoveryOutcome::CoolingDown;
            }
        }

        self.state = EmergencyState::Recovering;
        info!(
            attempt = self.recovery_attempts + 1,
            max = self.config.max_recovery_attempts,
            "Attempting recovery from emergency stop"
        );

        if check() {
            info!("Recovered from emergency stop, resuming normal operation");
            self.reset();
            RecoveryOutcome::Recovered
        } else {
            self.recovery_attempts += 1;
            self.state = EmergencyState::Halted;
            self.last_failure = Some(Instant::now());
            if self.recovery_attempts >= self.config.max_recovery_attempts {
                error!(
                    attempts = self.recovery_attempts,
                    "EMERGENCY STOP: recovery attempts exhausted, manual intervention required"
                );
                RecoveryOutcome::Exhausted
            } else {
                warn!(attempts = self.recovery_attempts, "Recovery check failed");
                RecoveryOutcome::Failed {
                    attempts: self.recovery_attempts,
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.state = EmergencyState::Normal;
        self.consecutive_errors = 0;
        self.recovery_attempts = 0;
        self.last_failure = None;
    }
}
