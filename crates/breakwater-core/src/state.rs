//! Breaker states and transition records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    #[default]
    Closed,

    /// Failing; calls are denied until the recovery deadline
    Open,

    /// Probing whether the dependency recovered
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Consecutive failures reached the threshold
    FailureThreshold,

    /// An admission attempt arrived after the recovery deadline
    RecoveryTimeoutElapsed,

    /// A call failed while half-open
    ProbeFailed,

    /// Enough half-open successes
    Recovered,

    /// Operator reset
    ManualReset,

    /// Operator forced the breaker open
    ForcedOpen,

    /// Operator re-enabled a disabled breaker
    Enabled,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::FailureThreshold => "failure threshold reached",
            Self::RecoveryTimeoutElapsed => "recovery timeout elapsed",
            Self::ProbeFailed => "probe failed",
            Self::Recovered => "recovered",
            Self::ManualReset => "manual reset",
            Self::ForcedOpen => "forced open",
            Self::Enabled => "enabled",
        };
        f.write_str(text)
    }
}

/// A recorded state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}
