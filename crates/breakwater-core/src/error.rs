//! Admission denial.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::CircuitState;

/// A call rejected by a breaker without invoking the operation.
///
/// Never caused by the wrapped operation itself. Hosts usually map this to
/// a "service unavailable" response.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("circuit breaker '{breaker}' is {state}; {}", describe_next(.next_attempt))]
pub struct AdmissionDenied {
    /// Breaker that denied the call
    pub breaker: String,

    /// State at the moment of denial
    pub state: CircuitState,

    /// Earliest time a call may be admitted again. Absent when a half-open
    /// breaker is waiting on an in-flight probe.
    pub next_attempt: Option<DateTime<Utc>>,
}

fn describe_next(next_attempt: &Option<DateTime<Utc>>) -> String {
    match next_attempt {
        Some(at) => format!(
            "next attempt at {}",
            at.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
        None => "probe in flight".to_string(),
    }
}
