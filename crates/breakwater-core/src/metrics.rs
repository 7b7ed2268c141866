//! Per-breaker call accounting.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Outcome of one admitted call. Used to update a breaker, then discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationOutcome {
    pub success: bool,
    pub duration: Duration,
}

impl OperationOutcome {
    pub fn success(duration: Duration) -> Self {
        Self {
            success: true,
            duration,
        }
    }

    pub fn failure(duration: Duration) -> Self {
        Self {
            success: false,
            duration,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Cumulative call counters for a breaker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallMetrics {
    /// Admission attempts, including denied ones
    pub total_calls: u64,

    pub successful_calls: u64,

    pub failed_calls: u64,

    /// Failed calls that hit the configured call timeout (also counted in `failed_calls`)
    pub timed_out_calls: u64,

    /// Calls denied without invoking the operation
    pub short_circuited_calls: u64,

    /// Successful calls slower than the slow-call threshold
    pub slow_calls: u64,

    pub state_changes: u64,

    /// Calls run while the breaker was disabled, without admission control
    pub bypassed_calls: u64,

    /// Failed or denied calls answered by a fallback
    pub fallback_calls: u64,

    pub min_response_ms: Option<u64>,

    pub max_response_ms: Option<u64>,

    /// Sum of response times of completed calls
    pub total_response_ms: u64,
}

impl CallMetrics {
    /// Record a completed call.
    pub(crate) fn record(&mut self, outcome: &OperationOutcome, slow: bool) {
        if outcome.success {
            self.successful_calls += 1;
        } else {
            self.failed_calls += 1;
        }
        if slow {
            self.slow_calls += 1;
        }

        let ms = outcome.duration_ms();
        self.total_response_ms = self.total_response_ms.saturating_add(ms);
        self.min_response_ms = Some(self.min_response_ms.map_or(ms, |m| m.min(ms)));
        self.max_response_ms = Some(self.max_response_ms.map_or(ms, |m| m.max(ms)));
    }

    /// Number of calls that ran to completion.
    pub fn completed_calls(&self) -> u64 {
        self.successful_calls + self.failed_calls
    }

    /// Mean response time over completed calls.
    pub fn avg_response_ms(&self) -> Option<f64> {
        match self.completed_calls() {
            0 => None,
            n => Some(self.total_response_ms as f64 / n as f64),
        }
    }

    /// Percentage of completed calls that failed.
    pub fn failure_rate(&self) -> f64 {
        match self.completed_calls() {
            0 => 0.0,
            n => self.failed_calls as f64 / n as f64 * 100.0,
        }
    }
}
