//! Read-only breaker snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;
use crate::metrics::CallMetrics;
use crate::state::{CircuitState, Transition};

/// Point-in-time view of one breaker, suitable for health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,

    pub state: CircuitState,

    /// Current consecutive failure streak
    pub failure_count: u32,

    /// Successes in the current half-open episode
    pub success_count: u32,

    pub last_failure_time: Option<DateTime<Utc>>,

    pub last_success_time: Option<DateTime<Utc>>,

    /// Set only while open
    pub next_attempt: Option<DateTime<Utc>>,

    pub last_state_change: DateTime<Utc>,

    /// True iff the breaker is closed
    pub is_healthy: bool,

    /// Admission control bypassed; calls run unrecorded
    pub disabled: bool,

    pub metrics: CallMetrics,

    /// Most recent transitions, oldest first
    pub recent_transitions: Vec<Transition>,

    pub config: BreakerConfig,
}
