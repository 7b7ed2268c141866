//! Breaker state machine.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: dependency assumed down, calls fail fast
//! - HalfOpen: probing whether the dependency recovered
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     failure_count >= failure_threshold
//! Open     → HalfOpen: first admission attempt at or after next_attempt
//! HalfOpen → Closed:   success_count >= success_threshold
//! HalfOpen → Open:     any failure
//! ```
//!
//! Every method takes `now` explicitly. The machine never reads a clock, so
//! the same sequence of calls always produces the same states.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::VecDeque;
use std::time::Duration;

use crate::config::{BreakerConfig, ConfigError, ProbePolicy};
use crate::error::AdmissionDenied;
use crate::metrics::{CallMetrics, OperationOutcome};
use crate::state::{CircuitState, Transition, TransitionReason};
use crate::status::BreakerStatus;

/// Transitions kept for status reporting.
pub const HISTORY_LIMIT: usize = 10;

/// How an admitted call entered the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed breaker, ordinary call
    Normal,

    /// Half-open breaker; the call tests recovery
    Probe,

    /// Disabled breaker; the call runs without being recorded
    Bypass,
}

/// State and counters for one named breaker.
#[derive(Debug, Clone)]
pub struct StateMachine {
    name: String,
    config: BreakerConfig,
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    next_attempt: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    probe_in_flight: bool,
    disabled: bool,
    metrics: CallMetrics,
    history: VecDeque<Transition>,
}

impl StateMachine {
    /// Create a closed breaker. Fails if the config is invalid.
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            last_success_time: None,
            next_attempt: None,
            last_state_change: now,
            probe_in_flight: false,
            disabled: false,
            metrics: CallMetrics::default(),
            history: VecDeque::with_capacity(HISTORY_LIMIT),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.last_failure_time
    }

    pub fn next_attempt(&self) -> Option<DateTime<Utc>> {
        self.next_attempt
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    pub fn history(&self) -> impl Iterator<Item = &Transition> {
        self.history.iter()
    }

    /// Decide whether a call arriving at `now` may run.
    ///
    /// An open breaker past its deadline moves to half-open here; there is
    /// no timer driving that transition.
    pub fn try_admit(&mut self, now: DateTime<Utc>) -> Result<Admission, AdmissionDenied> {
        self.metrics.total_calls += 1;

        if self.disabled {
            self.metrics.bypassed_calls += 1;
            return Ok(Admission::Bypass);
        }

        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::HalfOpen => self.admit_probe(),
            CircuitState::Open => match self.next_attempt {
                Some(at) if now < at => {
                    self.metrics.short_circuited_calls += 1;
                    Err(self.denied(Some(at)))
                }
                _ => {
                    self.transition(
                        CircuitState::HalfOpen,
                        TransitionReason::RecoveryTimeoutElapsed,
                        now,
                    );
                    self.admit_probe()
                }
            },
        }
    }

    fn admit_probe(&mut self) -> Result<Admission, AdmissionDenied> {
        if self.config.probe_policy == ProbePolicy::Single {
            if self.probe_in_flight {
                self.metrics.short_circuited_calls += 1;
                return Err(self.denied(None));
            }
            self.probe_in_flight = true;
        }
        Ok(Admission::Probe)
    }

    /// Release the single-probe permit taken by [`try_admit`](Self::try_admit).
    ///
    /// Idempotent; a no-op under [`ProbePolicy::Unlimited`].
    pub fn release_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Record a completed call and apply the outcome.
    ///
    /// Returns whether the call counted as slow.
    pub fn record(&mut self, now: DateTime<Utc>, outcome: &OperationOutcome) -> bool {
        let slow = outcome.success && outcome.duration > self.config.slow_call_threshold;
        self.metrics.record(outcome, slow);

        if outcome.success {
            self.on_success(now);
        } else {
            self.on_failure(now);
        }

        slow
    }

    /// Record a call that exceeded the configured call timeout.
    pub fn record_timeout(&mut self, now: DateTime<Utc>, elapsed: Duration) {
        self.metrics.timed_out_calls += 1;
        self.record(now, &OperationOutcome::failure(elapsed));
    }

    /// Apply a success. Clears the failure streak in every state.
    pub fn on_success(&mut self, now: DateTime<Utc>) {
        self.failure_count = 0;
        self.last_success_time = Some(now);

        if self.state == CircuitState::HalfOpen {
            self.success_count += 1;
            if self.success_count >= self.config.success_threshold {
                self.transition(CircuitState::Closed, TransitionReason::Recovered, now);
            }
        }
    }

    /// Apply a failure.
    pub fn on_failure(&mut self, now: DateTime<Utc>) {
        self.last_failure_time = Some(now);

        match self.state {
            CircuitState::HalfOpen => {
                self.transition(CircuitState::Open, TransitionReason::ProbeFailed, now);
            }
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.transition(CircuitState::Open, TransitionReason::FailureThreshold, now);
                }
            }
            // A call admitted before the trip finished late; the breaker is
            // already open.
            CircuitState::Open => {}
        }
    }

    /// Clear a failure streak that has gone stale.
    ///
    /// Returns true if the count was reset. State is never changed.
    pub fn decay(&mut self, now: DateTime<Utc>) -> bool {
        if self.failure_count == 0 {
            return false;
        }

        let stale = match self.last_failure_time {
            Some(last) => now.signed_duration_since(last) > to_delta(self.config.monitoring_period),
            None => true,
        };

        if stale {
            tracing::debug!(
                breaker = %self.name,
                failures = self.failure_count,
                "Stale failure streak decayed"
            );
            self.failure_count = 0;
        }
        stale
    }

    /// Force the breaker closed and zero its counters.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.transition(CircuitState::Closed, TransitionReason::ManualReset, now);
        self.failure_count = 0;
        self.success_count = 0;
        self.last_failure_time = None;
        self.next_attempt = None;
        self.probe_in_flight = false;
    }

    /// Stop admission control. Every call is admitted and no outcome is
    /// recorded until [`enable`](Self::enable).
    pub fn disable(&mut self) {
        if !self.disabled {
            self.disabled = true;
            tracing::warn!(breaker = %self.name, state = %self.state, "Circuit breaker disabled");
        }
    }

    /// Resume admission control from a clean closed state.
    ///
    /// Returns false if the breaker was not disabled.
    pub fn enable(&mut self, now: DateTime<Utc>) -> bool {
        if !self.disabled {
            return false;
        }
        self.disabled = false;
        self.transition(CircuitState::Closed, TransitionReason::Enabled, now);
        self.last_failure_time = None;
        true
    }

    /// Count a call answered by a fallback.
    pub fn record_fallback(&mut self) {
        self.metrics.fallback_calls += 1;
    }

    /// Force the breaker open until `now + duration`, regardless of counters.
    pub fn force_open(&mut self, now: DateTime<Utc>, duration: Duration) {
        self.transition(CircuitState::Open, TransitionReason::ForcedOpen, now);
        self.next_attempt = Some(deadline(now, duration));
    }

    /// Snapshot for status reporting.
    pub fn status(&self) -> BreakerStatus {
        BreakerStatus {
            name: self.name.clone(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            next_attempt: self.next_attempt,
            last_state_change: self.last_state_change,
            is_healthy: self.state == CircuitState::Closed,
            disabled: self.disabled,
            metrics: self.metrics.clone(),
            recent_transitions: self.history.iter().cloned().collect(),
            config: self.config.clone(),
        }
    }

    fn denied(&self, next_attempt: Option<DateTime<Utc>>) -> AdmissionDenied {
        AdmissionDenied {
            breaker: self.name.clone(),
            state: self.state,
            next_attempt,
        }
    }

    fn transition(&mut self, to: CircuitState, reason: TransitionReason, now: DateTime<Utc>) {
        let from = self.state;
        self.state = to;
        self.last_state_change = now;
        self.metrics.state_changes += 1;

        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
                self.next_attempt = None;
                self.probe_in_flight = false;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
                self.probe_in_flight = false;
            }
            CircuitState::Open => {
                self.success_count = 0;
                self.probe_in_flight = false;
                self.next_attempt = Some(deadline(now, self.config.recovery_timeout));
            }
        }

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                from = %from,
                reason = %reason,
                failures = self.failure_count,
                next_attempt = ?self.next_attempt,
                "Circuit opened"
            ),
            _ => tracing::info!(
                breaker = %self.name,
                from = %from,
                to = %to,
                reason = %reason,
                "Circuit state changed"
            ),
        }

        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(Transition {
            from,
            to,
            reason,
            at: now,
        });
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// `now + duration`, saturating at the largest representable time.
fn deadline(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_delta(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
