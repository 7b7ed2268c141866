//! Administrative and health surface of the registry.
//!
//! Admin operations address breakers by name and never create them: an
//! unknown name is an error (or `None`), not a fresh breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use breakwater_core::{BreakerStatus, CircuitState};

use crate::registry::{BreakerRegistry, RegistryError};

/// Breaker counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,

    /// Breakers bypassing admission control, whatever their state
    pub disabled: usize,
}

impl HealthSummary {
    fn count(&mut self, status: &BreakerStatus) {
        self.total += 1;
        if status.disabled {
            self.disabled += 1;
        }
        let state = status.state;
        match state {
            CircuitState::Closed => self.closed += 1,
            CircuitState::Open => self.open += 1,
            CircuitState::HalfOpen => self.half_open += 1,
        }
    }
}

/// Registry-wide health, keyed by breaker name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// True iff every breaker is closed. An empty registry is healthy.
    pub healthy: bool,
    pub summary: HealthSummary,
    pub breakers: BTreeMap<String, BreakerStatus>,
    pub generated_at: DateTime<Utc>,
}

impl BreakerRegistry {
    /// Snapshot of the named breaker.
    pub fn status(&self, name: &str) -> Option<BreakerStatus> {
        self.find(name).map(|b| b.status())
    }

    /// Snapshots of every breaker, keyed by name.
    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.all()
            .into_iter()
            .map(|b| (b.name().to_string(), b.status()))
            .collect()
    }

    /// Force the named breaker closed.
    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        let breaker = self
            .find(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        breaker.reset();
        Ok(())
    }

    /// Force the named breaker open for `duration`.
    pub fn force_open(&self, name: &str, duration: Duration) -> Result<(), RegistryError> {
        let breaker = self
            .find(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        breaker.force_open(duration);
        Ok(())
    }

    /// Bypass admission control on the named breaker.
    pub fn disable(&self, name: &str) -> Result<(), RegistryError> {
        let breaker = self
            .find(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        breaker.disable();
        Ok(())
    }

    /// Resume admission control on the named breaker. Returns false if it
    /// was not disabled.
    pub fn enable(&self, name: &str) -> Result<bool, RegistryError> {
        let breaker = self
            .find(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(breaker.enable())
    }

    /// Force every breaker closed.
    pub fn reset_all(&self) {
        let breakers = self.all();
        for breaker in &breakers {
            breaker.reset();
        }
        tracing::info!(breakers = breakers.len(), "All circuit breakers reset");
    }

    pub fn is_healthy(&self) -> bool {
        self.all()
            .iter()
            .all(|b| b.state() == CircuitState::Closed)
    }

    pub fn health(&self) -> HealthReport {
        let breakers = self.statuses();

        let mut summary = HealthSummary::default();
        for status in breakers.values() {
            summary.count(status);
        }

        HealthReport {
            healthy: summary.closed == summary.total,
            summary,
            breakers,
            generated_at: self.clock().now(),
        }
    }
}
