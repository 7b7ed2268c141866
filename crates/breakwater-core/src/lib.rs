//! # breakwater-core
//!
//! Deterministic circuit breaker state machine.
//!
//! A breaker guards one failure-prone dependency and answers a single
//! question per call: may this call run? This crate holds the parts that
//! answer it without an async runtime:
//!
//! - [`BreakerConfig`] thresholds, validated at construction
//! - [`StateMachine`] state, counters and transitions for one named breaker
//! - [`AdmissionDenied`] the error for calls rejected while open
//! - [`BreakerStatus`] snapshots for health reporting
//!
//! ## Key Guarantees
//!
//! 1. **Deterministic**: time is passed in, never read
//! 2. **Fail fast**: an open breaker denies without running the operation
//! 3. **No partial credit**: any half-open failure reopens the breaker
//!
//! ## Example
//!
//! ```rust
//! use breakwater_core::{BreakerConfig, CircuitState, OperationOutcome, StateMachine};
//! use chrono::Utc;
//! use std::time::Duration;
//!
//! let config = BreakerConfig::default().with_failure_threshold(1);
//! let mut breaker = StateMachine::new("database", config, Utc::now()).unwrap();
//!
//! let now = Utc::now();
//! breaker.try_admit(now).unwrap();
//! breaker.record(now, &OperationOutcome::failure(Duration::from_millis(3)));
//!
//! assert_eq!(breaker.state(), CircuitState::Open);
//! assert!(breaker.try_admit(now).is_err());
//! ```

pub mod config;
pub mod error;
pub mod machine;
pub mod metrics;
pub mod state;
pub mod status;

// Re-export main types at crate root
pub use config::{BreakerConfig, ConfigError, ProbePolicy, RegistryConfig};
pub use error::AdmissionDenied;
pub use machine::{Admission, StateMachine, HISTORY_LIMIT};
pub use metrics::{CallMetrics, OperationOutcome};
pub use state::{CircuitState, Transition, TransitionReason};
pub use status::BreakerStatus;
