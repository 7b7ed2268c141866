//! # breakwater-runtime
//!
//! Async execution on top of `breakwater-core`.
//!
//! This crate wraps the deterministic state machine in a shareable
//! [`Breaker`], runs operations through it (optionally with a fallback)
//! and keeps a registry of named breakers with periodic failure decay.
//! State changes are broadcast as [`BreakerEvent`]s for alerting.
//!
//! ## Example
//!
//! ```rust,no_run
//! use breakwater_runtime::{BreakerRegistry, ExecutionError};
//! use breakwater_core::RegistryConfig;
//!
//! # async fn query() -> Result<u32, std::io::Error> { Ok(1) }
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = BreakerRegistry::new(RegistryConfig::default())?;
//!
//! match registry.execute("database", || query()).await {
//!     Ok(rows) => println!("{rows} rows"),
//!     Err(ExecutionError::Denied(denied)) => println!("skipped: {denied}"),
//!     Err(e) => println!("query failed: {e}"),
//! }
//!
//! println!("{}", serde_json::to_string_pretty(&registry.health())?);
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod clock;
pub mod events;
pub mod executor;
pub mod health;
pub mod registry;
pub mod sweep;

pub use breaker::Breaker;
pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{BreakerEvent, EVENT_CAPACITY};
pub use executor::ExecutionError;
pub use health::{HealthReport, HealthSummary};
pub use registry::{BreakerRegistry, RegistryError};
pub use sweep::SweepTask;
