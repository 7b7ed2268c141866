//! Registry of named breakers.
//!
//! The host builds one registry at startup and shares it (usually as an
//! `Arc<BreakerRegistry>`) with every component that needs admission
//! control. Breakers are created lazily on first reference and each gets
//! its own sweep task, stopped on removal or registry shutdown.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use breakwater_core::{BreakerConfig, ConfigError, RegistryConfig};

use crate::breaker::Breaker;
use crate::clock::{Clock, SystemClock};
use crate::events::{BreakerEvent, EVENT_CAPACITY};
use crate::executor::ExecutionError;
use crate::sweep::SweepTask;

/// Errors from registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown breaker: {0}")]
    NotFound(String),

    #[error("Breaker already registered: {0}")]
    AlreadyRegistered(String),
}

struct Entry {
    breaker: Arc<Breaker>,
    // Held for its drop guard; dropping the entry stops the sweeper.
    _sweeper: Option<SweepTask>,
}

/// Named breakers, one per protected resource.
pub struct BreakerRegistry {
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
    breakers: RwLock<HashMap<String, Entry>>,
    events: broadcast::Sender<BreakerEvent>,
    shutdown: CancellationToken,
}

impl BreakerRegistry {
    /// Create a registry using the system clock.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a registry reading time from `clock`.
    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Result<Self, RegistryError> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            clock,
            breakers: RwLock::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get the named breaker, creating it on first reference.
    ///
    /// New breakers take the per-resource override if one exists, the
    /// registry defaults otherwise.
    ///
    /// # Panics
    ///
    /// Never in practice: every config `get` can pick was validated by
    /// [`with_clock`](Self::with_clock), and the registry config is not
    /// mutable afterwards.
    pub fn get(&self, name: &str) -> Arc<Breaker> {
        if let Some(entry) = self.breakers.read().get(name) {
            return entry.breaker.clone();
        }

        let mut breakers = self.breakers.write();
        if let Some(entry) = breakers.get(name) {
            return entry.breaker.clone();
        }

        let config = self.config.config_for(name).clone();
        let breaker = Breaker::new(name, config, self.clock.clone())
            .expect("registry configs are validated at construction");
        let entry = self.entry(breaker);
        let breaker = entry.breaker.clone();
        breakers.insert(name.to_string(), entry);

        tracing::info!(breaker = %name, "Circuit breaker created");
        breaker
    }

    /// Create a breaker with an explicit config.
    pub fn register(
        &self,
        name: impl Into<String>,
        config: BreakerConfig,
    ) -> Result<Arc<Breaker>, RegistryError> {
        let name = name.into();
        let mut breakers = self.breakers.write();
        if breakers.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered(name));
        }

        let breaker = Breaker::new(name.clone(), config, self.clock.clone())?;
        let entry = self.entry(breaker);
        let breaker = entry.breaker.clone();
        breakers.insert(name.clone(), entry);

        tracing::info!(breaker = %name, "Circuit breaker registered");
        Ok(breaker)
    }

    /// The named breaker, without creating it.
    pub fn find(&self, name: &str) -> Option<Arc<Breaker>> {
        self.breakers.read().get(name).map(|e| e.breaker.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.breakers.read().contains_key(name)
    }

    /// Drop a breaker and stop its sweep task.
    ///
    /// Callers still holding the `Arc<Breaker>` keep a working but detached
    /// breaker; the next `get` creates a fresh one.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.breakers.write().remove(name);
        match removed {
            Some(_) => {
                tracing::info!(breaker = %name, "Circuit breaker removed");
                true
            }
            None => false,
        }
    }

    /// Names of all tracked breakers, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }

    /// Run `operation` under the named breaker.
    pub async fn execute<F, Fut, T, E>(
        &self,
        name: &str,
        operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let breaker = self.get(name);
        breaker.execute(operation).await
    }

    /// Run `operation` under the named breaker, handing errors to `fallback`.
    ///
    /// See [`Breaker::execute_with_fallback`].
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        name: &str,
        operation: F,
        fallback: G,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(ExecutionError<E>) -> GFut,
        GFut: Future<Output = Result<T, ExecutionError<E>>>,
    {
        let breaker = self.get(name);
        breaker.execute_with_fallback(operation, fallback).await
    }

    /// Receive events from every breaker the registry creates.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Run one decay pass over every breaker. Returns how many were reset.
    pub fn sweep_all(&self) -> usize {
        self.all().iter().filter(|b| b.sweep()).count()
    }

    /// Stop every sweep task. Breakers keep working.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            tracing::info!(breakers = self.len(), "Breaker registry shut down");
        }
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Snapshot of all breakers, without holding the map lock afterwards.
    pub(crate) fn all(&self) -> Vec<Arc<Breaker>> {
        self.breakers
            .read()
            .values()
            .map(|e| e.breaker.clone())
            .collect()
    }

    fn entry(&self, breaker: Breaker) -> Entry {
        let breaker = Arc::new(breaker.forward_events(self.events.clone()));
        Entry {
            _sweeper: self.spawn_sweeper(&breaker),
            breaker,
        }
    }

    fn spawn_sweeper(&self, breaker: &Arc<Breaker>) -> Option<SweepTask> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(SweepTask::spawn_on(
                &runtime,
                Arc::downgrade(breaker),
                breaker.config().monitoring_period,
                self.shutdown.child_token(),
            )),
            Err(_) => {
                tracing::warn!(
                    breaker = %breaker.name(),
                    "No tokio runtime; stale failures decay only through sweep_all"
                );
                None
            }
        }
    }
}

impl Drop for BreakerRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use breakwater_core::CircuitState;
    use std::time::Duration;

    fn registry() -> (BreakerRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(0));
        let config = RegistryConfig::default().with_breaker(
            "database",
            BreakerConfig::default().with_failure_threshold(2),
        );
        let registry = BreakerRegistry::with_clock(config, clock.clone()).unwrap();
        (registry, clock)
    }

    #[tokio::test]
    async fn test_get_is_lazy_and_idempotent() {
        let (registry, _) = registry();
        assert!(registry.is_empty());

        let first = registry.get("database");
        let second = registry.get("database");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_overrides_and_defaults() {
        let (registry, _) = registry();
        assert_eq!(registry.get("database").config().failure_threshold, 2);
        assert_eq!(registry.get("cache").config().failure_threshold, 5);
        assert_eq!(registry.names(), vec!["cache", "database"]);
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let config = RegistryConfig::default()
            .with_breaker("database", BreakerConfig::default().with_failure_threshold(0));
        assert!(matches!(
            BreakerRegistry::new(config),
            Err(RegistryError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_register_custom_config() {
        let (registry, _) = registry();
        let breaker = registry
            .register("payments", BreakerConfig::default().with_success_threshold(1))
            .unwrap();
        assert_eq!(breaker.config().success_threshold, 1);

        assert!(matches!(
            registry.register("payments", BreakerConfig::default()),
            Err(RegistryError::AlreadyRegistered(_))
        ));
        assert!(matches!(
            registry.register("bad", BreakerConfig::default().with_failure_threshold(0)),
            Err(RegistryError::Config(_))
        ));
        assert!(!registry.contains("bad"));
    }

    #[tokio::test]
    async fn test_execute_by_name_trips_named_breaker_only() {
        let (registry, _) = registry();

        for _ in 0..2 {
            let result = registry
                .execute("database", || async { Err::<(), _>("timeout") })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(registry.get("database").state(), CircuitState::Open);
        let denied = registry
            .execute("database", || async { Ok::<_, &str>(()) })
            .await
            .unwrap_err();
        assert!(denied.is_denied());

        let value = registry
            .execute("cache", || async { Ok::<_, &str>("hit") })
            .await
            .unwrap();
        assert_eq!(value, "hit");
    }

    #[tokio::test]
    async fn test_remove_discards_state() {
        let (registry, _) = registry();
        registry.get("database").force_open(Duration::from_secs(60));

        assert!(registry.remove("database"));
        assert!(!registry.remove("database"));
        assert!(registry.find("database").is_none());

        assert_eq!(registry.get("database").state(), CircuitState::Closed);
    }

    #[test]
    fn test_works_without_runtime() {
        let (registry, clock) = registry();
        let breaker = registry.get("database");

        clock.set_millis(1000);
        breaker.with_machine(|m| m.on_failure(clock.now()));
        assert_eq!(breaker.failure_count(), 1);

        assert_eq!(registry.sweep_all(), 0);
        clock.advance(Duration::from_secs(61));
        assert_eq!(registry.sweep_all(), 1);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_per_breaker() {
        let (registry, clock) = registry();

        let breaker = registry.get("database");
        let _ = breaker.execute(|| async { Err::<(), _>("refused") }).await;
        assert_eq!(breaker.failure_count(), 1);

        clock.advance(Duration::from_secs(61));
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_sweepers() {
        let (registry, clock) = registry();

        let breaker = registry.get("database");
        registry.shutdown();
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let _ = breaker.execute(|| async { Err::<(), _>("refused") }).await;
        clock.advance(Duration::from_secs(61));
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        // No sweeper left to decay the streak
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_stops_sweeper() {
        let (registry, clock) = registry();

        let detached = registry.get("database");
        let _ = detached.execute(|| async { Err::<(), _>("refused") }).await;
        assert!(registry.remove("database"));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_secs(61));
        tokio::time::advance(Duration::from_secs(60)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        // A running sweeper would have decayed the streak by now
        assert_eq!(detached.failure_count(), 1);
        assert!(detached.sweep());
    }

    #[tokio::test]
    async fn test_subscribe_sees_every_breaker() {
        let (registry, _) = registry();
        let mut events = registry.subscribe();

        for _ in 0..2 {
            let _ = registry
                .execute("database", || async { Err::<(), _>("timeout") })
                .await;
        }
        registry.get("cache").force_open(Duration::from_secs(1));

        let first = events.try_recv().unwrap();
        assert_eq!(first.breaker(), "database");
        assert!(matches!(
            first,
            BreakerEvent::StateChanged { ref transition, .. }
                if transition.to == CircuitState::Open
        ));
        assert_eq!(events.try_recv().unwrap().breaker(), "cache");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_execute_with_fallback_by_name() {
        let (registry, _) = registry();
        registry.get("database").force_open(Duration::from_secs(60));

        let value = registry
            .execute_with_fallback(
                "database",
                || async { Ok::<_, &str>("live") },
                |_| async { Ok::<_, ExecutionError<&str>>("cached") },
            )
            .await
            .unwrap();
        assert_eq!(value, "cached");
        assert_eq!(registry.status("database").unwrap().metrics.fallback_calls, 1);
    }
}
