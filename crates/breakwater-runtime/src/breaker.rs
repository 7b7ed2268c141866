//! A named breaker shared across tasks.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use breakwater_core::{
    BreakerConfig, BreakerStatus, CircuitState, ConfigError, StateMachine, Transition,
};

use crate::clock::Clock;
use crate::events::{BreakerEvent, EventBus};

/// One breaker guarding one dependency.
///
/// State lives behind a mutex that is held only for the synchronous
/// admission and recording steps, never across an `.await`.
pub struct Breaker {
    name: String,
    config: BreakerConfig,
    machine: Mutex<StateMachine>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl Breaker {
    /// Create a closed breaker. Fails if the config is invalid.
    pub fn new(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let machine = StateMachine::new(name.clone(), config.clone(), clock.now())?;

        Ok(Self {
            name,
            config,
            machine: Mutex::new(machine),
            clock,
            events: EventBus::new(),
        })
    }

    /// Also publish every event on `registry`.
    pub(crate) fn forward_events(mut self, registry: broadcast::Sender<BreakerEvent>) -> Self {
        self.events.forward_to(registry);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.machine.lock().state()
    }

    pub fn failure_count(&self) -> u32 {
        self.machine.lock().failure_count()
    }

    pub fn is_disabled(&self) -> bool {
        self.machine.lock().is_disabled()
    }

    pub fn status(&self) -> BreakerStatus {
        self.machine.lock().status()
    }

    /// Receive this breaker's state changes and admin events.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Force closed and zero counters.
    pub fn reset(&self) {
        let now = self.clock.now();
        self.with_machine(|m| m.reset(now));
    }

    /// Force open for `duration`.
    pub fn force_open(&self, duration: Duration) {
        let now = self.clock.now();
        self.with_machine(|m| m.force_open(now, duration));
    }

    /// Bypass admission control until [`enable`](Self::enable).
    pub fn disable(&self) {
        let now = self.clock.now();
        let mut machine = self.machine.lock();
        if machine.is_disabled() {
            return;
        }
        machine.disable();
        self.events.publish(BreakerEvent::Disabled {
            breaker: self.name.clone(),
            at: now,
        });
    }

    /// Resume admission control from a clean closed state. Returns false
    /// if the breaker was not disabled.
    pub fn enable(&self) -> bool {
        let now = self.clock.now();
        self.with_machine(|m| m.enable(now))
    }

    /// Decay a stale failure streak. Returns true if the count was reset.
    pub fn sweep(&self) -> bool {
        let now = self.clock.now();
        self.with_machine(|m| m.decay(now))
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Run `f` with exclusive access to the state machine, then publish
    /// any transitions it caused.
    ///
    /// Events are sent before the lock is released so subscribers see
    /// transitions in the order they happened.
    pub(crate) fn with_machine<R>(&self, f: impl FnOnce(&mut StateMachine) -> R) -> R {
        let mut machine = self.machine.lock();
        let before = machine.metrics().state_changes;
        let result = f(&mut machine);

        let changed = machine.metrics().state_changes.saturating_sub(before);
        if changed > 0 {
            for transition in recent_transitions(&machine, changed) {
                self.events.publish(BreakerEvent::StateChanged {
                    breaker: self.name.clone(),
                    transition,
                });
            }
        }
        result
    }
}

/// The last `count` transitions, oldest first.
fn recent_transitions(machine: &StateMachine, count: u64) -> Vec<Transition> {
    let len = machine.history().count();
    let count = usize::try_from(count).unwrap_or(usize::MAX).min(len);
    machine.history().skip(len - count).cloned().collect()
}

impl fmt::Debug for Breaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
