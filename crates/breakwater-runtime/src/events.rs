//! Breaker notifications for alerting.
//!
//! Each breaker publishes on its own broadcast channel, and breakers owned
//! by a registry also publish on the registry's channel. Slow receivers
//! lag and skip events rather than blocking the breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use breakwater_core::Transition;

/// Buffered events per channel before slow receivers start lagging.
pub const EVENT_CAPACITY: usize = 64;

/// Something an operator may want to be alerted about.
///
/// Re-enabling a breaker shows up as a `StateChanged` with reason
/// `enabled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BreakerEvent {
    StateChanged {
        breaker: String,
        transition: Transition,
    },

    /// Admission control switched off
    Disabled {
        breaker: String,
        at: DateTime<Utc>,
    },
}

impl BreakerEvent {
    /// Name of the breaker the event came from.
    pub fn breaker(&self) -> &str {
        match self {
            Self::StateChanged { breaker, .. } | Self::Disabled { breaker, .. } => breaker,
        }
    }
}

pub(crate) struct EventBus {
    local: broadcast::Sender<BreakerEvent>,
    registry: Option<broadcast::Sender<BreakerEvent>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (local, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            local,
            registry: None,
        }
    }

    pub(crate) fn forward_to(&mut self, registry: broadcast::Sender<BreakerEvent>) {
        self.registry = Some(registry);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.local.subscribe()
    }

    /// Send to every subscriber. Having none is not an error.
    pub(crate) fn publish(&self, event: BreakerEvent) {
        if let Some(registry) = &self.registry {
            let _ = registry.send(event.clone());
        }
        let _ = self.local.send(event);
    }
}
