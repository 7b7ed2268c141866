//! Periodic decay of stale failure streaks.
//!
//! Each breaker gets a task ticking every `monitoring_period`. A tick
//! clears the failure count when the last failure is older than the
//! period, so a slow trickle of failures spread over hours never adds up
//! to a trip. State is never touched.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::breaker::Breaker;

/// Handle to a running sweep task. Dropping it stops the task.
pub struct SweepTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
    _guard: DropGuard,
}

impl SweepTask {
    /// Spawn a sweeper on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the breaker is
    /// dropped or `token` is cancelled.
    pub fn spawn(breaker: Weak<Breaker>, period: Duration, token: CancellationToken) -> Self {
        Self::spawn_on(&tokio::runtime::Handle::current(), breaker, period, token)
    }

    pub(crate) fn spawn_on(
        runtime: &tokio::runtime::Handle,
        breaker: Weak<Breaker>,
        period: Duration,
        token: CancellationToken,
    ) -> Self {
        let first_tick = Instant::now() + period;
        let handle = runtime.spawn(run(breaker, first_tick, period, token.clone()));
        Self {
            _guard: token.clone().drop_guard(),
            token,
            handle,
        }
    }

    /// Signal the task to stop.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task and wait for it to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        let SweepTask { handle, .. } = self;
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Sweep task ended abnormally");
        }
    }
}

async fn run(
    breaker: Weak<Breaker>,
    first_tick: Instant,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(breaker) = breaker.upgrade() else {
                    break;
                };
                if breaker.sweep() {
                    tracing::debug!(breaker = %breaker.name(), "Sweep reset failure streak");
                }
            }
        }
    }

    tracing::trace!("Sweep task stopped");
}
