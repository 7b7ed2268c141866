//! Operation executor: admission control and outcome recording.
//!
//! # Execution Flow
//! 1. Ask the breaker for admission (may move Open → HalfOpen)
//! 2. Denied: return [`ExecutionError::Denied`] without running the operation
//! 3. Run the operation, timing it (bounded by `call_timeout` if set)
//! 4. Record the outcome; the operation's own error is returned unchanged
//!
//! A disabled breaker skips steps 1, 2 and 4 and just runs the operation.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use breakwater_core::{Admission, AdmissionDenied, OperationOutcome, StateMachine};

use crate::breaker::Breaker;

/// Errors from [`Breaker::execute`].
#[derive(Error, Debug)]
pub enum ExecutionError<E> {
    /// The breaker refused the call; the operation never ran
    #[error(transparent)]
    Denied(#[from] AdmissionDenied),

    /// The operation exceeded the breaker's call timeout
    #[error("operation on breaker '{breaker}' timed out after {timeout:?}")]
    TimedOut { breaker: String, timeout: Duration },

    /// The operation's own error, untouched
    #[error(transparent)]
    Operation(E),
}

impl<E> ExecutionError<E> {
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Denied(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn denied(&self) -> Option<&AdmissionDenied> {
        match self {
            Self::Denied(denied) => Some(denied),
            _ => None,
        }
    }

    /// The operation's error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Releases a single-probe permit if the probe is abandoned mid-flight.
struct ProbePermit<'a> {
    breaker: Option<&'a Breaker>,
}

impl<'a> ProbePermit<'a> {
    fn new(breaker: &'a Breaker, admission: Admission) -> Self {
        Self {
            breaker: (admission == Admission::Probe).then_some(breaker),
        }
    }

    fn is_probe(&self) -> bool {
        self.breaker.is_some()
    }

    /// Outcome recorded; the permit was released under the same lock.
    fn disarm(mut self) {
        self.breaker = None;
    }
}

impl Drop for ProbePermit<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker {
            breaker.with_machine(|m| m.release_probe());
        }
    }
}

impl Breaker {
    /// Run `operation` under this breaker.
    ///
    /// # Errors
    /// - [`ExecutionError::Denied`] while open and before the recovery deadline
    /// - [`ExecutionError::TimedOut`] if a call timeout is configured and elapses
    /// - [`ExecutionError::Operation`] with the operation's own error
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ExecutionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = match self.with_machine(|m| m.try_admit(self.clock().now())) {
            Ok(admission) => admission,
            Err(denied) => {
                tracing::debug!(
                    breaker = %self.name(),
                    state = %denied.state,
                    next_attempt = ?denied.next_attempt,
                    "Call short-circuited"
                );
                return Err(denied.into());
            }
        };

        if admission == Admission::Bypass {
            return operation().await.map_err(ExecutionError::Operation);
        }

        let permit = ProbePermit::new(self, admission);
        if permit.is_probe() {
            tracing::info!(breaker = %self.name(), "Admitting recovery probe");
        }

        let started = Instant::now();
        let result = match self.config().call_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => {
                    let elapsed = started.elapsed();
                    self.finish(permit, |m, now| m.record_timeout(now, elapsed));
                    tracing::warn!(
                        breaker = %self.name(),
                        timeout = ?limit,
                        "Operation timed out"
                    );
                    return Err(ExecutionError::TimedOut {
                        breaker: self.name().to_string(),
                        timeout: limit,
                    });
                }
            },
            None => operation().await,
        };
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                let outcome = OperationOutcome::success(elapsed);
                let slow = self.finish(permit, |m, now| m.record(now, &outcome));
                if slow {
                    tracing::warn!(
                        breaker = %self.name(),
                        duration_ms = outcome.duration_ms(),
                        threshold = ?self.config().slow_call_threshold,
                        "Slow operation"
                    );
                }
                Ok(value)
            }
            Err(e) => {
                let outcome = OperationOutcome::failure(elapsed);
                self.finish(permit, |m, now| m.record(now, &outcome));
                tracing::debug!(
                    breaker = %self.name(),
                    duration_ms = outcome.duration_ms(),
                    "Operation failed"
                );
                Err(ExecutionError::Operation(e))
            }
        }
    }

    /// Like [`execute`](Self::execute), but hands any error to `fallback`.
    ///
    /// The fallback sees denials, timeouts and operation errors alike and
    /// decides per error: return `Ok` to answer the call, or `Err` (usually
    /// the error it was given) to let it through. Fallback results are not
    /// recorded against the breaker.
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(
        &self,
        operation: F,
        fallback: G,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(ExecutionError<E>) -> GFut,
        GFut: Future<Output = Result<T, ExecutionError<E>>>,
    {
        let err = match self.execute(operation).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        self.with_machine(|m| m.record_fallback());
        tracing::debug!(
            breaker = %self.name(),
            denied = err.is_denied(),
            timed_out = err.is_timeout(),
            "Running fallback"
        );
        fallback(err).await
    }

    /// Record an outcome and release any probe permit in one critical section.
    fn finish<R>(
        &self,
        permit: ProbePermit<'_>,
        record: impl FnOnce(&mut StateMachine, DateTime<Utc>) -> R,
    ) -> R {
        let probe = permit.is_probe();
        let result = self.with_machine(|m| {
            let result = record(m, self.clock().now());
            if probe {
                m.release_probe();
            }
            result
        });
        permit.disarm();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use breakwater_core::{BreakerConfig, CircuitState, ProbePolicy};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Error, PartialEq)]
    enum DbError {
        #[error("connection refused")]
        ConnectionRefused,
        #[error("row {0} not found")]
        NotFound(u32),
    }

    fn scenario_config() -> BreakerConfig {
        BreakerConfig::default()
            .with_failure_threshold(3)
            .with_recovery_timeout(Duration::from_millis(30_000))
            .with_success_threshold(2)
            .with_monitoring_period(Duration::from_millis(60_000))
    }

    fn breaker(config: BreakerConfig) -> (Breaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_millis(0));
        let breaker = Breaker::new("database", config, clock.clone()).unwrap();
        (breaker, clock)
    }

    async fn ok(b: &Breaker) -> Result<u32, ExecutionError<DbError>> {
        b.execute(|| async { Ok(7) }).await
    }

    async fn fail(b: &Breaker) -> Result<u32, ExecutionError<DbError>> {
        b.execute(|| async { Err(DbError::ConnectionRefused) }).await
    }

    #[tokio::test]
    async fn test_returns_value_and_operation_error() {
        let (b, _) = breaker(scenario_config());

        assert_eq!(ok(&b).await.unwrap(), 7);

        let err = b
            .execute(|| async { Err::<(), _>(DbError::NotFound(42)) })
            .await
            .unwrap_err();
        assert!(!err.is_denied());
        assert_eq!(err.to_string(), "row 42 not found");
        assert_eq!(err.into_operation(), Some(DbError::NotFound(42)));
        assert_eq!(b.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_scenario_trip_on_sixth_call() {
        let (b, clock) = breaker(scenario_config());

        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.failure_count(), 2);
        ok(&b).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);

        clock.set_millis(1000);
        let err = fail(&b).await.unwrap_err();
        assert!(!err.is_denied());
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(
            b.status().next_attempt.map(|t| t.timestamp_millis()),
            Some(31_000)
        );
    }

    async fn tripped_at_1000() -> (Breaker, Arc<ManualClock>) {
        let (b, clock) = breaker(scenario_config());
        clock.set_millis(1000);
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        assert_eq!(b.state(), CircuitState::Open);
        (b, clock)
    }

    #[tokio::test]
    async fn test_fail_fast_never_invokes_operation() {
        let (b, clock) = tripped_at_1000().await;
        let calls = AtomicUsize::new(0);

        for t in [1000, 10_000, 30_999] {
            clock.set_millis(t);
            let err = b
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, DbError>(())
                })
                .await
                .unwrap_err();
            let denied = err.denied().unwrap();
            assert_eq!(denied.breaker, "database");
            assert_eq!(denied.state, CircuitState::Open);
            assert_eq!(denied.next_attempt.map(|t| t.timestamp_millis()), Some(31_000));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.status().metrics.short_circuited_calls, 3);
    }

    #[tokio::test]
    async fn test_probe_runs_once_then_recovers() {
        let (b, clock) = tripped_at_1000().await;
        let calls = AtomicUsize::new(0);

        clock.set_millis(31_500);
        b.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert_eq!(b.status().success_count, 1);

        clock.set_millis(32_000);
        ok(&b).await.unwrap();
        let status = b.status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(status.success_count, 0);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let (b, clock) = tripped_at_1000().await;

        clock.set_millis(31_500);
        let err = fail(&b).await.unwrap_err();
        assert_eq!(err.into_operation(), Some(DbError::ConnectionRefused));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(
            b.status().next_attempt.map(|t| t.timestamp_millis()),
            Some(61_500)
        );
        assert!(fail(&b).await.unwrap_err().is_denied());
    }

    #[tokio::test]
    async fn test_unlimited_policy_admits_racing_probes() {
        let (b, clock) = tripped_at_1000().await;
        clock.set_millis(31_000);

        let barrier = tokio::sync::Barrier::new(2);
        let probe = || async {
            barrier.wait().await;
            Ok::<_, DbError>(())
        };

        let (first, second) = tokio::join!(b.execute(probe), b.execute(probe));
        assert!(first.is_ok());
        assert!(second.is_ok());
        // Two concurrent probes both counted toward recovery
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_probe_policy_denies_racing_probe() {
        let (b, clock) = breaker(scenario_config().with_probe_policy(ProbePolicy::Single));
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        clock.set_millis(30_000);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = b.execute(|| async move {
            rx.await.ok();
            Ok::<_, DbError>(1)
        });
        let second = async {
            let result = ok(&b).await;
            tx.send(()).ok();
            result
        };

        let (first, second) = tokio::join!(first, second);
        assert_eq!(first.unwrap(), 1);
        let err = second.unwrap_err();
        let denied = err.denied().unwrap();
        assert_eq!(denied.state, CircuitState::HalfOpen);
        assert!(denied.next_attempt.is_none());

        // The permit was released, so the next probe is admitted
        ok(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dropped_probe_releases_permit() {
        let (b, clock) = breaker(scenario_config().with_probe_policy(ProbePolicy::Single));
        for _ in 0..3 {
            fail(&b).await.unwrap_err();
        }
        clock.set_millis(30_000);

        let abandoned = b
            .execute(|| futures::future::pending::<Result<(), DbError>>())
            .now_or_never();
        assert!(abandoned.is_none());
        assert_eq!(b.state(), CircuitState::HalfOpen);

        ok(&b).await.unwrap();
        assert_eq!(b.status().success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_success_counts_but_does_not_fail() {
        let (b, _) = breaker(scenario_config());

        b.execute(|| async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            Ok::<_, DbError>(())
        })
        .await
        .unwrap();

        let status = b.status();
        assert_eq!(status.metrics.slow_calls, 1);
        assert_eq!(status.metrics.successful_calls, 1);
        assert_eq!(status.failure_count, 0);
        assert!(status.metrics.max_response_ms.unwrap() >= 2500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_counts_as_failure() {
        let config = scenario_config()
            .with_failure_threshold(1)
            .with_call_timeout(Duration::from_millis(100));
        let (b, _) = breaker(config);

        let err = b
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, DbError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(
            err.to_string(),
            "operation on breaker 'database' timed out after 100ms"
        );
        let status = b.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.metrics.timed_out_calls, 1);
        assert_eq!(status.metrics.failed_calls, 1);
    }

    #[derive(Debug, Error)]
    enum QueryError {
        #[error("query failed")]
        Db(#[from] DbError),
    }

    #[tokio::test]
    async fn test_operation_error_keeps_its_source_chain() {
        use std::error::Error as _;

        let (b, _) = breaker(scenario_config());
        let err = b
            .execute(|| async { Err::<(), _>(QueryError::from(DbError::NotFound(7))) })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "query failed");
        assert_eq!(err.source().map(|e| e.to_string()).as_deref(), Some("row 7 not found"));
    }

    #[tokio::test]
    async fn test_fallback_answers_denied_calls() {
        let (b, _) = tripped_at_1000().await;
        let calls = AtomicUsize::new(0);

        let value = b
            .execute_with_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, DbError>(1)
                },
                |err| async move {
                    assert!(err.is_denied());
                    Ok::<_, ExecutionError<DbError>>(0)
                },
            )
            .await
            .unwrap();

        assert_eq!(value, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(b.status().metrics.fallback_calls, 1);
    }

    #[tokio::test]
    async fn test_fallback_can_decline_and_failure_still_counts() {
        let (b, _) = breaker(scenario_config());

        let err = b
            .execute_with_fallback(
                || async { Err::<u32, _>(DbError::NotFound(3)) },
                |err| async move {
                    match err {
                        ExecutionError::Operation(DbError::ConnectionRefused) => Ok::<u32, _>(0),
                        other => Err(other),
                    }
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.into_operation(), Some(DbError::NotFound(3)));
        let status = b.status();
        assert_eq!(status.failure_count, 1);
        assert_eq!(status.metrics.fallback_calls, 1);

        // Successes never reach the fallback
        let value = b
            .execute_with_fallback(|| async { Ok::<_, DbError>(5) }, |_| async {
                Ok::<_, ExecutionError<DbError>>(0)
            })
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert_eq!(b.status().metrics.fallback_calls, 1);
    }

    #[tokio::test]
    async fn test_disabled_breaker_runs_without_recording() {
        let (b, clock) = tripped_at_1000().await;
        b.disable();

        clock.set_millis(2_000);
        assert_eq!(ok(&b).await.unwrap(), 7);
        let err = fail(&b).await.unwrap_err();
        assert_eq!(err.into_operation(), Some(DbError::ConnectionRefused));

        let status = b.status();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.metrics.bypassed_calls, 2);
        assert_eq!(status.metrics.successful_calls, 0);
        assert_eq!(status.metrics.failed_calls, 3);

        assert!(b.enable());
        assert_eq!(ok(&b).await.unwrap(), 7);
        assert_eq!(b.status().metrics.successful_calls, 1);
    }
}
