//! Bounded retry with exponential backoff
//!
//! Each request moves through an explicit state machine:
//!
//! Pending -> InFlight -> { Succeeded,
//!                          TransientFailure -> BackoffWait -> Pending,
//!                          PermanentFailure -> Failed }
//!
//! Attempts are issued strictly sequentially, so a request never has two
//! attempts in flight. Timing goes through a `Clock` trait so backoff policy
//! is testable without real delays.

use crate::types::{FetchAttempt, FetchOutcome, RequestDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paddock_common::config::SourceConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Per-request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    InFlight,
    BackoffWait,
    Succeeded,
    Failed,
}

/// Time source for backoff waits
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by tokio time
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Backoff and attempt-budget policy for one source
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request, first attempt included
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn from_source(config: &SourceConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_cap: Duration::from_millis(config.backoff_cap_ms),
        }
    }

    /// Delay before retrying after `failed_attempt` failed.
    ///
    /// Exponential (base * 2^(n-1)) capped at `backoff_cap`, plus up to 25%
    /// jitter so concurrent requests do not realign.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        let base_ms = self.backoff_base.as_millis() as u64;
        let delay_ms = base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap.as_millis() as u64);
        let jitter_ms = rand::thread_rng().gen_range(0..=delay_ms / 4);
        Duration::from_millis(delay_ms + jitter_ms)
    }
}

/// Terminal result for one request, with attempt bookkeeping
#[derive(Debug)]
pub struct RetryOutcome {
    pub final_state: RequestState,
    pub final_outcome: FetchOutcome,
    pub attempts: Vec<FetchAttempt>,
}

/// Drives a request through the retry state machine
pub struct RetryCoordinator<C: Clock> {
    policy: RetryPolicy,
    clock: C,
}

impl<C: Clock> RetryCoordinator<C> {
    pub fn new(policy: RetryPolicy, clock: C) -> Self {
        Self { policy, clock }
    }

    /// Run `attempt_fn` until Success, PermanentFailure, or attempt budget
    /// exhaustion. A PermanentFailure short-circuits without consuming the
    /// remaining budget; exhausted transient failures terminate in Failed.
    pub async fn run<F, Fut>(
        &self,
        request: &RequestDescriptor,
        mut attempt_fn: F,
    ) -> RetryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FetchOutcome>,
    {
        let mut attempts = Vec::new();
        let mut state = RequestState::Pending;

        for attempt_number in 1..=self.policy.max_attempts {
            state = RequestState::InFlight;
            tracing::trace!(
                url = %request.url,
                state = ?state,
                attempt = attempt_number,
                "issuing attempt"
            );
            let outcome = attempt_fn().await;

            attempts.push(FetchAttempt {
                request: request.clone(),
                attempt_number,
                outcome_label: outcome.label(),
                timestamp: self.clock.now(),
            });

            match outcome {
                FetchOutcome::Success(_) => {
                    if attempt_number > 1 {
                        tracing::info!(
                            source = %request.source_id,
                            url = %request.url,
                            attempt = attempt_number,
                            "request succeeded after retry"
                        );
                    }
                    return RetryOutcome {
                        final_state: RequestState::Succeeded,
                        final_outcome: outcome,
                        attempts,
                    };
                }
                FetchOutcome::PermanentFailure(ref reason) => {
                    tracing::warn!(
                        source = %request.source_id,
                        url = %request.url,
                        reason = %reason,
                        "permanent failure, not retrying"
                    );
                    return RetryOutcome {
                        final_state: RequestState::Failed,
                        final_outcome: outcome,
                        attempts,
                    };
                }
                FetchOutcome::TransientFailure(ref reason) => {
                    if attempt_number == self.policy.max_attempts {
                        tracing::warn!(
                            source = %request.source_id,
                            url = %request.url,
                            attempts = attempt_number,
                            reason = %reason,
                            "retry budget exhausted"
                        );
                        return RetryOutcome {
                            final_state: RequestState::Failed,
                            final_outcome: outcome,
                            attempts,
                        };
                    }

                    let delay = self.policy.backoff_delay(attempt_number);
                    tracing::debug!(
                        source = %request.source_id,
                        url = %request.url,
                        attempt = attempt_number,
                        backoff_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "transient failure, backing off"
                    );
                    state = RequestState::BackoffWait;
                    tracing::trace!(url = %request.url, state = ?state, "waiting");
                    self.clock.sleep(delay).await;
                    state = RequestState::Pending;
                }
            }
        }

        // max_attempts >= 1 is enforced by config validation, so the loop
        // always returns above.
        debug_assert!(matches!(state, RequestState::Pending));
        RetryOutcome {
            final_state: RequestState::Failed,
            final_outcome: FetchOutcome::TransientFailure("no attempts issued".to_string()),
            attempts,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Clock that records requested sleeps and returns immediately
    pub struct ManualClock {
        pub slept: Mutex<Vec<Duration>>,
    }

    impl ManualClock {
        pub fn new() -> Self {
            Self {
                slept: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }

        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::ManualClock;
    use super::*;
    use crate::types::SourceId;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_millis(8_000),
        }
    }

    fn request() -> RequestDescriptor {
        RequestDescriptor {
            source_id: SourceId::new("stub"),
            url: "http://x/a".to_string(),
            race: None,
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let coordinator = RetryCoordinator::new(policy(3), ManualClock::new());

        let result = coordinator
            .run(&request(), || async {
                FetchOutcome::Success("payload".to_string())
            })
            .await;

        assert_eq!(result.final_state, RequestState::Succeeded);
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_bounded_then_failed() {
        let coordinator = RetryCoordinator::new(policy(3), ManualClock::new());
        let calls = AtomicU32::new(0);

        let result = coordinator
            .run(&request(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { FetchOutcome::TransientFailure("503".to_string()) }
            })
            .await;

        // Retry bound: attempts == max, terminal state Failed, never Success
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.final_state, RequestState::Failed);
    }

    #[tokio::test]
    async fn test_permanent_failure_short_circuits() {
        let coordinator = RetryCoordinator::new(policy(3), ManualClock::new());
        let calls = AtomicU32::new(0);

        let result = coordinator
            .run(&request(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { FetchOutcome::PermanentFailure("404".to_string()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.final_state, RequestState::Failed);
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let coordinator = RetryCoordinator::new(policy(3), ManualClock::new());
        let calls = AtomicU32::new(0);

        let result = coordinator
            .run(&request(), || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        FetchOutcome::TransientFailure("reset".to_string())
                    } else {
                        FetchOutcome::Success("payload".to_string())
                    }
                }
            })
            .await;

        assert_eq!(result.final_state, RequestState::Succeeded);
        assert_eq!(result.attempts.len(), 3);
        assert_eq!(result.attempts[2].outcome_label, "success");
    }

    #[tokio::test]
    async fn test_backoff_is_exponential_without_real_sleeps() {
        let clock = ManualClock::new();
        let coordinator = RetryCoordinator::new(policy(4), clock);

        let _ = coordinator
            .run(&request(), || async {
                FetchOutcome::TransientFailure("503".to_string())
            })
            .await;

        let slept = coordinator.clock.slept.lock().unwrap();
        // Three backoffs for four attempts; each within [base*2^n, base*2^n * 1.25]
        assert_eq!(slept.len(), 3);
        assert!(slept[0] >= Duration::from_millis(500) && slept[0] <= Duration::from_millis(625));
        assert!(slept[1] >= Duration::from_millis(1_000) && slept[1] <= Duration::from_millis(1_250));
        assert!(slept[2] >= Duration::from_millis(2_000) && slept[2] <= Duration::from_millis(2_500));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = policy(10);
        for attempt in 1..=10 {
            let delay = policy.backoff_delay(attempt);
            // cap plus max jitter
            assert!(delay <= Duration::from_millis(10_000));
        }
    }
}
