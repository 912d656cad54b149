//! Per-source request pacing and identity rotation
//!
//! One limiter per configured source. Each permit enforces a pacing interval
//! drawn uniformly from the source's configured range plus jitter, caps the
//! number of in-flight requests, and selects the next client identity from
//! the pool round-robin. `acquire` cannot fail: it only waits.

use paddock_common::config::SourceConfig;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// Fraction of the drawn interval added as jitter (0..=10%)
const JITTER_FRACTION: f64 = 0.10;

/// Permission to issue one request
///
/// Carries the client identity to present; releases the in-flight slot on
/// drop.
pub struct Permit {
    pub identity: String,
    _in_flight: OwnedSemaphorePermit,
}

/// Pacing cursor, updated atomically under concurrent `acquire` calls
struct PacingState {
    last_request: Option<Instant>,
    identity_cursor: usize,
}

/// Token-paced gate for one source
pub struct RateLimiter {
    min_interval: Duration,
    max_interval: Duration,
    identities: Vec<String>,
    state: Mutex<PacingState>,
    in_flight: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(config: &SourceConfig) -> Self {
        Self::with_bounds(
            Duration::from_secs_f64(config.min_interval_secs),
            Duration::from_secs_f64(config.max_interval_secs),
            config.identities.clone(),
            config.max_in_flight,
        )
    }

    pub fn with_bounds(
        min_interval: Duration,
        max_interval: Duration,
        identities: Vec<String>,
        max_in_flight: usize,
    ) -> Self {
        debug_assert!(!identities.is_empty());
        Self {
            min_interval,
            max_interval,
            identities,
            state: Mutex::new(PacingState {
                last_request: None,
                identity_cursor: 0,
            }),
            in_flight: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    /// Block until the next request may be issued, then return its permit.
    ///
    /// The pacing lock is held across the wait so concurrent callers are
    /// released one interval apart, never in a burst.
    pub async fn acquire(&self) -> Permit {
        let in_flight = Arc::clone(&self.in_flight)
            .acquire_owned()
            .await
            .expect("rate limiter semaphore closed");

        let mut state = self.state.lock().await;

        if let Some(last) = state.last_request {
            let interval = self.draw_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                let wait = interval - elapsed;
                tracing::debug!(wait_ms = wait.as_millis() as u64, "pacing request");
                tokio::time::sleep(wait).await;
            }
        }
        state.last_request = Some(Instant::now());

        // Round-robin over the pool; with more than one identity this never
        // repeats the previous selection.
        let identity = self.identities[state.identity_cursor % self.identities.len()].clone();
        state.identity_cursor = state.identity_cursor.wrapping_add(1);

        Permit {
            identity,
            _in_flight: in_flight,
        }
    }

    /// Base interval drawn uniformly from the configured range, plus jitter
    fn draw_interval(&self) -> Duration {
        let mut rng = rand::thread_rng();
        let base = if self.max_interval > self.min_interval {
            rng.gen_range(self.min_interval.as_secs_f64()..=self.max_interval.as_secs_f64())
        } else {
            self.min_interval.as_secs_f64()
        };
        let jitter = base * rng.gen_range(0.0..=JITTER_FRACTION);
        Duration::from_secs_f64(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(min_ms: u64, max_ms: u64, identities: &[&str], max_in_flight: usize) -> RateLimiter {
        RateLimiter::with_bounds(
            Duration::from_millis(min_ms),
            Duration::from_millis(max_ms),
            identities.iter().map(|s| s.to_string()).collect(),
            max_in_flight,
        )
    }

    #[tokio::test]
    async fn test_first_acquire_is_immediate() {
        let limiter = limiter(200, 300, &["ua-1"], 1);

        let start = Instant::now();
        let _permit = limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_second_acquire_waits_at_least_min_interval() {
        let limiter = limiter(100, 150, &["ua-1"], 2);

        let start = Instant::now();
        drop(limiter.acquire().await);
        drop(limiter.acquire().await);

        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_identity_rotation_no_immediate_repeat() {
        let limiter = limiter(0, 0, &["ua-1", "ua-2", "ua-3"], 3);

        let a = limiter.acquire().await.identity.clone();
        let b = limiter.acquire().await.identity.clone();
        let c = limiter.acquire().await.identity.clone();
        let d = limiter.acquire().await.identity.clone();

        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(c, d);
        assert_eq!(a, d); // full cycle through pool of three
    }

    #[tokio::test]
    async fn test_in_flight_cap_blocks_overlap() {
        let limiter = Arc::new(limiter(0, 0, &["ua-1"], 1));

        let held = limiter.acquire().await;

        // Second acquire cannot complete while the first permit is held
        let second = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        drop(held);
        let _permit = second.await.unwrap();
    }

    #[test]
    fn test_drawn_interval_stays_in_bounds() {
        let limiter = limiter(100, 200, &["ua-1"], 1);

        for _ in 0..100 {
            let interval = limiter.draw_interval();
            assert!(interval >= Duration::from_millis(100));
            // max interval plus full jitter fraction
            assert!(interval <= Duration::from_millis(220));
        }
    }
}
