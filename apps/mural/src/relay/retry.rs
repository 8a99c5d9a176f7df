use rand::Rng;
use std::future::Future;
use std::time::Duration;

use super::RelayError;

/// Backoff curve for relay calls. Delays grow as `base * factor^(n-1)` up to
/// `cap`, with `jitter` as a symmetric fractional spread.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(400),
            factor: 2.0,
            jitter: 0.2,
            cap: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    /// Delay after `attempt` (1-based) has failed. `roll` is the jitter
    /// sample in [-1, 1]. A server-provided Retry-After wins over the curve
    /// and is used verbatim.
    pub fn delay_after(&self, attempt: u32, retry_after: Option<Duration>, roll: f64) -> Duration {
        if let Some(retry_after) = retry_after {
            return retry_after;
        }
        let exp = self.base.as_millis() as f64 * self.factor.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jittered = capped * (1.0 + self.jitter * roll.clamp(-1.0, 1.0));
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Drives `op` until it succeeds or the attempts run out; fatal errors end
/// the loop early. The attempt number passed to `op` is 1-based.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RelayError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RelayError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_fatal() || attempt >= policy.max_attempts {
            return Err(err);
        }
        let roll = rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = policy.delay_after(attempt, err.retry_after(), roll);
        tracing::debug!(
            target: "mural::relay",
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "{label} failed; backing off"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    fn unavailable() -> RelayError {
        RelayError::Unavailable { retry_after: None }
    }

    #[test]
    fn delays_double_until_the_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_after(1, None, 0.0), Duration::from_millis(400));
        assert_eq!(policy.delay_after(2, None, 0.0), Duration::from_millis(800));
        assert_eq!(policy.delay_after(3, None, 0.0), Duration::from_millis(1600));
        assert_eq!(policy.delay_after(4, None, 0.0), Duration::from_millis(3200));
        assert_eq!(policy.delay_after(10, None, 0.0), Duration::from_secs(15));
    }

    #[test]
    fn jitter_spreads_the_delay_symmetrically() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1, None, 1.0), Duration::from_millis(480));
        assert_eq!(policy.delay_after(1, None, -1.0), Duration::from_millis(320));
        // Rolls outside [-1, 1] are clamped.
        assert_eq!(policy.delay_after(1, None, 9.0), Duration::from_millis(480));
    }

    #[test]
    fn retry_after_overrides_the_curve() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_after(1, Some(Duration::from_secs(5)), 1.0),
            Duration::from_secs(5)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = retry_with_backoff(&no_jitter(), "test-op", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(unavailable())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 400ms + 800ms of backoff under paused time.
        assert_eq!(started.elapsed(), Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_immediately_on_identity_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&no_jitter(), "test-op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RelayError::BadToken) }
        })
        .await;
        assert!(matches!(result, Err(RelayError::BadToken)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&no_jitter(), "test-op", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(unavailable()) }
        })
        .await;
        assert!(matches!(result, Err(RelayError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn honors_server_retry_after() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result = retry_with_backoff(&no_jitter(), "test-op", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Err(RelayError::RateLimited {
                        retry_after: Some(Duration::from_secs(5)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }
}
