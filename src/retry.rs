//! Backoff, timeouts, and the retry loop shared by both external clients.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use crate::classify::{ClientError, classify};

/// Calculate the delay before the next attempt.
///
/// `attempt` is the 1-based attempt that just failed. The exponent is capped
/// at 3, a linear component grows with the attempt number, and up to 250 ms of
/// jitter is added so concurrent workers spread out.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let attempt = attempt.max(1);
    let exponent = (attempt - 1).min(3);
    let scaled = base.saturating_mul(2_u32.saturating_pow(exponent));
    let linear = Duration::from_millis(u64::from(attempt) * 500);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
    scaled + linear + jitter
}

/// Run `fut` under a deadline, mapping expiry to a distinguished error.
///
/// The underlying I/O is not cancelled by contract; dropping the future is
/// the best we can do on this transport.
pub async fn with_timeout<T>(
    fut: impl Future<Output = Result<T, ClientError>>,
    limit: Duration,
    label: &'static str,
) -> Result<T, ClientError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ClientError::Timeout {
            label,
            ms: limit.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

/// Hooks the phases use to mirror retry progress into job and item state
/// (attempt counters, "Retrying … in Xs" narration, lease refresh during
/// throttle waits). Implementations must tolerate being called often; all
/// methods are best-effort.
#[async_trait]
pub trait RetryObserver: Send + Sync {
    async fn on_attempt(&self, attempt: u32);
    async fn on_retry(&self, wait: Duration, reason: &str);
    async fn on_throttle(&self, wait: Duration);
}

pub struct NoopObserver;

#[async_trait]
impl RetryObserver for NoopObserver {
    async fn on_attempt(&self, _attempt: u32) {}
    async fn on_retry(&self, _wait: Duration, _reason: &str) {}
    async fn on_throttle(&self, _wait: Duration) {}
}

// Terminal states are the two `return`s in the loop below.
enum RetryState {
    Calling { attempt: u32 },
    Classifying { attempt: u32, error: ClientError },
    Sleeping { attempt: u32, wait: Duration, reason: String },
}

/// Drive `op` through `Calling → Classifying → Sleeping → Calling …` until it
/// succeeds, fails permanently, or exhausts the policy. The final error of an
/// exhausted transient chain is returned as-is so the caller can classify it
/// for the stored message.
pub async fn run_with_retry<T, F, Fut>(
    policy: RetryPolicy,
    observer: &dyn RetryObserver,
    label: &'static str,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut state = RetryState::Calling { attempt: 1 };
    loop {
        state = match state {
            RetryState::Calling { attempt } => {
                observer.on_attempt(attempt).await;
                match op(attempt).await {
                    Ok(value) => return Ok(value),
                    Err(error) => RetryState::Classifying { attempt, error },
                }
            }
            RetryState::Classifying { attempt, error } => {
                let classification = classify(&error);
                if !classification.transient || attempt >= policy.max_attempts {
                    return Err(error);
                }
                let backoff = backoff_delay(attempt, policy.backoff_base);
                let wait = backoff.max(classification.retry_after.unwrap_or(Duration::ZERO));
                debug!(%label, attempt, wait_ms = wait.as_millis() as u64, "transient failure, will retry");
                RetryState::Sleeping {
                    attempt,
                    wait,
                    reason: classification.user_message,
                }
            }
            RetryState::Sleeping { attempt, wait, reason } => {
                observer.on_retry(wait, &reason).await;
                sleep(wait).await;
                RetryState::Calling { attempt: attempt + 1 }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_progression() {
        let base = Duration::from_millis(1000);

        // attempt 1: 1000 + 500 + jitter
        let d1 = backoff_delay(1, base);
        assert!(d1 >= Duration::from_millis(1500) && d1 < Duration::from_millis(1750));

        // attempt 2: 2000 + 1000 + jitter
        let d2 = backoff_delay(2, base);
        assert!(d2 >= Duration::from_millis(3000) && d2 < Duration::from_millis(3250));

        // attempt 4 and beyond share the capped exponent
        let d4 = backoff_delay(4, base);
        assert!(d4 >= Duration::from_millis(10_000) && d4 < Duration::from_millis(10_250));
        let d9 = backoff_delay(9, base);
        assert!(d9 >= Duration::from_millis(12_500) && d9 < Duration::from_millis(12_750));
    }

    #[tokio::test]
    async fn timeout_yields_distinguished_error() {
        let result: Result<(), ClientError> = with_timeout(
            async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
            "slow op",
        )
        .await;

        match result {
            Err(ClientError::Timeout { label, ms }) => {
                assert_eq!(label, "slow op");
                assert_eq!(ms, 10);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    struct CountingObserver {
        attempts: AtomicU32,
        retries: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RetryObserver for CountingObserver {
        async fn on_attempt(&self, _attempt: u32) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_retry(&self, _wait: Duration, reason: &str) {
            self.retries.lock().unwrap().push(reason.to_string());
        }
        async fn on_throttle(&self, _wait: Duration) {}
    }

    fn tiny_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_errors_retry_until_success() {
        let observer = CountingObserver {
            attempts: AtomicU32::new(0),
            retries: Mutex::new(Vec::new()),
        };
        let calls = AtomicU32::new(0);

        let result = run_with_retry(tiny_policy(), &observer, "test", |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ClientError::Http {
                        status: 503,
                        message: "unavailable".to_string(),
                        retry_after: None,
                    })
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(observer.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(observer.retries.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ClientError> =
            run_with_retry(tiny_policy(), &NoopObserver, "test", |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ClientError::Http {
                        status: 401,
                        message: "denied".to_string(),
                        retry_after: None,
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_escalate_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ClientError> =
            run_with_retry(tiny_policy(), &NoopObserver, "test", |_attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ClientError::Network("reset by peer".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
