//! Bounded retry for output delivery.

use std::{future::Future, time::Duration};

use {
    serde::{Deserialize, Serialize},
    switchyard_common::{Error, Result},
    tracing::{debug, warn},
    url::Url,
};

/// How often, and how patiently, an output adapter retries a failed delivery.
///
/// `max_retries` is the total number of delivery attempts, with `0` meaning a
/// single attempt. `wait_interval_secs` separates consecutive attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub wait_interval_secs: u64,
    /// Where an envelope goes once retries are exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_delivery_address: Option<Url>,
}

/// Result of a failed [`RetryPolicy::execute`] run.
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: Error,
}

impl RetryPolicy {
    /// A policy that tries once and never forwards.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(max_retries: u32, wait_interval_secs: u64) -> Self {
        Self {
            max_retries,
            wait_interval_secs,
            failure_delivery_address: None,
        }
    }

    #[must_use]
    pub fn with_failure_address(mut self, address: Url) -> Self {
        self.failure_delivery_address = Some(address);
        self
    }

    /// Total number of attempts this policy allows.
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }

    /// Run `op` until it succeeds or the policy is exhausted. `op` receives the
    /// 1-based attempt number. Permanent errors end the run immediately.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> std::result::Result<(T, u32), RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(last_error) if last_error.is_permanent() => {
                    warn!(attempt, error = %last_error, "delivery failed permanently, not retrying");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error,
                    });
                },
                Err(last_error) if attempt >= attempts => {
                    warn!(attempt, error = %last_error, "delivery attempts exhausted");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error,
                    });
                },
                Err(error) => {
                    debug!(
                        attempt,
                        of = attempts,
                        wait_secs = self.wait_interval_secs,
                        error = %error,
                        "delivery attempt failed, retrying"
                    );
                    if self.wait_interval_secs > 0 {
                        tokio::time::sleep(self.wait_interval()).await;
                    }
                    attempt += 1;
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        rstest::rstest,
        std::sync::atomic::{AtomicU32, Ordering},
    };

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(3, 3)]
    fn attempts_are_bounded(#[case] max_retries: u32, #[case] expected: u32) {
        assert_eq!(RetryPolicy::new(max_retries, 0).attempts(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_runs_every_attempt() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 5);
        let started = tokio::time::Instant::now();
        let err = policy
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::message("refused")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempts, 3);
        // Two waits between three attempts.
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn zero_retries_tries_once() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::none()
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::message("refused")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn codec_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let err = RetryPolicy::new(5, 30)
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::codec("no serializer registered for Opaque")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.last_error, Error::Codec { .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn succeeds_on_later_attempt() {
        let (value, attempt) = RetryPolicy::new(4, 0)
            .execute(|attempt| async move {
                if attempt < 3 {
                    Err(Error::message("not yet"))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();
        assert_eq!((value, attempt), (30, 3));
    }

    #[test]
    fn deserializes_with_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"failure_delivery_address":"log://dead?level=error"}"#)
                .unwrap();
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.attempts(), 1);
        assert_eq!(
            policy.failure_delivery_address.unwrap().scheme(),
            "log"
        );
    }
}
