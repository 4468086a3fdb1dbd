//! Bounded retry with exponential backoff and cooperative abort.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rand::Rng as _;

use crate::error::Result;

/// Retry schedule for operations that are expected to succeed eventually,
/// like challenge pre-flight checks and status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Total attempts, including the first.
    pub attempts: usize,
    /// Delay before the second attempt.
    pub min_delay: Duration,
    /// Cap on the doubling delay.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            attempts: 5,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Handed to each attempt; aborting stops the schedule after the current
/// attempt instead of sleeping through the remaining ones.
#[derive(Debug, Clone, Default)]
pub struct AbortToken {
    aborted: Arc<AtomicBool>,
}

impl AbortToken {
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Run `op` until it succeeds, the schedule is exhausted, or an attempt
/// aborts. The failing attempt's error is returned unchanged.
///
/// Sleeps are jittered uniformly over the upper half of the current delay,
/// and the delay doubles per attempt up to `max_delay`.
pub(crate) async fn retry<T, F, Fut>(config: BackoffConfig, mut op: F) -> Result<T>
where
    F: FnMut(AbortToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.attempts.max(1);
    let mut delay = config.min_delay;

    for attempt in 1..=attempts {
        let token = AbortToken::default();

        match op(token.clone()).await {
            Ok(val) => return Ok(val),

            Err(err) if token.is_aborted() || attempt == attempts => return Err(err),

            Err(err) => {
                log::debug!("attempt {attempt}/{attempts} failed, retrying: {err}");
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(config.max_delay);
            }
        }
    }

    unreachable!("retry loop returns from its final attempt")
}

fn jittered(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }

    rand::thread_rng().gen_range(delay / 2..=delay)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::Error;

    fn fast_backoff(attempts: usize) -> BackoffConfig {
        BackoffConfig {
            attempts,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);

        let res = retry(fast_backoff(5), |_token| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(Error::Verification("not yet".to_owned()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(res, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_returns_the_last_error() {
        let calls = AtomicUsize::new(0);

        let err = retry::<(), _, _>(fast_backoff(3), |_token| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(Error::Verification(format!("attempt {n}"))) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            Error::Verification(msg) => assert_eq!(msg, "attempt 3"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_stops_the_schedule_immediately() {
        let calls = AtomicUsize::new(0);

        let err = retry::<(), _, _>(fast_backoff(5), |token| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                token.abort();
                Err(Error::Verification("fatal".to_owned()))
            }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::Verification(_)));
    }
}
