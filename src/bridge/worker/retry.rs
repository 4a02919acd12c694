//! Bounded retry for contended sync access handles

use crate::bridge::config::SLOT_RETRY;
use crate::bridge::shared::SharedState;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Pause between failed attempts
pub trait Backoff: Send {
    fn pause(&mut self, attempt: u32, wait: Duration);
}

/// Parks the worker on the reserved `retry` slot, which nothing ever notifies
pub struct SlotBackoff {
    shared: Arc<SharedState>,
}

impl SlotBackoff {
    pub fn new(shared: Arc<SharedState>) -> Self {
        SlotBackoff { shared }
    }
}

impl Backoff for SlotBackoff {
    fn pause(&mut self, _attempt: u32, wait: Duration) {
        self.shared.control.wait(SLOT_RETRY, 0, Some(wait));
    }
}

/// Attempt ceiling and linear backoff base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    /// Wait after the `attempt`-th failure
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base * attempt
    }
}

/// All attempts failed
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last: E,
}

/// Run `attempt` until it succeeds or the policy's ceiling is reached
pub async fn acquire_with_retry<T, E, F, Fut>(
    policy: RetryPolicy,
    backoff: &mut dyn Backoff,
    what: &str,
    mut attempt: F,
) -> Result<T, RetryExhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut i = 1;
    loop {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if i >= policy.attempts => {
                return Err(RetryExhausted {
                    attempts: i,
                    last: e,
                })
            }
            Err(e) => {
                let wait = policy.delay_for(i);
                warn!(
                    "Attempt {} to acquire {} failed, waiting {:?}: {}",
                    i, what, wait, e
                );
                backoff.pause(i, wait);
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        waits: Vec<Duration>,
    }

    impl Backoff for Recorder {
        fn pause(&mut self, _attempt: u32, wait: Duration) {
            self.waits.push(wait);
        }
    }

    fn block_on<F: Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(f)
    }

    const POLICY: RetryPolicy = RetryPolicy {
        attempts: 6,
        base: Duration::from_millis(300),
    };

    #[test]
    fn test_succeeds_after_transient_failures() {
        let mut recorder = Recorder::default();
        let mut calls = 0;
        let result: Result<u32, RetryExhausted<&str>> =
            block_on(acquire_with_retry(POLICY, &mut recorder, "handle", || {
                calls += 1;
                let n = calls;
                async move {
                    if n < 3 {
                        Err("busy")
                    } else {
                        Ok(n)
                    }
                }
            }));
        assert_eq!(result.unwrap(), 3);
        assert_eq!(
            recorder.waits,
            vec![Duration::from_millis(300), Duration::from_millis(600)]
        );
    }

    #[test]
    fn test_gives_up_at_ceiling() {
        let mut recorder = Recorder::default();
        let mut calls = 0u32;
        let result: Result<(), RetryExhausted<&str>> =
            block_on(acquire_with_retry(POLICY, &mut recorder, "handle", || {
                calls += 1;
                async { Err("busy") }
            }));
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 6);
        assert_eq!(err.last, "busy");
        assert_eq!(calls, 6);
        assert_eq!(recorder.waits.len(), 5);
        assert_eq!(recorder.waits[4], Duration::from_millis(1500));
    }
}
