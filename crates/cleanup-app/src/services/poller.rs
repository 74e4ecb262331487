//! Capped exponential-backoff polling of remote jobs.
//!
//! Shared by the export orchestrator (platform commands) and the execution
//! supervisor (platform executions). The caller supplies a status-fetch
//! closure; the poller owns timing, backoff, and terminal-state detection.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::services::status::RemoteState;

/// Status snapshot of a remote job as seen by the poller.
pub trait RemoteProgress {
    fn state(&self) -> RemoteState;
    /// Remote completion percentage in `[0, 100]`.
    fn progress(&self) -> u8;
    /// Raw status string as reported by the platform.
    fn raw_status(&self) -> &str;
}

/// Timing parameters for one poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Hard ceiling on the whole loop.
    pub timeout: Duration,
    /// Sleep after the n-th unfinished status is `backoff_base * 2^n`.
    pub backoff_base: Duration,
    /// Cap on a single sleep.
    pub max_sleep: Duration,
}

impl PollPolicy {
    pub const fn new(timeout: Duration, backoff_base: Duration, max_sleep: Duration) -> Self {
        Self {
            timeout,
            backoff_base,
            max_sleep,
        }
    }

    fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        // Attempts count from one, so the first sleep is already `2 * base`.
        ExponentialBuilder::default()
            .with_min_delay(self.backoff_base.saturating_mul(2))
            .with_factor(2.0)
            .with_max_delay(self.max_sleep)
            .with_max_times(usize::MAX)
            .build()
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2 * 60 * 60),
            backoff_base: Duration::from_secs(1),
            max_sleep: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError<E: std::error::Error + 'static> {
    #[error("timed out after {elapsed:?} at {progress}% (last status `{raw}`)")]
    Timeout {
        elapsed: Duration,
        progress: u8,
        raw: String,
    },
    #[error("remote job reported `{raw}` at {progress}%")]
    RemoteFailure { raw: String, progress: u8 },
    #[error("{source}")]
    Fetch {
        #[source]
        source: E,
        /// Progress of the last status that was read successfully.
        progress: u8,
    },
}

/// Poll `fetch` until the remote job reaches a terminal state or the policy
/// timeout elapses. Returns the final successful status.
///
/// A fetch error aborts the loop immediately; retrying transport failures is
/// the fetch implementation's concern.
pub async fn poll<T, E, F, Fut>(policy: &PollPolicy, mut fetch: F) -> Result<T, PollError<E>>
where
    T: RemoteProgress,
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut delays = policy.delays();
    let mut attempt: u32 = 0;
    let mut last_progress: u8 = 0;
    let mut last_raw = String::new();

    while started.elapsed() < policy.timeout {
        attempt = attempt.saturating_add(1);
        let status = fetch().await.map_err(|source| PollError::Fetch {
            source,
            progress: last_progress,
        })?;
        last_progress = status.progress().min(100);
        last_raw.clear();
        last_raw.push_str(status.raw_status());

        let state = status.state();
        if state.is_terminal() {
            if state.is_success() {
                return Ok(status);
            }
            return Err(PollError::RemoteFailure {
                raw: last_raw,
                progress: last_progress,
            });
        }

        let elapsed = started.elapsed();
        let Some(remaining) = policy.timeout.checked_sub(elapsed) else {
            break;
        };
        let step = delays
            .next()
            .unwrap_or(policy.max_sleep)
            .min(policy.max_sleep)
            .min(remaining);
        debug!(
            attempt,
            elapsed_ms = elapsed.as_millis() as u64,
            sleep_ms = step.as_millis() as u64,
            status = %last_raw,
            progress = last_progress,
            "remote job still running"
        );
        sleep(step).await;
    }

    Err(PollError::Timeout {
        elapsed: started.elapsed(),
        progress: last_progress,
        raw: last_raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Scripted {
        raw: &'static str,
        progress: u8,
    }

    impl RemoteProgress for Scripted {
        fn state(&self) -> RemoteState {
            RemoteState::parse(self.raw).expect("scripted statuses are known")
        }

        fn progress(&self) -> u8 {
            self.progress
        }

        fn raw_status(&self) -> &str {
            self.raw
        }
    }

    #[derive(Debug, Error)]
    #[error("transport down")]
    struct TransportDown;

    struct Script {
        steps: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<Instant>>,
    }

    impl Script {
        fn new(steps: &[(&'static str, u8)]) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(
                    steps
                        .iter()
                        .map(|&(raw, progress)| Scripted { raw, progress })
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn next(&self) -> Scripted {
            self.calls.lock().unwrap().push(Instant::now());
            let mut steps = self.steps.lock().unwrap();
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap()
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let calls = self.calls.lock().unwrap();
            calls.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    fn policy(timeout_secs: u64) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(timeout_secs),
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn returns_final_status_on_success() {
        let script = Script::new(&[("created", 0), ("in-progress", 40), ("success", 100)]);
        let s = Arc::clone(&script);

        let result = poll(&policy(600), || {
            let s = Arc::clone(&s);
            async move { Ok::<_, TransportDown>(s.next()) }
        })
        .await
        .expect("poll succeeds");

        assert_eq!(result.raw, "success");
        assert_eq!(script.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_grow_exponentially_and_cap_at_max_sleep() {
        let mut steps: Vec<(&'static str, u8)> = vec![("in-progress", 10); 6];
        steps.push(("success", 100));
        let script = Script::new(&steps);
        let s = Arc::clone(&script);

        poll(&policy(3600), || {
            let s = Arc::clone(&s);
            async move { Ok::<_, TransportDown>(s.next()) }
        })
        .await
        .expect("poll succeeds");

        let secs: Vec<u64> = script.gaps().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![2, 4, 8, 10, 10, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_failure_carries_raw_status() {
        let script = Script::new(&[("in-progress", 30), ("failed", 35)]);
        let s = Arc::clone(&script);

        let err = poll(&policy(600), || {
            let s = Arc::clone(&s);
            async move { Ok::<_, TransportDown>(s.next()) }
        })
        .await
        .unwrap_err();

        match err {
            PollError::RemoteFailure { raw, progress } => {
                assert_eq!(raw, "failed");
                assert_eq!(progress, 35);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_last_observed_progress() {
        let script = Script::new(&[("in-progress", 12)]);
        let s = Arc::clone(&script);

        let err = poll(&policy(30), || {
            let s = Arc::clone(&s);
            async move { Ok::<_, TransportDown>(s.next()) }
        })
        .await
        .unwrap_err();

        match err {
            PollError::Timeout {
                elapsed,
                progress,
                raw,
            } => {
                assert_eq!(progress, 12);
                assert_eq!(raw, "in-progress");
                assert_eq!(elapsed, Duration::from_secs(30));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Fetches at t = 0, 2, 6, 14, 24; the final sleep is clipped to the deadline.
        assert_eq!(script.calls.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_errors_abort_immediately() {
        let calls = Arc::new(Mutex::new(0_u32));
        let c = Arc::clone(&calls);

        let err = poll::<Scripted, _, _, _>(&policy(600), || {
            let c = Arc::clone(&c);
            async move {
                *c.lock().unwrap() += 1;
                Err(TransportDown)
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::Fetch { source: TransportDown, .. }));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn delay_sequence_never_exceeds_max_sleep() {
        let policy = PollPolicy::new(
            Duration::from_secs(60),
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        assert!(
            policy
                .delays()
                .take(200)
                .all(|d| d.min(policy.max_sleep) <= Duration::from_secs(10))
        );
    }
}
