//! Restart controller with a cyclic backoff schedule
//!
//! A worker run is classified by how long it lived: runs shorter than the
//! failure delta advance a cursor through the wait schedule, runs that held
//! the tunnel for at least the delta reset it. A worker that returns an
//! error stops the loop immediately; clean returns are resumed after the
//! scheduled wait, which is how an idle-timeout eviction turns into a
//! reconnect.

use std::future::Future;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProxyError;

/// Restart policy for the client tunnel loop
#[derive(Debug, Clone)]
pub struct RestartConfig {
    /// Ordered waits applied between failed runs, cycled by the cursor
    pub wait_schedule: Vec<std::time::Duration>,

    /// Runs shorter than this count as failures and advance the cursor
    pub failure_delta: std::time::Duration,

    /// Abort with [`ProxyError::MaxRestarts`] once consecutive failures
    /// exhaust the schedule; `false` keeps retrying at the last slot
    pub max_restarts: bool,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            wait_schedule: [1, 2, 4, 8, 10]
                .into_iter()
                .map(std::time::Duration::from_secs)
                .collect(),
            failure_delta: std::time::Duration::from_secs(10),
            max_restarts: true,
        }
    }
}

/// Run `work` until it errors, the schedule is exhausted, or cancellation
///
/// Each iteration hands the worker a child token of `cancel` and a flag that
/// is true only on the very first attempt. Between iterations the controller
/// waits the scheduled slot, racing the wait against cancellation.
///
/// # Errors
///
/// Returns the worker's error as-is, [`ProxyError::MaxRestarts`] when
/// consecutive short runs use up the schedule (and the policy says to
/// abort), [`ProxyError::Cancelled`] when cancellation fires during a wait,
/// or [`ProxyError::EmptyWaitSchedule`] for a misconfigured schedule.
pub async fn restart_until_err<F, Fut>(
    cancel: &CancellationToken,
    mut work: F,
    config: &RestartConfig,
) -> Result<(), ProxyError>
where
    F: FnMut(CancellationToken, bool) -> Fut,
    Fut: Future<Output = Result<(), ProxyError>>,
{
    if config.wait_schedule.is_empty() {
        return Err(ProxyError::EmptyWaitSchedule);
    }

    let mut failed = 0usize;
    let mut first = true;
    loop {
        let started = Instant::now();
        work(cancel.child_token(), first).await?;
        let elapsed = started.elapsed();

        if elapsed < config.failure_delta {
            debug!(?elapsed, slot = failed, "run classified as failed");
            wait_or_cancelled(cancel, config.wait_schedule[failed]).await?;
            failed += 1;
            if failed == config.wait_schedule.len() {
                if config.max_restarts {
                    return Err(ProxyError::MaxRestarts);
                }
                failed -= 1;
            }
        } else {
            failed = 0;
            wait_or_cancelled(cancel, config.wait_schedule[0]).await?;
        }
        first = false;
    }
}

/// Sleep for the scheduled slot unless cancellation wins the race
async fn wait_or_cancelled(
    cancel: &CancellationToken,
    wait: std::time::Duration,
) -> Result<(), ProxyError> {
    tokio::select! {
        () = cancel.cancelled() => Err(ProxyError::Cancelled),
        () = tokio::time::sleep(wait) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    fn micro_schedule(max_restarts: bool) -> RestartConfig {
        RestartConfig {
            wait_schedule: vec![Duration::from_micros(1); 5],
            failure_delta: Duration::from_secs(3600),
            max_restarts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_flag_passed() {
        let cancel = CancellationToken::new();
        let got_first = AtomicBool::new(false);

        let _ = restart_until_err(
            &cancel,
            |_, first| {
                got_first.fetch_or(first, Ordering::SeqCst);
                async { Ok(()) }
            },
            &RestartConfig {
                wait_schedule: vec![Duration::ZERO],
                failure_delta: Duration::from_secs(3600),
                max_restarts: true,
            },
        )
        .await;

        assert!(got_first.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_worker_error() {
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let err = restart_until_err(
            &cancel,
            |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProxyError::Io(io::Error::other("boom"))) }
            },
            &micro_schedule(true),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::Io(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_restarts_after_exhausting_schedule() {
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        // An instantly-returning worker fails every classification; one run
        // per schedule slot, then the controller gives up.
        let err = restart_until_err(
            &cancel,
            |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            &micro_schedule(true),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::MaxRestarts));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_runs_reset_the_cursor() {
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        // The first two runs outlive the delta and reset the cursor, so the
        // schedule only starts counting from the third run.
        let config = RestartConfig {
            wait_schedule: vec![Duration::from_micros(1); 5],
            failure_delta: Duration::from_secs(1),
            max_restarts: true,
        };
        let err = restart_until_err(
            &cancel,
            |_, _| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    Ok(())
                }
            },
            &config,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::MaxRestarts));
        assert_eq!(calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_worker_retries_until_its_own_error() {
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        // Always slower than the delta: the schedule never advances and the
        // loop only ends when the worker itself errors.
        let config = RestartConfig {
            wait_schedule: vec![Duration::from_micros(1); 5],
            failure_delta: Duration::from_micros(1),
            max_restarts: true,
        };
        let err = restart_until_err(
            &cancel,
            |_, _| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(Duration::from_micros(5)).await;
                    if n == 10 {
                        return Err(ProxyError::Io(io::Error::other("limit exceeded")));
                    }
                    Ok(())
                }
            },
            &config,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::Io(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_policy_keeps_retrying() {
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        // With max_restarts off, the cursor parks at the last slot; stop the
        // loop from the worker after well past the schedule length.
        let err = restart_until_err(
            &cancel,
            |_, _| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 12 {
                        return Err(ProxyError::Io(io::Error::other("done")));
                    }
                    Ok(())
                }
            },
            &micro_schedule(false),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::Io(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_during_wait() {
        let cancel = CancellationToken::new();

        let worker_cancel = cancel.clone();
        let err = restart_until_err(
            &cancel,
            move |_, _| {
                let c = worker_cancel.clone();
                async move {
                    c.cancel();
                    Ok(())
                }
            },
            &RestartConfig {
                wait_schedule: vec![Duration::from_secs(3600)],
                failure_delta: Duration::from_secs(1),
                max_restarts: false,
            },
        )
        .await
        .unwrap_err();

        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_schedule_rejected() {
        let cancel = CancellationToken::new();
        let err = restart_until_err(
            &cancel,
            |_, _| async { Ok(()) },
            &RestartConfig {
                wait_schedule: Vec::new(),
                failure_delta: Duration::from_secs(1),
                max_restarts: true,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProxyError::EmptyWaitSchedule));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_gets_child_token() {
        let cancel = CancellationToken::new();
        let saw_live_child = AtomicBool::new(false);

        let _ = restart_until_err(
            &cancel,
            |child, _| {
                saw_live_child.fetch_or(!child.is_cancelled(), Ordering::SeqCst);
                async { Err(ProxyError::Cancelled) }
            },
            &micro_schedule(true),
        )
        .await;

        assert!(saw_live_child.load(Ordering::SeqCst));
    }
}
