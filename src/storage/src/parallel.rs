//! Bounded worker engine for iterating stage sets.
//!
//! One future per item, gated by a semaphore so at most `max_workers`
//! invocations of the task closure run at any instant. The first error
//! cancels sibling dispatch cooperatively and propagates to the caller;
//! errors raced out by the winner are discarded. Running tasks observe
//! cancellation at their next backend call.

use std::sync::Arc;

use futures::future;
use stagedock_core::{DockError, Result};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Options for [`do_tasks`].
#[derive(Debug, Clone, Copy)]
pub struct DoTasksOptions {
    /// Maximum number of in-flight task invocations. Clamped to at
    /// least 1.
    pub max_workers: usize,

    /// The iteration's tasks talk to the container runtime: runtime-bound
    /// per-worker resources are to be allocated lazily on first use.
    pub init_worker_resources: bool,
}

impl Default for DoTasksOptions {
    fn default() -> Self {
        Self {
            max_workers: 1,
            init_worker_resources: false,
        }
    }
}

/// Run `f` over every task index in `0..tasks_count` with bounded
/// concurrency.
///
/// Every index is dispatched exactly once unless a sibling error or the
/// caller's token fires before its dispatch. Dispatch order is not
/// guaranteed.
pub async fn do_tasks<F, Fut>(
    token: &CancellationToken,
    tasks_count: usize,
    opts: DoTasksOptions,
    f: F,
) -> Result<()>
where
    F: Fn(usize) -> Fut + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    if tasks_count == 0 {
        return Ok(());
    }

    let max_workers = opts.max_workers.max(1);
    if opts.init_worker_resources {
        tracing::debug!(max_workers, "initializing per-worker runtime resources");
    }

    let semaphore = Arc::new(Semaphore::new(max_workers));

    // Cancelling the parent token cancels this one too; a failing task
    // cancels only this one, so sibling dispatch stops without marking
    // the caller's token.
    let work_token = token.child_token();

    let f = &f;
    let semaphore = &semaphore;
    let work_token = &work_token;

    // The task futures borrow the caller's state, so they are driven in
    // place rather than detached onto the runtime.
    let tasks = (0..tasks_count).map(|task_id| async move {
        let _permit = match semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        };

        if work_token.is_cancelled() {
            return if token.is_cancelled() {
                Err(DockError::Cancelled)
            } else {
                Ok(())
            };
        }

        match f(task_id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                work_token.cancel();
                Err(err)
            }
        }
    });

    let results = future::join_all(tasks).await;

    // First observed error wins.
    for result in results {
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn test_every_task_runs_exactly_once() {
        let token = CancellationToken::new();
        let seen = Mutex::new(vec![0usize; 20]);
        let seen_ref = &seen;

        do_tasks(
            &token,
            20,
            DoTasksOptions {
                max_workers: 4,
                init_worker_resources: false,
            },
            |task_id| async move {
                seen_ref.lock().await[task_id] += 1;
                Ok(())
            },
        )
        .await
        .unwrap();

        assert!(seen.into_inner().iter().all(|&count| count == 1));
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_max_workers() {
        let token = CancellationToken::new();
        let in_flight = AtomicUsize::new(0);
        let max_seen = AtomicUsize::new(0);
        let in_flight = &in_flight;
        let max_seen = &max_seen;

        do_tasks(
            &token,
            32,
            DoTasksOptions {
                max_workers: 3,
                init_worker_resources: false,
            },
            |_| async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await
        .unwrap();

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_single_worker_runs_sequentially() {
        let token = CancellationToken::new();
        let in_flight = AtomicUsize::new(0);
        let overlapped = AtomicBool::new(false);
        let in_flight = &in_flight;
        let overlapped = &overlapped;

        do_tasks(&token, 10, DoTasksOptions::default(), |_| async move {
            if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                overlapped.store(true, Ordering::SeqCst);
            }
            tokio::task::yield_now().await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_first_error_wins_and_suppresses_dispatch() {
        let token = CancellationToken::new();
        let dispatched = AtomicUsize::new(0);
        let dispatched = &dispatched;

        let err = do_tasks(
            &token,
            100,
            DoTasksOptions {
                max_workers: 2,
                init_worker_resources: false,
            },
            |task_id| async move {
                dispatched.fetch_add(1, Ordering::SeqCst);
                if task_id == 0 {
                    Err(DockError::StorageError("task 0 failed".to_string()))
                } else {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Ok(())
                }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DockError::StorageError(_)));
        // Dispatch of remaining items was suppressed.
        assert!(dispatched.load(Ordering::SeqCst) < 100);
    }

    #[tokio::test]
    async fn test_caller_cancellation_suppresses_dispatch() {
        let token = CancellationToken::new();
        let dispatched = Arc::new(AtomicUsize::new(0));

        token.cancel();
        let err = do_tasks(
            &token,
            10,
            DoTasksOptions {
                max_workers: 2,
                init_worker_resources: false,
            },
            |_| {
                let dispatched = Arc::clone(&dispatched);
                async move {
                    dispatched.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DockError::Cancelled));
        assert_eq!(dispatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_zero_tasks_is_a_noop() {
        let token = CancellationToken::new();
        do_tasks(&token, 0, DoTasksOptions::default(), |_| async {
            panic!("no task should run");
        })
        .await
        .unwrap();
    }
}
