//! Bounded-concurrency task runner.
//!
//! Every task is spawned up front and waits on a counting semaphore for a
//! worker slot. Results come back in submission order regardless of which
//! task finishes first.

use crate::config::effective_workers;
use crate::error::{InvokeError, TaskError};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// A deferred unit of work. It receives the shared cancellation token and
/// should stop cooperatively once it fires.
pub type Task<T> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

pub type TaskResult<T> = Result<T, TaskError>;

/// Box an async closure as a [`Task`].
pub fn task<T, F, Fut>(f: F) -> Task<T>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Box::new(move |cancel| Box::pin(f(cancel)))
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    max_workers: usize,
}

impl WorkerPool {
    /// `0` defaults to the machine's available parallelism.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: effective_workers(max_workers),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run all `tasks`, at most `max_workers` at a time. `results[i]` is the
    /// outcome of `tasks[i]`. Tasks that have not started when `cancel`
    /// fires never run and report [`TaskError::Cancelled`].
    pub async fn run<T>(
        &self,
        cancel: &CancellationToken,
        tasks: Vec<Task<T>>,
    ) -> Vec<TaskResult<T>>
    where
        T: Send + 'static,
    {
        if tasks.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(TaskError::Cancelled(
                                "run cancelled before the task acquired a worker slot".to_string(),
                            ));
                        }
                        permit = semaphore.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => {
                                return Err(TaskError::Cancelled("worker pool closed".to_string()));
                            }
                        },
                    };
                    if cancel.is_cancelled() {
                        return Err(TaskError::Cancelled(
                            "run cancelled before the task started".to_string(),
                        ));
                    }

                    match task(cancel.clone()).await {
                        Ok(value) => Ok(value),
                        Err(err) if cancel.is_cancelled() && is_cancellation(&err) => {
                            Err(TaskError::Cancelled(err.to_string()))
                        }
                        Err(err) => Err(TaskError::Failed(err)),
                    }
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    let payload = join_err.into_panic();
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    Err(TaskError::Panicked(message))
                }
                Err(join_err) => Err(TaskError::Cancelled(join_err.to_string())),
            };
            results.push(result);
        }
        results
    }
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(cause.downcast_ref::<InvokeError>(), Some(InvokeError::Cancelled))
            || cause
                .downcast_ref::<TaskError>()
                .map(TaskError::is_cancelled)
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn zero_tasks_return_immediately() {
        let pool = WorkerPool::new(2);
        let results: Vec<TaskResult<()>> = pool.run(&CancellationToken::new(), Vec::new()).await;
        assert!(results.is_empty());
    }

    #[test]
    fn zero_workers_defaults_to_parallelism() {
        assert!(WorkerPool::new(0).max_workers() >= 1);
        assert_eq!(WorkerPool::new(3).max_workers(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_max_workers() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task<()>> = (0..12)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                task(move |_cancel| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let results = WorkerPool::new(3).run(&CancellationToken::new(), tasks).await;
        assert_eq!(results.len(), 12);
        assert!(results.iter().all(|r| r.is_ok()));
        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "observed {peak} concurrent tasks");
        assert!(peak >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn results_keep_submission_order() {
        let tasks: Vec<Task<usize>> = (0..6)
            .map(|i| {
                task(move |_cancel| async move {
                    // Earlier tasks finish later.
                    tokio::time::sleep(Duration::from_millis(((6 - i) * 10) as u64)).await;
                    Ok(i)
                })
            })
            .collect();

        let results = WorkerPool::new(6).run(&CancellationToken::new(), tasks).await;
        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn failures_and_panics_are_isolated() {
        let tasks: Vec<Task<u32>> = vec![
            task(|_| async { Ok(1) }),
            task(|_| async { Err(anyhow::anyhow!("agent failed")) }),
            task(|_| async { panic!("boom") }),
            task(|_| async { Ok(4) }),
        ];

        let results = WorkerPool::new(2).run(&CancellationToken::new(), tasks).await;
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(matches!(results[1], Err(TaskError::Failed(_))));
        assert!(matches!(results[2], Err(TaskError::Panicked(ref m)) if m == "boom"));
        assert_eq!(*results[3].as_ref().unwrap(), 4);
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let executed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tasks: Vec<Task<()>> = (0..3)
            .map(|_| {
                let executed = executed.clone();
                task(move |_| async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        let results = WorkerPool::new(2).run(&cancel, tasks).await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(e) if e.is_cancelled())));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_skips_waiting_tasks_but_lets_running_finish() {
        let executed = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let tasks: Vec<Task<()>> = (0..4)
            .map(|_| {
                let executed = executed.clone();
                task(move |_| async move {
                    executed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
            })
            .collect();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let results = WorkerPool::new(1).run(&cancel, tasks).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let cancelled = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_cancelled()))
            .count();
        assert_eq!(ok, 1);
        assert_eq!(cancelled, 3);
        assert_eq!(executed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn running_task_that_observes_cancellation_reports_cancelled() {
        let cancel = CancellationToken::new();
        let tasks: Vec<Task<()>> = vec![task(|cancel: CancellationToken| async move {
            cancel.cancelled().await;
            Err(anyhow::Error::new(InvokeError::Cancelled).context("structure agent"))
        })];
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            trigger.cancel();
        });

        let results = WorkerPool::new(1).run(&cancel, tasks).await;
        assert!(matches!(results[0], Err(TaskError::Cancelled(_))));
    }
}
