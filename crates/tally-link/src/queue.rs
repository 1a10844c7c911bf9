//! Serialized upstream request queue.
//!
//! Every call to the aggregator goes through one spawned worker that drains
//! jobs FIFO and sleeps a fixed spacing between them, so at most one upstream
//! call is in flight at any instant system-wide and bursty callers degrade
//! into a rate-limit-friendly serial stream.
//!
//! A caller's timeout aborts only that caller's wait: the job keeps running
//! on the worker so its result can still populate the response cache for
//! everyone else.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::LinkError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to the single sequential upstream worker.
///
/// Cheap to clone; all clones feed the same worker.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl RequestQueue {
    /// Spawn the worker. Must be called from within a tokio runtime.
    pub fn new(spacing: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
                tokio::time::sleep(spacing).await;
            }
            tracing::debug!("request queue worker shut down");
        });
        Self { tx }
    }

    /// Run `task` on the worker, waiting at most `timeout` for its result.
    ///
    /// Tasks submitted earlier run to completion first (FIFO). On timeout the
    /// caller gets [`LinkError::Timeout`] while the task itself is left to
    /// finish on the worker.
    pub async fn run<T, F>(&self, timeout: Duration, task: F) -> Result<T, LinkError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, LinkError>> + Send + 'static,
    {
        let (reply, wait) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let out = task.await;
            // Receiver may have timed out and gone away.
            let _ = reply.send(out);
        });

        self.tx
            .send(job)
            .map_err(|_| LinkError::fatal("request queue worker is gone"))?;

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(out)) => out,
            Ok(Err(_)) => Err(LinkError::fatal("queued request was dropped")),
            Err(_) => {
                tracing::warn!("queued request exceeded {}s caller timeout", timeout.as_secs());
                Err(LinkError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn tasks_run_in_submission_order() {
        let queue = RequestQueue::new(Duration::from_millis(100));
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..4 {
            let queue = queue.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                queue
                    .run(Duration::from_secs(10), async move {
                        order.lock().push(i);
                        Ok::<_, LinkError>(i)
                    })
                    .await
            }));
            // Give each submission a chance to reach the queue before the next.
            tokio::task::yield_now().await;
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn spacing_is_enforced_between_tasks() {
        let spacing = Duration::from_millis(350);
        let queue = RequestQueue::new(spacing);

        let start = Instant::now();
        queue
            .run(Duration::from_secs(10), async { Ok::<_, LinkError>(()) })
            .await
            .unwrap();
        queue
            .run(Duration::from_secs(10), async { Ok::<_, LinkError>(()) })
            .await
            .unwrap();

        assert!(start.elapsed() >= spacing);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_caller_without_blocking_queue() {
        let queue = RequestQueue::new(Duration::from_millis(10));
        let ran = Arc::new(AtomicUsize::new(0));

        let slow_ran = Arc::clone(&ran);
        let result = queue
            .run(Duration::from_secs(1), async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                slow_ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LinkError>(())
            })
            .await;
        assert_eq!(result, Err(LinkError::Timeout));

        // The next task still runs, after the slow one finishes.
        let fast_ran = Arc::clone(&ran);
        queue
            .run(Duration::from_secs(120), async move {
                fast_ran.fetch_add(10, Ordering::SeqCst);
                Ok::<_, LinkError>(())
            })
            .await
            .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn task_errors_reach_only_their_caller() {
        let queue = RequestQueue::new(Duration::from_millis(10));

        let failed = queue
            .run(Duration::from_secs(10), async {
                Err::<(), _>(LinkError::fatal("boom"))
            })
            .await;
        assert!(matches!(failed, Err(LinkError::Fatal(_))));

        let ok = queue
            .run(Duration::from_secs(10), async { Ok::<_, LinkError>(7) })
            .await;
        assert_eq!(ok.unwrap(), 7);
    }
}
