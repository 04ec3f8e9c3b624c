//! Per-vehicle serial queue for scheduled actions.
//!
//! Actions scheduled on one vehicle run one after another in submission
//! order; different vehicles' queues run concurrently. A paused queue
//! finishes the running action and starts nothing new until resumed.
//! Clearing aborts the running action and every queued one.

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::background::{isolate, JobGroup, JobName};
use crate::sync::lock;

type Task = BoxFuture<'static, ()>;

struct Control {
    paused: watch::Sender<bool>,
    /// Shared by every action queued since the last clear.
    generation: Mutex<CancellationToken>,
}

#[derive(Clone)]
pub struct SerialExecutor {
    tx: mpsc::UnboundedSender<Task>,
    control: Arc<Control>,
}

impl SerialExecutor {
    /// Start the worker as the group's `Executor` job.
    pub fn start(jobs: &JobGroup) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let (paused, mut paused_rx) = watch::channel(false);
        jobs.spawn(JobName::Executor, async move {
            while let Some(task) = rx.recv().await {
                let resumed = paused_rx.wait_for(|paused| !*paused).await.is_ok();
                if !resumed {
                    break;
                }
                task.await;
            }
        });
        Self {
            tx,
            control: Arc::new(Control {
                paused,
                generation: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Queue `action` and wait for its result. A panicking action is
    /// reported as an error and does not stop the queue.
    pub async fn schedule<F, T>(&self, action: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let cancel = lock(&self.control.generation).clone();
        let (done_tx, done_rx) = oneshot::channel();
        let task = {
            let cancel = cancel.clone();
            async move {
                let result = tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(anyhow!("action cleared from the queue")),
                    result = isolate(action) => result,
                };
                let _ = done_tx.send(result);
            }
            .boxed()
        };
        self.tx
            .send(task)
            .map_err(|_| anyhow!("executor is not running"))?;
        tokio::select! {
            biased;
            result = done_rx => result
                .map_err(|_| anyhow!("executor stopped before the action completed"))?,
            () = cancel.cancelled() => Err(anyhow!("action cleared from the queue")),
        }
    }

    /// Hold queued actions back. The running one completes.
    pub fn pause(&self) {
        self.control.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.control.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.control.paused.borrow()
    }

    /// Abort the running action and drop everything queued. Actions
    /// scheduled afterwards run normally.
    pub fn clear(&self) {
        let previous = std::mem::replace(&mut *lock(&self.control.generation), CancellationToken::new());
        previous.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tracing::Span;

    #[tokio::test]
    async fn test_runs_in_submission_order() {
        let jobs = JobGroup::new(Span::none());
        let executor = SerialExecutor::start(&jobs);
        let order = Arc::new(Mutex::new(Vec::new()));

        let slow = {
            let order = Arc::clone(&order);
            executor.schedule(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                order.lock().unwrap().push(1);
                Ok(())
            })
        };
        let fast = {
            let order = Arc::clone(&order);
            executor.schedule(async move {
                order.lock().unwrap().push(2);
                Ok(())
            })
        };
        let (a, b) = tokio::join!(slow, fast);
        a.unwrap();
        b.unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        jobs.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_does_not_stop_queue() {
        let jobs = JobGroup::new(Span::none());
        let executor = SerialExecutor::start(&jobs);

        let err = executor
            .schedule(async {
                let fail = true;
                if fail {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(executor.schedule(async { Ok(5) }).await.unwrap(), 5);
        jobs.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_holds_queue_until_resume() {
        let jobs = JobGroup::new(Span::none());
        let executor = SerialExecutor::start(&jobs);
        executor.pause();
        assert!(executor.is_paused());

        let ran = Arc::new(Mutex::new(false));
        let pending = {
            let ran = Arc::clone(&ran);
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .schedule(async move {
                        *ran.lock().unwrap() = true;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!*ran.lock().unwrap());

        executor.resume();
        pending.await.unwrap().unwrap();
        assert!(*ran.lock().unwrap());
        jobs.shutdown().await;
    }

    #[tokio::test]
    async fn test_clear_aborts_running_and_queued() {
        let jobs = JobGroup::new(Span::none());
        let executor = SerialExecutor::start(&jobs);

        let running = {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .schedule(async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(())
                    })
                    .await
            })
        };
        let queued = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.schedule(async { Ok(()) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        executor.clear();
        let err = running.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("cleared"));
        assert!(queued.await.unwrap().is_err());

        assert_eq!(executor.schedule(async { Ok(9) }).await.unwrap(), 9);
        jobs.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_fails() {
        let jobs = JobGroup::new(Span::none());
        let executor = SerialExecutor::start(&jobs);
        jobs.shutdown().await;
        assert!(executor.schedule(async { Ok(()) }).await.is_err());
    }
}
