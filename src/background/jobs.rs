//! Named background jobs owned by a handle.
//!
//! Each relay and vehicle owns one [`JobGroup`]. Jobs are spawned on the
//! group's [`TaskTracker`] under a child [`CancellationToken`], so any
//! single job can be cancelled by name and the whole group is cancelled
//! and awaited on shutdown. Dropping the group cancels everything it
//! spawned, which is what keeps an abandoned connect from leaking tasks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, Instrument, Span};

use crate::sync::lock;

/// Every kind of background job in the fleet core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobName {
    VehicleHeartbeat,
    VehiclePing,
    VehicleRelay,
    OperatorHandshake,
    OperatorHeartbeat,
    OperatorPing,
    OperatorRelay,
    Callback,
    Executor,
    StatusFeed,
    StatusStream,
}

impl JobName {
    /// At most one job of this name runs per group; spawning again replaces
    /// the previous one. Transient jobs may run many at once.
    pub fn is_singleton(self) -> bool {
        !matches!(self, JobName::Callback | JobName::StatusStream)
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobName::VehicleHeartbeat => write!(f, "VehicleHeartbeat"),
            JobName::VehiclePing => write!(f, "VehiclePing"),
            JobName::VehicleRelay => write!(f, "VehicleRelay"),
            JobName::OperatorHandshake => write!(f, "OperatorHandshake"),
            JobName::OperatorHeartbeat => write!(f, "OperatorHeartbeat"),
            JobName::OperatorPing => write!(f, "OperatorPing"),
            JobName::OperatorRelay => write!(f, "OperatorRelay"),
            JobName::Callback => write!(f, "Callback"),
            JobName::Executor => write!(f, "Executor"),
            JobName::StatusFeed => write!(f, "StatusFeed"),
            JobName::StatusStream => write!(f, "StatusStream"),
        }
    }
}

type Running = Arc<Mutex<HashMap<JobName, (u64, CancellationToken)>>>;

pub struct JobGroup {
    token: CancellationToken,
    tracker: TaskTracker,
    running: Running,
    generation: AtomicU64,
    span: Span,
}

impl JobGroup {
    /// Jobs inherit `span`, so their logs carry the owner's fields.
    pub fn new(span: Span) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            span,
        }
    }

    /// Spawn `job`. Returns false, without spawning, once the group is shut
    /// down.
    pub fn spawn<F>(&self, name: JobName, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.token.is_cancelled() {
            debug!(parent: &self.span, job = %name, "Job group shut down, not spawning");
            return false;
        }

        let job_token = self.token.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if name.is_singleton() {
            if let Some((_, previous)) =
                lock(&self.running).insert(name, (generation, job_token.clone()))
            {
                previous.cancel();
            }
        }

        let running = Arc::clone(&self.running);
        self.tracker.spawn(
            async move {
                debug!(job = %name, "Job starting");
                tokio::select! {
                    () = job_token.cancelled() => debug!(job = %name, "Job cancelled"),
                    () = job => debug!(job = %name, "Job finished"),
                }
                if name.is_singleton() {
                    let mut running = lock(&running);
                    if running.get(&name).is_some_and(|(g, _)| *g == generation) {
                        running.remove(&name);
                    }
                }
            }
            .instrument(self.span.clone()),
        );
        true
    }

    /// Cancel one named job. Returns whether it was running.
    pub fn cancel(&self, name: JobName) -> bool {
        match lock(&self.running).remove(&name) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, name: JobName) -> bool {
        lock(&self.running)
            .get(&name)
            .is_some_and(|(_, token)| !token.is_cancelled())
    }

    /// Number of live tasks, transient ones included.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Token cancelled when the group shuts down.
    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every job and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        lock(&self.running).clear();
    }
}

impl Drop for JobGroup {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_named_job_cancel() {
        let group = JobGroup::new(Span::none());
        assert!(group.spawn(JobName::VehicleHeartbeat, std::future::pending()));
        assert!(group.spawn(JobName::VehiclePing, std::future::pending()));
        assert!(group.is_running(JobName::VehicleHeartbeat));

        assert!(group.cancel(JobName::VehicleHeartbeat));
        assert!(!group.is_running(JobName::VehicleHeartbeat));
        assert!(group.is_running(JobName::VehiclePing));
        assert!(!group.cancel(JobName::OperatorRelay));

        group.shutdown().await;
        assert!(group.is_empty());
        assert!(!group.is_running(JobName::VehiclePing));
    }

    #[tokio::test]
    async fn test_respawn_replaces_singleton() {
        let group = JobGroup::new(Span::none());
        let stopped = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let stopped = Arc::clone(&stopped);
            group.spawn(JobName::VehicleRelay, async move {
                struct OnDrop(Arc<AtomicUsize>);
                impl Drop for OnDrop {
                    fn drop(&mut self) {
                        self.0.fetch_add(1, Ordering::SeqCst);
                    }
                }
                let _guard = OnDrop(stopped);
                std::future::pending::<()>().await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1, "first instance replaced");
        assert_eq!(group.len(), 1);

        group.shutdown().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_spawn_after_shutdown() {
        let group = JobGroup::new(Span::none());
        group.shutdown().await;
        assert!(group.is_shut_down());
        assert!(!group.spawn(JobName::Callback, async {}));
    }

    #[tokio::test]
    async fn test_finished_job_is_not_running() {
        let group = JobGroup::new(Span::none());
        group.spawn(JobName::OperatorHandshake, async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!group.is_running(JobName::OperatorHandshake));
        assert!(group.is_empty());
    }
}
