use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use crate::error::BatchError;
use crate::queue::JobQueue;
use crate::registry::ProcessRegistry;

/// What a shutdown had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued jobs discarded without running
    pub drained: usize,
    /// Live transcoders killed
    pub terminated: usize,
    /// Workers that missed the join deadline and were aborted
    pub stragglers: usize,
}

/// Stops a batch: no new work, every live process killed, every worker
/// joined or aborted within a fixed deadline
pub struct ShutdownCoordinator {
    flag: Arc<AtomicBool>,
    started: AtomicBool,
    queue: Arc<JobQueue>,
    registry: Arc<ProcessRegistry>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        flag: Arc<AtomicBool>,
        queue: Arc<JobQueue>,
        registry: Arc<ProcessRegistry>,
        workers: Vec<JoinHandle<()>>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            flag,
            started: AtomicBool::new(false),
            queue,
            registry,
            workers: Mutex::new(workers),
            join_timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Run the shutdown sequence. Only the first call does anything; later
    /// calls return `None` immediately.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!("Shutting down");
        self.flag.store(true, Ordering::SeqCst);

        let drained = self.queue.drain().len();
        let terminated = self.registry.terminate_all();

        let mut handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for _ in 0..handles.len() {
            self.queue.push_stop();
        }

        let deadline = Instant::now() + self.join_timeout;
        let mut stragglers = 0;
        for (index, handle) in handles.iter_mut().enumerate() {
            if timeout_at(deadline, &mut *handle).await.is_err() {
                let err = BatchError::ShutdownTimeout {
                    what: format!("worker {}", index + 1),
                    timeout: self.join_timeout,
                };
                warn!("{}, aborting it", err);
                handle.abort();
                stragglers += 1;
            }
        }

        let report = ShutdownReport { drained, terminated, stragglers };
        info!(
            "Shutdown complete: {} queued jobs dropped, {} processes terminated, {} workers aborted",
            report.drained, report.terminated, report.stragglers
        );
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::job::Job;
    use crate::queue::Popped;

    fn job() -> Job {
        Job::new(PathBuf::from("a"), PathBuf::from("a"), 0)
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_stops_workers() {
        let flag = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(JobQueue::new());
        queue.push(job());
        queue.push(job());

        let stops = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handles = (0..2)
            .map(|_| {
                let queue = queue.clone();
                let stops = stops.clone();
                tokio::spawn(async move {
                    // Workers only react to stop markers here
                    loop {
                        if let Popped::Stop = queue.pop(Duration::from_millis(5)).await {
                            stops.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                    }
                })
            })
            .collect();

        let coordinator = ShutdownCoordinator::new(
            flag.clone(),
            queue.clone(),
            Arc::new(ProcessRegistry::new()),
            handles,
            Duration::from_secs(2),
        );
        let report = coordinator.shutdown().await.unwrap();

        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(report.stragglers, 0);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert!(queue.is_empty());
        assert!(coordinator.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn test_stuck_worker_is_aborted_at_deadline() {
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let coordinator = ShutdownCoordinator::new(
            Arc::new(AtomicBool::new(false)),
            Arc::new(JobQueue::new()),
            Arc::new(ProcessRegistry::new()),
            vec![stuck],
            Duration::from_millis(50),
        );

        let started = std::time::Instant::now();
        let report = coordinator.shutdown().await.unwrap();
        assert_eq!(report.stragglers, 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
