use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use log::{error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use crate::aggregate::{ProgressAggregator, Summary};
use crate::config::BatchConfig;
use crate::error::{BatchError, Result};
use crate::invoker::Launcher;
use crate::job::{Job, JobStatus};
use crate::pool::{PoolContext, SlotState, SlotTable, SlotView, WorkerPool};
use crate::probe::Probe;
use crate::queue::JobQueue;
use crate::registry::{ControlOutcome, ProcessRegistry};
use crate::scan::JobScanner;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::sink::{spawn_drain, StatusSender, StatusSink};

/// Entry point: scan, queue and start processing a directory tree
pub struct Batch;

impl Batch {
    /// Scan the source tree and start the workers. Returns once processing
    /// has begun; use the handle to steer and await it.
    pub async fn start(
        config: BatchConfig,
        probe: Arc<dyn Probe>,
        launcher: Arc<dyn Launcher>,
        sink: Arc<dyn StatusSink>,
    ) -> Result<BatchHandle> {
        config.validate()?;

        let (status, rx) = StatusSender::channel();
        let drain = spawn_drain(rx, sink);

        let jobs = match scan_jobs(&config, probe, status.clone()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("{}", e);
                status.post(format!("Error: {}", e), false);
                status.close();
                let _ = drain.await;
                return Err(e);
            }
        };

        let source_bytes: u64 = jobs.iter().map(|j| j.source_bytes).sum();
        let found = format!(
            "{} files found, {}",
            jobs.len(),
            humansize::format_size(source_bytes, humansize::BINARY)
        );
        info!("{}", found);
        status.post(found, false);

        let total_estimated: u64 = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .map(Job::estimated_amount)
            .sum();
        let aggregator = Arc::new(ProgressAggregator::new(
            jobs.len(),
            total_estimated,
            config.progress_refresh(),
            status.clone(),
        ));
        {
            let status = status.clone();
            aggregator.on_finish(move |summary| status.finished(summary.clone()));
        }

        let queue = Arc::new(JobQueue::new());
        for job in jobs {
            match job.status {
                JobStatus::Pending => {
                    queue.push(job);
                }
                JobStatus::Skipped => {
                    aggregator.record_skipped(&job);
                }
                _ => {
                    let reason = job.reason.clone().unwrap_or_else(|| "unknown error".to_string());
                    aggregator.record_failed(&job, &reason);
                }
            }
        }
        queue.close();

        let workers = config.threads.min(queue.len());
        let slots = Arc::new(SlotTable::new(workers));
        let registry = Arc::new(ProcessRegistry::new());
        let shutdown_flag = Arc::new(AtomicBool::new(false));

        let ctx = Arc::new(PoolContext {
            queue: queue.clone(),
            registry: registry.clone(),
            aggregator: aggregator.clone(),
            slots: slots.clone(),
            launcher,
            status: status.clone(),
            shutdown: shutdown_flag.clone(),
            poll: config.poll_interval(),
            exit_wait: config.exit_wait(),
        });
        let mut pool = WorkerPool::start(ctx, workers);
        let idle = pool.idle();

        let coordinator = ShutdownCoordinator::new(
            shutdown_flag,
            queue,
            registry.clone(),
            pool.take_handles(),
            config.shutdown_join(),
        );

        Ok(BatchHandle {
            registry,
            slots,
            aggregator,
            coordinator,
            idle,
            status,
            drain: Mutex::new(Some(drain)),
            cancel_wait: config.cancel_wait(),
            drain_wait: config.shutdown_join(),
        })
    }
}

async fn scan_jobs(config: &BatchConfig, probe: Arc<dyn Probe>, status: StatusSender) -> Result<Vec<Job>> {
    let scanner = JobScanner::new(config, probe, status);
    let root = config.source_dir.clone();
    tokio::task::spawn_blocking(move || scanner.scan(&root).map(|jobs| jobs.collect::<Vec<Job>>()))
        .await
        .map_err(|e| BatchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// Control surface of a running batch. Slots are 0-based.
pub struct BatchHandle {
    registry: Arc<ProcessRegistry>,
    slots: Arc<SlotTable>,
    aggregator: Arc<ProgressAggregator>,
    coordinator: ShutdownCoordinator,
    idle: watch::Receiver<bool>,
    status: StatusSender,
    drain: Mutex<Option<JoinHandle<()>>>,
    cancel_wait: Duration,
    drain_wait: Duration,
}

impl BatchHandle {
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> Vec<SlotView> {
        self.slots.snapshot()
    }

    pub fn pause(&self, slot: usize) -> ControlOutcome {
        let Some(key) = self.registry.key_for_slot(slot) else {
            return ControlOutcome::NotRunning;
        };
        let outcome = self.registry.pause(key);
        if outcome == ControlOutcome::Applied {
            self.slots.set_state(slot, key, SlotState::Paused);
        }
        outcome
    }

    pub fn resume(&self, slot: usize) -> ControlOutcome {
        let Some(key) = self.registry.key_for_slot(slot) else {
            return ControlOutcome::NotRunning;
        };
        let outcome = self.registry.resume(key);
        if outcome == ControlOutcome::Applied {
            self.slots.set_state(slot, key, SlotState::Running);
        }
        outcome
    }

    pub fn toggle_pause(&self, slot: usize) -> ControlOutcome {
        match self.slots.state(slot) {
            Some(SlotState::Paused) => self.resume(slot),
            _ => self.pause(slot),
        }
    }

    /// Cancel the job running in `slot`. False if nothing was running there
    /// or it finished first.
    pub async fn cancel(&self, slot: usize) -> bool {
        match self.registry.key_for_slot(slot) {
            Some(key) => self.registry.cancel(key, self.cancel_wait).await,
            None => false,
        }
    }

    /// Transcoders currently registered
    pub fn live_processes(&self) -> usize {
        self.registry.len()
    }

    pub fn percent(&self) -> f64 {
        self.aggregator.percent()
    }

    pub fn summary(&self) -> Summary {
        self.aggregator.summary()
    }

    pub fn is_idle(&self) -> bool {
        *self.idle.borrow()
    }

    /// Resolves once every worker has exited
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.clone();
        while !*idle.borrow_and_update() {
            if idle.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.coordinator.is_shutting_down()
    }

    /// Stop everything. Safe to call more than once.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        self.coordinator.shutdown().await
    }

    /// Wait for the workers, flush the status sink and return the tally
    pub async fn wait(&self) -> Summary {
        self.wait_idle().await;
        let summary = self.aggregator.summary();

        self.status.close();
        let drain = self.drain.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut drain) = drain {
            if tokio::time::timeout(self.drain_wait.max(Duration::from_secs(1)), &mut drain).await.is_err() {
                warn!("Status drain did not finish, aborting it");
                drain.abort();
            }
        }
        summary
    }
}
