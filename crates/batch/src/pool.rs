use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use crate::aggregate::ProgressAggregator;
use crate::error::BatchError;
use crate::invoker::Launcher;
use crate::job::{Disposition, Job, JobKey, JobStatus};
use crate::progress::{spawn_diagnostics_tail, ProgressMonitor};
use crate::queue::{JobQueue, Popped};
use crate::registry::ProcessRegistry;
use crate::sink::StatusSender;

/// Lines of transcoder diagnostics kept for failure reasons
const DIAGNOSTIC_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Running,
    Paused,
    Done,
    Failed,
    Cancelled,
}

/// What one worker slot is showing
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub slot: usize,
    pub job: Option<JobKey>,
    pub label: String,
    pub percent: f64,
    pub state: SlotState,
}

/// Fixed set of display slots, one per worker
#[derive(Debug)]
pub struct SlotTable {
    slots: Mutex<Vec<SlotView>>,
}

impl SlotTable {
    pub fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|slot| SlotView { slot, job: None, label: String::new(), percent: 0.0, state: SlotState::Idle })
            .collect();
        Self { slots: Mutex::new(slots) }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SlotView>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bind(&self, slot: usize, key: JobKey, label: &str) {
        if let Some(view) = self.lock().get_mut(slot) {
            view.job = Some(key);
            view.label = label.to_string();
            view.percent = 0.0;
            view.state = SlotState::Running;
        }
    }

    /// Update a slot only while it still shows `key`
    fn update(&self, slot: usize, key: JobKey, f: impl FnOnce(&mut SlotView)) -> bool {
        match self.lock().get_mut(slot) {
            Some(view) if view.job == Some(key) => {
                f(view);
                true
            }
            _ => false,
        }
    }

    pub fn set_progress(&self, slot: usize, key: JobKey, percent: f64) -> bool {
        self.update(slot, key, |view| view.percent = percent)
    }

    pub fn set_state(&self, slot: usize, key: JobKey, state: SlotState) -> bool {
        self.update(slot, key, |view| view.state = state)
    }

    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.lock().get(slot).map(|view| view.state)
    }

    pub fn release(&self, slot: usize) {
        if let Some(view) = self.lock().get_mut(slot) {
            if matches!(view.state, SlotState::Running | SlotState::Paused) {
                view.state = SlotState::Idle;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SlotView> {
        self.lock().clone()
    }
}

/// Everything a worker shares with the rest of the batch
pub struct PoolContext {
    pub queue: Arc<JobQueue>,
    pub registry: Arc<ProcessRegistry>,
    pub aggregator: Arc<ProgressAggregator>,
    pub slots: Arc<SlotTable>,
    pub launcher: Arc<dyn Launcher>,
    pub status: StatusSender,
    pub shutdown: Arc<AtomicBool>,
    pub poll: Duration,
    pub exit_wait: Duration,
}

impl PoolContext {
    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// Decrements the live-worker count however the worker ends, abort included.
/// The last one out declares the run complete.
struct ActiveGuard {
    ctx: Arc<PoolContext>,
    active: Arc<AtomicUsize>,
    idle: Arc<watch::Sender<bool>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            if !self.ctx.shutting_down() {
                self.ctx.aggregator.complete();
            }
            self.idle.send_replace(true);
        }
    }
}

/// Bounded set of workers draining the job queue
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    idle: watch::Receiver<bool>,
}

impl WorkerPool {
    /// Start `workers` workers, one per slot. With zero workers the run
    /// completes immediately.
    pub fn start(ctx: Arc<PoolContext>, workers: usize) -> Self {
        let (idle_tx, idle) = watch::channel(workers == 0);
        let idle_tx = Arc::new(idle_tx);

        if workers == 0 {
            if !ctx.shutting_down() {
                ctx.aggregator.complete();
            }
            return Self { handles: Vec::new(), idle };
        }

        info!("Starting {} workers", workers);
        let active = Arc::new(AtomicUsize::new(workers));
        let handles = (0..workers)
            .map(|slot| {
                let guard = ActiveGuard { ctx: ctx.clone(), active: active.clone(), idle: idle_tx.clone() };
                tokio::spawn(worker(ctx.clone(), slot, guard))
            })
            .collect();

        Self { handles, idle }
    }

    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    pub fn idle(&self) -> watch::Receiver<bool> {
        self.idle.clone()
    }

    pub fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.handles)
    }
}

async fn worker(ctx: Arc<PoolContext>, slot: usize, _guard: ActiveGuard) {
    debug!("Worker {} started", slot);
    loop {
        match ctx.queue.pop(ctx.poll).await {
            Popped::Job(job) => {
                if ctx.shutting_down() {
                    break;
                }
                run_job(&ctx, slot, job).await;
            }
            Popped::Stop | Popped::Closed => break,
            Popped::Empty => {
                if ctx.shutting_down() {
                    break;
                }
            }
        }
    }
    ctx.slots.release(slot);
    debug!("Worker {} exiting", slot);
}

/// `dir/a.mp3` becomes `dir/a_cancelled.mp3`
pub fn cancelled_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_cancelled.{}", stem, ext.to_string_lossy()),
        None => format!("{}_cancelled", stem),
    };
    path.with_file_name(name)
}

fn start_message(job: &Job, dest: &Path, disposition: Disposition) -> String {
    let name = job.display_name();
    match disposition {
        Disposition::Fresh => format!("Processing: {}", name),
        Disposition::Overwrite => format!("Overwriting: {}", name),
        Disposition::Renamed => {
            let renamed = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            format!("Renaming: {} to {}", name, renamed)
        }
    }
}

async fn remove_partial(key: JobKey, path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Job {}: removed partial output {}", key, path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Job {}: failed to remove partial output {}: {}", key, path.display(), e),
    }
}

fn fail(ctx: &PoolContext, slot: usize, job: &mut Job, reason: String) {
    job.finish(JobStatus::Failed, Some(reason.clone()));
    ctx.slots.set_state(slot, job.key, SlotState::Failed);
    ctx.aggregator.record_failed(job, &reason);
}

/// Drive one job from spawn to a terminal state
async fn run_job(ctx: &PoolContext, slot: usize, mut job: Job) {
    let key = job.key;
    let name = job.display_name();
    job.transition(JobStatus::Running);

    let Some(dest) = job.destination.clone() else {
        fail(ctx, slot, &mut job, "no destination".to_string());
        return;
    };

    ctx.status.post(start_message(&job, &dest.path, dest.disposition), false);
    info!("Job {}: {} -> {}", key, job.source_path.display(), dest.path.display());
    ctx.slots.bind(slot, key, &name);
    ctx.status.slot_progress(slot, 0.0, name.as_str());

    if let Some(parent) = dest.path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            fail(ctx, slot, &mut job, format!("cannot create {}: {}", parent.display(), e));
            return;
        }
    }

    ctx.aggregator.begin_job(&job);
    let spawned = match ctx.launcher.launch(&job, &dest.path) {
        Ok(spawned) => spawned,
        Err(e) => {
            fail(ctx, slot, &mut job, e.to_string());
            return;
        }
    };

    let controller = spawned.controller;
    let stop = ctx.registry.register(key, slot, controller.clone());
    if ctx.shutting_down() {
        // Registered after the shutdown sweep: withdraw so the job ends as cancelled
        ctx.registry.unregister(key);
        stop.notify_one();
        if let Err(e) = controller.terminate() {
            debug!("Job {}: terminate during shutdown: {}", key, e);
        }
    }
    let mut tail = spawned.diagnostics.map(|d| spawn_diagnostics_tail(d, DIAGNOSTIC_LINES));

    let mut monitor = ProgressMonitor::new(key, job.estimate, ctx.poll, ctx.exit_wait);
    let report = monitor
        .run(controller, spawned.progress, stop, |sample, percent| {
            ctx.aggregator.record_sample(sample.job_key, sample.processed_amount);
            ctx.slots.set_progress(slot, key, percent);
            ctx.status.slot_progress(slot, percent, name.as_str());
        })
        .await;

    let won = ctx.registry.unregister(key).is_some();

    let diagnostics = match tail.as_mut() {
        Some(handle) => match timeout(ctx.exit_wait, &mut *handle).await {
            Ok(Ok(lines)) => lines,
            _ => {
                handle.abort();
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    if !won {
        if ctx.shutting_down() {
            remove_partial(key, &dest.path).await;
        } else {
            let target = cancelled_path(&dest.path);
            match tokio::fs::rename(&dest.path, &target).await {
                Ok(()) => info!("Job {}: partial output kept as {}", key, target.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Job {}: failed to rename partial output: {}", key, e),
            }
        }
        job.finish(JobStatus::Cancelled, Some(BatchError::CancelledByOperator.to_string()));
        ctx.slots.set_state(slot, key, SlotState::Cancelled);
        ctx.aggregator.record_cancelled(&job);
        return;
    }

    ctx.slots.set_progress(slot, key, 100.0);
    ctx.status.slot_progress(slot, 100.0, name.as_str());

    match report.exit {
        Some(exit) if exit.success => {
            let output_bytes = tokio::fs::metadata(&dest.path).await.map(|m| m.len()).unwrap_or(0);
            job.finish(JobStatus::Done, None);
            ctx.slots.set_state(slot, key, SlotState::Done);
            ctx.aggregator.record_done(&job, output_bytes);
        }
        exit => {
            let err = BatchError::ProcessCrash {
                code: exit.and_then(|e| e.code),
                tail: diagnostics.join("\n"),
            };
            if !diagnostics.is_empty() {
                debug!("Job {}: transcoder diagnostics:\n{}", key, diagnostics.join("\n"));
            }
            let reason = match diagnostics.last() {
                Some(last) => format!("{}: {}", err, last),
                None => err.to_string(),
            };
            remove_partial(key, &dest.path).await;
            fail(ctx, slot, &mut job, reason);
        }
    }
}
