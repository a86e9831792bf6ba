use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use log::{error, info};
use crate::job::{Job, JobKey};
use crate::sink::StatusSender;

/// End-of-run tally
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed: Duration,
    /// Source bytes of the processed jobs
    pub source_bytes: u64,
    /// Bytes written for the processed jobs
    pub output_bytes: u64,
}

/// "95 sec" reads as "1 min 35 sec"
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{:.2} sec", secs)
    } else {
        let whole = elapsed.as_secs();
        format!("{} min {} sec", whole / 60, whole % 60)
    }
}

impl Summary {
    /// Jobs that never reached a terminal state, e.g. still queued at shutdown
    pub fn not_started(&self) -> usize {
        self.total
            .saturating_sub(self.processed + self.skipped + self.failed + self.cancelled)
    }

    pub fn compression_ratio(&self) -> Option<f64> {
        (self.output_bytes > 0).then(|| self.source_bytes as f64 / self.output_bytes as f64)
    }

    /// e.g. "5 Files Total: 4 Processed, 1 Errors in 12.30 sec. Compression ratio 3.95."
    pub fn line(&self) -> String {
        let mut msg = format!("{} Files Total: {} Processed", self.total, self.processed);
        if self.skipped > 0 {
            msg.push_str(&format!(", {} Skipped", self.skipped));
        }
        if self.failed > 0 {
            msg.push_str(&format!(", {} Errors", self.failed));
        }
        if self.cancelled > 0 {
            msg.push_str(&format!(", {} Cancelled", self.cancelled));
        }
        let not_started = self.not_started();
        if not_started > 0 {
            msg.push_str(&format!(", {} Not Started", not_started));
        }
        if !self.elapsed.is_zero() && self.skipped < self.total {
            msg.push_str(&format!(" in {}.", format_elapsed(self.elapsed)));
        }
        if let Some(ratio) = self.compression_ratio() {
            msg.push_str(&format!(" Compression ratio {:.2}.", ratio));
        }
        msg
    }
}

#[derive(Debug, Clone, Copy)]
struct JobProgress {
    processed: u64,
    estimate: u64,
}

#[derive(Debug, Default)]
struct AggregateState {
    /// Running jobs only
    per_job: HashMap<JobKey, JobProgress>,
    terminal: HashSet<JobKey>,
    /// Folded contributions of jobs that reached a terminal state
    finished_processed: u64,
    total_estimated: u64,
    completed: usize,
    skipped: usize,
    failed: usize,
    cancelled: usize,
    total_jobs: usize,
    source_bytes: u64,
    output_bytes: u64,
    last_push: Option<Instant>,
    finished: bool,
}

impl AggregateState {
    fn finished_jobs(&self) -> usize {
        self.completed + self.skipped + self.failed + self.cancelled
    }

    fn percent(&self) -> f64 {
        if self.total_estimated == 0 {
            if self.total_jobs == 0 {
                return 100.0;
            }
            return self.finished_jobs() as f64 / self.total_jobs as f64 * 100.0;
        }
        let running: u64 = self.per_job.values().map(|p| p.processed.min(p.estimate)).sum();
        let done = self.finished_processed.saturating_add(running);
        (done as f64 / self.total_estimated as f64 * 100.0).clamp(0.0, 100.0)
    }

    fn label(&self, percent: f64) -> String {
        format!("{}% {}/{}", percent.floor() as u64, self.finished_jobs(), self.total_jobs)
    }

    /// Fold a job out of the running set. False if it was already terminal.
    fn fold(&mut self, job: &Job) -> bool {
        if !self.terminal.insert(job.key) {
            return false;
        }
        self.per_job.remove(&job.key);
        self.finished_processed = self.finished_processed.saturating_add(job.estimated_amount());
        true
    }
}

type FinishCallback = Box<dyn FnOnce(&Summary) + Send>;

/// Overall progress across every job of the run
pub struct ProgressAggregator {
    state: Mutex<AggregateState>,
    refresh: Duration,
    started: Instant,
    status: StatusSender,
    on_finish: Mutex<Option<FinishCallback>>,
}

enum Terminal {
    Done { output_bytes: u64 },
    Skipped,
    Failed(String),
    Cancelled,
}

impl ProgressAggregator {
    pub fn new(total_jobs: usize, total_estimated: u64, refresh: Duration, status: StatusSender) -> Self {
        Self {
            state: Mutex::new(AggregateState {
                total_jobs,
                total_estimated,
                ..Default::default()
            }),
            refresh,
            started: Instant::now(),
            status,
            on_finish: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AggregateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the completion callback. It runs at most once.
    pub fn on_finish(&self, callback: impl FnOnce(&Summary) + Send + 'static) {
        *self.on_finish.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(callback));
    }

    pub fn begin_job(&self, job: &Job) {
        let mut state = self.lock();
        if state.terminal.contains(&job.key) {
            return;
        }
        state
            .per_job
            .insert(job.key, JobProgress { processed: 0, estimate: job.estimated_amount() });
    }

    /// Record the latest processed amount for a running job. Values never go
    /// backwards.
    pub fn record_sample(&self, key: JobKey, amount: u64) {
        {
            let mut state = self.lock();
            if let Some(progress) = state.per_job.get_mut(&key) {
                progress.processed = progress.processed.max(amount);
            }
        }
        self.recompute(false);
    }

    /// Push the overall percentage unless the last push was within the
    /// refresh interval. `force` bypasses the throttle.
    pub fn recompute(&self, force: bool) -> Option<f64> {
        let mut state = self.lock();
        let now = Instant::now();
        if !force {
            if let Some(last) = state.last_push {
                if now.duration_since(last) < self.refresh {
                    return None;
                }
            }
        }
        state.last_push = Some(now);
        let percent = state.percent();
        let label = state.label(percent);
        self.status.overall(percent, label);
        Some(percent)
    }

    pub fn percent(&self) -> f64 {
        self.lock().percent()
    }

    pub fn record_done(&self, job: &Job, output_bytes: u64) -> bool {
        self.record(job, Terminal::Done { output_bytes })
    }

    pub fn record_skipped(&self, job: &Job) -> bool {
        self.record(job, Terminal::Skipped)
    }

    pub fn record_failed(&self, job: &Job, reason: &str) -> bool {
        self.record(job, Terminal::Failed(reason.to_string()))
    }

    pub fn record_cancelled(&self, job: &Job) -> bool {
        self.record(job, Terminal::Cancelled)
    }

    fn record(&self, job: &Job, outcome: Terminal) -> bool {
        let name = job.display_name();
        let all_done = {
            let mut state = self.lock();
            if !state.fold(job) {
                return false;
            }
            let message = match &outcome {
                Terminal::Done { output_bytes } => {
                    state.completed += 1;
                    state.source_bytes += job.source_bytes;
                    state.output_bytes += output_bytes;
                    info!("Job {}: done {}", job.key, name);
                    format!("Done: {}", name)
                }
                Terminal::Skipped => {
                    state.skipped += 1;
                    info!("Job {}: skipped {}", job.key, name);
                    format!("Skipping: {}", name)
                }
                Terminal::Failed(reason) => {
                    state.failed += 1;
                    error!("Job {}: failed {}: {}", job.key, name, reason);
                    format!("Error processing {}: {}", name, reason)
                }
                Terminal::Cancelled => {
                    state.cancelled += 1;
                    info!("Job {}: cancelled {}", job.key, name);
                    format!("Cancelled processing {}", name)
                }
            };
            self.status.post(message, false);
            state.finished_jobs() == state.total_jobs
        };

        if all_done {
            self.complete();
        } else {
            self.recompute(true);
        }
        true
    }

    pub fn summary(&self) -> Summary {
        let state = self.lock();
        Summary {
            total: state.total_jobs,
            processed: state.completed,
            skipped: state.skipped,
            failed: state.failed,
            cancelled: state.cancelled,
            elapsed: self.started.elapsed(),
            source_bytes: state.source_bytes,
            output_bytes: state.output_bytes,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Declare the run complete. Only the first call has any effect: the
    /// overall gauge is pushed to 100% and the finish callback runs.
    pub fn complete(&self) -> bool {
        {
            let mut state = self.lock();
            if state.finished {
                return false;
            }
            state.finished = true;
            state.last_push = Some(Instant::now());
            let label = format!("100% {}/{}", state.finished_jobs(), state.total_jobs);
            self.status.overall(100.0, label);
        }

        let summary = self.summary();
        info!("{}", summary.line());
        let callback = self.on_finish.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(callback) = callback {
            callback(&summary);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use proptest::prelude::*;
    use crate::job::{Estimate, ProgressUnit};
    use crate::sink::StatusEvent;

    fn job(name: &str, estimate: u64) -> Job {
        let mut job = Job::new(PathBuf::from(name), PathBuf::from(name), 1000);
        job.estimate = Some(Estimate { amount: estimate, unit: ProgressUnit::Kilobytes });
        job
    }

    fn aggregator(total_jobs: usize, total_estimated: u64) -> (ProgressAggregator, tokio::sync::mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = StatusSender::channel();
        (ProgressAggregator::new(total_jobs, total_estimated, Duration::ZERO, tx), rx)
    }

    fn messages(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StatusEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StatusEvent::Message { text, .. } = event {
                out.push(text);
            }
        }
        out
    }

    #[test]
    fn test_summary_line_format() {
        let summary = Summary {
            total: 5,
            processed: 4,
            skipped: 0,
            failed: 1,
            cancelled: 0,
            elapsed: Duration::from_millis(12_300),
            source_bytes: 395,
            output_bytes: 100,
        };
        assert_eq!(summary.line(), "5 Files Total: 4 Processed, 1 Errors in 12.30 sec. Compression ratio 3.95.");

        let all_skipped = Summary { processed: 0, skipped: 5, failed: 0, output_bytes: 0, ..summary };
        assert_eq!(all_skipped.line(), "5 Files Total: 0 Processed, 5 Skipped");
    }

    #[test]
    fn test_summary_line_counts_jobs_left_in_queue() {
        let summary = Summary {
            total: 4,
            processed: 0,
            skipped: 0,
            failed: 0,
            cancelled: 2,
            elapsed: Duration::ZERO,
            source_bytes: 0,
            output_bytes: 0,
        };
        assert_eq!(summary.not_started(), 2);
        assert_eq!(summary.line(), "4 Files Total: 0 Processed, 2 Cancelled, 2 Not Started");
    }

    #[test]
    fn test_format_elapsed_minutes() {
        assert_eq!(format_elapsed(Duration::from_secs(95)), "1 min 35 sec");
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.50 sec");
    }

    #[test]
    fn test_finish_fires_once_at_equality() {
        let (agg, _rx) = aggregator(3, 300);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        agg.on_finish(move |summary| {
            assert_eq!(summary.processed + summary.failed + summary.skipped, 3);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let jobs = [job("a", 100), job("b", 100), job("c", 100)];
        agg.record_done(&jobs[0], 10);
        agg.record_failed(&jobs[1], "boom");
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        agg.record_skipped(&jobs[2]);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert!(!agg.complete());
        assert!(!agg.record_done(&jobs[2], 10));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(agg.is_finished());
    }

    #[test]
    fn test_each_terminal_state_counts_once_with_one_message() {
        let (agg, mut rx) = aggregator(4, 400);
        let a = job("a.wav", 100);
        agg.begin_job(&a);
        assert!(agg.record_cancelled(&a));
        assert!(!agg.record_done(&a, 5));
        assert!(!agg.record_failed(&a, "late"));

        let summary = agg.summary();
        assert_eq!((summary.cancelled, summary.processed, summary.failed), (1, 0, 0));
        assert_eq!(messages(&mut rx), vec!["Cancelled processing a.wav"]);
    }

    #[test]
    fn test_running_contribution_is_clamped() {
        let (agg, _rx) = aggregator(2, 200);
        let a = job("a", 100);
        agg.begin_job(&a);
        agg.record_sample(a.key, 150);
        assert_eq!(agg.percent(), 50.0);
        agg.record_sample(a.key, 40);
        assert_eq!(agg.percent(), 50.0);
    }

    #[test]
    fn test_samples_for_unknown_jobs_are_ignored() {
        let (agg, _rx) = aggregator(1, 100);
        agg.record_sample(JobKey::new(), 80);
        assert_eq!(agg.percent(), 0.0);
    }

    #[test]
    fn test_recompute_is_throttled() {
        let (tx, _rx) = StatusSender::channel();
        let agg = ProgressAggregator::new(1, 100, Duration::from_secs(60), tx);
        assert!(agg.recompute(false).is_some());
        assert!(agg.recompute(false).is_none());
        assert!(agg.recompute(true).is_some());
    }

    #[test]
    fn test_zero_jobs_complete_immediately() {
        let (agg, mut rx) = aggregator(0, 0);
        assert!(agg.complete());
        let mut last_overall = None;
        while let Ok(event) = rx.try_recv() {
            if let StatusEvent::Overall { percent, label } = event {
                last_overall = Some((percent, label));
            }
        }
        assert_eq!(last_overall, Some((100.0, "100% 0/0".to_string())));
    }

    proptest! {
        /// Overall percent never decreases and stays within [0, 100]
        #[test]
        fn prop_overall_percent_monotone(
            estimates in proptest::collection::vec(1u64..1000, 1..6),
            samples in proptest::collection::vec((0usize..8, 0u64..2000), 0..60),
        ) {
            let total: u64 = estimates.iter().sum();
            let (agg, _rx) = aggregator(estimates.len(), total);
            let jobs: Vec<Job> = estimates.iter().enumerate().map(|(i, e)| job(&i.to_string(), *e)).collect();
            for j in &jobs {
                agg.begin_job(j);
            }

            let mut last = 0.0;
            for (idx, amount) in samples {
                if idx >= 6 {
                    agg.record_done(&jobs[amount as usize % jobs.len()], 1);
                } else {
                    agg.record_sample(jobs[idx % jobs.len()].key, amount);
                }
                let now = agg.percent();
                prop_assert!(now >= last);
                prop_assert!((0.0..=100.0).contains(&now));
                last = now;
            }
        }
    }
}
