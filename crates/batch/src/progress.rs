use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use crate::invoker::BoxedReader;
use crate::job::{Estimate, JobKey, ProgressUnit};
use crate::process::{wait_for_exit, ExitOutcome, ProcessController};

/// A progress value pulled out of one transcoder output line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressToken {
    /// `size=` from the stats line, normalised to kilobytes
    SizeKb(u64),
    /// `out_time_ms=` from `-progress` output. ffmpeg reports microseconds here.
    OutTimeMicros(u64),
}

impl ProgressToken {
    /// Value in `unit`, or `None` when the token measures something else
    pub fn amount_in(&self, unit: ProgressUnit) -> Option<u64> {
        match (self, unit) {
            (ProgressToken::SizeKb(kb), ProgressUnit::Kilobytes) => Some(*kb),
            (ProgressToken::OutTimeMicros(us), ProgressUnit::Millis) => Some(us / 1000),
            _ => None,
        }
    }
}

/// Text following the first standalone occurrence of `key`.
/// `total_size=` does not count as `size=`.
fn value_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut from = 0;
    while let Some(idx) = line[from..].find(key) {
        let at = from + idx;
        let standalone = line[..at]
            .chars()
            .next_back()
            .map(|c| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(true);
        if standalone {
            return Some(&line[at + key.len()..]);
        }
        from = at + key.len();
    }
    None
}

fn leading_digits(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    s.split_at(end)
}

fn parse_size(rest: &str) -> Option<ProgressToken> {
    let (digits, tail) = leading_digits(rest.trim_start());
    let value: u64 = digits.parse().ok()?;
    let unit_end = tail.find(|c: char| !c.is_ascii_alphabetic()).unwrap_or(tail.len());
    let kb = match &tail[..unit_end] {
        "" | "kB" | "KB" | "kb" | "KiB" | "kiB" => value,
        "B" => value / 1024,
        "MB" | "MiB" | "mB" => value.saturating_mul(1024),
        "GB" | "GiB" => value.saturating_mul(1024 * 1024),
        _ => return None,
    };
    Some(ProgressToken::SizeKb(kb))
}

fn parse_out_time(rest: &str) -> Option<ProgressToken> {
    let rest = rest.trim_start();
    let (negative, rest) = match rest.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, rest),
    };
    let (digits, _) = leading_digits(rest);
    let value: u64 = digits.parse().ok()?;
    // ffmpeg emits small negative times before the first frame
    Some(ProgressToken::OutTimeMicros(if negative { 0 } else { value }))
}

/// Extract a progress token from one line. Lines without a usable value
/// (including `N/A`) yield `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressToken> {
    if let Some(rest) = value_after(line, "size=") {
        if let Some(token) = parse_size(rest) {
            return Some(token);
        }
    }
    value_after(line, "out_time_ms=").and_then(parse_out_time)
}

/// `processed / estimate` as a percentage, clamped to 100
pub fn job_percent(processed: u64, estimate: u64) -> f64 {
    if estimate == 0 {
        return 0.0;
    }
    (processed as f64 / estimate as f64 * 100.0).min(100.0)
}

/// One parsed progress update for a running job
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub job_key: JobKey,
    pub processed_amount: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
enum ReaderEvent {
    Line(String),
    Eof,
}

/// Split a byte stream into records on either `\n` or `\r`. The stats
/// line is rewritten in place with carriage returns.
async fn read_records<R>(mut reader: R, mut emit: impl FnMut(String) -> bool)
where
    R: AsyncRead + Unpin,
{
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Transcoder pipe read failed: {}", e);
                break;
            }
        };
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                if !pending.is_empty() {
                    let record = String::from_utf8_lossy(&pending).into_owned();
                    pending.clear();
                    if !emit(record) {
                        return;
                    }
                }
            } else {
                pending.push(byte);
            }
        }
    }
    if !pending.is_empty() {
        emit(String::from_utf8_lossy(&pending).into_owned());
    }
}

/// Keep the last `keep` records of a stream for failure reports
pub fn spawn_diagnostics_tail(reader: BoxedReader, keep: usize) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(keep);
        read_records(reader, |line| {
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line);
            true
        })
        .await;
        tail.into_iter().collect()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Streaming,
    Draining,
    Done,
}

/// What the monitor saw by the time the process was gone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorReport {
    /// `None` if the process could not be reaped even after termination
    pub exit: Option<ExitOutcome>,
    pub last_amount: u64,
    pub samples: usize,
    /// Monitoring was cut short by a stop notification
    pub stopped: bool,
}

/// Follows one transcoder's progress stream until the process is gone
pub struct ProgressMonitor {
    key: JobKey,
    estimate: Option<Estimate>,
    poll: Duration,
    exit_wait: Duration,
    state: MonitorState,
    last_amount: u64,
    samples: usize,
}

impl ProgressMonitor {
    pub fn new(key: JobKey, estimate: Option<Estimate>, poll: Duration, exit_wait: Duration) -> Self {
        Self {
            key,
            estimate,
            poll,
            exit_wait,
            state: MonitorState::Streaming,
            last_amount: 0,
            samples: 0,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    fn handle_line(&mut self, line: &str, on_sample: &mut impl FnMut(&ProgressSample, f64)) {
        let Some(estimate) = self.estimate else {
            return;
        };
        let Some(amount) = parse_progress_line(line).and_then(|t| t.amount_in(estimate.unit)) else {
            return;
        };
        // Only forward progress counts; ffmpeg can report lower values mid-run
        if amount <= self.last_amount {
            return;
        }
        self.last_amount = amount;
        self.samples += 1;
        let sample = ProgressSample { job_key: self.key, processed_amount: amount, timestamp: Utc::now() };
        on_sample(&sample, job_percent(amount, estimate.amount));
    }

    /// Stream, drain, and reap. `on_sample` gets every parsed sample with the
    /// job's clamped percentage.
    pub async fn run(
        &mut self,
        controller: Arc<dyn ProcessController>,
        progress: BoxedReader,
        stop: Arc<Notify>,
        mut on_sample: impl FnMut(&ProgressSample, f64),
    ) -> MonitorReport {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reader = tokio::spawn(async move {
            read_records(progress, |line| tx.send(ReaderEvent::Line(line)).is_ok()).await;
            let _ = tx.send(ReaderEvent::Eof);
        });

        self.state = MonitorState::Streaming;
        let mut stopped = false;
        while self.state == MonitorState::Streaming {
            tokio::select! {
                biased;
                _ = stop.notified() => {
                    debug!("Job {}: monitor stopped", self.key);
                    stopped = true;
                    self.state = MonitorState::Draining;
                }
                received = timeout(self.poll, rx.recv()) => match received {
                    Ok(Some(ReaderEvent::Line(line))) => self.handle_line(&line, &mut on_sample),
                    Ok(Some(ReaderEvent::Eof)) | Ok(None) => self.state = MonitorState::Draining,
                    Err(_) => {
                        if let Ok(Some(_)) = controller.try_exit() {
                            self.state = MonitorState::Draining;
                        }
                    }
                },
            }
        }

        // Output after a stop is discarded, so there is no point waiting long for it
        let reader_wait = if stopped { self.poll } else { self.exit_wait };
        if timeout(reader_wait, &mut reader).await.is_err() {
            warn!("Job {}: progress reader did not finish, aborting it", self.key);
            reader.abort();
        }
        while let Ok(event) = rx.try_recv() {
            if let ReaderEvent::Line(line) = event {
                if !stopped {
                    self.handle_line(&line, &mut on_sample);
                }
            }
        }

        let mut exit = wait_for_exit(controller.as_ref(), self.exit_wait, self.poll).await;
        if exit.is_none() {
            warn!("Job {}: transcoder still running after {:?}, terminating", self.key, self.exit_wait);
            let _ = controller.terminate();
            exit = wait_for_exit(controller.as_ref(), self.exit_wait, self.poll).await;
        }

        self.state = MonitorState::Done;
        MonitorReport { exit, last_amount: self.last_amount, samples: self.samples, stopped }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use proptest::prelude::*;

    #[test]
    fn test_parse_stats_line() {
        let line = "size=     256kB time=00:00:16.32 bitrate= 128.5kbits/s speed=32.6x";
        assert_eq!(parse_progress_line(line), Some(ProgressToken::SizeKb(256)));
        assert_eq!(parse_progress_line("size=  12KiB time=00:00:01.00"), Some(ProgressToken::SizeKb(12)));
        assert_eq!(parse_progress_line("size=2MiB"), Some(ProgressToken::SizeKb(2048)));
        assert_eq!(parse_progress_line("size=2048B"), Some(ProgressToken::SizeKb(2)));
    }

    #[test]
    fn test_parse_progress_keys() {
        assert_eq!(parse_progress_line("out_time_ms=1500000"), Some(ProgressToken::OutTimeMicros(1_500_000)));
        assert_eq!(parse_progress_line("out_time_ms=-23220"), Some(ProgressToken::OutTimeMicros(0)));
        assert_eq!(parse_progress_line("out_time_ms=N/A"), None);
        assert_eq!(parse_progress_line("total_size=123456"), None);
        assert_eq!(parse_progress_line("size=N/A time=N/A"), None);
        assert_eq!(parse_progress_line("frame=10"), None);
        assert_eq!(parse_progress_line(""), None);
    }

    #[test]
    fn test_token_units() {
        assert_eq!(ProgressToken::OutTimeMicros(2_500_000).amount_in(ProgressUnit::Millis), Some(2500));
        assert_eq!(ProgressToken::SizeKb(10).amount_in(ProgressUnit::Millis), None);
        assert_eq!(ProgressToken::SizeKb(10).amount_in(ProgressUnit::Kilobytes), Some(10));
    }

    #[test]
    fn test_job_percent_clamps() {
        assert_eq!(job_percent(50, 200), 25.0);
        assert_eq!(job_percent(500, 200), 100.0);
        assert_eq!(job_percent(5, 0), 0.0);
    }

    /// Exits as soon as it is terminated or released
    struct FakeController {
        exited: AtomicBool,
        outcome: Mutex<ExitOutcome>,
    }

    impl FakeController {
        fn new(success: bool) -> Arc<Self> {
            Arc::new(Self {
                exited: AtomicBool::new(false),
                outcome: Mutex::new(ExitOutcome { code: Some(if success { 0 } else { 1 }), success }),
            })
        }
    }

    impl ProcessController for FakeController {
        fn pid(&self) -> Option<u32> {
            None
        }
        fn suspend(&self) -> io::Result<()> {
            Ok(())
        }
        fn resume(&self) -> io::Result<()> {
            Ok(())
        }
        fn terminate(&self) -> io::Result<()> {
            *self.outcome.lock().unwrap() = ExitOutcome { code: None, success: false };
            self.exited.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn try_exit(&self) -> io::Result<Option<ExitOutcome>> {
            Ok(self.exited.load(Ordering::SeqCst).then(|| *self.outcome.lock().unwrap()))
        }
    }

    fn monitor(amount: u64) -> ProgressMonitor {
        ProgressMonitor::new(
            JobKey::new(),
            Some(Estimate { amount, unit: ProgressUnit::Kilobytes }),
            Duration::from_millis(10),
            Duration::from_millis(500),
        )
    }

    #[tokio::test]
    async fn test_monitor_streams_carriage_return_records() {
        let controller = FakeController::new(true);
        controller.exited.store(true, Ordering::SeqCst);
        let stream = b"size=     10kB time=1\rsize=     50kB time=2\rsize=  250kB time=3\n".to_vec();

        let mut seen = Vec::new();
        let mut mon = monitor(100);
        let report = mon
            .run(controller, Box::new(io::Cursor::new(stream)), Arc::new(Notify::new()), |s, pct| {
                seen.push((s.processed_amount, pct))
            })
            .await;

        assert_eq!(seen, vec![(10, 10.0), (50, 50.0), (250, 100.0)]);
        assert_eq!(report.samples, 3);
        assert_eq!(report.last_amount, 250);
        assert!(!report.stopped);
        assert_eq!(report.exit, Some(ExitOutcome { code: Some(0), success: true }));
        assert_eq!(mon.state(), MonitorState::Done);
    }

    #[tokio::test]
    async fn test_monitor_percent_never_goes_backwards() {
        let controller = FakeController::new(true);
        controller.exited.store(true, Ordering::SeqCst);
        let stream = b"out_time_ms=500000\nout_time_ms=-23220\nout_time_ms=300000\nout_time_ms=800000\n".to_vec();

        let mut seen = Vec::new();
        let mut mon = ProgressMonitor::new(
            JobKey::new(),
            Some(Estimate { amount: 1000, unit: ProgressUnit::Millis }),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );
        let report = mon
            .run(controller, Box::new(io::Cursor::new(stream)), Arc::new(Notify::new()), |_, pct| seen.push(pct))
            .await;

        assert_eq!(seen, vec![50.0, 80.0]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(report.last_amount, 800);
        assert_eq!(report.samples, 2);
    }

    #[tokio::test]
    async fn test_monitor_stop_terminates_silent_process() {
        let controller = FakeController::new(true);
        // Never produces output and never closes
        let (_keep_open, stream) = tokio::io::duplex(64);
        let stop = Arc::new(Notify::new());
        stop.notify_one();

        let mut mon = monitor(100);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            mon.run(controller.clone(), Box::new(stream), stop, |_, _| {}),
        )
        .await
        .expect("monitor must not hang");

        assert!(report.stopped);
        assert_eq!(report.samples, 0);
        assert_eq!(report.exit.map(|e| e.success), Some(false));
        assert!(controller.exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_monitor_notices_exit_without_eof() {
        let controller = FakeController::new(false);
        let (_keep_open, stream) = tokio::io::duplex(64);
        let exiter = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            exiter.exited.store(true, Ordering::SeqCst);
        });

        let mut mon = monitor(100);
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            mon.run(controller, Box::new(stream), Arc::new(Notify::new()), |_, _| {}),
        )
        .await
        .unwrap();
        assert!(!report.stopped);
        assert_eq!(report.exit, Some(ExitOutcome { code: Some(1), success: false }));
    }

    #[tokio::test]
    async fn test_diagnostics_tail_keeps_last_lines() {
        let text: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let tail = spawn_diagnostics_tail(Box::new(io::Cursor::new(text.into_bytes())), 20)
            .await
            .unwrap();
        assert_eq!(tail.len(), 20);
        assert_eq!(tail[0], "line 10");
        assert_eq!(tail[19], "line 29");
    }

    proptest! {
        /// Arbitrary input never panics the parser
        #[test]
        fn prop_parser_total(line in "\\PC*") {
            let _ = parse_progress_line(&line);
        }

        /// Any well-formed size field is recovered
        #[test]
        fn prop_size_roundtrip(n in 0u64..10_000_000, pad in 0usize..8) {
            let line = format!("size={}{}kB time=00:00:01.00", " ".repeat(pad), n);
            prop_assert_eq!(parse_progress_line(&line), Some(ProgressToken::SizeKb(n)));
        }
    }
}
