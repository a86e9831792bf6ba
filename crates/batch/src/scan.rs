use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use log::{debug, info, warn};
use walkdir::WalkDir;
use crate::config::{BatchConfig, OverwritePolicy, Profile};
use crate::error::{BatchError, Result};
use crate::job::{Destination, Disposition, Job, JobStatus};
use crate::probe::Probe;
use crate::sink::StatusSender;

/// Mirror `relative` under `dest_root`, swapping the extension when the
/// profile has a fixed output format
pub fn destination_path(dest_root: &Path, relative: &Path, output_ext: Option<&str>) -> PathBuf {
    let mut path = dest_root.join(relative);
    if let Some(ext) = output_ext {
        path.set_extension(ext);
    }
    path
}

/// `dir/a.mp3` with n = 2 becomes `dir/a(2).mp3`
pub fn renamed_candidate(path: &Path, n: u32) -> PathBuf {
    let mut name = OsString::new();
    if let Some(stem) = path.file_stem() {
        name.push(stem);
    }
    name.push(format!("({})", n));
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

/// Apply the overwrite policy. `None` means the job is skipped.
pub fn resolve_destination(
    candidate: PathBuf,
    policy: OverwritePolicy,
    exists: impl Fn(&Path) -> bool,
) -> Option<Destination> {
    if !exists(&candidate) {
        return Some(Destination { path: candidate, disposition: Disposition::Fresh });
    }
    match policy {
        OverwritePolicy::Skip => None,
        OverwritePolicy::Overwrite => {
            Some(Destination { path: candidate, disposition: Disposition::Overwrite })
        }
        OverwritePolicy::Rename => {
            let mut n = 1;
            while exists(&renamed_candidate(&candidate, n)) {
                n += 1;
            }
            Some(Destination {
                path: renamed_candidate(&candidate, n),
                disposition: Disposition::Renamed,
            })
        }
    }
}

/// "{n} files analyzed, total duration: {x} Minutes|Hours"
pub fn analysis_status(files: usize, total_secs: f64) -> String {
    if total_secs > 3600.0 {
        format!("{} files analyzed, total duration: {:.2} Hours", files, total_secs / 3600.0)
    } else {
        format!("{} files analyzed, total duration: {:.2} Minutes", files, total_secs / 60.0)
    }
}

/// Turns a source tree into jobs
pub struct JobScanner {
    extensions: Vec<String>,
    dest_dir: PathBuf,
    output_ext: Option<&'static str>,
    policy: OverwritePolicy,
    profile: Profile,
    tempo: f64,
    default_kbps: u64,
    status_interval: Duration,
    probe: Arc<dyn Probe>,
    status: StatusSender,
}

impl JobScanner {
    pub fn new(cfg: &BatchConfig, probe: Arc<dyn Probe>, status: StatusSender) -> Self {
        Self {
            extensions: cfg.effective_extensions(),
            dest_dir: cfg.dest_dir.clone(),
            output_ext: cfg.profile.output_extension(),
            policy: cfg.overwrite,
            profile: cfg.profile,
            tempo: cfg.tempo,
            default_kbps: cfg.default_bitrate_kbps,
            status_interval: cfg.status_interval(),
            probe,
            status,
        }
    }

    /// Walk `root` once. Fails only when the root itself cannot be read;
    /// per-file problems end up on the yielded jobs.
    pub fn scan(self, root: &Path) -> Result<ScanIter> {
        std::fs::read_dir(root).map_err(|source| BatchError::SourceRoot {
            path: root.to_path_buf(),
            source,
        })?;

        info!("Scanning directory: {}", root.display());
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        Ok(ScanIter {
            scanner: self,
            root: root.to_path_buf(),
            walker,
            claimed: HashSet::new(),
            files: 0,
            total_secs: 0.0,
            last_status: Instant::now(),
            finished: false,
        })
    }

    fn matches(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|s| s.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }
}

/// Lazy, single-pass sequence of jobs
pub struct ScanIter {
    scanner: JobScanner,
    root: PathBuf,
    walker: walkdir::IntoIter,
    claimed: HashSet<PathBuf>,
    files: usize,
    total_secs: f64,
    last_status: Instant,
    finished: bool,
}

impl ScanIter {
    fn build_job(&mut self, path: &Path, source_bytes: u64) -> Job {
        let relative = path.strip_prefix(&self.root).unwrap_or(path).to_path_buf();
        let mut job = Job::new(path.to_path_buf(), relative, source_bytes);
        let sc = &self.scanner;

        let candidate = destination_path(&sc.dest_dir, &job.relative_path, sc.output_ext);
        let claimed = &self.claimed;
        let resolved = resolve_destination(candidate, sc.policy, |p| p.exists() || claimed.contains(p));

        let destination = match resolved {
            Some(d) => d,
            None => {
                debug!("Skipping {}: destination exists", job.display_name());
                job.finish(JobStatus::Skipped, Some("destination exists".to_string()));
                return job;
            }
        };
        self.claimed.insert(destination.path.clone());
        job.destination = Some(destination);

        match sc.probe.probe(path) {
            Ok(info) => {
                let estimate = info.estimate(sc.profile, sc.tempo, sc.default_kbps);
                debug!("{}: estimate {:?}", job.display_name(), estimate);
                let output_secs = info.output_secs(sc.tempo);
                self.total_secs += output_secs;
                job.output_secs = Some(output_secs);
                job.estimate = Some(estimate);
            }
            Err(e) => {
                warn!("Could not probe {}: {}", path.display(), e);
                job.finish(JobStatus::Failed, Some(e.to_string()));
            }
        }
        job
    }

    fn emit_status(&mut self) {
        self.scanner.status.post(analysis_status(self.files, self.total_secs), true);
        self.last_status = Instant::now();
    }
}

impl Iterator for ScanIter {
    type Item = Job;

    fn next(&mut self) -> Option<Job> {
        if self.finished {
            return None;
        }

        while let Some(entry) = self.walker.next() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() || !self.scanner.matches(entry.path()) {
                continue;
            }

            let source_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let path = entry.path().to_path_buf();
            let job = self.build_job(&path, source_bytes);
            self.files += 1;

            if self.last_status.elapsed() >= self.scanner.status_interval {
                self.emit_status();
            }
            return Some(job);
        }

        self.finished = true;
        info!("Scan complete: {} media files, {:.0} s of output", self.files, self.total_secs);
        self.emit_status();
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::probe::ProbeInfo;
    use crate::sink::StatusEvent;

    struct CountingProbe {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl CountingProbe {
        fn new(fail_on: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail_on })
        }
    }

    impl Probe for CountingProbe {
        fn probe(&self, path: &Path) -> Result<ProbeInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(name) = self.fail_on {
                if path.file_name().and_then(|s| s.to_str()) == Some(name) {
                    return Err(BatchError::Scan { path: path.to_path_buf(), reason: "corrupt".into() });
                }
            }
            Ok(ProbeInfo { bitrate_kbps: Some(128), duration_secs: 60.0 })
        }
    }

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, b"data").unwrap();
    }

    fn config(src: &Path, dst: &Path, overwrite: OverwritePolicy) -> BatchConfig {
        BatchConfig {
            source_dir: src.to_path_buf(),
            dest_dir: dst.to_path_buf(),
            overwrite,
            ..BatchConfig::default_config()
        }
    }

    #[test]
    fn test_rename_picks_next_free_suffix() {
        let existing: HashSet<PathBuf> = ["/d/a.mp3", "/d/a(1).mp3"].iter().map(PathBuf::from).collect();
        let dest = resolve_destination(PathBuf::from("/d/a.mp3"), OverwritePolicy::Rename, |p| existing.contains(p))
            .unwrap();
        assert_eq!(dest.path, PathBuf::from("/d/a(2).mp3"));
        assert_eq!(dest.disposition, Disposition::Renamed);
    }

    #[test]
    fn test_resolve_fresh_skip_overwrite() {
        let fresh = resolve_destination(PathBuf::from("/d/a.mp3"), OverwritePolicy::Skip, |_| false).unwrap();
        assert_eq!(fresh.disposition, Disposition::Fresh);
        assert!(resolve_destination(PathBuf::from("/d/a.mp3"), OverwritePolicy::Skip, |_| true).is_none());
        let over = resolve_destination(PathBuf::from("/d/a.mp3"), OverwritePolicy::Overwrite, |_| true).unwrap();
        assert_eq!(over.disposition, Disposition::Overwrite);
        assert_eq!(over.path, PathBuf::from("/d/a.mp3"));
    }

    #[test]
    fn test_destination_mirrors_relative_path() {
        let p = destination_path(Path::new("/out"), Path::new("book/ch1.flac"), Some("mp3"));
        assert_eq!(p, PathBuf::from("/out/book/ch1.mp3"));
        let p = destination_path(Path::new("/out"), Path::new("clip.mkv"), None);
        assert_eq!(p, PathBuf::from("/out/clip.mkv"));
    }

    #[test]
    fn test_analysis_status_units() {
        assert_eq!(analysis_status(3, 90.0), "3 files analyzed, total duration: 1.50 Minutes");
        assert_eq!(analysis_status(9, 7200.0), "9 files analyzed, total duration: 2.00 Hours");
    }

    #[test]
    fn test_skip_existing_never_probes() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        touch(&src.path().join("a.wav"));
        touch(&src.path().join("sub/b.WAV"));
        touch(&src.path().join("notes.txt"));
        touch(&dst.path().join("a.mp3"));

        let probe = CountingProbe::new(None);
        let (status, _rx) = StatusSender::channel();
        let cfg = config(src.path(), dst.path(), OverwritePolicy::Skip);
        let jobs: Vec<Job> = JobScanner::new(&cfg, probe.clone(), status).scan(src.path()).unwrap().collect();

        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].relative_path, PathBuf::from("a.wav"));
        assert_eq!(jobs[0].status, JobStatus::Skipped);
        assert!(jobs[0].estimate.is_none());
        assert_eq!(jobs[1].status, JobStatus::Pending);
        assert_eq!(jobs[1].destination_path(), Some(dst.path().join("sub/b.mp3").as_path()));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_probe_failure_marks_job_failed() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        touch(&src.path().join("bad.mp3"));
        touch(&src.path().join("good.mp3"));

        let probe = CountingProbe::new(Some("bad.mp3"));
        let (status, _rx) = StatusSender::channel();
        let cfg = config(src.path(), dst.path(), OverwritePolicy::Skip);
        let jobs: Vec<Job> = JobScanner::new(&cfg, probe, status).scan(src.path()).unwrap().collect();

        assert_eq!(jobs[0].status, JobStatus::Failed);
        assert!(jobs[0].reason.as_deref().unwrap().contains("corrupt"));
        assert_eq!(jobs[1].status, JobStatus::Pending);
        assert_eq!(jobs[1].estimated_amount(), 412);
    }

    #[test]
    fn test_same_output_claimed_once() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        touch(&src.path().join("a.flac"));
        touch(&src.path().join("a.wav"));

        let (status, _rx) = StatusSender::channel();
        let cfg = config(src.path(), dst.path(), OverwritePolicy::Rename);
        let jobs: Vec<Job> = JobScanner::new(&cfg, CountingProbe::new(None), status)
            .scan(src.path())
            .unwrap()
            .collect();

        assert_eq!(jobs[0].destination_path(), Some(dst.path().join("a.mp3").as_path()));
        assert_eq!(jobs[1].destination_path(), Some(dst.path().join("a(1).mp3").as_path()));
    }

    #[test]
    fn test_final_status_line_replaces() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        touch(&src.path().join("a.mp3"));

        let (status, mut rx) = StatusSender::channel();
        let cfg = config(src.path(), dst.path(), OverwritePolicy::Skip);
        let count = JobScanner::new(&cfg, CountingProbe::new(None), status)
            .scan(src.path())
            .unwrap()
            .count();
        assert_eq!(count, 1);

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        match last {
            Some(StatusEvent::Message { text, replace }) => {
                assert!(replace);
                assert_eq!(text, "1 files analyzed, total duration: 1.00 Minutes");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unreadable_root_is_fatal() {
        let (status, _rx) = StatusSender::channel();
        let cfg = config(Path::new("/no/such/dir"), Path::new("/tmp"), OverwritePolicy::Skip);
        let result = JobScanner::new(&cfg, CountingProbe::new(None), status).scan(Path::new("/no/such/dir"));
        assert!(matches!(result, Err(BatchError::SourceRoot { .. })));
    }
}
