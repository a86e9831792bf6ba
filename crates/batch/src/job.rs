use std::fmt;
use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a job for the lifetime of one batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey(Uuid);

impl JobKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty to tell jobs apart in logs
        let simple = self.0.simple().to_string();
        f.write_str(&simple[..8])
    }
}

/// Lifecycle of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Skipped,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Skipped | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// How the destination path was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// Nothing existed at the mirrored path
    Fresh,
    /// An existing file is replaced
    Overwrite,
    /// A `(n)` suffix was appended to dodge an existing file
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub path: PathBuf,
    pub disposition: Disposition,
}

/// Unit of the progress denominator. A run uses exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressUnit {
    /// Kilobytes of output written
    Kilobytes,
    /// Milliseconds of output media encoded
    Millis,
}

/// Heuristic size of the job's output, used only as a progress denominator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Estimate {
    pub amount: u64,
    pub unit: ProgressUnit,
}

/// One source file scheduled for transcoding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    pub source_path: PathBuf,
    pub relative_path: PathBuf,
    pub destination: Option<Destination>,
    pub estimate: Option<Estimate>,
    /// Output media length in seconds after tempo, when the probe succeeded
    pub output_secs: Option<f64>,
    pub source_bytes: u64,
    pub status: JobStatus,
    pub reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(source_path: PathBuf, relative_path: PathBuf, source_bytes: u64) -> Self {
        Self {
            key: JobKey::new(),
            source_path,
            relative_path,
            destination: None,
            estimate: None,
            output_secs: None,
            source_bytes,
            status: JobStatus::Pending,
            reason: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Relative path as shown to the operator
    pub fn display_name(&self) -> String {
        self.relative_path.display().to_string()
    }

    pub fn destination_path(&self) -> Option<&Path> {
        self.destination.as_ref().map(|d| d.path.as_path())
    }

    pub fn estimated_amount(&self) -> u64 {
        self.estimate.map(|e| e.amount).unwrap_or(0)
    }

    /// Move to `next`. Terminal states are final; returns false if refused.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.is_terminal() || self.status == next {
            return false;
        }
        if next == JobStatus::Pending {
            return false;
        }
        match next {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            _ => self.finished_at = Some(Utc::now()),
        }
        self.status = next;
        true
    }

    /// Move to a terminal state and record why
    pub fn finish(&mut self, status: JobStatus, reason: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        if !self.transition(status) {
            return false;
        }
        self.reason = reason;
        true
    }
}
