use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure taxonomy of a batch run.
///
/// Everything except `SourceRoot` and `Config` is contained within the job
/// that produced it: the job is marked and the pool moves on.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The source root cannot be read; nothing is queued.
    #[error("cannot read source directory {}: {source}", path.display())]
    SourceRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The duration/bitrate probe failed for a source file.
    #[error("probe failed for {}: {reason}", path.display())]
    Scan { path: PathBuf, reason: String },

    /// The transcoder could not be started.
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transcoder exited unsuccessfully.
    #[error("transcoder exit code {}", exit_label(.code))]
    ProcessCrash { code: Option<i32>, tail: String },

    #[error("cancelled by operator")]
    CancelledByOperator,

    /// A worker or process did not stop within its bounded wait.
    #[error("{what} did not stop within {timeout:?}")]
    ShutdownTimeout { what: String, timeout: Duration },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (killed by signal)".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_message_includes_exit_code() {
        let err = BatchError::ProcessCrash { code: Some(1), tail: String::new() };
        assert_eq!(err.to_string(), "transcoder exit code 1");

        let err = BatchError::ProcessCrash { code: None, tail: String::new() };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_source_root_message_names_path() {
        let err = BatchError::SourceRoot {
            path: PathBuf::from("/nowhere"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/nowhere"));
    }
}
