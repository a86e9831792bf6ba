use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::BatchError;
use crate::job::ProgressUnit;

/// What to do when the mirrored destination already exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwritePolicy {
    Skip,
    Overwrite,
    Rename,
}

impl FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "skip" => Ok(OverwritePolicy::Skip),
            "overwrite" => Ok(OverwritePolicy::Overwrite),
            "rename" => Ok(OverwritePolicy::Rename),
            other => Err(format!("unknown overwrite policy '{}' (skip|overwrite|rename)", other)),
        }
    }
}

impl fmt::Display for OverwritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OverwritePolicy::Skip => "skip",
            OverwritePolicy::Overwrite => "overwrite",
            OverwritePolicy::Rename => "rename",
        };
        f.write_str(s)
    }
}

/// Output profile. Decides the extension set, the encoder arguments and
/// the progress unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Speech-oriented mp3 at an adjusted tempo
    Audio,
    /// Small AV1 renditions that keep the source container
    Video,
}

impl Profile {
    pub fn default_extensions(&self) -> Vec<String> {
        let exts: &[&str] = match self {
            Profile::Audio => &["mp3", "m4a", "m4b", "wav", "ogg", "flac"],
            Profile::Video => &["mp4", "mkv", "avi", "webm", "flv", "wmv"],
        };
        exts.iter().map(|e| e.to_string()).collect()
    }

    /// `None` keeps the source extension
    pub fn output_extension(&self) -> Option<&'static str> {
        match self {
            Profile::Audio => Some("mp3"),
            Profile::Video => None,
        }
    }

    pub fn progress_unit(&self) -> ProgressUnit {
        match self {
            Profile::Audio => ProgressUnit::Kilobytes,
            Profile::Video => ProgressUnit::Millis,
        }
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(Profile::Audio),
            "video" => Ok(Profile::Video),
            other => Err(format!("unknown profile '{}' (audio|video)", other)),
        }
    }
}

pub const MAX_THREADS: usize = 16;
pub const MAX_TEMPO: f64 = 2.0;

/// Configuration for one batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Root of the tree to transcode
    pub source_dir: PathBuf,
    /// Root the relative layout is mirrored into
    pub dest_dir: PathBuf,
    /// Number of concurrent transcoder processes
    pub threads: usize,
    /// Playback speed multiplier applied by the transcoder
    pub tempo: f64,
    /// Add the low-bitrate audio encoder block
    pub compression: bool,
    pub overwrite: OverwritePolicy,
    pub profile: Profile,
    /// Overrides the profile's extension list
    pub extensions: Option<Vec<String>>,
    /// Bitrate cap used for audio size estimates (kbit/s)
    pub default_bitrate_kbps: u64,
    pub poll_interval_ms: u64,
    pub progress_refresh_ms: u64,
    pub status_interval_ms: u64,
    pub cancel_wait_ms: u64,
    pub exit_wait_ms: u64,
    pub shutdown_join_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl BatchConfig {
    pub fn default_config() -> Self {
        Self {
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            source_dir: PathBuf::new(),
            dest_dir: PathBuf::new(),
            threads: 4,
            tempo: 1.0,
            compression: false,
            overwrite: OverwritePolicy::Skip,
            profile: Profile::Audio,
            extensions: None,
            default_bitrate_kbps: 55,
            poll_interval_ms: 100,
            progress_refresh_ms: 300,
            status_interval_ms: 1000,
            cancel_wait_ms: 3000,
            exit_wait_ms: 5000,
            shutdown_join_ms: 500,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), BatchError> {
        if !(self.tempo > 0.0 && self.tempo <= MAX_TEMPO) {
            return Err(BatchError::Config(format!(
                "tempo must be in (0, {}], got {}",
                MAX_TEMPO, self.tempo
            )));
        }
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(BatchError::Config(format!(
                "threads must be in 1..={}, got {}",
                MAX_THREADS, self.threads
            )));
        }
        if self.source_dir.as_os_str().is_empty() {
            return Err(BatchError::Config("source directory is not set".to_string()));
        }
        if self.dest_dir.as_os_str().is_empty() {
            return Err(BatchError::Config("destination directory is not set".to_string()));
        }
        if self.poll_interval_ms == 0 {
            return Err(BatchError::Config("poll interval must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Lower-cased extensions (no dot) that select source files
    pub fn effective_extensions(&self) -> Vec<String> {
        match &self.extensions {
            Some(list) if !list.is_empty() => list
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            _ => self.profile.default_extensions(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_refresh(&self) -> Duration {
        Duration::from_millis(self.progress_refresh_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_millis(self.cancel_wait_ms)
    }

    pub fn exit_wait(&self) -> Duration {
        Duration::from_millis(self.exit_wait_ms)
    }

    pub fn shutdown_join(&self) -> Duration {
        Duration::from_millis(self.shutdown_join_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> BatchConfig {
        BatchConfig {
            source_dir: PathBuf::from("/in"),
            dest_dir: PathBuf::from("/out"),
            ..BatchConfig::default_config()
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = BatchConfig::load_config(Some(Path::new("/definitely/not/here.toml"))).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.overwrite, OverwritePolicy::Skip);
        assert_eq!(config.default_bitrate_kbps, 55);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "threads = 8\ntempo = 1.5\noverwrite = \"rename\"\nprofile = \"video\"").unwrap();

        let config = BatchConfig::load_config(Some(file.path())).unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.tempo, 1.5);
        assert_eq!(config.overwrite, OverwritePolicy::Rename);
        assert_eq!(config.profile, Profile::Video);
        assert_eq!(config.poll_interval_ms, 100);
    }

    #[test]
    fn test_load_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"compression": true, "source_dir": "/a"}}"#).unwrap();

        let config = BatchConfig::load_config(Some(file.path())).unwrap();
        assert!(config.compression);
        assert_eq!(config.source_dir, PathBuf::from("/a"));
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(BatchConfig::load_config(Some(file.path())).is_err());
    }

    #[test]
    fn test_validate_ranges() {
        assert!(valid().validate().is_ok());
        assert!(BatchConfig { tempo: 2.0, ..valid() }.validate().is_ok());
        assert!(BatchConfig { tempo: 0.0, ..valid() }.validate().is_err());
        assert!(BatchConfig { tempo: 2.01, ..valid() }.validate().is_err());
        assert!(BatchConfig { threads: 0, ..valid() }.validate().is_err());
        assert!(BatchConfig { threads: 17, ..valid() }.validate().is_err());
        assert!(BatchConfig { dest_dir: PathBuf::new(), ..valid() }.validate().is_err());
    }

    #[test]
    fn test_extension_override_is_normalised() {
        let config = BatchConfig {
            extensions: Some(vec![".WAV".to_string(), "flac".to_string()]),
            ..valid()
        };
        assert_eq!(config.effective_extensions(), vec!["wav", "flac"]);
        assert_eq!(valid().effective_extensions().len(), 6);
    }

    #[test]
    fn test_policy_parses_case_insensitively() {
        assert_eq!("Rename".parse::<OverwritePolicy>(), Ok(OverwritePolicy::Rename));
        assert!("replace".parse::<OverwritePolicy>().is_err());
        assert_eq!("VIDEO".parse::<Profile>(), Ok(Profile::Video));
    }
}
