use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use log::debug;
use tokio::io::AsyncRead;
use tokio::process::Command;
use crate::config::{BatchConfig, Profile};
use crate::error::{BatchError, Result};
use crate::job::Job;
use crate::process::{ChildProcess, ProcessController};

/// Which pipe carries the progress lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressChannel {
    /// `-progress pipe:1` key=value blocks
    Stdout,
    /// `-stats` lines
    Stderr,
}

impl Profile {
    pub fn progress_channel(&self) -> ProgressChannel {
        match self {
            Profile::Audio => ProgressChannel::Stderr,
            Profile::Video => ProgressChannel::Stdout,
        }
    }
}

/// Everything that shapes the transcoder command line
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvocationPolicy {
    pub profile: Profile,
    pub tempo: f64,
    pub compression: bool,
}

impl From<&BatchConfig> for InvocationPolicy {
    fn from(cfg: &BatchConfig) -> Self {
        Self { profile: cfg.profile, tempo: cfg.tempo, compression: cfg.compression }
    }
}

/// Command builder for generating ffmpeg command lines
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    policy: InvocationPolicy,
}

impl CommandBuilder {
    pub fn new(policy: InvocationPolicy) -> Self {
        Self { policy }
    }

    /// Full argument vector (without the program) for one job
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<String> {
        match self.policy.profile {
            Profile::Audio => self.audio_args(input, output),
            Profile::Video => self.video_args(input, output),
        }
    }

    fn audio_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        if self.policy.compression {
            // VBR quality 7 at 22.05 kHz is plenty for speech
            args.push("-codec:a".to_string());
            args.push("libmp3lame".to_string());
            args.push("-q:a".to_string());
            args.push("7".to_string());
            args.push("-ar".to_string());
            args.push("22050".to_string());
        }

        args.push("-filter:a".to_string());
        args.push(format!("atempo={}", self.policy.tempo));
        args.push("-vn".to_string());

        args.push(output.to_string_lossy().to_string());
        args.push("-y".to_string());

        // Errors only, plus the size= stats line on stderr
        args.push("-hide_banner".to_string());
        args.push("-loglevel".to_string());
        args.push("error".to_string());
        args.push("-stats".to_string());

        args
    }

    fn video_args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args = Vec::new();

        args.push("-i".to_string());
        args.push(input.to_string_lossy().to_string());

        if self.policy.tempo != 1.0 {
            // Video timestamps stretch by 1/tempo, audio is resampled by atempo
            args.push("-filter:v".to_string());
            args.push(format!("setpts={:.8}*PTS,scale=640:360", 1.0 / self.policy.tempo));
            args.push("-filter:a".to_string());
            args.push(format!("atempo={}", self.policy.tempo));
        } else {
            args.push("-vf".to_string());
            args.push("scale=640:360".to_string());
        }
        args.push("-pix_fmt".to_string());
        args.push("yuv420p".to_string());

        for (flag, value) in [
            ("-c:v", "libaom-av1"),
            ("-b:v", "70k"),
            ("-crf", "30"),
            ("-cpu-used", "8"),
            ("-row-mt", "1"),
            ("-g", "240"),
            ("-aq-mode", "0"),
            ("-c:a", "aac"),
            ("-b:a", "80k"),
        ] {
            args.push(flag.to_string());
            args.push(value.to_string());
        }

        args.push(output.to_string_lossy().to_string());
        args.push("-y".to_string());

        args.push("-progress".to_string());
        args.push("pipe:1".to_string());
        args.push("-nostats".to_string());
        args.push("-hide_banner".to_string());
        args.push("-loglevel".to_string());
        args.push("error".to_string());

        args
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// A started transcoder, split into its control handle and output streams
pub struct SpawnedProcess {
    pub controller: Arc<dyn ProcessController>,
    /// Stream carrying progress lines
    pub progress: BoxedReader,
    /// The other pipe, kept for failure diagnostics
    pub diagnostics: Option<BoxedReader>,
}

/// Starts the transcoder for a job
pub trait Launcher: Send + Sync {
    fn launch(&self, job: &Job, output: &Path) -> Result<SpawnedProcess>;
}

/// Launcher backed by a local ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg_bin: PathBuf,
    builder: CommandBuilder,
    channel: ProgressChannel,
}

impl FfmpegLauncher {
    pub fn new(cfg: &BatchConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            builder: CommandBuilder::new(InvocationPolicy::from(cfg)),
            channel: cfg.profile.progress_channel(),
        }
    }
}

impl Launcher for FfmpegLauncher {
    fn launch(&self, job: &Job, output: &Path) -> Result<SpawnedProcess> {
        let args = self.builder.build_args(&job.source_path, output);
        debug!("Job {}: executing {} {}", job.key, self.ffmpeg_bin.display(), args.join(" "));

        let spawn_err = |source: std::io::Error| BatchError::Spawn {
            program: self.ffmpeg_bin.clone(),
            source,
        };

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let missing = |name: &str| {
            spawn_err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("failed to capture ffmpeg {}", name),
            ))
        };
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (progress, diagnostics): (BoxedReader, BoxedReader) = match self.channel {
            ProgressChannel::Stdout => (Box::new(stdout), Box::new(stderr)),
            ProgressChannel::Stderr => (Box::new(stderr), Box::new(stdout)),
        };

        Ok(SpawnedProcess {
            controller: Arc::new(ChildProcess::new(child)),
            progress,
            diagnostics: Some(diagnostics),
        })
    }
}
