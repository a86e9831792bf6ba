use anyhow::{Context, Result};
use batch::{
    Batch, BatchConfig, BatchHandle, ControlOutcome, FfmpegLauncher, FfprobeProbe, OverwritePolicy,
    Profile, StatusSink, Summary,
};
use clap::Parser;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Batch-transcode a directory tree with ffmpeg
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source directory
    #[arg(short, long)]
    src: Option<PathBuf>,

    /// Destination directory
    #[arg(short, long)]
    dst: Option<PathBuf>,

    /// Number of concurrent transcoders (1-16)
    #[arg(short = 'j', long)]
    threads: Option<usize>,

    /// Playback speed multiplier (0 < tempo <= 2)
    #[arg(short, long)]
    tempo: Option<f64>,

    /// What to do with existing outputs: skip, overwrite or rename
    #[arg(long)]
    overwrite: Option<OverwritePolicy>,

    /// Output profile: audio or video
    #[arg(long)]
    profile: Option<Profile>,

    /// Use the low-bitrate audio encoder settings
    #[arg(long)]
    compression: bool,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Path to the ffprobe binary
    #[arg(long)]
    ffprobe: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(&self, cfg: &mut BatchConfig) {
        if let Some(src) = &self.src {
            cfg.source_dir = src.clone();
        }
        if let Some(dst) = &self.dst {
            cfg.dest_dir = dst.clone();
        }
        if let Some(threads) = self.threads {
            cfg.threads = threads;
        }
        if let Some(tempo) = self.tempo {
            cfg.tempo = tempo;
        }
        if let Some(overwrite) = self.overwrite {
            cfg.overwrite = overwrite;
        }
        if let Some(profile) = self.profile {
            cfg.profile = profile;
        }
        if self.compression {
            cfg.compression = true;
        }
        if let Some(ffmpeg) = &self.ffmpeg {
            cfg.ffmpeg_bin = ffmpeg.clone();
        }
        if let Some(ffprobe) = &self.ffprobe {
            cfg.ffprobe_bin = ffprobe.clone();
        }
    }
}

/// Status sink that writes everything to the log
struct LogSink;

impl StatusSink for LogSink {
    fn post(&self, message: &str, replace: bool) {
        if replace {
            debug!("{}", message);
        } else {
            info!("{}", message);
        }
    }

    fn set_slot_progress(&self, slot: usize, percent: f64, label: &str) {
        debug!("[{}] {:>5.1}% {}", slot + 1, percent, label);
    }

    fn set_overall_progress(&self, _percent: f64, label: &str) {
        info!("Overall: {}", label);
    }

    fn finished(&self, summary: &Summary) {
        info!("✅ {}", summary.line());
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Pause(usize),
    Resume(usize),
    Cancel(usize),
    Status,
    Quit,
}

/// `pause 2`, `resume 2`, `cancel 2`, `status`, `quit`. Slots are 1-based.
fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let verb = parts.next()?.to_ascii_lowercase();
    let slot = parts
        .next()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .map(|n| n - 1);
    match (verb.as_str(), slot) {
        ("pause" | "p", Some(slot)) => Some(Command::Pause(slot)),
        ("resume" | "r", Some(slot)) => Some(Command::Resume(slot)),
        ("cancel" | "c", Some(slot)) => Some(Command::Cancel(slot)),
        ("status" | "s", None) => Some(Command::Status),
        ("quit" | "q", None) => Some(Command::Quit),
        _ => None,
    }
}

fn report(action: &str, slot: usize, outcome: ControlOutcome) {
    match outcome {
        ControlOutcome::Applied => info!("{} slot {}", action, slot + 1),
        ControlOutcome::NotRunning => warn!("Slot {} has no running job", slot + 1),
        ControlOutcome::Unsupported => warn!("{} is not supported on this platform", action),
    }
}

async fn read_commands(handle: Arc<BatchHandle>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match parse_command(&line) {
            Some(Command::Pause(slot)) => report("Paused", slot, handle.pause(slot)),
            Some(Command::Resume(slot)) => report("Resumed", slot, handle.resume(slot)),
            Some(Command::Cancel(slot)) => {
                if !handle.cancel(slot).await {
                    warn!("Slot {} has no running job", slot + 1);
                }
            }
            Some(Command::Status) => {
                info!("Overall {:.0}%", handle.percent());
                for view in handle.slots() {
                    info!("  [{}] {:?} {:>5.1}% {}", view.slot + 1, view.state, view.percent, view.label);
                }
            }
            Some(Command::Quit) => {
                handle.shutdown().await;
                break;
            }
            None => warn!("Unknown command '{}' (pause N | resume N | cancel N | status | quit)", line.trim()),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT (Ctrl-C), shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let mut cfg = BatchConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut cfg);

    info!("Tempo batch starting");
    info!("  Source: {}", cfg.source_dir.display());
    info!("  Destination: {}", cfg.dest_dir.display());
    info!("  Profile: {:?}, tempo {}, {} threads, overwrite {}", cfg.profile, cfg.tempo, cfg.threads, cfg.overwrite);

    let probe = Arc::new(FfprobeProbe::new(cfg.ffprobe_bin.clone()));
    let launcher = Arc::new(FfmpegLauncher::new(&cfg));
    let handle = Arc::new(
        Batch::start(cfg, probe, launcher, Arc::new(LogSink))
            .await
            .context("Failed to start batch")?,
    );

    let commands = tokio::spawn(read_commands(handle.clone()));

    tokio::select! {
        _ = handle.wait_idle() => {}
        _ = shutdown_signal() => {
            handle.shutdown().await;
        }
    }
    commands.abort();

    let summary = handle.wait().await;
    println!("{}", summary.line());
    Ok(())
}
