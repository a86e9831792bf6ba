use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use log::debug;
use serde::Deserialize;
use crate::config::Profile;
use crate::error::{BatchError, Result};
use crate::job::{Estimate, ProgressUnit};

/// Duration and bitrate of a source file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    pub bitrate_kbps: Option<u64>,
    pub duration_secs: f64,
}

impl ProbeInfo {
    /// Output media length once the tempo is applied
    pub fn output_secs(&self, tempo: f64) -> f64 {
        self.duration_secs / tempo
    }

    /// Expected output amount in the profile's progress unit.
    ///
    /// Audio estimates kilobytes written, with the source bitrate capped at
    /// `default_kbps`. Video estimates milliseconds of encoded output.
    pub fn estimate(&self, profile: Profile, tempo: f64, default_kbps: u64) -> Estimate {
        let unit = profile.progress_unit();
        let amount = match unit {
            ProgressUnit::Kilobytes => {
                let kbps = self.bitrate_kbps.unwrap_or(default_kbps).min(default_kbps);
                (kbps as f64 * self.duration_secs / (8.0 * tempo)) as u64
            }
            ProgressUnit::Millis => (self.output_secs(tempo) * 1000.0) as u64,
        };
        Estimate { amount, unit }
    }
}

/// Reads duration and bitrate from a media file.
///
/// Called from the blocking scan task.
pub trait Probe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ProbeInfo>;
}

#[derive(Debug, Deserialize)]
struct FFProbeOutput {
    format: Option<FFProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct FFProbeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

/// Parse `-show_entries format=duration,bit_rate -of json` output
pub fn parse_probe_json(json: &str) -> std::result::Result<ProbeInfo, String> {
    let data: FFProbeOutput = serde_json::from_str(json)
        .map_err(|e| format!("invalid ffprobe JSON: {}", e))?;
    let format = data.format.ok_or_else(|| "ffprobe reported no format section".to_string())?;

    let duration_secs = format
        .duration
        .as_deref()
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0)
        .ok_or_else(|| "ffprobe reported no duration".to_string())?;

    // ffprobe reports bits per second
    let bitrate_kbps = format
        .bit_rate
        .as_deref()
        .and_then(|b| b.trim().parse::<u64>().ok())
        .map(|bps| bps / 1000);

    Ok(ProbeInfo { bitrate_kbps, duration_secs })
}

/// Probe backed by the ffprobe binary
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    ffprobe_bin: PathBuf,
}

impl FfprobeProbe {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self { ffprobe_bin: ffprobe_bin.into() }
    }
}

impl Probe for FfprobeProbe {
    fn probe(&self, path: &Path) -> Result<ProbeInfo> {
        let scan_err = |reason: String| BatchError::Scan { path: path.to_path_buf(), reason };

        debug!("ffprobe: probing {}", path.display());
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration,bit_rate")
            .arg("-of")
            .arg("json")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| scan_err(format!("failed to execute {}: {}", self.ffprobe_bin.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(scan_err(format!(
                "ffprobe exit code {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_probe_json(&stdout).map_err(scan_err)
    }
}
