// ABOUTME: Audio conversion through the ffmpeg CLI
// ABOUTME: Builds transcode/loudnorm arguments and parses ffmpeg's stderr diagnostics

use crate::error::{ConversionError, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, process::Stdio, time::Duration};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Number of stderr lines carried into error messages
const STDERR_TAIL_LINES: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    M4a,
    Ogg,
    Opus,
    Wav,
    Flac,
}

impl AudioFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('.').to_lowercase().as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "m4a" | "aac" => Some(AudioFormat::M4a),
            "ogg" | "vorbis" => Some(AudioFormat::Ogg),
            "opus" => Some(AudioFormat::Opus),
            "wav" => Some(AudioFormat::Wav),
            "flac" => Some(AudioFormat::Flac),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4a => "m4a",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Opus => "opus",
            AudioFormat::Wav => "wav",
            AudioFormat::Flac => "flac",
        }
    }

    pub fn codec(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "libmp3lame",
            AudioFormat::M4a => "aac",
            AudioFormat::Ogg => "libvorbis",
            AudioFormat::Opus => "libopus",
            AudioFormat::Wav => "pcm_s16le",
            AudioFormat::Flac => "flac",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::M4a => "audio/mp4",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Opus => "audio/opus",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Flac => "audio/flac",
        }
    }

    /// Lossless outputs ignore the bitrate setting
    pub fn is_lossless(&self) -> bool {
        matches!(self, AudioFormat::Wav | AudioFormat::Flac)
    }

    /// Most channels the encoder accepts
    pub fn max_channels(&self) -> u8 {
        match self {
            AudioFormat::Mp3 => 2,
            _ => 8,
        }
    }

    /// Sample rates the encoder accepts; `None` means any rate in the general range
    pub fn supported_sample_rates(&self) -> Option<&'static [u32]> {
        match self {
            AudioFormat::Mp3 => Some(&[
                8_000, 11_025, 12_000, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000,
            ]),
            AudioFormat::M4a => Some(&[
                8_000, 11_025, 12_000, 16_000, 22_050, 24_000, 32_000, 44_100, 48_000, 64_000,
                88_200, 96_000,
            ]),
            AudioFormat::Opus => Some(&[8_000, 12_000, 16_000, 24_000, 48_000]),
            AudioFormat::Ogg | AudioFormat::Wav | AudioFormat::Flac => None,
        }
    }
}

/// EBU R128 normalization target handed to the loudnorm filter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessTarget {
    pub integrated_lufs: f64,
    pub true_peak_dbtp: f64,
    pub loudness_range_lu: f64,
}

impl Default for LoudnessTarget {
    fn default() -> Self {
        Self {
            integrated_lufs: -16.0,
            true_peak_dbtp: -1.5,
            loudness_range_lu: 11.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioSettings {
    pub format: AudioFormat,
    /// ffmpeg bitrate, e.g. "192k"
    pub bitrate: String,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub normalize: bool,
}

impl AudioSettings {
    pub fn validate(&self) -> std::result::Result<(), String> {
        let kbps = self
            .bitrate
            .strip_suffix(['k', 'K'])
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| format!("Invalid bitrate '{}': expected e.g. 192k", self.bitrate))?;
        if !(1..=1024).contains(&kbps) {
            return Err(format!("Bitrate {}k out of range (1k-1024k)", kbps));
        }

        if let Some(rate) = self.sample_rate {
            if !(8_000..=192_000).contains(&rate) {
                return Err(format!("Sample rate {} out of range (8000-192000)", rate));
            }
            if let Some(rates) = self.format.supported_sample_rates() {
                if !rates.contains(&rate) {
                    let listed: Vec<String> = rates.iter().map(u32::to_string).collect();
                    return Err(format!(
                        "Sample rate {} not supported for {} (supported: {})",
                        rate,
                        self.format.extension(),
                        listed.join(", ")
                    ));
                }
            }
        }

        if let Some(channels) = self.channels {
            let max = self.format.max_channels();
            if !(1..=max).contains(&channels) {
                return Err(format!(
                    "Channel count {} out of range for {} (1-{})",
                    channels,
                    self.format.extension(),
                    max
                ));
            }
        }

        Ok(())
    }
}

/// Loudness measured by ffmpeg's loudnorm filter; non-finite readings are `None`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoudnessReport {
    pub integrated_lufs: Option<f64>,
    pub true_peak_dbtp: Option<f64>,
    pub loudness_range_lu: Option<f64>,
    pub threshold_lufs: Option<f64>,
    pub target_offset_lu: Option<f64>,
}

impl LoudnessReport {
    /// All values the second loudnorm pass needs are present
    pub fn is_complete(&self) -> bool {
        self.integrated_lufs.is_some()
            && self.true_peak_dbtp.is_some()
            && self.loudness_range_lu.is_some()
            && self.threshold_lufs.is_some()
            && self.target_offset_lu.is_some()
    }
}

/// Raw loudnorm block; ffmpeg prints every value as a string
#[derive(Debug, Deserialize)]
struct LoudnormOutput {
    #[serde(default)]
    input_i: Option<String>,
    #[serde(default)]
    input_tp: Option<String>,
    #[serde(default)]
    input_lra: Option<String>,
    #[serde(default)]
    input_thresh: Option<String>,
    #[serde(default)]
    target_offset: Option<String>,
}

fn metric(value: &Option<String>) -> Option<f64> {
    value
        .as_deref()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

/// Extract the JSON measurement that `loudnorm=print_format=json` writes to stderr
pub fn parse_loudnorm_report(stderr: &str) -> Option<LoudnessReport> {
    let block = match stderr.rfind("[Parsed_loudnorm") {
        Some(i) => &stderr[i..],
        None => stderr,
    };
    let open = block.find('{')?;
    let close = open + block[open..].find('}')?;

    let raw: LoudnormOutput = serde_json::from_str(&block[open..=close]).ok()?;
    Some(LoudnessReport {
        integrated_lufs: metric(&raw.input_i),
        true_peak_dbtp: metric(&raw.input_tp),
        loudness_range_lu: metric(&raw.input_lra),
        threshold_lufs: metric(&raw.input_thresh),
        target_offset_lu: metric(&raw.target_offset),
    })
}

/// Input duration in seconds from the `Duration: HH:MM:SS.xx` banner line
pub fn parse_duration(stderr: &str) -> Option<f64> {
    let start = stderr.find("Duration: ")? + "Duration: ".len();
    let rest = &stderr[start..];
    let end = rest.find([',', '\n']).unwrap_or(rest.len());

    let mut parts = rest[..end].trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

fn stderr_tail(stderr: &str, lines: usize) -> String {
    let all: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

fn loudnorm_base(target: &LoudnessTarget) -> String {
    format!(
        "loudnorm=I={}:TP={}:LRA={}",
        target.integrated_lufs, target.true_peak_dbtp, target.loudness_range_lu
    )
}

/// Measurement-only pass: decode, run loudnorm, discard the audio
pub fn analysis_args(input: &Path, target: &LoudnessTarget) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-vn".into(),
        "-af".into(),
        format!("{}:print_format=json", loudnorm_base(target)),
        "-f".into(),
        "null".into(),
        "-".into(),
    ]
}

/// Full transcode; `measured` enables linear two-pass normalization
pub fn transcode_args(
    input: &Path,
    output: &Path,
    settings: &AudioSettings,
    target: &LoudnessTarget,
    measured: Option<&LoudnessReport>,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(),
        "-hide_banner".into(),
        "-nostats".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-vn".into(),
    ];

    if let Some(m) = measured.filter(|m| m.is_complete()) {
        args.push("-af".into());
        args.push(format!(
            "{}:measured_I={}:measured_TP={}:measured_LRA={}:measured_thresh={}:offset={}:linear=true:print_format=summary",
            loudnorm_base(target),
            m.integrated_lufs.unwrap_or_default(),
            m.true_peak_dbtp.unwrap_or_default(),
            m.loudness_range_lu.unwrap_or_default(),
            m.threshold_lufs.unwrap_or_default(),
            m.target_offset_lu.unwrap_or_default(),
        ));
    }

    args.push("-c:a".into());
    args.push(settings.format.codec().into());

    if !settings.format.is_lossless() {
        args.push("-b:a".into());
        args.push(settings.bitrate.to_lowercase());
    }

    // loudnorm resamples to 192 kHz internally, so pin the output rate
    let sample_rate = settings.sample_rate.or_else(|| {
        measured
            .filter(|m| m.is_complete())
            .map(|_| 48_000)
    });
    if let Some(rate) = sample_rate {
        args.push("-ar".into());
        args.push(rate.to_string());
    }

    if let Some(channels) = settings.channels {
        args.push("-ac".into());
        args.push(channels.to_string());
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

/// Result of one audio conversion
#[derive(Debug, Clone, Default)]
pub struct AudioConversion {
    pub duration_seconds: Option<f64>,
    pub loudness: Option<LoudnessReport>,
    pub normalized: bool,
}

/// Runs the external transcoder
#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_path: String,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(ffmpeg_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            timeout,
        }
    }

    /// Check if the ffmpeg binary can be executed
    pub async fn is_available(&self) -> bool {
        Command::new(&self.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Run ffmpeg and return its stderr
    async fn run(&self, args: &[String]) -> Result<String> {
        debug!("Running {} {}", self.ffmpeg_path, args.join(" "));

        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(args).stdin(Stdio::null()).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                ConversionError::Transcode(format!(
                    "ffmpeg timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| ConversionError::Transcode(format!("Failed to run ffmpeg: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            error!("FFmpeg failed ({}): {}", output.status, stderr);
            return Err(ConversionError::Transcode(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr_tail(&stderr, STDERR_TAIL_LINES)
            )));
        }

        Ok(stderr)
    }

    pub async fn analyze_loudness(
        &self,
        input: &Path,
        target: &LoudnessTarget,
    ) -> Result<LoudnessReport> {
        let stderr = self.run(&analysis_args(input, target)).await?;
        parse_loudnorm_report(&stderr).ok_or_else(|| {
            ConversionError::Transcode("loudnorm produced no measurement".to_string())
        })
    }

    /// Transcode `input` into `output`; returns the input duration when ffmpeg reports one
    pub async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        settings: &AudioSettings,
        target: &LoudnessTarget,
        measured: Option<&LoudnessReport>,
    ) -> Result<Option<f64>> {
        let stderr = self
            .run(&transcode_args(input, output, settings, target, measured))
            .await?;

        let size = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            return Err(ConversionError::Transcode(
                "ffmpeg produced no output".to_string(),
            ));
        }

        Ok(parse_duration(&stderr))
    }

    /// Measure (when asked to analyze or normalize) and transcode
    pub async fn convert(
        &self,
        input: &Path,
        output: &Path,
        settings: &AudioSettings,
        target: &LoudnessTarget,
        analyze: bool,
    ) -> Result<AudioConversion> {
        let loudness = if analyze || settings.normalize {
            match self.analyze_loudness(input, target).await {
                Ok(report) => {
                    debug!("Loudness measurement: {:?}", report);
                    Some(report)
                }
                Err(e) if settings.normalize => return Err(e),
                Err(e) => {
                    warn!("Loudness analysis failed, continuing without metrics: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let measured = if settings.normalize {
            match loudness.as_ref().filter(|m| m.is_complete()) {
                Some(m) => Some(m),
                None => {
                    // Silent input reports -inf loudness; nothing to normalize against
                    warn!("Incomplete loudness measurement, skipping normalization");
                    None
                }
            }
        } else {
            None
        };

        let duration_seconds = self
            .transcode(input, output, settings, target, measured)
            .await?;

        info!(
            "Transcoded to {} ({}), duration={:?}, normalized={}",
            settings.format.extension(),
            settings.bitrate,
            duration_seconds,
            measured.is_some()
        );

        Ok(AudioConversion {
            duration_seconds,
            normalized: measured.is_some(),
            loudness,
        })
    }
}
