// ABOUTME: Environment-driven service configuration
// ABOUTME: Reads storage, transcoder, HDRI and server settings once at startup

use crate::audio::{AudioFormat, LoudnessTarget};
use std::{env, path::PathBuf, str::FromStr};

/// Object storage backend selected by `STORAGE_BACKEND`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Supabase,
    Gcs,
    Local,
}

impl StorageBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "supabase" => Some(StorageBackend::Supabase),
            "gcs" | "google" => Some(StorageBackend::Gcs),
            "local" | "fs" => Some(StorageBackend::Local),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Supabase => "supabase",
            StorageBackend::Gcs => "gcs",
            StorageBackend::Local => "local",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage_backend: StorageBackend,
    pub storage_bucket: String,
    pub supabase_url: Option<String>,
    pub supabase_service_key: Option<String>,
    pub local_storage_root: PathBuf,
    /// max-age applied to every uploaded object
    pub cache_control_secs: u32,
    /// Parent of the per-request scratch directories
    pub scratch_dir: PathBuf,
    pub ffmpeg_path: String,
    pub ffmpeg_timeout_secs: u64,
    pub default_audio_format: AudioFormat,
    pub default_audio_bitrate: String,
    /// Run the loudnorm measurement pass even when normalization is not requested
    pub analyze_loudness: bool,
    pub loudness_target: LoudnessTarget,
    pub hdri_target_width: u32,
    pub hdri_target_height: u32,
    pub max_upload_bytes: usize,
    pub max_concurrent_conversions: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup; unparseable values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| {
                    let v = v.trim().to_lowercase();
                    match v.as_str() {
                        "true" | "1" | "yes" => true,
                        "false" | "0" | "no" => false,
                        _ => default,
                    }
                })
                .unwrap_or(default)
        };

        let default_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        let defaults = LoudnessTarget::default();

        Self {
            port: parse_var(&lookup, "PORT").unwrap_or(8080),
            storage_backend: lookup("STORAGE_BACKEND")
                .and_then(|v| StorageBackend::parse(&v))
                .unwrap_or(StorageBackend::Supabase),
            storage_bucket: lookup("STORAGE_BUCKET")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| "realease-experience-content".to_string()),
            supabase_url: lookup("SUPABASE_URL")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            supabase_service_key: lookup("SUPABASE_SERVICE_KEY").filter(|v| !v.trim().is_empty()),
            local_storage_root: lookup("LOCAL_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./storage")),
            cache_control_secs: parse_var(&lookup, "CACHE_CONTROL_SECS").unwrap_or(3600),
            scratch_dir: lookup("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".to_string()),
            ffmpeg_timeout_secs: parse_var(&lookup, "FFMPEG_TIMEOUT_SECS").unwrap_or(600),
            default_audio_format: lookup("AUDIO_FORMAT")
                .and_then(|v| AudioFormat::parse(&v))
                .unwrap_or(AudioFormat::Mp3),
            default_audio_bitrate: lookup("AUDIO_BITRATE").unwrap_or_else(|| "192k".to_string()),
            analyze_loudness: flag("ANALYZE_LOUDNESS", true),
            loudness_target: LoudnessTarget {
                integrated_lufs: parse_var(&lookup, "LOUDNESS_TARGET_I").unwrap_or(defaults.integrated_lufs),
                true_peak_dbtp: parse_var(&lookup, "LOUDNESS_TARGET_TP").unwrap_or(defaults.true_peak_dbtp),
                loudness_range_lu: parse_var(&lookup, "LOUDNESS_TARGET_LRA")
                    .unwrap_or(defaults.loudness_range_lu),
            },
            hdri_target_width: parse_var(&lookup, "HDRI_TARGET_WIDTH").filter(|&w| w > 0).unwrap_or(2048),
            hdri_target_height: parse_var(&lookup, "HDRI_TARGET_HEIGHT").filter(|&h| h > 0).unwrap_or(1024),
            max_upload_bytes: parse_var(&lookup, "MAX_UPLOAD_BYTES").unwrap_or(512 * 1024 * 1024),
            max_concurrent_conversions: parse_var(&lookup, "MAX_CONCURRENT_CONVERSIONS")
                .filter(|&n| n > 0)
                .unwrap_or(default_parallelism),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_backend, StorageBackend::Supabase);
        assert_eq!(config.storage_bucket, "realease-experience-content");
        assert_eq!(config.cache_control_secs, 3600);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert_eq!(config.default_audio_format, AudioFormat::Mp3);
        assert_eq!(config.default_audio_bitrate, "192k");
        assert!(config.analyze_loudness);
        assert_eq!(config.hdri_target_width, 2048);
        assert_eq!(config.hdri_target_height, 1024);
        assert!(config.max_concurrent_conversions > 0);
        assert!(config.supabase_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("PORT", "9090"),
            ("STORAGE_BACKEND", "GCS"),
            ("STORAGE_BUCKET", "media"),
            ("SUPABASE_URL", "https://project.supabase.co/"),
            ("AUDIO_FORMAT", "flac"),
            ("ANALYZE_LOUDNESS", "false"),
            ("LOUDNESS_TARGET_I", "-23"),
            ("HDRI_TARGET_WIDTH", "4096"),
            ("MAX_CONCURRENT_CONVERSIONS", "2"),
        ]);
        assert_eq!(config.port, 9090);
        assert_eq!(config.storage_backend, StorageBackend::Gcs);
        assert_eq!(config.storage_bucket, "media");
        assert_eq!(config.supabase_url.as_deref(), Some("https://project.supabase.co"));
        assert_eq!(config.default_audio_format, AudioFormat::Flac);
        assert!(!config.analyze_loudness);
        assert_eq!(config.loudness_target.integrated_lufs, -23.0);
        assert_eq!(config.loudness_target.true_peak_dbtp, -1.5);
        assert_eq!(config.hdri_target_width, 4096);
        assert_eq!(config.max_concurrent_conversions, 2);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("PORT", "not-a-port"),
            ("STORAGE_BACKEND", "ftp"),
            ("ANALYZE_LOUDNESS", "maybe"),
            ("HDRI_TARGET_HEIGHT", "0"),
            ("MAX_CONCURRENT_CONVERSIONS", "0"),
            ("SUPABASE_SERVICE_KEY", "  "),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.storage_backend, StorageBackend::Supabase);
        assert!(config.analyze_loudness);
        assert_eq!(config.hdri_target_height, 1024);
        assert!(config.max_concurrent_conversions > 0);
        assert!(config.supabase_service_key.is_none());
    }
}
