//! Process-wide configuration, loaded once from `config.toml`.
//!
//! Every field has a default so a missing file or a partial file is never
//! fatal; stages read their own sections through the shared `Arc<Config>`.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub pipeline: PipelineConfig,
    pub processing: ProcessingConfig,
    pub transcription: TranscriptionConfig,
    pub clip_mining: ClipMiningConfig,
    pub podcast: PodcastConfig,
    pub platforms: PlatformsConfig,
}

impl Config {
    /// Load configuration from an explicit path, or from `config.toml` in the
    /// current directory. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("config.toml"));

        if !path.exists() {
            tracing::debug!("no config file at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let raw = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&raw)?;
        Ok(config)
    }

    /// Root directory holding one subdirectory per episode.
    ///
    /// Resolution order: `CROSSCUT_OUTPUT_DIR` env var, then `paths.output_dir`
    /// from config, then `~/crosscut/episodes`.
    pub fn episodes_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("CROSSCUT_OUTPUT_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        if !self.paths.output_dir.is_empty() {
            return PathBuf::from(&self.paths.output_dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("crosscut")
            .join("episodes")
    }

    /// Backup root, from `paths.backup_dir` or `CROSSCUT_BACKUP_DIR`.
    pub fn backup_dir(&self) -> Option<PathBuf> {
        if !self.paths.backup_dir.is_empty() {
            return Some(PathBuf::from(&self.paths.backup_dir));
        }
        match std::env::var("CROSSCUT_BACKUP_DIR") {
            Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub output_dir: String,
    pub backup_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent stage cap. Several stages are encoder-heavy, so this stays
    /// small and independent of stage count.
    pub max_workers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { max_workers: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Analysis frame length for per-channel energy, in seconds.
    pub frame_seconds: f64,
    /// A channel is speech-active when it exceeds its noise floor by this many dB.
    pub speech_db_margin: f64,
    /// Segments shorter than this are absorbed into a neighbor.
    pub min_segment_seconds: f64,
    /// Both channels within this dB range of each other counts as cross-talk.
    pub both_db_range: f64,
    /// Channel-identity pre-check thresholds.
    pub max_channel_correlation: f64,
    pub max_channel_rms_delta_db: f64,
    /// Sample rate the analysis channels are extracted at.
    pub extracted_sample_rate: u32,
    pub clip_count: usize,
    pub clip_min_seconds: f64,
    pub clip_max_seconds: f64,
    pub video_crf: u32,
    pub audio_bitrate: String,
    pub shorts_crf: u32,
    pub shorts_audio_bitrate: String,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            frame_seconds: 0.1,
            speech_db_margin: 12.0,
            min_segment_seconds: 2.0,
            both_db_range: 6.0,
            max_channel_correlation: 0.95,
            max_channel_rms_delta_db: 3.0,
            extracted_sample_rate: 16_000,
            clip_count: 10,
            clip_min_seconds: 30.0,
            clip_max_seconds: 90.0,
            video_crf: 18,
            audio_bitrate: "192k".to_string(),
            shorts_crf: 21,
            shorts_audio_bitrate: "128k".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub model: String,
    pub language: String,
    pub diarize: bool,
    pub utterances: bool,
    pub smart_format: bool,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: "nova-3".to_string(),
            language: "en".to_string(),
            diarize: true,
            utterances: true,
            smart_format: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClipMiningConfig {
    pub llm_model: String,
    pub llm_temperature: f32,
    /// How far a clip boundary may be nudged to the nearest energy minimum.
    pub boundary_snap_tolerance_seconds: f64,
}

impl Default for ClipMiningConfig {
    fn default() -> Self {
        Self {
            llm_model: "claude-sonnet-4-5".to_string(),
            llm_temperature: 0.3,
            boundary_snap_tolerance_seconds: 3.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PodcastConfig {
    pub title: String,
    pub description: String,
    pub author: String,
    pub owner_email: String,
    pub channel_handle: String,
    pub artwork_url: String,
    pub language: String,
    pub category: String,
    pub explicit: bool,
    pub link: String,
    /// Object-storage bucket for hosted feed + audio.
    pub bucket: String,
    /// Public base URL for hosted feed + audio. Empty disables feed upload.
    pub base_url: String,
}

impl Default for PodcastConfig {
    fn default() -> Self {
        Self {
            title: "The Local Podcast".to_string(),
            description: String::new(),
            author: String::new(),
            owner_email: String::new(),
            channel_handle: "@local".to_string(),
            artwork_url: String::new(),
            language: "en".to_string(),
            category: "Technology".to_string(),
            explicit: false,
            link: String::new(),
            bucket: String::new(),
            base_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlatformsConfig {
    pub youtube: PlatformToggle,
    pub tiktok: PlatformToggle,
    pub instagram: PlatformToggle,
}

impl PlatformsConfig {
    /// Names of the enabled platforms, in the order the uploader expects.
    pub fn enabled(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.youtube.enabled {
            out.push("youtube");
        }
        if self.tiktok.enabled {
            out.push("tiktok");
        }
        if self.instagram.enabled {
            out.push("instagram");
        }
        out
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlatformToggle {
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.pipeline.max_workers, 3);
        assert_eq!(config.processing.frame_seconds, 0.1);
        assert_eq!(config.processing.speech_db_margin, 12.0);
        assert_eq!(config.processing.min_segment_seconds, 2.0);
        assert_eq!(config.transcription.model, "nova-3");
        assert!(config.platforms.enabled().is_empty());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let raw = r#"
            [processing]
            speech_db_margin = 9.0

            [platforms.youtube]
            enabled = true
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.processing.speech_db_margin, 9.0);
        assert_eq!(config.processing.both_db_range, 6.0);
        assert_eq!(config.platforms.enabled(), vec!["youtube"]);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let raw = r#"
            [processing]
            some_future_knob = 1
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.processing.frame_seconds, 0.1);
    }
}
