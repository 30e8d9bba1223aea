//! Audio analysis stage: decide whether the stereo channels are two distinct
//! microphones (true stereo) or the same mixed signal on both sides.
//!
//! Extracts each channel to a downsampled mono WAV for the segmentation
//! stage, then compares the channels by Pearson correlation and RMS delta.

use async_trait::async_trait;
use serde::Deserialize;

use super::{Stage, StageContext, StageResult};
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;
use crate::segment;

/// On-disk shape of `audio_analysis.json`, read back by speaker_cut.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioAnalysis {
    pub channels: u32,
    pub sample_rate: u32,
    #[serde(default)]
    pub extracted_sample_rate: Option<u32>,
    pub classification: String,
    pub audio_channels_identical: bool,
    pub correlation: f64,
    pub rms_delta_db: f64,
}

pub struct AudioAnalysisStage;

#[async_trait]
impl Stage for AudioAnalysisStage {
    fn id(&self) -> StageId {
        StageId::AudioAnalysis
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let merged = ctx.episode_dir.join("source_merged.mp4");
        if !merged.exists() {
            return Err(StageError::Precondition("source_merged.mp4".to_string()));
        }
        let work_dir = ctx.work_dir();
        tokio::fs::create_dir_all(&work_dir).await?;

        let probe = media::probe(&merged).await?;
        let audio = probe
            .audio_stream()
            .ok_or_else(|| StageError::Other("no audio stream in source_merged.mp4".to_string()))?;
        let channels = audio.channels.unwrap_or(2);
        let sample_rate: u32 = audio
            .sample_rate
            .as_deref()
            .and_then(|r| r.parse().ok())
            .unwrap_or(48_000);

        tracing::info!("audio: {} channels, {} Hz", channels, sample_rate);

        if channels < 2 {
            // Mono source: per-channel attribution is meaningless, treat as BOTH.
            return Ok(StageResult::new()
                .with("channels", channels)
                .with("sample_rate", sample_rate)
                .with("classification", "mono_source")
                .with("audio_channels_identical", true)
                .with("correlation", 1.0)
                .with("rms_delta_db", 0.0));
        }

        let left_wav = work_dir.join("left.wav");
        let right_wav = work_dir.join("right.wav");
        let extract_rate = ctx.config.processing.extracted_sample_rate;

        // Both channels in a single ffmpeg pass, downsampled for analysis.
        media::run_ffmpeg([
            "-i",
            &merged.to_string_lossy(),
            "-filter_complex",
            "channelsplit=channel_layout=stereo[L][R]",
            "-map",
            "[L]",
            "-ar",
            &extract_rate.to_string(),
            &left_wav.to_string_lossy(),
            "-map",
            "[R]",
            "-ar",
            &extract_rate.to_string(),
            &right_wav.to_string_lossy(),
        ])
        .await?;

        let (mut left, _) = media::read_wav_samples(&left_wav)?;
        let (mut right, _) = media::read_wav_samples(&right_wav)?;
        let min_len = left.len().min(right.len());
        left.truncate(min_len);
        right.truncate(min_len);

        let correlation = segment::channel_correlation(&left, &right);
        let rms_delta = segment::rms_delta_db(&left, &right);

        let processing = &ctx.config.processing;
        let identical = segment::channels_identical(
            correlation,
            rms_delta,
            processing.max_channel_correlation,
            processing.max_channel_rms_delta_db,
        );
        let classification = if identical {
            "audio_channels_identical"
        } else {
            "true_stereo"
        };
        tracing::info!(
            "classification: {} (corr={:.4}, rms_delta={:.2}dB)",
            classification,
            correlation,
            rms_delta
        );

        Ok(StageResult::new()
            .with("channels", channels)
            .with("sample_rate", sample_rate)
            .with("extracted_sample_rate", extract_rate)
            .with("classification", classification)
            .with("audio_channels_identical", identical)
            .with("correlation", (correlation * 1e6).round() / 1e6)
            .with("rms_delta_db", (rms_delta * 100.0).round() / 100.0))
    }
}
