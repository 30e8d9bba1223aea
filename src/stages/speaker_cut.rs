//! Speaker cut stage: run the segmentation engine over the extracted channel
//! WAVs and emit `segments.json` plus the per-frame energy arrays the clip
//! miner uses for boundary snapping.

use async_trait::async_trait;

use super::audio_analysis::AudioAnalysis;
use super::stitch::StitchOutput;
use super::{Stage, StageContext, StageResult};
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;
use crate::segment::{self, RmsData, SegmentationParams, SegmentsFile};

pub struct SpeakerCutStage;

#[async_trait]
impl Stage for SpeakerCutStage {
    fn id(&self) -> StageId {
        StageId::SpeakerCut
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let analysis: AudioAnalysis = ctx.load_json("audio_analysis.json")?;
        let stitch: StitchOutput = ctx.load_json("stitch.json")?;
        let total_duration = stitch.duration_seconds;

        if analysis.audio_channels_identical {
            tracing::info!("channels identical, single BOTH segment");
            let segments = segment::single_both_segment(total_duration);
            let file = SegmentsFile {
                segment_count: segments.len(),
                segments,
                duration_seconds: total_duration,
                channels_identical: true,
                frame_count: 0,
            };
            ctx.save_json("segments.json", &file)?;
            return Ok(StageResult::new()
                .with("segments", &file.segments)
                .with("segment_count", file.segment_count)
                .with("duration_seconds", total_duration)
                .with("channels_identical", true));
        }

        let work_dir = ctx.work_dir();
        let left_wav = work_dir.join("left.wav");
        let right_wav = work_dir.join("right.wav");
        if !left_wav.exists() || !right_wav.exists() {
            return Err(StageError::Precondition(
                "work/left.wav and work/right.wav".to_string(),
            ));
        }

        let (left, left_rate) = media::read_wav_samples(&left_wav)?;
        let (right, _) = media::read_wav_samples(&right_wav)?;

        let sample_rate = analysis
            .extracted_sample_rate
            .unwrap_or(if left_rate > 0 { left_rate } else { analysis.sample_rate });
        let params = SegmentationParams::from(&ctx.config.processing);
        let frame_size = (sample_rate as f64 * params.frame_seconds) as usize;
        if frame_size == 0 {
            return Err(StageError::Other("frame size computed as zero".to_string()));
        }

        let min_len = left.len().min(right.len());
        let left_db = segment::frame_rms_db(&left[..min_len], frame_size);
        let right_db = segment::frame_rms_db(&right[..min_len], frame_size);
        let frame_count = left_db.len();

        let segments = segment::segment_channels(&left_db, &right_db, total_duration, &params)?;
        tracing::info!(
            "generated {} segments from {} frames",
            segments.len(),
            frame_count
        );

        // Per-frame energy is retained for the clip miner's boundary snapping.
        let rms_data = RmsData {
            frame_seconds: params.frame_seconds,
            left_rms_db: left_db,
            right_rms_db: right_db,
        };
        ctx.save_json("work/rms_data.json", &rms_data)?;

        let file = SegmentsFile {
            segment_count: segments.len(),
            segments,
            duration_seconds: total_duration,
            channels_identical: false,
            frame_count,
        };
        ctx.save_json("segments.json", &file)?;

        Ok(StageResult::new()
            .with("segments", &file.segments)
            .with("segment_count", file.segment_count)
            .with("duration_seconds", total_duration)
            .with("channels_identical", false)
            .with("frame_count", frame_count))
    }
}
