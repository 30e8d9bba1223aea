//! Stitch stage: concatenate the ingested files into `source_merged.mp4` and
//! capture a reference frame for the crop annotation UI.

use async_trait::async_trait;
use std::path::Path;

use super::ingest::IngestManifest;
use super::{Stage, StageContext, StageResult};
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;

/// Concat boundaries cost a little time; beyond this we warn.
const STITCH_TOLERANCE_SECONDS: f64 = 2.0;

pub struct StitchStage;

#[async_trait]
impl Stage for StitchStage {
    fn id(&self) -> StageId {
        StageId::Stitch
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let manifest: IngestManifest = ctx.load_json("ingest.json")?;
        if manifest.files.is_empty() {
            return Err(StageError::Other("no files to stitch".to_string()));
        }

        let output_path = ctx.episode_dir.join("source_merged.mp4");

        if manifest.files.len() == 1 {
            tokio::fs::copy(&manifest.files[0].dest_path, &output_path).await?;
        } else {
            let concat_list = ctx.work_dir().join("concat_list.txt");
            tokio::fs::create_dir_all(ctx.work_dir()).await?;
            let mut listing = String::new();
            for file in &manifest.files {
                // ffmpeg concat format: single quotes in paths must be escaped.
                let safe = file.dest_path.replace('\'', "'\\''");
                listing.push_str(&format!("file '{}'\n", safe));
            }
            tokio::fs::write(&concat_list, listing).await?;

            tracing::info!("stitching {} files", manifest.files.len());
            // Stream-copy merge: the capture files are uniform H.264/AAC.
            media::run_ffmpeg([
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                &concat_list.to_string_lossy(),
                "-c",
                "copy",
                &output_path.to_string_lossy(),
            ])
            .await?;
        }

        let probe = media::probe(&output_path).await?;
        let duration = probe.duration_seconds();
        let expected = manifest.total_duration_seconds;
        if (duration - expected).abs() > STITCH_TOLERANCE_SECONDS {
            tracing::warn!(
                "duration mismatch: expected {:.1}s, got {:.1}s",
                expected,
                duration
            );
        }

        extract_crop_frame(&output_path, &ctx.episode_dir, duration).await;

        Ok(StageResult::new()
            .with("output_path", output_path.to_string_lossy())
            .with("input_count", manifest.files.len())
            .with("duration_seconds", round3(duration))
            .with("expected_duration_seconds", round3(expected)))
    }
}

/// Grab one frame early in the episode so a human can mark speaker crop
/// regions. Failure here is cosmetic, not fatal.
async fn extract_crop_frame(merged: &Path, episode_dir: &Path, duration: f64) {
    let frame_path = episode_dir.join("crop_frame.jpg");
    let frame_time = 5.0_f64.min(duration / 2.0).max(0.0);
    let result = media::run_ffmpeg([
        "-ss",
        &frame_time.to_string(),
        "-i",
        &merged.to_string_lossy(),
        "-frames:v",
        "1",
        "-q:v",
        "2",
        &frame_path.to_string_lossy(),
    ])
    .await;
    match result {
        Ok(()) => tracing::info!("extracted crop frame at {:.1}s", frame_time),
        Err(e) => tracing::warn!("failed to extract crop frame: {}", e),
    }
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

/// On-disk shape of `stitch.json`, read back by several downstream stages.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct StitchOutput {
    pub output_path: String,
    pub duration_seconds: f64,
}
