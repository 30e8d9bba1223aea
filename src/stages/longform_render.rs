//! Longform render stage: re-render the full episode at 16:9, cropping each
//! speaker segment onto its speaker and burning in word-level subtitles, then
//! concatenate the segments into `longform.mp4`.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageResult};
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;
use crate::segment::{SegmentsFile, Speaker};
use crate::transcript::{self, DiarizedTranscript};

/// Audio mixdown applied to every render: both mics folded into both ears.
pub const MIXDOWN_FILTER: &str = "pan=stereo|c0=0.5*c0+0.5*c1|c1=0.5*c0+0.5*c1";

const LONGFORM_SUB_STYLE: &str = "FontSize=14,FontName=Arial,Bold=1,\
    PrimaryColour=&H00FFFFFF,OutlineColour=&H00000000,\
    BackColour=&H80000000,BorderStyle=4,Outline=2,\
    Shadow=1,ShadowColour=&HA0000000,MarginV=30,Alignment=2";

/// Speaker center points marked by the human annotator, stored in
/// `episode.json` as `crop_config`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CropConfig {
    pub speaker_l_center_x: i64,
    pub speaker_l_center_y: i64,
    pub speaker_r_center_x: i64,
    pub speaker_r_center_y: i64,
}

/// Read the crop annotation out of `episode.json`; the render stages cannot
/// run without it.
pub fn load_crop_config(ctx: &StageContext) -> Result<CropConfig, StageError> {
    let episode: serde_json::Value = ctx.load_json("episode.json")?;
    let value = episode
        .get("crop_config")
        .filter(|v| !v.is_null())
        .ok_or_else(|| StageError::Precondition("crop_config in episode.json".to_string()))?;
    Ok(serde_json::from_value(value.clone())?)
}

/// Shared x264 settings. Frame-rate and GOP pinning keep the per-segment
/// outputs concat-safe.
pub fn encoder_args(crf: u32, audio_bitrate: &str) -> Vec<String> {
    [
        "-c:v", "libx264", "-crf", &crf.to_string(), "-preset", "fast",
        "-r", "30", "-g", "30", "-bf", "0",
        "-vsync", "cfr",
        "-pix_fmt", "yuv420p",
        "-video_track_timescale", "30000",
        "-c:a", "aac", "-b:a", audio_bitrate,
        "-use_editlist", "0",
        "-movflags", "+faststart",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct LongformRenderStage;

#[async_trait]
impl Stage for LongformRenderStage {
    fn id(&self) -> StageId {
        StageId::LongformRender
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let segments_file: SegmentsFile = ctx.load_json("segments.json")?;
        let diarized: DiarizedTranscript = ctx.load_json("diarized_transcript.json")?;
        let crop = load_crop_config(ctx)?;

        let merged = ctx.episode_dir.join("source_merged.mp4");
        let probe = media::probe(&merged).await?;
        let (src_w, src_h) = probe
            .video_dimensions()
            .ok_or_else(|| StageError::Other("no video stream in source_merged.mp4".to_string()))?;

        let work_dir = ctx.work_dir();
        let srt_dir = work_dir.join("longform_srt");
        tokio::fs::create_dir_all(&srt_dir).await?;

        let processing = &ctx.config.processing;
        let enc = encoder_args(processing.video_crf, &processing.audio_bitrate);

        let segments = &segments_file.segments;
        tracing::info!("rendering {} segments with speaker crops", segments.len());

        let mut seg_files = Vec::with_capacity(segments.len());
        for (i, seg) in segments.iter().enumerate() {
            let srt_path = srt_dir.join(format!("seg_{:04}.srt", i));
            let words = diarized.words_in_range(seg.start, seg.end);
            tokio::fs::write(&srt_path, transcript::build_word_srt(&words, seg.start)).await?;

            let mut vf = crop_filter_16x9(seg.speaker, src_w, src_h, &crop);
            if !words.is_empty() {
                vf.push_str(&format!(
                    ",subtitles='{}':force_style='{}'",
                    media::escape_filter_path(&srt_path),
                    LONGFORM_SUB_STYLE,
                ));
            }

            let seg_path = work_dir.join(format!("longform_seg_{:04}.mp4", i));
            let mut args = vec![
                "-ss".to_string(),
                seg.start.to_string(),
                "-i".to_string(),
                merged.to_string_lossy().to_string(),
                "-t".to_string(),
                (seg.end - seg.start).to_string(),
                "-vf".to_string(),
                vf,
                "-af".to_string(),
                MIXDOWN_FILTER.to_string(),
            ];
            args.extend(enc.iter().cloned());
            args.push(seg_path.to_string_lossy().to_string());
            media::run_ffmpeg(args).await?;

            ctx.report_progress(self.id(), i + 1, segments.len(), &format!("Rendered segment {}", i));
            seg_files.push(seg_path);
        }

        let output_path = ctx.episode_dir.join("longform.mp4");
        concat_and_remux(&seg_files, &work_dir, &output_path, &processing.audio_bitrate).await?;

        let out_probe = media::probe(&output_path).await?;
        let duration = out_probe.duration_seconds();
        let size_mb = tokio::fs::metadata(&output_path).await?.len() as f64 / 1e6;

        Ok(StageResult::new()
            .with("output_path", output_path.to_string_lossy())
            .with("duration_seconds", (duration * 1000.0).round() / 1000.0)
            .with("segment_count", segments.len())
            .with("file_size_mb", (size_mb * 10.0).round() / 10.0))
    }
}

/// 16:9 crop centered on the speaker's annotated point, clamped to the frame.
/// BOTH and silence pass the full frame through.
fn crop_filter_16x9(speaker: Speaker, src_w: u32, src_h: u32, crop: &CropConfig) -> String {
    let (cx, cy) = match speaker {
        Speaker::Left => (crop.speaker_l_center_x, crop.speaker_l_center_y),
        Speaker::Right => (crop.speaker_r_center_x, crop.speaker_r_center_y),
        Speaker::Both | Speaker::Silence => return "scale=1920:1080".to_string(),
    };

    let crop_w = (src_w / 2) as i64;
    let crop_h = crop_w * 9 / 16;
    let x = (cx - crop_w / 2).clamp(0, src_w as i64 - crop_w);
    let y = (cy - crop_h / 2).clamp(0, src_h as i64 - crop_h);
    format!("crop={}:{}:{}:{},scale=1920:1080", crop_w, crop_h, x, y)
}

/// Stream-copy concat, then a re-mux that hard-stops both tracks at the video
/// duration. Segment concat can leave the audio track slightly longer than the
/// video, which some platforms reject; re-encoding the audio flushes the
/// accumulated timestamp drift.
pub async fn concat_and_remux(
    seg_files: &[PathBuf],
    work_dir: &Path,
    output: &Path,
    audio_bitrate: &str,
) -> Result<(), StageError> {
    let concat_list = work_dir.join("longform_concat.txt");
    let mut listing = String::new();
    for path in seg_files {
        let safe = path.to_string_lossy().replace('\'', "'\\''");
        listing.push_str(&format!("file '{}'\n", safe));
    }
    tokio::fs::write(&concat_list, listing).await?;

    let raw_concat = work_dir.join("longform_raw.mp4");
    media::run_ffmpeg([
        "-f",
        "concat",
        "-safe",
        "0",
        "-i",
        &concat_list.to_string_lossy(),
        "-c",
        "copy",
        &raw_concat.to_string_lossy(),
    ])
    .await?;

    let video_dur = media::probe(&raw_concat).await?.video_duration_seconds();

    let mut args = vec!["-i".to_string(), raw_concat.to_string_lossy().to_string()];
    if let Some(dur) = video_dur {
        args.push("-t".to_string());
        args.push(dur.to_string());
    }
    args.extend(
        [
            "-c:v", "copy",
            "-c:a", "aac", "-b:a", audio_bitrate,
            "-use_editlist", "0",
            "-movflags", "+faststart",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().to_string());
    media::run_ffmpeg(args).await?;

    tokio::fs::remove_file(&raw_concat).await.ok();
    Ok(())
}
