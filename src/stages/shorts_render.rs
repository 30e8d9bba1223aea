//! Shorts render stage: one 9:16 vertical video per mined clip, cropped onto
//! the active speaker per segment, with word-level subtitles burned in.

use async_trait::async_trait;
use std::path::Path;

use super::longform_render::{self, CropConfig, MIXDOWN_FILTER};
use super::{Stage, StageContext, StageResult};
use crate::episode::Clip;
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;
use crate::segment::{Segment, SegmentsFile, Speaker};
use crate::transcript::{self, DiarizedTranscript};

const SHORTS_SUB_STYLE: &str = "FontSize=12,PrimaryColour=&H00FFFFFF,\
    OutlineColour=&H00000000,BorderStyle=3,Outline=1,Shadow=0,MarginV=80";

/// Sub-segments this short get absorbed into a neighbor before rendering;
/// ffmpeg misbehaves on near-zero cuts.
const MIN_RENDER_SEGMENT_SECONDS: f64 = 0.5;

pub struct ShortsRenderStage;

#[async_trait]
impl Stage for ShortsRenderStage {
    fn id(&self) -> StageId {
        StageId::ShortsRender
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let clips_doc: serde_json::Value = ctx.load_json("clips.json")?;
        let clips: Vec<Clip> = serde_json::from_value(
            clips_doc.get("clips").cloned().unwrap_or_default(),
        )?;
        let segments_file: SegmentsFile = ctx.load_json("segments.json")?;
        let diarized: DiarizedTranscript = ctx.load_json("diarized_transcript.json")?;
        let crop = longform_render::load_crop_config(ctx)?;

        let merged = ctx.episode_dir.join("source_merged.mp4");
        let probe = media::probe(&merged).await?;
        let (src_w, src_h) = probe
            .video_dimensions()
            .ok_or_else(|| StageError::Other("no video stream in source_merged.mp4".to_string()))?;

        let shorts_dir = ctx.episode_dir.join("shorts");
        let subtitles_dir = ctx.episode_dir.join("subtitles");
        tokio::fs::create_dir_all(&shorts_dir).await?;
        tokio::fs::create_dir_all(&subtitles_dir).await?;

        let processing = &ctx.config.processing;
        let enc = longform_render::encoder_args(
            processing.shorts_crf,
            &processing.shorts_audio_bitrate,
        );

        tracing::info!("rendering {} shorts", clips.len());
        let mut rendered = Vec::with_capacity(clips.len());
        for clip in &clips {
            // Clip-relative SRT kept alongside the video for manual re-edits.
            let clip_srt = subtitles_dir.join(format!("{}.srt", clip.id));
            let words = diarized.words_in_range(clip.start_seconds, clip.end_seconds);
            tokio::fs::write(&clip_srt, transcript::build_word_srt(&words, clip.start_seconds))
                .await?;

            let output = shorts_dir.join(format!("{}.mp4", clip.id));
            render_short(ctx, &merged, &output, clip, &segments_file.segments, &diarized, src_w, src_h, &crop, &enc, &processing.shorts_audio_bitrate)
                .await?;

            rendered.push(clip.id.clone());
            ctx.report_progress(
                self.id(),
                rendered.len(),
                clips.len(),
                &format!("Rendered {}", clip.id),
            );
            tracing::info!("rendered {}", clip.id);
        }

        rendered.sort();
        Ok(StageResult::new()
            .with("rendered_clips", &rendered)
            .with("count", rendered.len())
            .with("shorts_dir", shorts_dir.to_string_lossy()))
    }
}

#[allow(clippy::too_many_arguments)]
async fn render_short(
    ctx: &StageContext,
    source: &Path,
    output: &Path,
    clip: &Clip,
    segments: &[Segment],
    diarized: &DiarizedTranscript,
    src_w: u32,
    src_h: u32,
    crop: &CropConfig,
    enc: &[String],
    audio_bitrate: &str,
) -> Result<(), StageError> {
    let clip_segs = clip_segments(segments, clip.start_seconds, clip.end_seconds);

    // One speaker throughout: a single render, no concat step.
    let single_speaker = clip_segs
        .windows(2)
        .all(|pair| pair[0].speaker == pair[1].speaker);
    if single_speaker {
        let speaker = clip_segs[0].speaker;
        let srt_path = ctx.episode_dir.join("subtitles").join(format!("{}.srt", clip.id));
        let has_subs = std::fs::metadata(&srt_path).map(|m| m.len() > 0).unwrap_or(false);
        let vf = crop_filter_9x16(speaker, src_w, src_h, crop, has_subs.then_some(&srt_path));
        let mut args = vec![
            "-ss".to_string(),
            clip.start_seconds.to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-t".to_string(),
            (clip.end_seconds - clip.start_seconds).to_string(),
            "-vf".to_string(),
            vf,
            "-af".to_string(),
            MIXDOWN_FILTER.to_string(),
        ];
        args.extend(enc.iter().cloned());
        args.push(output.to_string_lossy().to_string());
        return media::run_ffmpeg(args).await;
    }

    // Speaker changes inside the clip: render each sub-segment with its own
    // crop, then concat.
    let work_dir = ctx.work_dir().join(format!("shorts_{}", clip.id));
    tokio::fs::create_dir_all(&work_dir).await?;

    let mut seg_files = Vec::with_capacity(clip_segs.len());
    for (idx, seg) in clip_segs.iter().enumerate() {
        let seg_srt = work_dir.join(format!("seg_{}.srt", idx));
        let words = diarized.words_in_range(seg.start, seg.end);
        tokio::fs::write(&seg_srt, transcript::build_word_srt(&words, seg.start)).await?;

        let vf = crop_filter_9x16(
            seg.speaker,
            src_w,
            src_h,
            crop,
            (!words.is_empty()).then_some(&seg_srt),
        );

        let seg_output = work_dir.join(format!("seg_{}.mp4", idx));
        let mut args = vec![
            "-ss".to_string(),
            seg.start.to_string(),
            "-i".to_string(),
            source.to_string_lossy().to_string(),
            "-t".to_string(),
            (seg.end - seg.start).to_string(),
            "-vf".to_string(),
            vf,
            "-af".to_string(),
            MIXDOWN_FILTER.to_string(),
        ];
        args.extend(enc.iter().cloned());
        args.push(seg_output.to_string_lossy().to_string());
        media::run_ffmpeg(args).await?;
        seg_files.push(seg_output);
    }

    concat_short(&seg_files, &work_dir, output, audio_bitrate).await?;
    tokio::fs::remove_dir_all(&work_dir).await.ok();
    Ok(())
}

/// Speaker segments overlapping the clip range, clamped to its bounds, with
/// sub-half-second slivers absorbed into a neighbor.
fn clip_segments(segments: &[Segment], clip_start: f64, clip_end: f64) -> Vec<Segment> {
    let mut overlapping: Vec<Segment> = segments
        .iter()
        .filter(|seg| seg.end > clip_start && seg.start < clip_end)
        .map(|seg| {
            let start = seg.start.max(clip_start);
            let end = seg.end.min(clip_end);
            Segment {
                start,
                end,
                speaker: seg.speaker,
                duration: end - start,
            }
        })
        .filter(|seg| seg.duration >= 0.05)
        .collect();

    if overlapping.is_empty() {
        return vec![Segment {
            start: clip_start,
            end: clip_end,
            speaker: Speaker::Both,
            duration: clip_end - clip_start,
        }];
    }

    let mut merged: Vec<Segment> = Vec::with_capacity(overlapping.len());
    for seg in overlapping.drain(..) {
        let short = seg.duration < MIN_RENDER_SEGMENT_SECONDS;
        match merged.last_mut() {
            Some(prev) if short => {
                prev.end = seg.end;
                prev.duration = prev.end - prev.start;
            }
            None if short => {
                // Leading sliver: let the next segment start at the clip edge.
                continue;
            }
            _ => merged.push(seg),
        }
    }
    if let Some(first) = merged.first_mut() {
        if first.start > clip_start {
            first.start = clip_start;
            first.duration = first.end - first.start;
        }
    }
    merged
}

/// 9:16 crop: full source height, width narrowed to 9:16, x centered on the
/// speaker's annotated point. BOTH uses the left speaker's position; centering
/// between two speakers frames empty table.
fn crop_filter_9x16(
    speaker: Speaker,
    src_w: u32,
    src_h: u32,
    crop: &CropConfig,
    srt: Option<&std::path::PathBuf>,
) -> String {
    let crop_w = (src_h as i64) * 9 / 16;
    let cx = match speaker {
        Speaker::Right => crop.speaker_r_center_x,
        _ => crop.speaker_l_center_x,
    };
    let x = (cx - crop_w / 2).clamp(0, src_w as i64 - crop_w);

    let mut vf = format!("crop={}:{}:{}:0,scale=1080:1920", crop_w, src_h, x);
    if let Some(srt_path) = srt {
        vf.push_str(&format!(
            ",subtitles='{}':force_style='{}'",
            media::escape_filter_path(srt_path),
            SHORTS_SUB_STYLE,
        ));
    }
    vf
}

/// Concat the per-segment renders, then re-mux against a cleanly re-decoded
/// WAV of the audio. AAC priming samples accumulate across concat boundaries
/// and inflate the audio track; platforms reject audio longer than video.
async fn concat_short(
    seg_files: &[std::path::PathBuf],
    work_dir: &Path,
    output: &Path,
    audio_bitrate: &str,
) -> Result<(), StageError> {
    let concat_list = work_dir.join("concat.txt");
    let mut listing = String::new();
    for path in seg_files {
        let safe = path.to_string_lossy().replace('\'', "'\\''");
        listing.push_str(&format!("file '{}'\n", safe));
    }
    tokio::fs::write(&concat_list, listing).await?;

    let raw_concat = work_dir.join("concat_raw.mp4");
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

    let clean_wav = work_dir.join("audio_clean.wav");
    let mut wav_args = vec!["-i".to_string(), raw_concat.to_string_lossy().to_string()];
    if let Some(dur) = video_dur {
        wav_args.push("-t".to_string());
        wav_args.push(dur.to_string());
    }
    wav_args.extend(
        ["-vn", "-c:a", "pcm_s16le", "-ar", "48000"]
            .iter()
            .map(|s| s.to_string()),
    );
    wav_args.push(clean_wav.to_string_lossy().to_string());
    media::run_ffmpeg(wav_args).await?;

    media::run_ffmpeg([
        "-i",
        &raw_concat.to_string_lossy(),
        "-i",
        &clean_wav.to_string_lossy(),
        "-map",
        "0:v",
        "-map",
        "1:a",
        "-c:v",
        "copy",
        "-c:a",
        "aac",
        "-b:a",
        audio_bitrate,
        "-shortest",
        "-fflags",
        "+shortest",
        "-use_editlist",
        "0",
        "-movflags",
        "+faststart",
        &output.to_string_lossy(),
    ])
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop() -> CropConfig {
        CropConfig {
            speaker_l_center_x: 480,
            speaker_l_center_y: 540,
            speaker_r_center_x: 1440,
            speaker_r_center_y: 540,
        }
    }

    fn seg(start: f64, end: f64, speaker: Speaker) -> Segment {
        Segment {
            start,
            end,
            speaker,
            duration: end - start,
        }
    }

    #[test]
    fn test_clip_segments_clamps_to_bounds() {
        let segments = vec![
            seg(0.0, 20.0, Speaker::Left),
            seg(20.0, 40.0, Speaker::Right),
        ];
        let clipped = clip_segments(&segments, 15.0, 35.0);
        assert_eq!(clipped.len(), 2);
        assert_eq!(clipped[0].start, 15.0);
        assert_eq!(clipped[0].end, 20.0);
        assert_eq!(clipped[1].end, 35.0);
    }

    #[test]
    fn test_clip_segments_fallback_when_no_overlap() {
        let segments = vec![seg(0.0, 10.0, Speaker::Left)];
        let clipped = clip_segments(&segments, 50.0, 80.0);
        assert_eq!(clipped.len(), 1);
        assert_eq!(clipped[0].speaker, Speaker::Both);
        assert_eq!(clipped[0].start, 50.0);
        assert_eq!(clipped[0].end, 80.0);
    }

    #[test]
    fn test_clip_segments_absorbs_slivers() {
        let segments = vec![
            seg(0.0, 10.0, Speaker::Left),
            seg(10.0, 10.3, Speaker::Both),
            seg(10.3, 20.0, Speaker::Right),
        ];
        let clipped = clip_segments(&segments, 0.0, 20.0);
        assert_eq!(clipped.len(), 2);
        // The sliver extended the previous segment.
        assert_eq!(clipped[0].end, 10.3);
        assert_eq!(clipped[1].start, 10.3);
    }

    #[test]
    fn test_clip_segments_leading_sliver_yields_to_next() {
        let segments = vec![
            seg(0.0, 10.2, Speaker::Both),
            seg(10.2, 30.0, Speaker::Left),
        ];
        let clipped = clip_segments(&segments, 10.0, 25.0);
        assert_eq!(clipped.len(), 1);
        assert_eq!(clipped[0].speaker, Speaker::Left);
        // The skipped leading sliver's time is reclaimed at the clip edge.
        assert_eq!(clipped[0].start, 10.0);
        assert_eq!(clipped[0].end, 25.0);
    }

    #[test]
    fn test_crop_filter_9x16_centers_both_on_left() {
        // 1080p: 9:16 crop is 607 wide; BOTH follows the left speaker.
        let vf = crop_filter_9x16(Speaker::Both, 1920, 1080, &crop(), None);
        assert_eq!(vf, "crop=607:1080:177:0,scale=1080:1920");

        let vf = crop_filter_9x16(Speaker::Right, 1920, 1080, &crop(), None);
        assert_eq!(vf, "crop=607:1080:1137:0,scale=1080:1920");
    }
}
