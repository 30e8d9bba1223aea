//! Clip miner stage: ask the model for the best short-form clips plus guest
//! and episode metadata, then ground the proposed boundaries in the audio by
//! snapping them to low-energy frames.

use async_trait::async_trait;
use serde::Deserialize;

use super::stitch::StitchOutput;
use super::{Stage, StageContext, StageResult};
use crate::episode::{Clip, ClipStatus};
use crate::error::StageError;
use crate::llm::{self, LlmClient};
use crate::pipeline::graph::StageId;
use crate::segment::{self, RmsData, Segment, SegmentsFile, Speaker};
use crate::transcript::DiarizedTranscript;

pub struct ClipMinerStage;

#[async_trait]
impl Stage for ClipMinerStage {
    fn id(&self) -> StageId {
        StageId::ClipMiner
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let diarized: DiarizedTranscript = ctx.load_json("diarized_transcript.json")?;
        let segments_file: SegmentsFile = ctx.load_json("segments.json")?;
        let stitch: StitchOutput = ctx.load_json("stitch.json")?;

        let processing = &ctx.config.processing;
        let prompt = build_prompt(
            &diarized,
            stitch.duration_seconds,
            processing.clip_count,
            processing.clip_min_seconds,
            processing.clip_max_seconds,
        );

        let client = LlmClient::from_config(&ctx.config.clip_mining)?;
        let response = client.complete(&prompt).await?;
        let parsed: MinerResponse = serde_json::from_str(llm::strip_code_fences(&response))
            .map_err(|e| StageError::Other(format!("unparseable miner response: {}", e)))?;

        let info = parsed.episode_info.unwrap_or_default();
        ctx.save_json("episode_info.json", &info)?;

        // Model timestamps drift; anchor each boundary to the quietest nearby
        // frame so cuts land in pauses instead of mid-word.
        let rms_data: Option<RmsData> = ctx.load_json("work/rms_data.json").ok();
        let tolerance = ctx.config.clip_mining.boundary_snap_tolerance_seconds;

        let mut clips = Vec::with_capacity(parsed.clips.len());
        for (i, proposal) in parsed.clips.into_iter().enumerate() {
            let (start, end) = match &rms_data {
                Some(rms) => {
                    let combined: Vec<f64> = rms
                        .left_rms_db
                        .iter()
                        .zip(rms.right_rms_db.iter())
                        .map(|(l, r)| l + r)
                        .collect();
                    (
                        segment::snap_to_energy_minimum(
                            proposal.start_seconds,
                            &combined,
                            rms.frame_seconds,
                            tolerance,
                        ),
                        segment::snap_to_energy_minimum(
                            proposal.end_seconds,
                            &combined,
                            rms.frame_seconds,
                            tolerance,
                        ),
                    )
                }
                None => (proposal.start_seconds, proposal.end_seconds),
            };

            clips.push(Clip {
                id: format!("clip_{:02}", i + 1),
                rank: (i + 1) as u32,
                start_seconds: start,
                end_seconds: end,
                duration: ((end - start) * 10.0).round() / 10.0,
                title: proposal.title,
                hook_text: proposal.hook_text,
                compelling_reason: proposal.compelling_reason,
                virality_score: proposal.virality_score,
                speaker: dominant_speaker(start, end, &segments_file.segments),
                status: ClipStatus::Pending,
                manual: false,
            });
        }

        tracing::info!("mined {} clips", clips.len());
        let clips_doc = serde_json::json!({
            "clips": clips,
            "clip_count": clips.len(),
            "model_used": client.model(),
        });
        ctx.save_json("clips.json", &clips_doc)?;

        // Episode metadata rides back on the result; the orchestrator owns
        // episode.json and merges these after the stage completes.
        Ok(StageResult::new()
            .with("clips", &clips)
            .with("clip_count", clips.len())
            .with("model_used", client.model())
            .with("guest_name", &info.guest_name)
            .with("guest_title", &info.guest_title)
            .with("episode_title", &info.episode_title)
            .with("episode_description", &info.episode_description))
    }
}

fn build_prompt(
    diarized: &DiarizedTranscript,
    total_duration: f64,
    clip_count: usize,
    clip_min: f64,
    clip_max: f64,
) -> String {
    format!(
        "You are an expert podcast clip editor. Analyze this transcript and:\n\
         \n\
         1. Extract guest/episode information from the opening\n\
         2. Identify the {clip_count} best clips for short-form video (YouTube Shorts, TikTok, Instagram Reels)\n\
         \n\
         Each clip should be {clip_min:.0}-{clip_max:.0} seconds long and should:\n\
         - Have a strong hook in the first 3 seconds\n\
         - Tell a complete micro-story or make a compelling point\n\
         - Be emotionally engaging, funny, surprising, or deeply insightful\n\
         - End on a strong note (punchline, revelation, call-to-action)\n\
         \n\
         The total episode duration is {total_duration:.1} seconds.\n\
         \n\
         TRANSCRIPT (with timestamps and speaker labels):\n\
         {transcript}\n\
         \n\
         Return EXACTLY a JSON object with two keys:\n\
         \n\
         1. \"episode_info\": object with:\n\
            - \"guest_name\": full name of the guest (empty string if not mentioned)\n\
            - \"guest_title\": who they are / what they do (empty string if unknown)\n\
            - \"episode_title\": suggested episode title\n\
            - \"episode_description\": 2-3 sentence description\n\
         \n\
         2. \"clips\": array of {clip_count} clips, each with:\n\
            - \"start_seconds\": number (start time in seconds)\n\
            - \"end_seconds\": number (end time in seconds)\n\
            - \"title\": string (catchy title, max 60 chars)\n\
            - \"hook_text\": string (the opening hook line)\n\
            - \"compelling_reason\": string (why this clip will perform well)\n\
            - \"virality_score\": number (1-10, how viral this clip could be)\n\
         \n\
         Return ONLY the JSON object, no other text.",
        transcript = diarized.as_prompt_text(),
    )
}

/// The speaker holding the most overlapping time wins; BOTH when nothing
/// overlaps at all.
fn dominant_speaker(start: f64, end: f64, segments: &[Segment]) -> Speaker {
    let mut totals: Vec<(Speaker, f64)> = Vec::new();
    for seg in segments {
        let overlap = end.min(seg.end) - start.max(seg.start);
        if overlap > 0.0 {
            match totals.iter_mut().find(|(s, _)| *s == seg.speaker) {
                Some(entry) => entry.1 += overlap,
                None => totals.push((seg.speaker, overlap)),
            }
        }
    }
    totals
        .into_iter()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(s, _)| s)
        .unwrap_or(Speaker::Both)
}

#[derive(Debug, Deserialize)]
struct MinerResponse {
    #[serde(default)]
    episode_info: Option<EpisodeInfo>,
    #[serde(default)]
    clips: Vec<ClipProposal>,
}

#[derive(Debug, Default, Deserialize, serde::Serialize)]
struct EpisodeInfo {
    #[serde(default)]
    guest_name: String,
    #[serde(default)]
    guest_title: String,
    #[serde(default)]
    episode_title: String,
    #[serde(default)]
    episode_description: String,
}

#[derive(Debug, Deserialize)]
struct ClipProposal {
    start_seconds: f64,
    end_seconds: f64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    hook_text: String,
    #[serde(default)]
    compelling_reason: String,
    #[serde(default)]
    virality_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, speaker: Speaker) -> Segment {
        Segment {
            start,
            end,
            speaker,
            duration: end - start,
        }
    }

    #[test]
    fn test_dominant_speaker_by_overlap() {
        let segments = vec![
            seg(0.0, 10.0, Speaker::Left),
            seg(10.0, 12.0, Speaker::Both),
            seg(12.0, 30.0, Speaker::Right),
        ];
        assert_eq!(dominant_speaker(2.0, 8.0, &segments), Speaker::Left);
        assert_eq!(dominant_speaker(8.0, 25.0, &segments), Speaker::Right);
        // No overlap at all falls back to BOTH.
        assert_eq!(dominant_speaker(40.0, 50.0, &segments), Speaker::Both);
    }

    #[test]
    fn test_miner_response_parses_with_missing_fields() {
        let raw = r#"{
            "episode_info": {"guest_name": "Jane Doe", "episode_title": "On Risk"},
            "clips": [
                {"start_seconds": 10.5, "end_seconds": 55.0, "title": "The hook"}
            ]
        }"#;
        let parsed: MinerResponse = serde_json::from_str(raw).unwrap();
        let info = parsed.episode_info.unwrap();
        assert_eq!(info.guest_name, "Jane Doe");
        assert_eq!(info.guest_title, "");
        assert_eq!(parsed.clips.len(), 1);
        assert_eq!(parsed.clips[0].virality_score, 0.0);
    }

    #[test]
    fn test_prompt_carries_transcript_and_limits() {
        let t = DiarizedTranscript {
            utterances: vec![crate::transcript::Utterance {
                speaker: 0,
                start: 0.0,
                end: 3.0,
                text: "Welcome back.".to_string(),
                words: Vec::new(),
            }],
        };
        let prompt = build_prompt(&t, 1800.0, 10, 30.0, 90.0);
        assert!(prompt.contains("Speaker 0: Welcome back."));
        assert!(prompt.contains("30-90 seconds"));
        assert!(prompt.contains("1800.0 seconds"));
    }
}
