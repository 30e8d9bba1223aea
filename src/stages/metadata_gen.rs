//! Metadata generation stage: one model call producing per-platform titles,
//! captions, and a publish schedule for every clip plus the longform episode.

use async_trait::async_trait;
use serde::Serialize;

use super::{Stage, StageContext, StageResult};
use crate::episode::Clip;
use crate::error::StageError;
use crate::llm::{self, LlmClient};
use crate::pipeline::graph::StageId;
use crate::transcript::DiarizedTranscript;

const METADATA_MAX_TOKENS: u32 = 16_384;
const METADATA_TEMPERATURE: f32 = 0.4;
const EXCERPT_MAX_CHARS: usize = 500;

pub struct MetadataGenStage;

#[async_trait]
impl Stage for MetadataGenStage {
    fn id(&self) -> StageId {
        StageId::MetadataGen
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let clips_doc: serde_json::Value = ctx.load_json("clips.json")?;
        let clips: Vec<Clip> =
            serde_json::from_value(clips_doc.get("clips").cloned().unwrap_or_default())?;
        let diarized: DiarizedTranscript = ctx.load_json("diarized_transcript.json")?;

        // episode_info.json is best effort; the prompt degrades gracefully
        // without guest details.
        let info: serde_json::Value = ctx.load_json("episode_info.json").unwrap_or_default();
        let guest_name = info.get("guest_name").and_then(|v| v.as_str()).unwrap_or("");
        let guest_title = info.get("guest_title").and_then(|v| v.as_str()).unwrap_or("");
        let episode_description = info
            .get("episode_description")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let summaries: Vec<ClipSummary> = clips
            .iter()
            .map(|clip| ClipSummary {
                id: clip.id.clone(),
                title: clip.title.clone(),
                hook_text: clip.hook_text.clone(),
                duration: clip.duration,
                virality_score: clip.virality_score,
                transcript_excerpt: excerpt(&diarized, clip.start_seconds, clip.end_seconds),
            })
            .collect();

        let podcast = &ctx.config.podcast;
        let prompt = build_prompt(
            &summaries,
            guest_name,
            guest_title,
            episode_description,
            &podcast.title,
            &podcast.channel_handle,
        )?;

        let client = LlmClient::from_config(&ctx.config.clip_mining)?;
        tracing::info!("generating metadata via {}", client.model());
        let response = client
            .complete_with(&prompt, METADATA_MAX_TOKENS, METADATA_TEMPERATURE)
            .await?;
        let metadata: serde_json::Value = serde_json::from_str(llm::strip_code_fences(&response))
            .map_err(|e| StageError::Other(format!("unparseable metadata response: {}", e)))?;

        ctx.save_json("metadata/metadata.json", &metadata)?;

        let longform_title = metadata
            .pointer("/longform/title")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let clip_count = metadata
            .get("clips")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let schedule_entries = metadata
            .get("schedule")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);

        Ok(StageResult::new()
            .with(
                "metadata_path",
                ctx.episode_dir.join("metadata").join("metadata.json").to_string_lossy(),
            )
            .with("longform_title", longform_title)
            .with("clip_metadata_count", clip_count)
            .with("schedule_entries", schedule_entries))
    }
}

#[derive(Serialize)]
struct ClipSummary {
    id: String,
    title: String,
    hook_text: String,
    duration: f64,
    virality_score: f64,
    transcript_excerpt: String,
}

/// Utterance text overlapping the clip range, bounded for prompt size.
fn excerpt(diarized: &DiarizedTranscript, start: f64, end: f64) -> String {
    let text = diarized
        .slice(start, end)
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    truncate_chars(&text, EXCERPT_MAX_CHARS)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn build_prompt(
    summaries: &[ClipSummary],
    guest_name: &str,
    guest_title: &str,
    episode_description: &str,
    podcast_title: &str,
    channel_handle: &str,
) -> Result<String, StageError> {
    let guest_context = if !guest_name.is_empty() {
        let guest_line = if guest_title.is_empty() {
            guest_name.to_string()
        } else {
            format!("{} — {}", guest_name, guest_title)
        };
        format!(
            "EPISODE CONTEXT:\n\
             - Guest: {guest_line}\n\
             - Podcast: {podcast_title} (channel: {channel_handle})\n\
             - Episode description: {episode_description}\n\
             \n\
             IMPORTANT RULES:\n\
             - Longform title MUST follow this format: \"{guest_name} | {podcast_title}\"\n\
             - Longform description should mention who {guest_name} is and what they do\n\
             - ALL short-form clip metadata MUST include a reference to the full episode channel ({channel_handle})\n\
             - Include \"{guest_name}\" in clip captions/descriptions where natural\n\
             - YouTube Shorts descriptions should include \"Full episode on {channel_handle}\"\n\
             - TikTok captions should include \"{channel_handle}\"\n\
             - Instagram captions should include \"Full ep on {channel_handle}\"\n",
        )
    } else {
        format!(
            "EPISODE CONTEXT:\n\
             - Podcast: {podcast_title} (channel: {channel_handle})\n\
             \n\
             IMPORTANT RULES:\n\
             - ALL short-form clip metadata MUST include a reference to the full episode channel ({channel_handle})\n\
             - YouTube Shorts descriptions should include \"Full episode on {channel_handle}\"\n\
             - TikTok captions should include \"{channel_handle}\"\n\
             - Instagram captions should include \"Full ep on {channel_handle}\"\n",
        )
    };

    let clips_json = serde_json::to_string_pretty(summaries)?;
    Ok(format!(
        "You are a social media strategist for a podcast. Generate metadata for these clips and the longform episode.\n\
         {guest_context}\n\
         CLIPS:\n\
         {clips_json}\n\
         \n\
         Generate a JSON object with these sections:\n\
         \n\
         1. \"longform\": object with:\n\
            - \"title\": YouTube episode title (max 100 chars)\n\
            - \"description\": YouTube description (2-3 paragraphs, include timestamps, call to action)\n\
            - \"tags\": array of 10-15 relevant tags\n\
         \n\
         2. \"clips\": array (one per clip, same order) each with:\n\
            - \"id\": clip ID\n\
            - \"youtube\": object with \"title\" (max 100 chars with #Shorts), \"description\" (2-3 lines, include \"Full episode on {channel_handle}\")\n\
            - \"tiktok\": object with \"caption\" (max 150 chars with hashtags inline, include {channel_handle}), \"hashtags\" (array of 5-8 hashtags)\n\
            - \"instagram\": object with \"caption\" (max 200 chars with CTA, include \"Full ep on {channel_handle}\"), \"hashtags\" (array of 10 hashtags)\n\
            - \"linkedin\": object with \"title\" (professional tone, max 100 chars), \"description\" (1-2 paragraphs, insight-driven)\n\
            - \"x\": object with \"text\" (max 280 chars including hashtags, punchy and engaging)\n\
            - \"facebook\": object with \"title\" (max 100 chars), \"description\" (conversational, 1-2 paragraphs)\n\
            - \"threads\": object with \"text\" (max 500 chars, conversational tone)\n\
            - \"pinterest\": object with \"title\" (max 100 chars, keyword-rich), \"description\" (2-3 sentences, searchable)\n\
            - \"bluesky\": object with \"text\" (max 300 chars, casual tone)\n\
         \n\
         3. \"schedule\": array of publish slots, each with:\n\
            - \"clip_id\": which clip\n\
            - \"platform\": \"youtube\" | \"tiktok\" | \"instagram\" | \"linkedin\" | \"x\" | \"facebook\" | \"threads\" | \"pinterest\" | \"bluesky\"\n\
            - \"day_offset\": days from today (0 = today)\n\
            - \"time_slot\": \"morning\" | \"afternoon\" | \"evening\"\n\
         \n\
         Schedule rules: 1 clip/day Mon-Thu, 2 clips/day Fri-Sun. Stagger platforms. \
         Prioritize YouTube, TikTok, Instagram first, then rotate LinkedIn, X, Facebook, Threads, Pinterest, Bluesky.\n\
         \n\
         Return ONLY the JSON object, no other text.",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Utterance;

    #[test]
    fn test_excerpt_is_bounded() {
        let t = DiarizedTranscript {
            utterances: vec![Utterance {
                speaker: 0,
                start: 0.0,
                end: 60.0,
                text: "word ".repeat(200),
                words: Vec::new(),
            }],
        };
        let e = excerpt(&t, 0.0, 60.0);
        assert_eq!(e.chars().count(), EXCERPT_MAX_CHARS);
    }

    #[test]
    fn test_prompt_includes_guest_rules_only_when_known() {
        let with_guest = build_prompt(&[], "Jane Doe", "economist", "About money.", "My Pod", "@mypod").unwrap();
        assert!(with_guest.contains("Jane Doe | My Pod"));
        assert!(with_guest.contains("Jane Doe — economist"));

        let without = build_prompt(&[], "", "", "", "My Pod", "@mypod").unwrap();
        assert!(!without.contains("Longform title MUST"));
        assert!(without.contains("Full episode on @mypod"));
    }
}
