//! Transcribe stage: extract compact audio, send it to Deepgram, and write
//! the raw response, the diarized transcript, and a full-episode SRT.

use async_trait::async_trait;
use std::time::Duration;

use super::{Stage, StageContext, StageResult};
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;
use crate::transcript::{self, DiarizedTranscript, Utterance, Word};

const DEEPGRAM_URL: &str = "https://api.deepgram.com/v1/listen";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub struct TranscribeStage;

#[async_trait]
impl Stage for TranscribeStage {
    fn id(&self) -> StageId {
        StageId::Transcribe
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let merged = ctx.episode_dir.join("source_merged.mp4");
        if !merged.exists() {
            return Err(StageError::Precondition("source_merged.mp4".to_string()));
        }
        let work_dir = ctx.work_dir();
        tokio::fs::create_dir_all(&work_dir).await?;

        // Compact AAC for upload; reused across retries of this stage.
        let audio_path = work_dir.join("audio.m4a");
        if !audio_path.exists() {
            tracing::info!("extracting audio to m4a");
            media::run_ffmpeg([
                "-i",
                &merged.to_string_lossy(),
                "-vn",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                &audio_path.to_string_lossy(),
            ])
            .await?;
        }

        let audio_size_mb = tokio::fs::metadata(&audio_path).await?.len() as f64 / 1e6;
        tracing::info!("audio file: {:.1} MB", audio_size_mb);

        let api_key = std::env::var("DEEPGRAM_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| StageError::Other("DEEPGRAM_API_KEY not set in environment".into()))?;

        let tc = &ctx.config.transcription;
        let audio_data = tokio::fs::read(&audio_path).await?;

        tracing::info!("sending to Deepgram {} (may take minutes)", tc.model);
        let client = reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
        let response = client
            .post(DEEPGRAM_URL)
            .query(&[
                ("model", tc.model.as_str()),
                ("language", tc.language.as_str()),
                ("diarize", bool_str(tc.diarize)),
                ("utterances", bool_str(tc.utterances)),
                ("smart_format", bool_str(tc.smart_format)),
                ("punctuate", "true"),
            ])
            .header("Authorization", format!("Token {}", api_key))
            .header("Content-Type", "audio/mp4")
            .body(audio_data)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(StageError::Api {
                service: "deepgram".to_string(),
                status,
                detail,
            });
        }

        let raw: serde_json::Value = response.json().await?;
        ctx.save_json("transcript.json", &raw)?;
        tracing::info!("raw transcript saved");

        let diarized = build_diarized_transcript(&raw);
        ctx.save_json("diarized_transcript.json", &diarized)?;

        let slices: Vec<&Utterance> = diarized.utterances.iter().collect();
        let srt = transcript::build_srt(&slices, 0.0);
        let srt_path = ctx.episode_dir.join("subtitles").join("transcript.srt");
        if let Some(parent) = srt_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&srt_path, srt).await?;

        let utterance_count = diarized.utterances.len();
        let word_count: usize = diarized.utterances.iter().map(|u| u.words.len()).sum();

        Ok(StageResult::new()
            .with("transcript_path", ctx.episode_dir.join("transcript.json").to_string_lossy())
            .with(
                "diarized_path",
                ctx.episode_dir.join("diarized_transcript.json").to_string_lossy(),
            )
            .with("srt_path", srt_path.to_string_lossy())
            .with("utterance_count", utterance_count)
            .with("word_count", word_count)
            .with("audio_size_mb", (audio_size_mb * 10.0).round() / 10.0))
    }
}

fn bool_str(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

/// Flatten the provider response into speaker-labeled utterances with word
/// timestamps.
fn build_diarized_transcript(raw: &serde_json::Value) -> DiarizedTranscript {
    let mut utterances = Vec::new();
    let raw_utterances = raw
        .pointer("/results/utterances")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    for utt in raw_utterances {
        let words = utt
            .get("words")
            .and_then(|v| v.as_array())
            .map(|ws| {
                ws.iter()
                    .map(|w| Word {
                        word: w.get("word").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                        start: w.get("start").and_then(|v| v.as_f64()).unwrap_or(0.0),
                        end: w.get("end").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    })
                    .collect()
            })
            .unwrap_or_default();

        utterances.push(Utterance {
            speaker: utt.get("speaker").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            start: utt.get("start").and_then(|v| v.as_f64()).unwrap_or(0.0),
            end: utt.get("end").and_then(|v| v.as_f64()).unwrap_or(0.0),
            text: utt
                .get("transcript")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            words,
        });
    }

    DiarizedTranscript { utterances }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_diarized_transcript() {
        let raw = serde_json::json!({
            "results": {
                "utterances": [
                    {
                        "speaker": 1,
                        "start": 0.5,
                        "end": 4.2,
                        "transcript": "Welcome to the show.",
                        "words": [
                            {"word": "Welcome", "start": 0.5, "end": 1.0}
                        ]
                    }
                ]
            }
        });
        let diarized = build_diarized_transcript(&raw);
        assert_eq!(diarized.utterances.len(), 1);
        let u = &diarized.utterances[0];
        assert_eq!(u.speaker, 1);
        assert_eq!(u.text, "Welcome to the show.");
        assert_eq!(u.words.len(), 1);
    }

    #[test]
    fn test_build_diarized_transcript_empty_response() {
        let diarized = build_diarized_transcript(&serde_json::json!({}));
        assert!(diarized.utterances.is_empty());
    }
}
