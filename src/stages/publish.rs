//! Publish stage: submit the shorts and the longform episode to social
//! platforms through the Upload-Post API. Rejected clips are skipped; a failed
//! submission is recorded per clip, not fatal to the rest.

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, Timelike, Utc};
use reqwest::multipart;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::{Stage, StageContext, StageResult};
use crate::episode::{Clip, ClipStatus};
use crate::error::StageError;
use crate::pipeline::graph::StageId;

const UPLOAD_POST_URL: &str = "https://api.upload-post.com/api/upload_videos";
const SHORTS_TIMEOUT: Duration = Duration::from_secs(300);
const LONGFORM_TIMEOUT: Duration = Duration::from_secs(600);

const SHORTS_PER_WEEKDAY: usize = 1;
const SHORTS_PER_WEEKEND_DAY: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub clip_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub day_offset: i64,
    #[serde(default)]
    pub time_slot: String,
}

#[derive(Debug, Serialize)]
struct Submission {
    clip_id: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub struct PublishStage;

#[async_trait]
impl Stage for PublishStage {
    fn id(&self) -> StageId {
        StageId::Publish
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let api_key = require_env("UPLOAD_POST_API_KEY")?;
        let user = require_env("UPLOAD_POST_USER")?;

        let clips_doc: serde_json::Value = ctx.load_json("clips.json")?;
        let clips: Vec<Clip> =
            serde_json::from_value(clips_doc.get("clips").cloned().unwrap_or_default())?;

        let metadata: serde_json::Value =
            ctx.load_json("metadata/metadata.json").unwrap_or_default();
        let clip_metadata: HashMap<String, serde_json::Value> = metadata
            .get("clips")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        m.get("id")
                            .and_then(|v| v.as_str())
                            .map(|id| (id.to_string(), m.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        // X piggybacks on Upload-Post regardless of config toggles.
        let mut platforms = ctx.config.platforms.enabled();
        platforms.push("x");

        let mut schedule: Vec<ScheduleEntry> = metadata
            .get("schedule")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if schedule.is_empty() {
            schedule = generate_schedule(&clips);
        }
        let clip_schedules: HashMap<&str, &ScheduleEntry> = {
            let mut map = HashMap::new();
            for entry in &schedule {
                map.entry(entry.clip_id.as_str()).or_insert(entry);
            }
            map
        };

        let client = reqwest::Client::new();
        tracing::info!("publishing {} shorts to {:?}", clips.len(), platforms);

        let mut results = Vec::new();
        for clip in &clips {
            if clip.status == ClipStatus::Rejected {
                tracing::info!("skipping rejected clip {}", clip.id);
                continue;
            }
            let short_path = ctx.episode_dir.join("shorts").join(format!("{}.mp4", clip.id));
            if !short_path.exists() {
                tracing::warn!("short not found: {}", clip.id);
                continue;
            }

            let mut form = multipart::Form::new()
                .text("user", user.clone())
                .text("title", clip.title.clone())
                .text("async_upload", "true");
            for (i, p) in platforms.iter().enumerate() {
                form = form.text(format!("platform[{}]", i), p.to_string());
            }

            let cmeta = clip_metadata.get(&clip.id);
            if let Some(yt) = cmeta.and_then(|m| m.get("youtube")) {
                form = form
                    .text(
                        "youtube_title",
                        str_or(yt.get("title"), &clip.title).to_string(),
                    )
                    .text(
                        "youtube_description",
                        str_or(yt.get("description"), "").to_string(),
                    );
            }
            if let Some(tt) = cmeta.and_then(|m| m.get("tiktok")) {
                let caption = str_or(tt.get("caption"), &clip.title);
                let hashtags = join_hashtags(tt.get("hashtags"));
                form = form.text("tiktok_title", format!("{} {}", caption, hashtags).trim().to_string());
            }
            if let Some(ig) = cmeta.and_then(|m| m.get("instagram")) {
                let caption = str_or(ig.get("caption"), &clip.title);
                let hashtags = join_hashtags(ig.get("hashtags"));
                form = form.text(
                    "instagram_caption",
                    format!("{}\n\n{}", caption, hashtags).trim().to_string(),
                );
            }

            let mut scheduled = None;
            if let Some(entry) = clip_schedules.get(clip.id.as_str()) {
                let when = schedule_to_datetime(entry.day_offset, &entry.time_slot);
                scheduled = Some(when.to_rfc3339());
                form = form.text("scheduled_date", when.to_rfc3339());
            }

            let video = tokio::fs::read(&short_path).await?;
            tracing::info!("uploading {} ({:.1} MB)", clip.id, video.len() as f64 / 1e6);
            let part = multipart::Part::bytes(video)
                .file_name(format!("{}.mp4", clip.id))
                .mime_str("video/mp4")?;
            form = form.part("video", part);

            let response = client
                .post(UPLOAD_POST_URL)
                .header("Authorization", format!("Apikey {}", api_key))
                .multipart(form)
                .timeout(SHORTS_TIMEOUT)
                .send()
                .await?;

            if response.status().is_success() {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                let request_id = request_id_of(&body);
                tracing::info!("{} submitted (id: {})", clip.id, request_id);
                results.push(Submission {
                    clip_id: clip.id.clone(),
                    status: "submitted".to_string(),
                    request_id: Some(request_id),
                    scheduled,
                    error: None,
                });
            } else {
                let status = response.status().as_u16();
                let detail = response.text().await.unwrap_or_default();
                tracing::error!("{} failed: {} {}", clip.id, status, detail);
                results.push(Submission {
                    clip_id: clip.id.clone(),
                    status: "failed".to_string(),
                    request_id: None,
                    scheduled: None,
                    error: Some(format!("{}: {}", status, detail)),
                });
            }
        }

        // Longform goes to YouTube only.
        let longform_path = ctx.episode_dir.join("longform.mp4");
        let mut longform_result = serde_json::Value::Null;
        if longform_path.exists() && platforms.contains(&"youtube") {
            let longform_meta = metadata.get("longform").cloned().unwrap_or_default();
            let lf_title = str_or(longform_meta.get("title"), "Podcast Episode").to_string();
            let lf_desc = str_or(longform_meta.get("description"), "").to_string();

            let mut form = multipart::Form::new()
                .text("user", user.clone())
                .text("platform[0]", "youtube")
                .text("title", lf_title.clone())
                .text("description", lf_desc.clone())
                .text("youtube_title", lf_title)
                .text("youtube_description", lf_desc)
                .text("async_upload", "true");
            if let Some(tags) = longform_meta.get("tags").and_then(|v| v.as_array()) {
                let joined = tags
                    .iter()
                    .filter_map(|t| t.as_str())
                    .collect::<Vec<_>>()
                    .join(",");
                if !joined.is_empty() {
                    form = form.text("tags", joined);
                }
            }

            let video = tokio::fs::read(&longform_path).await?;
            tracing::info!("uploading longform ({:.0} MB)", video.len() as f64 / 1e6);
            let part = multipart::Part::bytes(video)
                .file_name("longform.mp4")
                .mime_str("video/mp4")?;
            form = form.part("video", part);

            let response = client
                .post(UPLOAD_POST_URL)
                .header("Authorization", format!("Apikey {}", api_key))
                .multipart(form)
                .timeout(LONGFORM_TIMEOUT)
                .send()
                .await?;

            longform_result = if response.status().is_success() {
                let body: serde_json::Value = response.json().await.unwrap_or_default();
                tracing::info!("longform submitted");
                serde_json::json!({
                    "status": "submitted",
                    "platform": "youtube",
                    "request_id": request_id_of(&body),
                })
            } else {
                let status = response.status().as_u16();
                let detail = response.text().await.unwrap_or_default();
                tracing::error!("longform failed: {}", status);
                serde_json::json!({
                    "status": "failed",
                    "status_code": status,
                    "error": detail,
                })
            };
        }

        let submitted = results.iter().filter(|r| r.status == "submitted").count();
        let failed = results.iter().filter(|r| r.status == "failed").count();

        Ok(StageResult::new()
            .with("shorts", &results)
            .with("longform", longform_result)
            .with("shorts_submitted", submitted)
            .with("shorts_failed", failed)
            .with("platforms", &platforms))
    }
}

fn require_env(name: &str) -> Result<String, StageError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StageError::Other(format!("{} not set in environment", name)))
}

fn str_or<'a>(value: Option<&'a serde_json::Value>, default: &'a str) -> &'a str {
    value.and_then(|v| v.as_str()).unwrap_or(default)
}

fn join_hashtags(value: Option<&serde_json::Value>) -> String {
    value
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn request_id_of(body: &serde_json::Value) -> String {
    body.get("request_id")
        .or_else(|| body.get("job_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// Fallback schedule when metadata generation produced none: one short per
/// weekday, two on Friday through Sunday.
fn generate_schedule(clips: &[Clip]) -> Vec<ScheduleEntry> {
    let mut schedule = Vec::with_capacity(clips.len());
    let now = Utc::now();
    let mut day_offset = 0i64;
    let mut clip_idx = 0usize;

    while clip_idx < clips.len() {
        let target = now + ChronoDuration::days(day_offset);
        let weekday = target.weekday().num_days_from_monday();
        let slots = if weekday >= 4 {
            SHORTS_PER_WEEKEND_DAY
        } else {
            SHORTS_PER_WEEKDAY
        };

        for slot in 0..slots {
            let Some(clip) = clips.get(clip_idx) else {
                break;
            };
            schedule.push(ScheduleEntry {
                clip_id: clip.id.clone(),
                platform: "all".to_string(),
                day_offset,
                time_slot: if slot == 0 { "morning" } else { "evening" }.to_string(),
            });
            clip_idx += 1;
        }
        day_offset += 1;
    }
    schedule
}

fn schedule_to_datetime(day_offset: i64, time_slot: &str) -> chrono::DateTime<Utc> {
    let hour = match time_slot {
        "morning" => 9,
        "afternoon" => 14,
        "evening" => 18,
        _ => 12,
    };
    let target = Utc::now() + ChronoDuration::days(day_offset);
    target
        .with_hour(hour)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Speaker;

    fn clip(id: &str) -> Clip {
        Clip {
            id: id.to_string(),
            rank: 1,
            start_seconds: 0.0,
            end_seconds: 45.0,
            duration: 45.0,
            title: format!("Clip {}", id),
            hook_text: String::new(),
            compelling_reason: String::new(),
            virality_score: 5.0,
            speaker: Speaker::Both,
            status: ClipStatus::Pending,
            manual: false,
        }
    }

    #[test]
    fn test_generate_schedule_covers_all_clips() {
        let clips: Vec<Clip> = (0..7).map(|i| clip(&format!("clip_{:02}", i))).collect();
        let schedule = generate_schedule(&clips);
        assert_eq!(schedule.len(), clips.len());
        // Offsets never decrease, at most two slots share a day.
        for pair in schedule.windows(2) {
            assert!(pair[1].day_offset >= pair[0].day_offset);
        }
        for entry in &schedule {
            assert!(entry.time_slot == "morning" || entry.time_slot == "evening");
        }
    }

    #[test]
    fn test_schedule_to_datetime_slots() {
        let morning = schedule_to_datetime(0, "morning");
        assert_eq!(morning.hour(), 9);
        let unknown = schedule_to_datetime(0, "lunch");
        assert_eq!(unknown.hour(), 12);
    }

    #[test]
    fn test_request_id_of_falls_back_to_job_id() {
        let body = serde_json::json!({"job_id": "j-123"});
        assert_eq!(request_id_of(&body), "j-123");
        assert_eq!(request_id_of(&serde_json::json!({})), "");
    }
}
