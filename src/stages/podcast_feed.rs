//! Podcast feed stage: extract the episode audio as MP3, rebuild the RSS feed
//! over every published episode, and push both to object storage.
//!
//! With no hosting configured (`podcast.base_url` / `podcast.bucket` empty)
//! the MP3 and `feed.xml` are still produced locally and the upload is skipped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use super::{Stage, StageContext, StageResult};
use crate::config::PodcastConfig;
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;

const R2_API_BASE: &str = "https://api.cloudflare.com/client/v4/accounts";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// One feed item; persisted per episode as part of `podcast_feed.json` and
/// collected across episode directories on every rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEpisode {
    pub episode_id: String,
    pub title: String,
    pub description: String,
    pub audio_url: String,
    pub audio_size: u64,
    pub duration_seconds: u64,
    pub pub_date: String,
}

pub struct PodcastFeedStage;

#[async_trait]
impl Stage for PodcastFeedStage {
    fn id(&self) -> StageId {
        StageId::PodcastFeed
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let episode: serde_json::Value = ctx.load_json("episode.json")?;
        let episode_id = episode
            .get("episode_id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| {
                ctx.episode_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default()
            });

        let longform = ctx.episode_dir.join("longform.mp4");
        if !longform.exists() {
            return Err(StageError::Precondition("longform.mp4".to_string()));
        }

        // A feed item without a name is unlistable; this is the one episode
        // field a human must have filled in (or clip mining extracted).
        let title = episode
            .get("episode_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| episode.get("title").and_then(|v| v.as_str()).filter(|s| !s.is_empty()))
            .ok_or_else(|| {
                StageError::Other(
                    "episode name is required before publishing to the podcast feed".to_string(),
                )
            })?
            .to_string();

        let audio_path = ctx.episode_dir.join("podcast_audio.mp3");
        if audio_path.exists() {
            tracing::info!("podcast_audio.mp3 already exists, skipping extraction");
        } else {
            tracing::info!("extracting audio from longform.mp4");
            media::run_ffmpeg([
                "-i",
                &longform.to_string_lossy(),
                "-vn",
                "-c:a",
                "libmp3lame",
                "-b:a",
                "192k",
                "-ar",
                "44100",
                &audio_path.to_string_lossy(),
            ])
            .await?;
        }

        let audio_size = tokio::fs::metadata(&audio_path).await?.len();
        let audio_duration = media::probe(&audio_path).await?.duration_seconds() as u64;
        tracing::info!("audio: {:.1} MB, {}s", audio_size as f64 / 1e6, audio_duration);

        let podcast = &ctx.config.podcast;
        let base_url = podcast.base_url.trim_end_matches('/');
        let hosted = !base_url.is_empty() && !podcast.bucket.is_empty();

        let audio_key = format!("audio/{}.mp3", episode_id);
        let audio_url = if hosted {
            format!("{}/{}", base_url, audio_key)
        } else {
            String::new()
        };

        let description = episode
            .get("episode_description")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let pub_date = episode
            .get("created_at")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Utc::now().to_rfc3339());

        let current = FeedEpisode {
            episode_id: episode_id.clone(),
            title,
            description,
            audio_url: audio_url.clone(),
            audio_size,
            duration_seconds: audio_duration,
            pub_date,
        };

        // Rebuild the whole feed: sibling episode directories contribute the
        // items recorded by their own podcast_feed runs.
        let episodes_root = ctx.episode_dir.parent().map(Path::to_path_buf);
        let mut all_episodes = match &episodes_root {
            Some(root) => collect_feed_episodes(root, &ctx.episode_dir),
            None => Vec::new(),
        };
        all_episodes.retain(|e| e.episode_id != current.episode_id);
        all_episodes.push(current.clone());
        all_episodes.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));

        let feed_xml = build_feed_xml(podcast, &all_episodes);
        let feed_path = ctx.episode_dir.join("feed.xml");
        tokio::fs::write(&feed_path, &feed_xml).await?;

        let feed_url = if hosted {
            tracing::info!("uploading MP3 and feed to {}", podcast.bucket);
            let audio_data = tokio::fs::read(&audio_path).await?;
            upload_object(&podcast.bucket, &audio_key, audio_data, "audio/mpeg").await?;
            upload_object(
                &podcast.bucket,
                "feed.xml",
                feed_xml.into_bytes(),
                "application/rss+xml; charset=utf-8",
            )
            .await?;
            format!("{}/feed.xml", base_url)
        } else {
            tracing::info!("no podcast hosting configured, feed written locally only");
            String::new()
        };

        Ok(StageResult::new()
            .with("audio_url", &audio_url)
            .with("feed_url", &feed_url)
            .with("audio_size_bytes", audio_size)
            .with("duration_seconds", audio_duration)
            .with("episode_id", &episode_id)
            .with("total_episodes_in_feed", all_episodes.len()))
    }
}

/// Feed items recorded by earlier runs in sibling episode directories. A
/// malformed sidecar skips that episode, never fails the feed.
fn collect_feed_episodes(episodes_root: &Path, current_dir: &Path) -> Vec<FeedEpisode> {
    let mut episodes = Vec::new();
    let Ok(entries) = std::fs::read_dir(episodes_root) else {
        return episodes;
    };
    let mut dirs: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p != current_dir)
        .collect();
    dirs.sort();

    for dir in dirs {
        let sidecar = dir.join("podcast_feed.json");
        if !sidecar.exists() {
            continue;
        }
        let parsed = std::fs::read_to_string(&sidecar)
            .ok()
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok());
        let Some(data) = parsed else {
            tracing::warn!("skipping malformed podcast_feed.json in {:?}", dir);
            continue;
        };

        let episode: serde_json::Value = std::fs::read_to_string(dir.join("episode.json"))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let title = episode
            .get("episode_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .or_else(|| episode.get("title").and_then(|v| v.as_str()).filter(|s| !s.is_empty()))
            .unwrap_or(&dir_name)
            .to_string();

        episodes.push(FeedEpisode {
            episode_id: data
                .get("episode_id")
                .and_then(|v| v.as_str())
                .unwrap_or(&dir_name)
                .to_string(),
            title,
            description: episode
                .get("episode_description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            audio_url: data
                .get("audio_url")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            audio_size: data.get("audio_size_bytes").and_then(|v| v.as_u64()).unwrap_or(0),
            duration_seconds: data
                .get("duration_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            pub_date: episode
                .get("created_at")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        });
    }
    episodes
}

/// PUT an object through the Cloudflare R2 REST API.
async fn upload_object(
    bucket: &str,
    key: &str,
    data: Vec<u8>,
    content_type: &str,
) -> Result<(), StageError> {
    let account_id = require_env("CLOUDFLARE_ACCOUNT_ID")?;
    let api_token = require_env("CLOUDFLARE_API_TOKEN")?;

    let url = format!("{}/{}/r2/buckets/{}/objects/{}", R2_API_BASE, account_id, bucket, key);
    let client = reqwest::Client::builder().timeout(UPLOAD_TIMEOUT).build()?;
    let response = client
        .put(&url)
        .bearer_auth(api_token)
        .header("Content-Type", content_type)
        .body(data)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        return Err(StageError::Api {
            service: "r2".to_string(),
            status,
            detail,
        });
    }
    Ok(())
}

fn require_env(name: &str) -> Result<String, StageError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| StageError::Other(format!("{} not set in environment", name)))
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn rfc2822(iso: &str) -> String {
    DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.to_rfc2822())
        .unwrap_or_else(|_| Utc::now().to_rfc2822())
}

/// Minimal Apple Podcasts / Spotify compliant RSS document.
pub fn build_feed_xml(podcast: &PodcastConfig, episodes: &[FeedEpisode]) -> String {
    let explicit = if podcast.explicit { "true" } else { "false" };
    let mut xml = String::new();
    let _ = writeln!(xml, r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    let _ = writeln!(
        xml,
        r#"<rss version="2.0" xmlns:itunes="http://www.itunes.apple.com/dtds/podcast-1.0.dtd" xmlns:content="http://purl.org/rss/1.0/modules/content/">"#
    );
    let _ = writeln!(xml, "  <channel>");
    let _ = writeln!(xml, "    <title>{}</title>", xml_escape(&podcast.title));
    let _ = writeln!(xml, "    <link>{}</link>", xml_escape(&podcast.link));
    let _ = writeln!(xml, "    <description>{}</description>", xml_escape(&podcast.description));
    let _ = writeln!(xml, "    <language>{}</language>", xml_escape(&podcast.language));
    let _ = writeln!(xml, "    <itunes:author>{}</itunes:author>", xml_escape(&podcast.author));
    let _ = writeln!(xml, r#"    <itunes:image href="{}"/>"#, xml_escape(&podcast.artwork_url));
    let _ = writeln!(xml, r#"    <itunes:category text="{}"/>"#, xml_escape(&podcast.category));
    let _ = writeln!(xml, "    <itunes:explicit>{}</itunes:explicit>", explicit);
    let _ = writeln!(xml, "    <itunes:owner>");
    let _ = writeln!(xml, "      <itunes:name>{}</itunes:name>", xml_escape(&podcast.author));
    if !podcast.owner_email.is_empty() {
        let _ = writeln!(
            xml,
            "      <itunes:email>{}</itunes:email>",
            xml_escape(&podcast.owner_email)
        );
    }
    let _ = writeln!(xml, "    </itunes:owner>");

    for ep in episodes {
        let _ = writeln!(xml, "    <item>");
        let _ = writeln!(xml, "      <title>{}</title>", xml_escape(&ep.title));
        let _ = writeln!(xml, "      <description>{}</description>", xml_escape(&ep.description));
        let _ = writeln!(
            xml,
            r#"      <enclosure url="{}" length="{}" type="audio/mpeg"/>"#,
            xml_escape(&ep.audio_url),
            ep.audio_size
        );
        let _ = writeln!(
            xml,
            r#"      <guid isPermaLink="false">{}</guid>"#,
            xml_escape(&ep.episode_id)
        );
        let _ = writeln!(xml, "      <pubDate>{}</pubDate>", rfc2822(&ep.pub_date));
        let _ = writeln!(
            xml,
            "      <itunes:duration>{}</itunes:duration>",
            ep.duration_seconds
        );
        let _ = writeln!(xml, "      <itunes:explicit>{}</itunes:explicit>", explicit);
        let _ = writeln!(xml, "    </item>");
    }
    let _ = writeln!(xml, "  </channel>");
    let _ = writeln!(xml, "</rss>");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_episode(id: &str, pub_date: &str) -> FeedEpisode {
        FeedEpisode {
            episode_id: id.to_string(),
            title: format!("Episode {}", id),
            description: "A & B <talk>".to_string(),
            audio_url: format!("https://cdn.example.com/audio/{}.mp3", id),
            audio_size: 1024,
            duration_seconds: 3600,
            pub_date: pub_date.to_string(),
        }
    }

    #[test]
    fn test_feed_xml_escapes_and_structures() {
        let podcast = PodcastConfig {
            title: "Talk & Co".to_string(),
            ..Default::default()
        };
        let xml = build_feed_xml(&podcast, &[feed_episode("ep_1", "2026-08-25T12:00:00+00:00")]);
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(xml.contains("<title>Talk &amp; Co</title>"));
        assert!(xml.contains("A &amp; B &lt;talk&gt;"));
        assert!(xml.contains(r#"<guid isPermaLink="false">ep_1</guid>"#));
        assert!(xml.contains("<itunes:duration>3600</itunes:duration>"));
        assert!(xml.contains("<pubDate>Tue, 25 Aug 2026 12:00:00 +0000</pubDate>"));
    }

    #[test]
    fn test_rfc2822_falls_back_on_garbage() {
        // Unparseable dates become "now" rather than failing the feed.
        let out = rfc2822("not-a-date");
        assert!(out.contains("20"));
    }

    #[test]
    fn test_collect_skips_malformed_sidecars() {
        let temp = tempfile::TempDir::new().unwrap();
        let root = temp.path();
        let good = root.join("ep_a");
        let bad = root.join("ep_b");
        let current = root.join("ep_current");
        for d in [&good, &bad, &current] {
            std::fs::create_dir_all(d).unwrap();
        }
        std::fs::write(
            good.join("podcast_feed.json"),
            r#"{"episode_id": "ep_a", "audio_url": "u", "audio_size_bytes": 5, "duration_seconds": 10}"#,
        )
        .unwrap();
        std::fs::write(good.join("episode.json"), r#"{"episode_name": "Alpha", "created_at": "2026-01-01T00:00:00Z"}"#).unwrap();
        std::fs::write(bad.join("podcast_feed.json"), "{not json").unwrap();
        std::fs::write(current.join("podcast_feed.json"), r#"{"episode_id": "ep_current"}"#).unwrap();

        let episodes = collect_feed_episodes(root, &current);
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].episode_id, "ep_a");
        assert_eq!(episodes[0].title, "Alpha");
    }
}
