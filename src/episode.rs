//! Episode state store: one `episode.json` per episode directory, rewritten in
//! full on every transition so progress survives process restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::PipelineError;
use crate::pipeline::graph::StageId;
use crate::segment::Speaker;

pub const EPISODE_FILE: &str = "episode.json";

/// Subdirectories every episode directory carries.
pub const EPISODE_SUBDIRS: [&str; 6] = ["source", "shorts", "subtitles", "metadata", "qa", "work"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Processing,
    ReadyForReview,
    Error,
    Cancelled,
    /// Deliberate pause: a human must supply the crop annotation before any
    /// stage depending on it may proceed. Not an error.
    AwaitingExternalInput,
}

impl EpisodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EpisodeStatus::Processing => "processing",
            EpisodeStatus::ReadyForReview => "ready_for_review",
            EpisodeStatus::Error => "error",
            EpisodeStatus::Cancelled => "cancelled",
            EpisodeStatus::AwaitingExternalInput => "awaiting_external_input",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipStatus {
    Pending,
    Approved,
    Rejected,
}

/// A short-form clip mined from the transcript. Created once by clip mining;
/// only its status changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub rank: u32,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub duration: f64,
    pub title: String,
    #[serde(default)]
    pub hook_text: String,
    #[serde(default)]
    pub compelling_reason: String,
    #[serde(default)]
    pub virality_score: f64,
    pub speaker: Speaker,
    pub status: ClipStatus,
    #[serde(default)]
    pub manual: bool,
}

/// Pipeline bookkeeping embedded in the episode record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stages_requested: Vec<StageId>,
    #[serde(default)]
    pub stages_completed: Vec<StageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<StageId, String>,
}

impl PipelineRecord {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            stages_requested: Vec::new(),
            stages_completed: Vec::new(),
            current_stage: None,
            errors: BTreeMap::new(),
        }
    }

    /// A stage appears in the completed list at most once.
    pub fn mark_completed(&mut self, stage: StageId) {
        if !self.stages_completed.contains(&stage) {
            self.stages_completed.push(stage);
        }
    }
}

/// The root aggregate for one recording session.
///
/// Strongly typed where the orchestrator owns the data; fields written by
/// external tooling (the crop annotation UI in particular) pass through the
/// flattened `extra` map untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    #[serde(default)]
    pub title: String,
    pub status: EpisodeStatus,
    pub source_path: String,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guest_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guest_title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub episode_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub episode_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop_config: Option<serde_json::Value>,
    #[serde(default)]
    pub clips: Vec<Clip>,
    pub pipeline: PipelineRecord,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Episode {
    pub fn new(episode_id: &str, source_path: &str) -> Self {
        Self {
            episode_id: episode_id.to_string(),
            title: String::new(),
            status: EpisodeStatus::Processing,
            source_path: source_path.to_string(),
            duration_seconds: None,
            created_at: Utc::now(),
            guest_name: String::new(),
            guest_title: String::new(),
            episode_name: String::new(),
            episode_description: String::new(),
            crop_config: None,
            clips: Vec::new(),
            pipeline: PipelineRecord::new(),
            extra: serde_json::Map::new(),
        }
    }

    /// Time-derived identifier for a new episode, `ep_YYYY-MM-DD_HHMMSS`.
    pub fn generate_id(now: DateTime<Utc>) -> String {
        format!("ep_{}", now.format("%Y-%m-%d_%H%M%S"))
    }

    pub fn load(path: &Path) -> Result<Episode, PipelineError> {
        let raw = std::fs::read_to_string(path)?;
        let episode = serde_json::from_str(&raw)?;
        Ok(episode)
    }

    /// Rewrite the full state file, human-inspectable.
    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Create the episode directory skeleton.
    pub fn ensure_layout(episode_dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(episode_dir)?;
        for sub in EPISODE_SUBDIRS {
            std::fs::create_dir_all(episode_dir.join(sub))?;
        }
        Ok(())
    }
}

/// Whether an episode id already carries a guest-name slug. The base form is
/// `ep_YYYY-MM-DD_HHMMSS` (two underscores); a slug adds at least one more.
pub fn has_name_slug(episode_id: &str) -> bool {
    episode_id.split('_').count() > 3
}

/// URL-safe slug from a guest name, e.g. "John Smith" -> "john-smith".
pub fn slugify(name: &str) -> String {
    static SLUG_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = SLUG_RE.get_or_init(|| regex::Regex::new(r"[^a-z0-9]+").expect("valid pattern"));
    re.replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}
