//! Stage executors and their uniform contract.
//!
//! Every stage receives the episode working directory plus the process-wide
//! config, reads whatever upstream JSON/media it needs from that directory,
//! and returns a result map that the orchestrator merges into the episode
//! record. A timed wrapper writes `<stage>.json` alongside the artifacts.

pub mod audio_analysis;
pub mod backup;
pub mod clip_miner;
pub mod ingest;
pub mod longform_render;
pub mod metadata_gen;
pub mod podcast_feed;
pub mod publish;
pub mod qa;
pub mod shorts_render;
pub mod speaker_cut;
pub mod stitch;
pub mod transcribe;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::episode::Clip;
use crate::error::StageError;
use crate::pipeline::graph::StageId;

/// Everything a stage may touch: its episode directory and the shared config.
/// Stages communicate results only through their return value and their own
/// output files; the episode record itself belongs to the orchestrator.
#[derive(Clone)]
pub struct StageContext {
    pub episode_dir: PathBuf,
    pub config: Arc<Config>,
    /// Raw media location, consumed by ingest only.
    pub source_path: Option<PathBuf>,
}

impl StageContext {
    pub fn work_dir(&self) -> PathBuf {
        self.episode_dir.join("work")
    }

    /// Load a JSON artifact written by an upstream stage. A missing file is a
    /// precondition failure, not an I/O error.
    pub fn load_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, StageError> {
        let path = self.episode_dir.join(name);
        if !path.exists() {
            return Err(StageError::Precondition(name.to_string()));
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StageError> {
        let path = self.episode_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    /// Write `progress.json` so callers can report real-time status. Best
    /// effort; progress is cosmetic.
    pub fn report_progress(&self, stage: StageId, current: usize, total: usize, detail: &str) {
        let percent = if total > 0 {
            (current as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        let progress = serde_json::json!({
            "stage": stage.as_str(),
            "current": current,
            "total": total,
            "percent": percent,
            "detail": detail,
        });
        if let Ok(raw) = serde_json::to_string(&progress) {
            let _ = std::fs::write(self.episode_dir.join("progress.json"), raw);
        }
    }
}

/// Result mapping merged into the episode record; also serialized verbatim as
/// the stage's `<stage>.json` sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageResult {
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl StageResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.fields.insert(key.to_string(), v);
            }
            Err(e) => tracing::warn!("unserializable result field {}: {}", key, e),
        }
    }

    pub fn with<T: Serialize>(mut self, key: &str, value: T) -> Self {
        self.set(key, value);
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_str())
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.fields.get("duration_seconds").and_then(|v| v.as_f64())
    }

    pub fn clips(&self) -> Option<Vec<Clip>> {
        let value = self.fields.get("clips")?.clone();
        serde_json::from_value(value).ok()
    }
}

/// The uniform executor contract the orchestrator consumes.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError>;
}

pub type StageRegistry = HashMap<StageId, Arc<dyn Stage>>;

/// The production registry: all thirteen stages.
pub fn default_registry() -> StageRegistry {
    let stages: Vec<Arc<dyn Stage>> = vec![
        Arc::new(ingest::IngestStage),
        Arc::new(stitch::StitchStage),
        Arc::new(audio_analysis::AudioAnalysisStage),
        Arc::new(speaker_cut::SpeakerCutStage),
        Arc::new(transcribe::TranscribeStage),
        Arc::new(clip_miner::ClipMinerStage),
        Arc::new(longform_render::LongformRenderStage),
        Arc::new(shorts_render::ShortsRenderStage),
        Arc::new(metadata_gen::MetadataGenStage),
        Arc::new(qa::QaStage),
        Arc::new(podcast_feed::PodcastFeedStage),
        Arc::new(publish::PublishStage),
        Arc::new(backup::BackupStage),
    ];
    stages.into_iter().map(|s| (s.id(), s)).collect()
}

/// Execute a stage with timing and sidecar output.
///
/// On success the result gains `_stage`, `_elapsed_seconds`, and `_status`
/// markers and is written to `<stage>.json`; on failure a failed sidecar is
/// written before the error propagates so the directory records what happened.
pub async fn run_stage(stage: &dyn Stage, ctx: &StageContext) -> Result<StageResult, StageError> {
    let id = stage.id();
    tracing::info!("[{}] starting", id);
    let start = std::time::Instant::now();

    match stage.execute(ctx).await {
        Ok(mut result) => {
            let elapsed = start.elapsed().as_secs_f64();
            result.set("_stage", id);
            result.set("_elapsed_seconds", (elapsed * 100.0).round() / 100.0);
            result.set("_status", "completed");
            write_sidecar(&ctx.episode_dir, id, &result);
            tracing::info!("[{}] completed in {:.1}s", id, elapsed);
            Ok(result)
        }
        Err(e) => {
            let elapsed = start.elapsed().as_secs_f64();
            let failed = StageResult::new()
                .with("_stage", id)
                .with("_elapsed_seconds", (elapsed * 100.0).round() / 100.0)
                .with("_status", "failed")
                .with("_error", e.to_string());
            write_sidecar(&ctx.episode_dir, id, &failed);
            tracing::error!("[{}] failed after {:.1}s: {}", id, elapsed, e);
            Err(e)
        }
    }
}

fn write_sidecar(episode_dir: &Path, id: StageId, result: &StageResult) {
    let path = episode_dir.join(format!("{}.json", id));
    match serde_json::to_string_pretty(result) {
        Ok(raw) => {
            if let Err(e) = std::fs::write(&path, raw) {
                tracing::warn!("failed to write {:?}: {}", path, e);
            }
        }
        Err(e) => tracing::warn!("failed to serialize {} result: {}", id, e),
    }
}
