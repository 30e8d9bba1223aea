//! Pipeline orchestrator: resolves the requested stage subset against the
//! static graph and drives it to a terminal episode status with bounded
//! concurrency.
//!
//! The episode record is owned by this loop alone. Stages hand their results
//! back through `StageResult`; every state transition is persisted to
//! `episode.json` before the loop proceeds.

pub mod graph;

#[cfg(test)]
mod tests;

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::episode::{self, Episode, EpisodeStatus, EPISODE_FILE};
use crate::error::{PipelineError, StageError};
use crate::stages::{self, StageContext, StageRegistry, StageResult};
use graph::StageId;

/// What a caller wants run: a fresh episode from a source path, or a stage
/// subset over an existing episode directory.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub source_path: Option<PathBuf>,
    pub episode_id: Option<String>,
    /// Wire names; empty means the full pipeline. Unknown names are dropped.
    pub stages: Vec<String>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<StageRegistry>,
    episodes_dir: PathBuf,
}

type StageOutcome = (StageId, Result<StageResult, StageError>);

impl Orchestrator {
    pub fn new(config: Arc<Config>) -> Self {
        let episodes_dir = config.episodes_dir();
        Self {
            config,
            registry: Arc::new(stages::default_registry()),
            episodes_dir,
        }
    }

    /// Swap in an alternate stage registry. Tests drive the loop with mock
    /// stages through this.
    pub fn with_registry(config: Arc<Config>, registry: StageRegistry, episodes_dir: PathBuf) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            episodes_dir,
        }
    }

    /// Run the requested stages to a terminal status.
    ///
    /// Stage failures surface through the returned episode's status and error
    /// map; `Err` is reserved for the run itself being impossible (bad
    /// request, unreadable state, dependency deadlock).
    pub async fn run(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<Episode, PipelineError> {
        let explicit_subset = !request.stages.is_empty();
        let requested = if explicit_subset {
            graph::parse_requested(&request.stages)
        } else {
            graph::ALL_STAGES.to_vec()
        };
        if requested.is_empty() {
            return Err(PipelineError::EmptyRequest);
        }

        let (mut ep, mut episode_dir) = self.resolve_episode(&request)?;
        let mut episode_id = ep.episode_id.clone();
        let episode_file = |dir: &PathBuf| dir.join(EPISODE_FILE);

        ep.status = EpisodeStatus::Processing;
        ep.pipeline.stages_requested = requested.clone();
        if explicit_subset {
            // Partial re-run: requested stages lose their completed status so
            // they run again; everything else keeps satisfying edges.
            ep.pipeline.stages_completed =
                graph::evict_requested(&ep.pipeline.stages_completed, &requested);
        }
        ep.save(&episode_file(&episode_dir))?;

        tracing::info!("pipeline: running {} stages for {}", requested.len(), episode_id);

        let deps = graph::requested_dependencies(&requested);
        let source_path = request.source_path.clone().or_else(|| {
            if ep.source_path.is_empty() {
                None
            } else {
                Some(PathBuf::from(&ep.source_path))
            }
        });

        let mut completed: BTreeSet<StageId> = BTreeSet::new();
        let mut failed: BTreeSet<StageId> = BTreeSet::new();
        let mut running: BTreeSet<StageId> = BTreeSet::new();
        let mut in_flight: JoinSet<StageOutcome> = JoinSet::new();
        // Task id -> stage, so a panicked task can still be attributed.
        let mut task_ids: HashMap<tokio::task::Id, StageId> = HashMap::new();

        // The crop annotation gate: armed until a human (or a prior run) has
        // written crop_config into episode.json.
        let mut crop_pause_armed =
            requested.contains(&StageId::Stitch) && ep.crop_config.is_none();

        let max_workers = self.config.pipeline.max_workers.max(1);

        while completed.len() + failed.len() < deps.len() {
            if cancel.is_cancelled() {
                tracing::info!("pipeline cancelled for {}", episode_id);
                self.drain(&mut in_flight, &mut task_ids, &mut ep, &mut completed, &mut running)
                    .await;
                ep.status = EpisodeStatus::Cancelled;
                ep.pipeline.current_stage = None;
                ep.save(&episode_file(&episode_dir))?;
                return Ok(ep);
            }

            for stage_id in graph::ready_set(&deps, &completed, &failed, &running) {
                if in_flight.len() >= max_workers {
                    break;
                }

                if crop_pause_armed
                    && stage_id != StageId::Stitch
                    && completed.contains(&StageId::Stitch)
                {
                    // The annotation UI writes into episode.json directly, so
                    // the on-disk record is the source of truth here.
                    let on_disk = Episode::load(&episode_file(&episode_dir))?;
                    if on_disk.crop_config.is_none() {
                        tracing::info!("pipeline paused for {}: awaiting crop annotation", episode_id);
                        self.drain(&mut in_flight, &mut task_ids, &mut ep, &mut completed, &mut running)
                            .await;
                        ep.status = EpisodeStatus::AwaitingExternalInput;
                        ep.pipeline.current_stage = None;
                        ep.save(&episode_file(&episode_dir))?;
                        return Ok(ep);
                    }
                    ep.crop_config = on_disk.crop_config;
                    ep.extra = on_disk.extra;
                    crop_pause_armed = false;
                }

                let Some(stage) = self.registry.get(&stage_id).cloned() else {
                    // Registry and graph disagree; treat as fatal for the stage.
                    failed.insert(stage_id);
                    ep.pipeline
                        .errors
                        .insert(stage_id, "stage not registered".to_string());
                    continue;
                };

                ep.pipeline.current_stage = Some(stage_id);
                ep.save(&episode_file(&episode_dir))?;

                let ctx = StageContext {
                    episode_dir: episode_dir.clone(),
                    config: Arc::clone(&self.config),
                    source_path: source_path.clone(),
                };
                running.insert(stage_id);
                let handle = in_flight.spawn(async move {
                    let result = stages::run_stage(stage.as_ref(), &ctx).await;
                    (stage_id, result)
                });
                task_ids.insert(handle.id(), stage_id);
            }

            if in_flight.is_empty() {
                let stuck: Vec<String> = deps
                    .keys()
                    .copied()
                    .filter(|s| !completed.contains(s) && !failed.contains(s))
                    .map(|s| s.to_string())
                    .collect();
                return Err(PipelineError::Deadlock(stuck));
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                continue;
            };
            let (stage_id, result) = match joined {
                Ok((task_id, outcome)) => {
                    task_ids.remove(&task_id);
                    outcome
                }
                Err(join_err) => {
                    // A panicked stage fails like any other; the task id tells
                    // us which one it was.
                    tracing::error!("stage task failed to join: {}", join_err);
                    match task_ids.remove(&join_err.id()) {
                        Some(id) => (id, Err(StageError::Other(join_err.to_string()))),
                        None => continue,
                    }
                }
            };
            running.remove(&stage_id);

            match result {
                Ok(result) => {
                    if stage_id == StageId::Stitch && crop_pause_armed {
                        // An annotation written while stitch ran must survive
                        // this save; pick it up from disk first.
                        let on_disk = Episode::load(&episode_file(&episode_dir))?;
                        if on_disk.crop_config.is_some() {
                            ep.crop_config = on_disk.crop_config;
                            ep.extra = on_disk.extra;
                            crop_pause_armed = false;
                        }
                    }
                    self.apply_result(&mut ep, stage_id, &result);
                    completed.insert(stage_id);
                    ep.save(&episode_file(&episode_dir))?;
                    tracing::info!("stage {} completed for {}", stage_id, episode_id);

                    if stage_id == StageId::ClipMiner {
                        if let Some(new_dir) =
                            self.maybe_rename(&mut ep, &episode_dir, &result)
                        {
                            episode_dir = new_dir;
                            episode_id = ep.episode_id.clone();
                        }
                        ep.save(&episode_file(&episode_dir))?;
                    }
                }
                Err(e) => {
                    tracing::error!("stage {} failed for {}: {}", stage_id, episode_id, e);
                    ep.pipeline.current_stage = None;
                    ep.pipeline.errors.insert(stage_id, e.to_string());
                    ep.save(&episode_file(&episode_dir))?;

                    if stage_id.is_critical() {
                        self.drain(&mut in_flight, &mut task_ids, &mut ep, &mut completed, &mut running)
                            .await;
                        ep.status = EpisodeStatus::Error;
                        ep.save(&episode_file(&episode_dir))?;
                        return Ok(ep);
                    }
                    // Non-critical: dependents may proceed; the error map is
                    // the only trace.
                    tracing::info!("skipping non-critical stage {}, continuing", stage_id);
                    completed.insert(stage_id);
                }
            }
        }

        ep.pipeline.completed_at = Some(Utc::now());
        ep.pipeline.current_stage = None;
        ep.status = EpisodeStatus::ReadyForReview;
        let progress = episode_dir.join("progress.json");
        if progress.exists() {
            std::fs::remove_file(&progress)?;
        }
        ep.save(&episode_file(&episode_dir))?;
        tracing::info!("pipeline complete for {}", episode_id);
        Ok(ep)
    }

    /// Load the episode for a resume, or create a fresh one from the source.
    fn resolve_episode(&self, request: &RunRequest) -> Result<(Episode, PathBuf), PipelineError> {
        if let Some(id) = &request.episode_id {
            let dir = self.episodes_dir.join(id);
            let ep = Episode::load(&dir.join(EPISODE_FILE))?;
            return Ok((ep, dir));
        }

        let source = request
            .source_path
            .as_ref()
            .ok_or_else(|| PipelineError::SourceMissing("<none>".to_string()))?;
        if !source.exists() {
            return Err(PipelineError::SourceMissing(
                source.to_string_lossy().to_string(),
            ));
        }

        let id = Episode::generate_id(Utc::now());
        let dir = self.episodes_dir.join(&id);
        Episode::ensure_layout(&dir)?;
        let ep = Episode::new(&id, &source.to_string_lossy());
        ep.save(&dir.join(EPISODE_FILE))?;
        Ok((ep, dir))
    }

    /// Merge a successful stage's reported fields into the episode record.
    fn apply_result(&self, ep: &mut Episode, stage_id: StageId, result: &StageResult) {
        ep.pipeline.mark_completed(stage_id);
        if let Some(duration) = result.duration_seconds() {
            if duration > 0.0 {
                ep.duration_seconds = Some(duration);
            }
        }
        if let Some(clips) = result.clips() {
            ep.clips = clips;
        }
        if let Some(v) = result.get_str("guest_name").filter(|v| !v.is_empty()) {
            ep.guest_name = v.to_string();
        }
        if let Some(v) = result.get_str("guest_title").filter(|v| !v.is_empty()) {
            ep.guest_title = v.to_string();
        }
        if let Some(v) = result.get_str("episode_title").filter(|v| !v.is_empty()) {
            ep.episode_name = v.to_string();
        }
        if let Some(v) = result.get_str("episode_description").filter(|v| !v.is_empty()) {
            ep.episode_description = v.to_string();
        }
    }

    /// Rename the episode directory once a guest name is known, at most once
    /// per episode. Failure to rename is logged, never fatal.
    fn maybe_rename(
        &self,
        ep: &mut Episode,
        episode_dir: &Path,
        result: &StageResult,
    ) -> Option<PathBuf> {
        let guest_name = result.get_str("guest_name").unwrap_or("");
        if guest_name.is_empty() || episode::has_name_slug(&ep.episode_id) {
            return None;
        }
        let slug = episode::slugify(guest_name);
        if slug.is_empty() {
            return None;
        }

        let new_id = format!("{}_{}", ep.episode_id, slug);
        let new_dir = self.episodes_dir.join(&new_id);
        match std::fs::rename(episode_dir, &new_dir) {
            Ok(()) => {
                tracing::info!("renamed episode dir to {}", new_id);
                ep.episode_id = new_id;
                Some(new_dir)
            }
            Err(e) => {
                tracing::warn!("failed to rename episode dir: {}", e);
                None
            }
        }
    }

    /// Wait for every in-flight stage to finish and fold in its outcome. Used
    /// on the exit paths, where no further work is dispatched but started
    /// stages must run to completion.
    async fn drain(
        &self,
        in_flight: &mut JoinSet<StageOutcome>,
        task_ids: &mut HashMap<tokio::task::Id, StageId>,
        ep: &mut Episode,
        completed: &mut BTreeSet<StageId>,
        running: &mut BTreeSet<StageId>,
    ) {
        while let Some(joined) = in_flight.join_next_with_id().await {
            let (stage_id, result) = match joined {
                Ok((task_id, outcome)) => {
                    task_ids.remove(&task_id);
                    outcome
                }
                Err(join_err) => match task_ids.remove(&join_err.id()) {
                    Some(id) => (id, Err(StageError::Other(join_err.to_string()))),
                    None => continue,
                },
            };
            running.remove(&stage_id);
            match result {
                Ok(result) => {
                    self.apply_result(ep, stage_id, &result);
                    completed.insert(stage_id);
                }
                Err(e) => {
                    ep.pipeline.errors.insert(stage_id, e.to_string());
                }
            }
        }
    }
}
