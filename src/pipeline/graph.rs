//! Static stage dependency graph and ready-set resolution.
//!
//! The stage vocabulary is a closed enum so dispatch stays statically
//! checkable; callers pass stage names as strings and unknown names are
//! dropped with a warning, never a hard error.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// One unit of pipeline work, identified by its wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Ingest,
    Stitch,
    AudioAnalysis,
    SpeakerCut,
    Transcribe,
    ClipMiner,
    LongformRender,
    ShortsRender,
    MetadataGen,
    Qa,
    PodcastFeed,
    Publish,
    Backup,
}

/// Every stage in pipeline order.
pub const ALL_STAGES: [StageId; 13] = [
    StageId::Ingest,
    StageId::Stitch,
    StageId::AudioAnalysis,
    StageId::SpeakerCut,
    StageId::Transcribe,
    StageId::ClipMiner,
    StageId::LongformRender,
    StageId::ShortsRender,
    StageId::MetadataGen,
    StageId::Qa,
    StageId::PodcastFeed,
    StageId::Publish,
    StageId::Backup,
];

impl StageId {
    pub fn as_str(self) -> &'static str {
        match self {
            StageId::Ingest => "ingest",
            StageId::Stitch => "stitch",
            StageId::AudioAnalysis => "audio_analysis",
            StageId::SpeakerCut => "speaker_cut",
            StageId::Transcribe => "transcribe",
            StageId::ClipMiner => "clip_miner",
            StageId::LongformRender => "longform_render",
            StageId::ShortsRender => "shorts_render",
            StageId::MetadataGen => "metadata_gen",
            StageId::Qa => "qa",
            StageId::PodcastFeed => "podcast_feed",
            StageId::Publish => "publish",
            StageId::Backup => "backup",
        }
    }

    /// Stages that must be completed before this one may run.
    pub fn dependencies(self) -> &'static [StageId] {
        match self {
            StageId::Ingest => &[],
            StageId::Stitch => &[StageId::Ingest],
            StageId::AudioAnalysis => &[StageId::Stitch],
            StageId::SpeakerCut => &[StageId::AudioAnalysis],
            StageId::Transcribe => &[StageId::Stitch],
            StageId::ClipMiner => &[StageId::Transcribe],
            StageId::LongformRender => &[StageId::SpeakerCut, StageId::Transcribe],
            StageId::ShortsRender => &[StageId::ClipMiner, StageId::SpeakerCut],
            StageId::MetadataGen => &[StageId::ClipMiner],
            StageId::Qa => &[
                StageId::LongformRender,
                StageId::ShortsRender,
                StageId::MetadataGen,
            ],
            StageId::PodcastFeed => &[StageId::Qa],
            StageId::Publish => &[StageId::Qa],
            StageId::Backup => &[StageId::Qa],
        }
    }

    /// Whether a failure of this stage halts the run. Feed, publish, and
    /// backup failures are recorded but never block the rest of the graph.
    pub fn is_critical(self) -> bool {
        !matches!(
            self,
            StageId::PodcastFeed | StageId::Publish | StageId::Backup
        )
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_STAGES
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or(())
    }
}

/// Parse caller-supplied stage names, dropping unknown ones with a warning.
pub fn parse_requested(names: &[String]) -> Vec<StageId> {
    let mut out = Vec::new();
    for name in names {
        match name.parse::<StageId>() {
            Ok(stage) => {
                if !out.contains(&stage) {
                    out.push(stage);
                }
            }
            Err(()) => tracing::warn!("unknown stage: {}, skipping", name),
        }
    }
    out
}

/// Build the dependency map for a requested subset: each stage's edges are
/// intersected with the requested set, so partial re-runs never require
/// re-running stages the caller did not select.
pub fn requested_dependencies(requested: &[StageId]) -> BTreeMap<StageId, BTreeSet<StageId>> {
    let requested_set: BTreeSet<StageId> = requested.iter().copied().collect();
    requested
        .iter()
        .map(|&stage| {
            let deps = stage
                .dependencies()
                .iter()
                .copied()
                .filter(|d| requested_set.contains(d))
                .collect();
            (stage, deps)
        })
        .collect()
}

/// Stages that are requested, not yet terminal, not already running, and whose
/// every (requested-intersected) dependency is completed. Recomputed after
/// each completion; completion only grows the set, nothing regresses.
pub fn ready_set(
    deps: &BTreeMap<StageId, BTreeSet<StageId>>,
    completed: &BTreeSet<StageId>,
    failed: &BTreeSet<StageId>,
    running: &BTreeSet<StageId>,
) -> Vec<StageId> {
    deps.iter()
        .filter(|(stage, stage_deps)| {
            !completed.contains(stage)
                && !failed.contains(stage)
                && !running.contains(stage)
                && stage_deps.is_subset(completed)
        })
        .map(|(&stage, _)| stage)
        .collect()
}

/// Partial re-run eviction: a previously completed stage that is requested
/// again is removed from the completed list so it re-runs; everything else
/// keeps its status and satisfies dependency edges as if already done.
pub fn evict_requested(completed: &[StageId], requested: &[StageId]) -> Vec<StageId> {
    completed
        .iter()
        .copied()
        .filter(|stage| !requested.contains(stage))
        .collect()
}
