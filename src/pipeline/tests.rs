use super::*;
use crate::config::Config;
use crate::episode::{Episode, EpisodeStatus, EPISODE_FILE};
use crate::error::{PipelineError, StageError};
use crate::stages::{Stage, StageContext, StageRegistry, StageResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct MockSpec {
    fail: Option<String>,
    panic_msg: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    delay_ms: u64,
    /// Simulate the annotation UI writing crop_config into episode.json while
    /// this stage runs.
    write_crop: bool,
}

impl MockSpec {
    fn failing(msg: &str) -> Self {
        Self {
            fail: Some(msg.to_string()),
            ..Default::default()
        }
    }

    fn panicking(msg: &str) -> Self {
        Self {
            panic_msg: Some(msg.to_string()),
            ..Default::default()
        }
    }

    fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    fn slow(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    fn writes_crop(mut self) -> Self {
        self.write_crop = true;
        self
    }
}

struct MockStage {
    id: StageId,
    spec: MockSpec,
    log: Arc<Mutex<Vec<StageId>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

#[async_trait]
impl Stage for MockStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        if self.spec.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.spec.delay_ms)).await;
        }
        if self.spec.write_crop {
            let path = ctx.episode_dir.join(EPISODE_FILE);
            let mut on_disk = Episode::load(&path).unwrap();
            on_disk.crop_config = Some(crop_annotation());
            on_disk.save(&path).unwrap();
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(msg) = &self.spec.panic_msg {
            panic!("{}", msg);
        }
        self.log.lock().unwrap().push(self.id);
        match &self.spec.fail {
            Some(msg) => Err(StageError::Other(msg.clone())),
            None => Ok(StageResult {
                fields: self.spec.fields.clone(),
            }),
        }
    }
}

struct Harness {
    temp: TempDir,
    log: Arc<Mutex<Vec<StageId>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl Harness {
    fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
            log: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn source_file(&self) -> PathBuf {
        let dir = self.temp.path().join("card");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("recording.mp4");
        std::fs::write(&path, b"not really video").unwrap();
        path
    }

    fn episodes_dir(&self) -> PathBuf {
        self.temp.path().join("episodes")
    }

    fn orchestrator(&self, overrides: &[(StageId, MockSpec)]) -> Orchestrator {
        self.orchestrator_with(Config::default(), overrides)
    }

    fn orchestrator_with(&self, config: Config, overrides: &[(StageId, MockSpec)]) -> Orchestrator {
        let mut registry = StageRegistry::new();
        for id in graph::ALL_STAGES {
            let spec = overrides
                .iter()
                .find(|(o, _)| *o == id)
                .map(|(_, s)| s.clone())
                .unwrap_or_default();
            registry.insert(
                id,
                Arc::new(MockStage {
                    id,
                    spec,
                    log: Arc::clone(&self.log),
                    active: Arc::clone(&self.active),
                    max_active: Arc::clone(&self.max_active),
                }) as Arc<dyn Stage>,
            );
        }
        Orchestrator::with_registry(Arc::new(config), registry, self.episodes_dir())
    }

    fn ran(&self) -> Vec<StageId> {
        self.log.lock().unwrap().clone()
    }

    fn run_count(&self, id: StageId) -> usize {
        self.ran().iter().filter(|s| **s == id).count()
    }
}

fn names(stages: &[&str]) -> Vec<String> {
    stages.iter().map(|s| s.to_string()).collect()
}

fn position(log: &[StageId], id: StageId) -> usize {
    log.iter().position(|s| *s == id).unwrap()
}

fn crop_annotation() -> serde_json::Value {
    serde_json::json!({
        "speaker_l_center_x": 480, "speaker_l_center_y": 540,
        "speaker_r_center_x": 1440, "speaker_r_center_y": 540,
    })
}

#[tokio::test]
async fn test_full_run_pauses_for_crop_then_resumes_to_review() {
    let h = Harness::new();
    let orch = h.orchestrator(&[(
        StageId::Stitch,
        MockSpec::default().with_field("duration_seconds", serde_json::json!(3600.5)),
    )]);

    // First run stops after stitch: no crop annotation exists yet.
    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(ep.status, EpisodeStatus::AwaitingExternalInput);
    assert_eq!(h.ran(), vec![StageId::Ingest, StageId::Stitch]);
    assert_eq!(ep.duration_seconds, Some(3600.5));
    assert!(ep.pipeline.current_stage.is_none());

    // The annotation UI writes crop_config straight into episode.json.
    let ep_path = h.episodes_dir().join(&ep.episode_id).join(EPISODE_FILE);
    let mut on_disk = Episode::load(&ep_path).unwrap();
    on_disk.crop_config = Some(crop_annotation());
    on_disk.save(&ep_path).unwrap();

    let remaining: Vec<String> = graph::ALL_STAGES
        .iter()
        .filter(|s| !matches!(s, StageId::Ingest | StageId::Stitch))
        .map(|s| s.to_string())
        .collect();
    let ep = orch
        .run(
            RunRequest {
                episode_id: Some(ep.episode_id.clone()),
                stages: remaining,
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    assert!(ep.pipeline.completed_at.is_some());
    assert_eq!(ep.pipeline.stages_completed.len(), graph::ALL_STAGES.len());

    let log = h.ran();
    assert_eq!(log.len(), graph::ALL_STAGES.len());
    assert!(position(&log, StageId::AudioAnalysis) < position(&log, StageId::SpeakerCut));
    assert!(position(&log, StageId::Transcribe) < position(&log, StageId::ClipMiner));
    assert!(position(&log, StageId::ClipMiner) < position(&log, StageId::ShortsRender));
    assert!(position(&log, StageId::Qa) < position(&log, StageId::Publish));
    assert!(position(&log, StageId::Qa) < position(&log, StageId::Backup));
}

#[tokio::test]
async fn test_noncritical_failure_is_recorded_but_does_not_halt() {
    let h = Harness::new();
    let orch = h.orchestrator(&[(StageId::PodcastFeed, MockSpec::failing("no feed bucket"))]);

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["podcast_feed", "publish", "backup"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    assert_eq!(h.run_count(StageId::Publish), 1);
    assert_eq!(h.run_count(StageId::Backup), 1);
    assert!(ep
        .pipeline
        .errors
        .get(&StageId::PodcastFeed)
        .unwrap()
        .contains("no feed bucket"));
    // A failed stage never appears in the completed list, even when the run
    // proceeds past it.
    assert!(!ep.pipeline.stages_completed.contains(&StageId::PodcastFeed));
    assert!(ep.pipeline.stages_completed.contains(&StageId::Backup));
}

#[tokio::test]
async fn test_critical_failure_halts_and_skips_dependents() {
    let h = Harness::new();
    let orch = h.orchestrator(&[(StageId::Transcribe, MockSpec::failing("api down"))]);

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["transcribe", "clip_miner"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::Error);
    assert!(ep
        .pipeline
        .errors
        .get(&StageId::Transcribe)
        .unwrap()
        .contains("api down"));
    assert_eq!(h.run_count(StageId::ClipMiner), 0);
    assert!(ep.pipeline.stages_completed.is_empty());
}

#[tokio::test]
async fn test_panicked_noncritical_stage_attributed_and_isolated() {
    let h = Harness::new();
    let orch = h.orchestrator(&[
        (StageId::PodcastFeed, MockSpec::default().slow(60)),
        (StageId::Publish, MockSpec::panicking("encoder blew up").slow(20)),
    ]);

    // publish panics while podcast_feed is still in flight; the failure must
    // land on publish, not whichever sibling sorts first.
    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["podcast_feed", "publish", "backup"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    let err = ep.pipeline.errors.get(&StageId::Publish).unwrap();
    assert!(err.contains("panic"), "unexpected error text: {}", err);
    assert!(!ep.pipeline.errors.contains_key(&StageId::PodcastFeed));
    assert!(ep.pipeline.stages_completed.contains(&StageId::PodcastFeed));
    assert!(ep.pipeline.stages_completed.contains(&StageId::Backup));
    assert!(!ep.pipeline.stages_completed.contains(&StageId::Publish));
}

#[tokio::test]
async fn test_panicked_critical_stage_halts_run() {
    let h = Harness::new();
    let orch = h.orchestrator(&[(StageId::Transcribe, MockSpec::panicking("decode fault"))]);

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["transcribe", "clip_miner"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::Error);
    assert!(ep
        .pipeline
        .errors
        .get(&StageId::Transcribe)
        .unwrap()
        .contains("panic"));
    assert_eq!(h.run_count(StageId::ClipMiner), 0);
}

#[tokio::test]
async fn test_crop_written_during_stitch_skips_pause() {
    let h = Harness::new();
    let orch = h.orchestrator(&[(
        StageId::Stitch,
        MockSpec::default().slow(30).writes_crop(),
    )]);

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    assert_eq!(ep.pipeline.stages_completed.len(), graph::ALL_STAGES.len());
    assert!(ep.crop_config.is_some());
}

#[tokio::test]
async fn test_cancelled_before_start_runs_nothing() {
    let h = Harness::new();
    let orch = h.orchestrator(&[]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                ..Default::default()
            },
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::Cancelled);
    assert!(h.ran().is_empty());
}

#[tokio::test]
async fn test_concurrency_never_exceeds_max_workers() {
    let h = Harness::new();
    let mut config = Config::default();
    config.pipeline.max_workers = 2;
    let orch = h.orchestrator_with(
        config,
        &[
            (StageId::PodcastFeed, MockSpec::default().slow(40)),
            (StageId::Publish, MockSpec::default().slow(40)),
            (StageId::Backup, MockSpec::default().slow(40)),
        ],
    );

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["podcast_feed", "publish", "backup"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    assert_eq!(h.ran().len(), 3);
    assert!(h.max_active.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_guest_name_renames_episode_dir_once() {
    let h = Harness::new();
    let orch = h.orchestrator(&[(
        StageId::ClipMiner,
        MockSpec::default()
            .with_field("guest_name", serde_json::json!("John Smith"))
            .with_field("episode_title", serde_json::json!("On Channel Energy")),
    )]);

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["clip_miner"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(ep.episode_id.ends_with("_john-smith"));
    assert_eq!(ep.guest_name, "John Smith");
    assert_eq!(ep.episode_name, "On Channel Energy");
    let dir = h.episodes_dir().join(&ep.episode_id);
    assert!(dir.join(EPISODE_FILE).exists());

    // Re-running never stacks a second slug.
    let again = orch
        .run(
            RunRequest {
                episode_id: Some(ep.episode_id.clone()),
                stages: names(&["clip_miner"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(again.episode_id, ep.episode_id);
}

#[tokio::test]
async fn test_unknown_stage_names() {
    let h = Harness::new();
    let orch = h.orchestrator(&[]);

    let err = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["clip_mining_v2"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyRequest));

    // Known names in the same request still run.
    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["ingest", "clip_mining_v2"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    assert_eq!(h.ran(), vec![StageId::Ingest]);
}

#[tokio::test]
async fn test_missing_source_is_rejected() {
    let h = Harness::new();
    let orch = h.orchestrator(&[]);

    let err = orch
        .run(RunRequest::default(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SourceMissing(_)));

    let err = orch
        .run(
            RunRequest {
                source_path: Some(h.temp.path().join("no-such-card")),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SourceMissing(_)));
}

#[tokio::test]
async fn test_rerun_evicts_requested_stages_only() {
    let h = Harness::new();
    let orch = h.orchestrator(&[]);

    let ep = orch
        .run(
            RunRequest {
                source_path: Some(h.source_file()),
                stages: names(&["ingest", "stitch"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    assert_eq!(
        ep.pipeline.stages_completed,
        vec![StageId::Ingest, StageId::Stitch]
    );

    let ep = orch
        .run(
            RunRequest {
                episode_id: Some(ep.episode_id.clone()),
                stages: names(&["stitch"]),
                ..Default::default()
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(ep.status, EpisodeStatus::ReadyForReview);
    assert!(ep.pipeline.stages_completed.contains(&StageId::Ingest));
    assert!(ep.pipeline.stages_completed.contains(&StageId::Stitch));
    assert_eq!(h.run_count(StageId::Stitch), 2);
    assert_eq!(h.run_count(StageId::Ingest), 1);
}
