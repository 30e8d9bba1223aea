//! QA stage: validate every pipeline output before anything is published.
//! Hard checks fail the stage; soft checks only warn.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Stage, StageContext, StageResult};
use crate::episode::Clip;
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;

/// Episodes shorter than this are assumed to be misfires.
const MIN_EPISODE_SECONDS: f64 = 60.0;

#[derive(Debug, Serialize, Deserialize)]
pub struct QaCheck {
    pub name: String,
    pub pass: bool,
    pub detail: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QaWarning {
    pub name: String,
    pub detail: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QaReport {
    pub overall: String,
    pub checks: Vec<QaCheck>,
    pub warnings: Vec<QaWarning>,
    pub hard_checks_passed: usize,
    pub hard_checks_total: usize,
    pub warning_count: usize,
}

pub struct QaStage;

#[async_trait]
impl Stage for QaStage {
    fn id(&self) -> StageId {
        StageId::Qa
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let mut checks = Vec::new();
        let mut warnings = Vec::new();

        // Merged source: exists, long enough, carries audio.
        let merged = ctx.episode_dir.join("source_merged.mp4");
        if merged.exists() {
            let probe = media::probe(&merged).await?;
            let duration = probe.duration_seconds();
            checks.push(QaCheck {
                name: "source_merged_exists".to_string(),
                pass: true,
                detail: format!("Duration: {:.1}s", duration),
            });
            checks.push(QaCheck {
                name: "source_merged_duration".to_string(),
                pass: duration > MIN_EPISODE_SECONDS,
                detail: format!("{:.1}s (min {:.0}s)", duration, MIN_EPISODE_SECONDS),
            });
            checks.push(QaCheck {
                name: "source_merged_has_audio".to_string(),
                pass: probe.has_audio(),
                detail: format!("Audio stream: {}", probe.has_audio()),
            });
        } else {
            checks.push(QaCheck {
                name: "source_merged_exists".to_string(),
                pass: false,
                detail: "File not found".to_string(),
            });
        }

        // Longform render.
        let longform = ctx.episode_dir.join("longform.mp4");
        if longform.exists() {
            let probe = media::probe(&longform).await?;
            let size_mb = tokio::fs::metadata(&longform).await?.len() as f64 / 1e6;
            checks.push(QaCheck {
                name: "longform_exists".to_string(),
                pass: true,
                detail: format!(
                    "Duration: {:.1}s, Size: {:.1} MB",
                    probe.duration_seconds(),
                    size_mb
                ),
            });
        } else {
            checks.push(QaCheck {
                name: "longform_exists".to_string(),
                pass: false,
                detail: "File not found".to_string(),
            });
        }

        // Every mined clip has a rendered short; durations are a soft check.
        match ctx.load_json::<serde_json::Value>("clips.json") {
            Ok(clips_doc) => {
                let clips: Vec<Clip> =
                    serde_json::from_value(clips_doc.get("clips").cloned().unwrap_or_default())?;
                let shorts_dir = ctx.episode_dir.join("shorts");
                let mut missing = Vec::new();
                let mut rendered = 0usize;
                for clip in &clips {
                    if shorts_dir.join(format!("{}.mp4", clip.id)).exists() {
                        rendered += 1;
                    } else {
                        missing.push(clip.id.clone());
                    }
                }
                let mut detail = format!("{}/{} rendered", rendered, clips.len());
                if !missing.is_empty() {
                    detail.push_str(&format!(", missing: {:?}", missing));
                }
                checks.push(QaCheck {
                    name: "all_shorts_rendered".to_string(),
                    pass: missing.is_empty(),
                    detail,
                });

                let processing = &ctx.config.processing;
                for clip in &clips {
                    if clip.duration < processing.clip_min_seconds
                        || clip.duration > processing.clip_max_seconds
                    {
                        warnings.push(QaWarning {
                            name: format!("clip_duration_{}", clip.id),
                            detail: format!(
                                "{:.1}s (expected {:.0}-{:.0}s)",
                                clip.duration,
                                processing.clip_min_seconds,
                                processing.clip_max_seconds
                            ),
                        });
                    }
                }
            }
            Err(_) => checks.push(QaCheck {
                name: "clips_json_exists".to_string(),
                pass: false,
                detail: "clips.json not found".to_string(),
            }),
        }

        // Full-episode subtitles.
        let transcript_srt = ctx.episode_dir.join("subtitles").join("transcript.srt");
        checks.push(QaCheck {
            name: "transcript_srt_exists".to_string(),
            pass: transcript_srt.exists(),
            detail: transcript_srt.to_string_lossy().to_string(),
        });

        // Metadata shape.
        match ctx.load_json::<serde_json::Value>("metadata/metadata.json") {
            Ok(meta) => {
                let has_longform = meta.get("longform").is_some();
                let clip_count = meta
                    .get("clips")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                let schedule_count = meta
                    .get("schedule")
                    .and_then(|v| v.as_array())
                    .map(|a| a.len())
                    .unwrap_or(0);
                checks.push(QaCheck {
                    name: "metadata_valid".to_string(),
                    pass: has_longform && clip_count > 0,
                    detail: format!(
                        "longform={}, clips={}, schedule={}",
                        has_longform, clip_count, schedule_count
                    ),
                });
                if schedule_count == 0 {
                    warnings.push(QaWarning {
                        name: "metadata_schedule".to_string(),
                        detail: "No publish schedule in metadata".to_string(),
                    });
                }
            }
            Err(_) => checks.push(QaCheck {
                name: "metadata_exists".to_string(),
                pass: false,
                detail: "metadata.json not found".to_string(),
            }),
        }

        let report = summarize(checks, warnings);
        ctx.save_json("qa/qa_report.json", &report)?;
        tracing::info!(
            "QA: {} ({}/{} checks, {} warnings)",
            report.overall.to_uppercase(),
            report.hard_checks_passed,
            report.hard_checks_total,
            report.warning_count
        );

        if report.overall != "pass" {
            let failed: Vec<&str> = report
                .checks
                .iter()
                .filter(|c| !c.pass)
                .map(|c| c.name.as_str())
                .collect();
            return Err(StageError::Other(format!(
                "QA failed: {}",
                failed.join(", ")
            )));
        }

        Ok(StageResult::new()
            .with("overall", &report.overall)
            .with("hard_checks_passed", report.hard_checks_passed)
            .with("hard_checks_total", report.hard_checks_total)
            .with("warning_count", report.warning_count))
    }
}

fn summarize(checks: Vec<QaCheck>, warnings: Vec<QaWarning>) -> QaReport {
    let passed = checks.iter().filter(|c| c.pass).count();
    let overall = if passed == checks.len() { "pass" } else { "fail" };
    QaReport {
        overall: overall.to_string(),
        hard_checks_passed: passed,
        hard_checks_total: checks.len(),
        warning_count: warnings.len(),
        checks,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str, pass: bool) -> QaCheck {
        QaCheck {
            name: name.to_string(),
            pass,
            detail: String::new(),
        }
    }

    #[test]
    fn test_summarize_counts() {
        let report = summarize(
            vec![check("a", true), check("b", false), check("c", true)],
            vec![QaWarning {
                name: "w".to_string(),
                detail: String::new(),
            }],
        );
        assert_eq!(report.overall, "fail");
        assert_eq!(report.hard_checks_passed, 2);
        assert_eq!(report.hard_checks_total, 3);
        assert_eq!(report.warning_count, 1);
    }

    #[test]
    fn test_summarize_all_pass() {
        let report = summarize(vec![check("a", true)], Vec::new());
        assert_eq!(report.overall, "pass");
    }
}
