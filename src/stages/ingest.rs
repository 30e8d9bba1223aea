//! Ingest stage: copy source MP4s from the capture card into the episode's
//! `source/` directory, ordered by recording time, and validate each copy.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{Stage, StageContext, StageResult};
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;
use async_trait::async_trait;

/// Copied duration may drift from the source by at most this much.
const COPY_TOLERANCE_SECONDS: f64 = 1.0;

/// On-disk shape of `ingest.json`, read back by stitch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestManifest {
    pub files: Vec<IngestFile>,
    pub file_count: usize,
    pub total_duration_seconds: f64,
    pub total_size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestFile {
    pub source_path: String,
    pub dest_path: String,
    pub filename: String,
    pub creation_time: String,
    pub duration_seconds: f64,
    pub size_bytes: u64,
}

pub struct IngestStage;

#[async_trait]
impl Stage for IngestStage {
    fn id(&self) -> StageId {
        StageId::Ingest
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let source = ctx
            .source_path
            .clone()
            .ok_or_else(|| StageError::Precondition("source path for ingest".to_string()))?;

        let files = list_source_files(&source)?;
        if files.is_empty() {
            return Err(StageError::Other(format!(
                "no MP4 files found at {:?}",
                source
            )));
        }

        // Probe for creation time and duration, then sort chronologically so
        // stitch concatenates in recording order.
        let mut probed = Vec::with_capacity(files.len());
        for path in files {
            let probe = media::probe(&path).await?;
            let size = tokio::fs::metadata(&path).await?.len();
            probed.push((path, probe.creation_time(), probe.duration_seconds(), size));
        }
        probed.sort_by(|a, b| a.1.cmp(&b.1));

        let total: f64 = probed.iter().map(|p| p.2).sum();
        tracing::info!("found {} files, total {:.1}s", probed.len(), total);

        let dest_dir = ctx.episode_dir.join("source");
        tokio::fs::create_dir_all(&dest_dir).await?;

        let mut copied = Vec::with_capacity(probed.len());
        let count = probed.len();
        for (idx, (src, creation_time, duration, size)) in probed.into_iter().enumerate() {
            let filename = src
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| format!("source_{:02}.mp4", idx));
            let dst = dest_dir.join(&filename);

            tracing::info!("copying {} ({:.2} GB)", filename, size as f64 / 1e9);
            ctx.report_progress(self.id(), idx, count, &format!("Copying {}", filename));
            tokio::fs::copy(&src, &dst).await?;

            // Validate the copy landed intact.
            let copy_probe = media::probe(&dst).await?;
            let copy_duration = copy_probe.duration_seconds();
            if (copy_duration - duration).abs() > COPY_TOLERANCE_SECONDS {
                return Err(StageError::Other(format!(
                    "duration mismatch after copy: {} (source={:.1}s, copy={:.1}s)",
                    filename, duration, copy_duration
                )));
            }

            copied.push(IngestFile {
                source_path: src.to_string_lossy().to_string(),
                dest_path: dst.to_string_lossy().to_string(),
                filename,
                creation_time,
                duration_seconds: round3(duration),
                size_bytes: size,
            });
        }

        let total_duration: f64 = copied.iter().map(|f| f.duration_seconds).sum();
        let total_size: u64 = copied.iter().map(|f| f.size_bytes).sum();
        let manifest = IngestManifest {
            file_count: copied.len(),
            total_duration_seconds: round3(total_duration),
            total_size_bytes: total_size,
            files: copied,
        };

        let mut result = StageResult::new();
        result.set("files", &manifest.files);
        result.set("file_count", manifest.file_count);
        result.set("total_duration_seconds", manifest.total_duration_seconds);
        result.set("total_size_bytes", manifest.total_size_bytes);
        result.set("duration_seconds", manifest.total_duration_seconds);
        Ok(result)
    }
}

/// MP4 files at the source, excluding macOS `._` resource forks. A single-file
/// source is passed through as-is.
fn list_source_files(source: &Path) -> Result<Vec<PathBuf>, StageError> {
    if !source.exists() {
        return Err(StageError::Precondition(format!(
            "source path {:?}",
            source
        )));
    }
    if source.is_file() {
        return Ok(vec![source.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(source)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let is_mp4 = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("mp4"))
                .unwrap_or(false);
            let hidden = path
                .file_name()
                .map(|n| n.to_string_lossy().starts_with("._"))
                .unwrap_or(true);
            is_mp4 && !hidden
        })
        .collect();
    files.sort();
    Ok(files)
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_source_files_filters_and_sorts() {
        let temp = TempDir::new().unwrap();
        for name in ["b.MP4", "a.mp4", "._a.mp4", "notes.txt"] {
            std::fs::write(temp.path().join(name), b"x").unwrap();
        }
        let files = list_source_files(temp.path()).unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.mp4", "b.MP4"]);
    }

    #[test]
    fn test_single_file_source_passes_through() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("only.mp4");
        std::fs::write(&file, b"x").unwrap();
        let files = list_source_files(&file).unwrap();
        assert_eq!(files, vec![file]);
    }

    #[test]
    fn test_missing_source_is_precondition() {
        let err = list_source_files(Path::new("/no/such/dir")).unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
    }
}
