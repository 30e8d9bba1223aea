//! Backup stage: rsync the episode directory to an external drive, leaving
//! the scratch `work/` directory behind.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;

use super::{Stage, StageContext, StageResult};
use crate::error::StageError;
use crate::media;
use crate::pipeline::graph::StageId;

pub struct BackupStage;

#[async_trait]
impl Stage for BackupStage {
    fn id(&self) -> StageId {
        StageId::Backup
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageResult, StageError> {
        let backup_root = ctx.config.backup_dir().ok_or_else(|| {
            StageError::Other(
                "backup_dir not set in config.toml or CROSSCUT_BACKUP_DIR env var".to_string(),
            )
        })?;

        // A missing parent means the drive is not mounted; creating the
        // directory would silently back up onto the boot disk.
        match backup_root.parent() {
            Some(parent) if parent.exists() => {}
            _ => {
                return Err(StageError::Other(format!(
                    "backup drive not mounted: {:?}",
                    backup_root
                )))
            }
        }
        tokio::fs::create_dir_all(&backup_root).await?;

        let episode_id = ctx
            .episode_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| StageError::Other("episode directory has no name".to_string()))?;
        let dest = backup_root.join(&episode_id);

        let src = format!("{}/", ctx.episode_dir.to_string_lossy().trim_end_matches('/'));
        let dst = format!("{}/", dest.to_string_lossy().trim_end_matches('/'));
        tracing::info!("backing up {} -> {}", src, dst);

        let mut cmd = Command::new("rsync");
        cmd.args(["-a", "--delete", "--exclude", "work/", &src, &dst]);
        media::run_tool("rsync", cmd).await?;

        let backup_size = dir_size(&dest).unwrap_or(0);
        tracing::info!(
            "backup complete: {} ({:.1} MB)",
            dst,
            backup_size as f64 / 1e6
        );

        Ok(StageResult::new()
            .with("backup_path", dest.to_string_lossy())
            .with("backup_size_bytes", backup_size)
            .with("episode_id", episode_id))
    }
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dir_size_recurses() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.bin"), vec![0u8; 100]).unwrap();
        let sub = temp.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("b.bin"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(temp.path()).unwrap(), 150);
    }
}
