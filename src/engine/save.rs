use crate::engine::naming;
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Where finished artifacts end up; the backend-declared filename is passed through as-is.
#[async_trait]
pub trait ArtifactSink: Send + Sync + 'static {
  async fn save(&self, filename: &str, payload: Bytes) -> anyhow::Result<PathBuf>;
}

/// A payload written to a temporary location and not yet handed over under its final name.
/// Dropping it removes whatever is still at the temporary path.
pub struct StagedArtifact {
  path: PathBuf,
}

impl StagedArtifact {
  pub async fn write(dir: &Path, payload: &[u8]) -> anyhow::Result<Self> {
    let staged = Self {
      path: dir.join(format!(".firedown-{}.part", Uuid::new_v4())),
    };
    tokio::fs::write(&staged.path, payload)
      .await
      .context("failed to write staged artifact")?;
    Ok(staged)
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for StagedArtifact {
  fn drop(&mut self) {
    match std::fs::remove_file(&self.path) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
      Err(e) => tracing::warn!(path = %self.path.display(), error = %e, "failed to release staged artifact"),
    }
  }
}

#[derive(Clone)]
pub struct DirectorySink {
  dir: PathBuf,
}

impl DirectorySink {
  pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
    let dir = dir.into();
    naming::ensure_dir(&dir)?;
    Ok(Self { dir })
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
  async fn save(&self, filename: &str, payload: Bytes) -> anyhow::Result<PathBuf> {
    let staged = StagedArtifact::write(&self.dir, &payload).await?;
    let final_name = naming::choose_non_colliding_filename(&self.dir, filename)?;
    let final_path = self.dir.join(final_name);
    let moved = tokio::fs::rename(staged.path(), &final_path)
      .await
      .context("failed to move staged artifact to its final name");
    // Released on both paths; after a successful rename this is a no-op.
    drop(staged);
    moved?;
    tracing::info!(path = %final_path.display(), bytes = payload.len(), "artifact saved");
    Ok(final_path)
  }
}
