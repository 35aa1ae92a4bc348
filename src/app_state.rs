use crate::{engine::DownloadEngineHandle, events::EventHub, settings::Settings};
use anyhow::Context;
use std::path::PathBuf;

#[derive(Clone)]
pub struct AppPaths {
  pub download_dir: PathBuf,
  pub logs_dir: PathBuf,
}

impl AppPaths {
  pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
    let download_dir = PathBuf::from(&settings.download_dir);
    std::fs::create_dir_all(&download_dir).context("failed to create download dir")?;

    let logs_dir = PathBuf::from(&settings.logs_dir);
    std::fs::create_dir_all(&logs_dir).context("failed to create logs dir")?;

    Ok(Self {
      download_dir,
      logs_dir,
    })
  }
}

#[derive(Clone)]
pub struct AppState {
  pub engine: DownloadEngineHandle,
  pub events: EventHub,
  pub token: Option<String>,
}
