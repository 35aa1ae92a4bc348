use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use url::Url;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
  /// Register every added URL as a backend session and start jobs inside it.
  #[default]
  Session,
  /// Plain per-item jobs; the archive is requested from download ids alone.
  PerItem,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub backend_url: String,
  pub poll_interval_ms: u64,
  pub max_poll_attempts: u32,
  pub request_timeout_ms: u64,
  pub connect_timeout_ms: u64,
  pub batch_mode: BatchMode,
  pub batch_concurrency: usize,
  pub download_dir: String,
  pub logs_dir: String,
  pub local_api_port: u16,
  pub local_api_token: Option<String>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      backend_url: "http://localhost:8000".to_string(),
      poll_interval_ms: 1000,
      max_poll_attempts: 300,
      request_timeout_ms: 10_000,
      connect_timeout_ms: 15_000,
      batch_mode: BatchMode::Session,
      batch_concurrency: 2,
      download_dir: "downloads".to_string(),
      logs_dir: "logs".to_string(),
      local_api_port: 7878,
      local_api_token: None,
    }
  }
}

impl Settings {
  pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
    let mut settings = match path {
      Some(p) => {
        let raw = std::fs::read_to_string(p)
          .with_context(|| format!("failed to read settings file {}", p.display()))?;
        serde_json::from_str(&raw).context("failed to parse settings file")?
      }
      None => Settings::default(),
    };
    settings.apply_env(|key| std::env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
  }

  fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
    if let Some(v) = get("FIREDOWN_BACKEND_URL") {
      self.backend_url = v;
    }
    if let Some(v) = get("FIREDOWN_POLL_INTERVAL_MS") {
      self.poll_interval_ms = v.parse().context("FIREDOWN_POLL_INTERVAL_MS")?;
    }
    if let Some(v) = get("FIREDOWN_MAX_POLL_ATTEMPTS") {
      self.max_poll_attempts = v.parse().context("FIREDOWN_MAX_POLL_ATTEMPTS")?;
    }
    if let Some(v) = get("FIREDOWN_REQUEST_TIMEOUT_MS") {
      self.request_timeout_ms = v.parse().context("FIREDOWN_REQUEST_TIMEOUT_MS")?;
    }
    if let Some(v) = get("FIREDOWN_CONNECT_TIMEOUT_MS") {
      self.connect_timeout_ms = v.parse().context("FIREDOWN_CONNECT_TIMEOUT_MS")?;
    }
    if let Some(v) = get("FIREDOWN_BATCH_MODE") {
      self.batch_mode = match v.trim() {
        "session" => BatchMode::Session,
        "per_item" => BatchMode::PerItem,
        other => anyhow::bail!("unknown FIREDOWN_BATCH_MODE {other}"),
      };
    }
    if let Some(v) = get("FIREDOWN_BATCH_CONCURRENCY") {
      self.batch_concurrency = v.parse().context("FIREDOWN_BATCH_CONCURRENCY")?;
    }
    if let Some(v) = get("FIREDOWN_DOWNLOAD_DIR") {
      self.download_dir = v;
    }
    if let Some(v) = get("FIREDOWN_LOGS_DIR") {
      self.logs_dir = v;
    }
    if let Some(v) = get("FIREDOWN_LOCAL_API_PORT") {
      self.local_api_port = v.parse().context("FIREDOWN_LOCAL_API_PORT")?;
    }
    if let Some(v) = get("FIREDOWN_LOCAL_API_TOKEN") {
      self.local_api_token = Some(v).filter(|t| !t.trim().is_empty());
    }
    Ok(())
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    Url::parse(&self.backend_url).context("backend_url is not a valid url")?;
    if self.poll_interval_ms == 0 {
      anyhow::bail!("poll_interval_ms must be greater than zero");
    }
    if self.max_poll_attempts == 0 {
      anyhow::bail!("max_poll_attempts must be greater than zero");
    }
    if self.batch_concurrency == 0 {
      anyhow::bail!("batch_concurrency must be greater than zero");
    }
    Ok(())
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }
}
