//! Transport layer: the backend operations the orchestrator drives, and their reqwest implementation.

use crate::{
  engine::naming,
  error::{display_detail, DownloadError, ErrorCode},
  model::{BatchStatus, DownloadOptions, QueueItem, SessionInfo, StatusReport, VideoInfo},
  settings::Settings,
};
use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to retrieve once the backend reports a job as ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
  Filename(String),
  Download(String),
  Session(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupTarget {
  Download(String),
  Session(String),
  Batch(String),
}

#[derive(Debug, Clone)]
pub struct Artifact {
  pub payload: Bytes,
  /// Name declared by the backend, either the requested filename or the Content-Disposition one.
  pub filename: Option<String>,
  pub content_type: Option<String>,
}

#[async_trait]
pub trait JobBackend: Send + Sync + 'static {
  async fn fetch_metadata(&self, url: &str) -> Result<VideoInfo, DownloadError>;
  async fn create_session(&self, url: &str, options: &DownloadOptions) -> Result<SessionInfo, DownloadError>;
  async fn enqueue_playlist(&self, url: &str, options: &DownloadOptions) -> Result<SessionInfo, DownloadError>;
  async fn start_download(&self, item: &QueueItem, session_id: Option<&str>) -> Result<String, DownloadError>;
  /// Independent of earlier calls; a 404 comes back as `JobExpired`.
  async fn poll_status(&self, download_id: &str) -> Result<StatusReport, DownloadError>;
  async fn request_archive(&self, session_id: Option<&str>, download_ids: &[String]) -> Result<String, DownloadError>;
  async fn poll_archive(&self, batch_id: &str) -> Result<BatchStatus, DownloadError>;
  async fn fetch_artifact(&self, target: &ArtifactRef) -> Result<Artifact, DownloadError>;
  async fn cleanup(&self, target: &CleanupTarget) -> Result<(), DownloadError>;
}

#[derive(Serialize)]
struct JobRequest<'a> {
  url: &'a str,
  #[serde(flatten)]
  options: &'a DownloadOptions,
  #[serde(skip_serializing_if = "Option::is_none")]
  session_id: Option<&'a str>,
}

#[derive(Serialize)]
struct ArchiveRequest<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  session_id: Option<&'a str>,
  download_ids: &'a [String],
}

#[derive(Deserialize)]
struct StartResponse {
  download_id: String,
}

#[derive(Deserialize)]
struct ArchiveResponse {
  batch_id: String,
}

#[derive(Deserialize)]
struct StatusWire {
  #[serde(default)]
  progress: Option<f64>,
  #[serde(default)]
  title: Option<String>,
  #[serde(default, alias = "isReady")]
  is_ready: Option<bool>,
  #[serde(default)]
  filename: Option<String>,
  #[serde(default)]
  error: Option<serde_json::Value>,
}

impl From<StatusWire> for StatusReport {
  fn from(w: StatusWire) -> Self {
    let filename = non_empty(w.filename);
    StatusReport {
      progress: w.progress.unwrap_or(0.0).clamp(0.0, 100.0),
      title: non_empty(w.title),
      is_ready: w.is_ready.unwrap_or(filename.is_some()),
      filename,
      error: error_field(w.error),
    }
  }
}

#[derive(Deserialize)]
struct BatchStatusWire {
  #[serde(default)]
  ready: bool,
  #[serde(default)]
  progress: Option<f64>,
  #[serde(default)]
  filename: Option<String>,
  #[serde(default)]
  error: Option<serde_json::Value>,
}

impl From<BatchStatusWire> for BatchStatus {
  fn from(w: BatchStatusWire) -> Self {
    BatchStatus {
      ready: w.ready,
      progress: w.progress.unwrap_or(0.0).clamp(0.0, 100.0),
      filename: non_empty(w.filename),
      error: error_field(w.error),
    }
  }
}

fn non_empty(s: Option<String>) -> Option<String> {
  s.filter(|v| !v.trim().is_empty())
}

fn error_field(v: Option<serde_json::Value>) -> Option<String> {
  match v {
    None | Some(serde_json::Value::Null) => None,
    Some(v) => Some(display_detail(&v)).filter(|s| !s.trim().is_empty()),
  }
}

#[derive(Clone)]
pub struct RemoteJobClient {
  http: reqwest::Client,
  base: String,
  call_timeout: Duration,
}

impl RemoteJobClient {
  pub fn new(settings: &Settings) -> anyhow::Result<Self> {
    Ok(Self {
      http: build_client(settings.connect_timeout())?,
      base: settings.backend_url.trim_end_matches('/').to_string(),
      call_timeout: settings.request_timeout(),
    })
  }

  fn endpoint(&self, path: &str) -> String {
    format!("{}/{}", self.base, path)
  }

  async fn post_json<B: Serialize + ?Sized + Sync, T: serde::de::DeserializeOwned + Send>(
    &self,
    path: &str,
    body: &B,
    timeout: Option<Duration>,
  ) -> Result<T, DownloadError> {
    let mut req = self.http.post(self.endpoint(path)).json(body);
    if let Some(t) = timeout {
      req = req.timeout(t);
    }
    let resp = check(req.send().await?).await?;
    Ok(resp.json::<T>().await?)
  }
}

#[async_trait]
impl JobBackend for RemoteJobClient {
  async fn fetch_metadata(&self, url: &str) -> Result<VideoInfo, DownloadError> {
    self
      .post_json("video-info", &serde_json::json!({ "url": url }), Some(self.call_timeout))
      .await
  }

  async fn create_session(&self, url: &str, options: &DownloadOptions) -> Result<SessionInfo, DownloadError> {
    let body = JobRequest {
      url,
      options,
      session_id: None,
    };
    self.post_json("session", &body, None).await
  }

  async fn enqueue_playlist(&self, url: &str, options: &DownloadOptions) -> Result<SessionInfo, DownloadError> {
    let body = JobRequest {
      url,
      options,
      session_id: None,
    };
    self.post_json("playlist", &body, None).await
  }

  async fn start_download(&self, item: &QueueItem, session_id: Option<&str>) -> Result<String, DownloadError> {
    let body = JobRequest {
      url: &item.url,
      options: &item.options,
      session_id,
    };
    let resp: StartResponse = self.post_json("download", &body, None).await?;
    Ok(resp.download_id)
  }

  async fn poll_status(&self, download_id: &str) -> Result<StatusReport, DownloadError> {
    let resp = self
      .http
      .get(self.endpoint(&format!("status/{}", urlencoding::encode(download_id))))
      .timeout(self.call_timeout)
      .send()
      .await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
      return Err(DownloadError::JobExpired);
    }
    let wire: StatusWire = check(resp).await?.json().await?;
    Ok(wire.into())
  }

  async fn request_archive(&self, session_id: Option<&str>, download_ids: &[String]) -> Result<String, DownloadError> {
    let body = ArchiveRequest {
      session_id,
      download_ids,
    };
    let resp: ArchiveResponse = self.post_json("batch", &body, None).await?;
    Ok(resp.batch_id)
  }

  async fn poll_archive(&self, batch_id: &str) -> Result<BatchStatus, DownloadError> {
    let resp = self
      .http
      .get(self.endpoint(&format!("batch/{}/status", urlencoding::encode(batch_id))))
      .timeout(self.call_timeout)
      .send()
      .await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
      return Err(DownloadError::JobExpired);
    }
    let wire: BatchStatusWire = check(resp).await?.json().await?;
    Ok(wire.into())
  }

  async fn fetch_artifact(&self, target: &ArtifactRef) -> Result<Artifact, DownloadError> {
    let path = match target {
      ArtifactRef::Filename(name) => format!("download/{}", urlencoding::encode(name)),
      ArtifactRef::Download(id) => format!("download/id/{}", urlencoding::encode(id)),
      ArtifactRef::Session(id) => format!("session/{}/download", urlencoding::encode(id)),
    };
    let resp = check(self.http.get(self.endpoint(&path)).send().await?).await?;

    let header = |name: &str| {
      resp
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
    };
    let content_type = header("content-type");
    let declared = match target {
      ArtifactRef::Filename(name) => Some(name.clone()),
      _ => header("content-disposition").and_then(|cd| naming::parse_content_disposition_filename(&cd)),
    };

    let mut payload = BytesMut::new();
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
      payload.extend_from_slice(&chunk?);
    }

    Ok(Artifact {
      payload: payload.freeze(),
      filename: declared,
      content_type,
    })
  }

  async fn cleanup(&self, target: &CleanupTarget) -> Result<(), DownloadError> {
    let path = match target {
      CleanupTarget::Download(id) => format!("download/{}", urlencoding::encode(id)),
      CleanupTarget::Session(id) => format!("session/{}", urlencoding::encode(id)),
      CleanupTarget::Batch(id) => format!("batch/{}", urlencoding::encode(id)),
    };
    let resp = self
      .http
      .delete(self.endpoint(&path))
      .timeout(self.call_timeout)
      .send()
      .await?;
    check(resp).await?;
    Ok(())
  }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, DownloadError> {
  let status = resp.status();
  if status.is_success() {
    return Ok(resp);
  }
  let code = ErrorCode::from_status(status.as_u16());
  let body = resp.text().await.unwrap_or_default();
  let message = match serde_json::from_str::<serde_json::Value>(&body) {
    Ok(v) => display_detail(&v),
    Err(_) if !body.trim().is_empty() => body,
    Err(_) => format!("HTTP {}", status.as_u16()),
  };
  Err(DownloadError::remote(code, message))
}

fn build_client(connect_timeout: Duration) -> anyhow::Result<reqwest::Client> {
  reqwest::Client::builder()
    .user_agent(concat!("firedown-client/", env!("CARGO_PKG_VERSION")))
    .redirect(reqwest::redirect::Policy::limited(10))
    .connect_timeout(connect_timeout)
    .build()
    .context("failed to build reqwest client")
}
