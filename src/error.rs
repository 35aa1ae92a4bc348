use crate::app_state::AppPaths;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
  InvalidUrl,
  ConnectFail,
  Timeout,
  NotFound,
  Http4xx,
  Http5xx,
  MalformedResponse,
  Unknown,
}

impl ErrorCode {
  pub fn from_status(status: u16) -> Self {
    match status {
      404 => ErrorCode::NotFound,
      400..=499 => ErrorCode::Http4xx,
      500..=599 => ErrorCode::Http5xx,
      _ => ErrorCode::Unknown,
    }
  }

  pub fn from_reqwest(err: &reqwest::Error) -> Self {
    if err.is_timeout() {
      ErrorCode::Timeout
    } else if err.is_connect() {
      ErrorCode::ConnectFail
    } else if err.is_decode() {
      ErrorCode::MalformedResponse
    } else if let Some(status) = err.status() {
      ErrorCode::from_status(status.as_u16())
    } else {
      ErrorCode::Unknown
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadError {
  #[error("{0}")]
  Validation(String),
  #[error("{message}")]
  Remote { code: ErrorCode, message: String },
  #[error("download not found on the server (expired or never started)")]
  JobExpired,
  #[error("{0}")]
  BackendReported(String),
  #[error("timed out waiting for the server to finish the download")]
  Timeout,
  #[error("download cancelled")]
  Cancelled,
  #[error("could not save the file: {0}")]
  Save(String),
  #[error("another {0} is already in progress")]
  Busy(&'static str),
  #[error("no queue item with id {0}")]
  UnknownItem(String),
  #[error("queue item {0} has already been downloaded or failed")]
  NotPending(String),
  #[error("queue item {0} is downloading and cannot be removed")]
  ItemInProgress(String),
}

impl DownloadError {
  pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
    DownloadError::Remote {
      code,
      message: message.into(),
    }
  }

  pub fn code(&self) -> Option<ErrorCode> {
    match self {
      DownloadError::Remote { code, .. } => Some(*code),
      DownloadError::JobExpired => Some(ErrorCode::NotFound),
      DownloadError::Timeout => Some(ErrorCode::Timeout),
      DownloadError::Validation(_) => Some(ErrorCode::InvalidUrl),
      _ => None,
    }
  }

  /// Rejections of a command itself, as opposed to failures of remote work.
  pub fn is_rejection(&self) -> bool {
    matches!(
      self,
      DownloadError::Validation(_)
        | DownloadError::Busy(_)
        | DownloadError::UnknownItem(_)
        | DownloadError::NotPending(_)
        | DownloadError::ItemInProgress(_)
    )
  }
}

impl From<reqwest::Error> for DownloadError {
  fn from(err: reqwest::Error) -> Self {
    DownloadError::remote(ErrorCode::from_reqwest(&err), err.to_string())
  }
}

/// Flattens a backend error payload into one display string.
///
/// Validation failures arrive as `{"detail": [{"msg": ...}, ...]}`, plain failures as
/// `{"detail": "..."}` or a bare string.
pub fn display_detail(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    serde_json::Value::Array(items) => items
      .iter()
      .map(|item| match item.get("msg").and_then(|m| m.as_str()) {
        Some(msg) => msg.to_string(),
        None => item.to_string(),
      })
      .collect::<Vec<_>>()
      .join(", "),
    serde_json::Value::Object(map) => {
      if let Some(detail) = map.get("detail") {
        display_detail(detail)
      } else if let Some(message) = map.get("message") {
        display_detail(message)
      } else {
        value.to_string()
      }
    }
    other => other.to_string(),
  }
}

pub fn init_tracing(paths: &AppPaths) -> anyhow::Result<()> {
  let file_appender = tracing_appender::rolling::daily(&paths.logs_dir, "firedown.jsonl");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
  let _ = LOG_GUARD.set(guard);

  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn,hyper=warn"));

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(non_blocking)
    .json()
    .with_current_span(true)
    .with_span_list(true)
    .try_init()
    .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

  Ok(())
}
