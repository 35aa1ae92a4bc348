use crate::error::DownloadError;
use serde::{Deserialize, Deserializer, Serialize};

pub const VIDEO_FORMATS: [&str; 6] = ["mp4", "mkv", "avi", "webm", "mov", "flv"];
pub const AUDIO_FORMATS: [&str; 7] = ["mp3", "m4a", "wav", "aac", "ogg", "opus", "flac"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
  #[default]
  Video,
  Audio,
}

impl MediaKind {
  pub fn formats(&self) -> &'static [&'static str] {
    match self {
      MediaKind::Video => &VIDEO_FORMATS,
      MediaKind::Audio => &AUDIO_FORMATS,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
  #[default]
  Highest,
  Medium,
  Lowest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DownloadOptions {
  #[serde(rename = "format")]
  pub kind: MediaKind,
  #[serde(default)]
  pub quality: Quality,
  #[serde(rename = "fileFormat")]
  pub file_format: String,
}

impl DownloadOptions {
  pub fn for_kind(kind: MediaKind) -> Self {
    Self {
      kind,
      quality: Quality::default(),
      file_format: kind.formats()[0].to_string(),
    }
  }

  pub fn validate(&self) -> Result<(), DownloadError> {
    let fmt = self.file_format.trim().to_ascii_lowercase();
    if self.kind.formats().contains(&fmt.as_str()) {
      Ok(())
    } else {
      Err(DownloadError::Validation(format!(
        "format {} is not available for {:?} downloads",
        self.file_format, self.kind
      )))
    }
  }
}

impl Default for DownloadOptions {
  fn default() -> Self {
    Self::for_kind(MediaKind::Video)
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
  Pending,
  Downloading,
  Completed,
  Error,
}

impl QueueItemStatus {
  /// Lifecycle is `pending -> downloading -> {completed | error}`; nothing else.
  pub fn can_transition_to(&self, next: QueueItemStatus) -> bool {
    use QueueItemStatus::*;
    matches!((self, next), (Pending, Downloading) | (Downloading, Completed) | (Downloading, Error))
  }

  pub fn is_settled(&self) -> bool {
    matches!(self, QueueItemStatus::Completed | QueueItemStatus::Error)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
  pub id: String,
  pub url: String,
  pub options: DownloadOptions,
  pub title: Option<String>,
  pub thumbnail: Option<String>,
  pub duration: Option<String>,
  pub size: Option<String>,
  pub status: QueueItemStatus,
  pub progress: f64,
  pub error: Option<String>,
  pub session_id: Option<String>,
  pub download_id: Option<String>,
  pub filename: Option<String>,
  pub added_at: String,
  pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlaylistEntry {
  pub url: String,
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub thumbnail: Option<String>,
  #[serde(default, deserialize_with = "display_string")]
  pub duration: Option<String>,
  #[serde(default, deserialize_with = "display_string")]
  pub size: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct VideoInfo {
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub thumbnail: Option<String>,
  #[serde(default, deserialize_with = "display_string")]
  pub duration: Option<String>,
  #[serde(default, deserialize_with = "display_string")]
  pub size: Option<String>,
  #[serde(default, alias = "isPlaylist")]
  pub is_playlist: bool,
  #[serde(default, alias = "playlistItems")]
  pub playlist_items: Vec<PlaylistEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
  pub session_id: String,
  #[serde(default)]
  pub video_info: VideoInfo,
}

/// One poll of a backend job, already normalized: empty strings are absent and
/// `is_ready` is derived from the filename when the backend omits it.
#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct StatusReport {
  pub progress: f64,
  pub title: Option<String>,
  pub is_ready: bool,
  pub filename: Option<String>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct BatchStatus {
  pub ready: bool,
  pub progress: f64,
  pub filename: Option<String>,
  pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
  Single,
  Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateProgress {
  pub percent: f64,
  pub settled: usize,
  pub total: usize,
  pub current_item_id: Option<String>,
  pub current_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
  pub items: Vec<QueueItem>,
  pub adding_to_queue: bool,
  pub downloading: Option<DownloadMode>,
  pub progress: Option<AggregateProgress>,
  /// Server-side progress of the archive being built, while a batch is in that phase.
  pub archive_progress: Option<f64>,
  pub error: Option<String>,
  pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddToQueueRequest {
  pub url: String,
  #[serde(flatten)]
  pub options: DownloadOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BatchReport {
  pub completed: usize,
  pub failed: usize,
  pub archive: Option<String>,
  pub error: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DisplayValue {
  Text(String),
  Number(f64),
}

/// Accepts `"3:25"`, `205` or `12.5` and keeps a display string.
fn display_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  let value = Option::<DisplayValue>::deserialize(deserializer)?;
  Ok(match value {
    Some(DisplayValue::Text(s)) if !s.trim().is_empty() => Some(s),
    Some(DisplayValue::Number(n)) if n.fract() == 0.0 => Some(format!("{}", n as i64)),
    Some(DisplayValue::Number(n)) => Some(n.to_string()),
    _ => None,
  })
}
