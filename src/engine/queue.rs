use super::now_rfc3339;
use crate::{
  error::DownloadError,
  model::{DownloadOptions, PlaylistEntry, QueueItem, QueueItemStatus, VideoInfo},
  normalize,
};
use uuid::Uuid;

/// Everything that can happen to a queue item once it exists.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemEvent {
  Start,
  Accepted { download_id: String },
  Progress { progress: f64, title: Option<String> },
  Complete { filename: Option<String> },
  Fail { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{event} is not valid for an item that is {status:?}")]
pub struct TransitionRejected {
  pub status: QueueItemStatus,
  pub event: &'static str,
}

impl ItemEvent {
  fn name(&self) -> &'static str {
    match self {
      ItemEvent::Start => "start",
      ItemEvent::Accepted { .. } => "accepted",
      ItemEvent::Progress { .. } => "progress",
      ItemEvent::Complete { .. } => "complete",
      ItemEvent::Fail { .. } => "fail",
    }
  }
}

/// Pure transition: returns the item as it looks after `event`, or why the event does not apply.
pub fn apply_event(item: &QueueItem, event: &ItemEvent) -> Result<QueueItem, TransitionRejected> {
  let reject = || TransitionRejected {
    status: item.status,
    event: event.name(),
  };
  let mut next = item.clone();
  match event {
    ItemEvent::Start => {
      if !item.status.can_transition_to(QueueItemStatus::Downloading) {
        return Err(reject());
      }
      next.status = QueueItemStatus::Downloading;
      next.progress = 0.0;
      next.error = None;
    }
    ItemEvent::Accepted { download_id } => {
      if item.status != QueueItemStatus::Downloading {
        return Err(reject());
      }
      next.download_id = Some(download_id.clone());
    }
    ItemEvent::Progress { progress, title } => {
      if item.status != QueueItemStatus::Downloading {
        return Err(reject());
      }
      next.progress = item.progress.max(progress.clamp(0.0, 100.0));
      if let Some(t) = title {
        next.title = Some(t.clone());
      }
    }
    ItemEvent::Complete { filename } => {
      if !item.status.can_transition_to(QueueItemStatus::Completed) {
        return Err(reject());
      }
      next.status = QueueItemStatus::Completed;
      next.progress = 100.0;
      if filename.is_some() {
        next.filename = filename.clone();
      }
    }
    ItemEvent::Fail { message } => {
      if !item.status.can_transition_to(QueueItemStatus::Error) {
        return Err(reject());
      }
      next.status = QueueItemStatus::Error;
      next.error = Some(message.clone());
    }
  }
  next.updated_at = now_rfc3339();
  Ok(next)
}

/// Builds pending items from a metadata response, in the order the server listed them.
pub fn items_from_info(
  url: &str,
  options: &DownloadOptions,
  info: &VideoInfo,
  session_id: Option<&str>,
) -> Vec<QueueItem> {
  if info.is_playlist {
    return info
      .playlist_items
      .iter()
      .filter(|e| !e.url.trim().is_empty())
      .map(|e| pending_item(e, options, session_id))
      .collect();
  }
  let entry = PlaylistEntry {
    url: url.to_string(),
    title: info.title.clone(),
    thumbnail: info.thumbnail.clone(),
    duration: info.duration.clone(),
    size: info.size.clone(),
  };
  vec![pending_item(&entry, options, session_id)]
}

fn pending_item(entry: &PlaylistEntry, options: &DownloadOptions, session_id: Option<&str>) -> QueueItem {
  let now = now_rfc3339();
  QueueItem {
    id: Uuid::new_v4().to_string(),
    url: normalize::normalize(&entry.url),
    options: options.clone(),
    title: entry.title.clone(),
    thumbnail: entry.thumbnail.clone(),
    duration: entry.duration.clone(),
    size: entry.size.clone(),
    status: QueueItemStatus::Pending,
    progress: 0.0,
    error: None,
    session_id: session_id.map(|s| s.to_string()),
    download_id: None,
    filename: None,
    added_at: now.clone(),
    updated_at: now,
  }
}

#[derive(Debug, Clone, Default)]
pub struct Queue {
  items: Vec<QueueItem>,
}

impl Queue {
  pub fn items(&self) -> &[QueueItem] {
    &self.items
  }

  pub fn get(&self, id: &str) -> Option<&QueueItem> {
    self.items.iter().find(|i| i.id == id)
  }

  pub fn extend(&mut self, items: Vec<QueueItem>) {
    self.items.extend(items);
  }

  /// Swaps in a new value for one item; other items and the item's position are untouched.
  pub fn replace_by_id<F>(&mut self, id: &str, f: F) -> Option<&QueueItem>
  where
    F: FnOnce(&QueueItem) -> Option<QueueItem>,
  {
    let idx = self.items.iter().position(|i| i.id == id)?;
    let next = f(&self.items[idx])?;
    self.items[idx] = next;
    Some(&self.items[idx])
  }

  pub fn apply(&mut self, id: &str, event: &ItemEvent) -> Result<QueueItem, DownloadError> {
    let current = self
      .get(id)
      .ok_or_else(|| DownloadError::UnknownItem(id.to_string()))?;
    let next = apply_event(current, event).map_err(|e| {
      tracing::debug!(item_id = %id, error = %e, "ignored queue transition");
      match e.status {
        QueueItemStatus::Downloading => DownloadError::ItemInProgress(id.to_string()),
        _ => DownloadError::NotPending(id.to_string()),
      }
    })?;
    self.replace_by_id(id, |_| Some(next.clone()));
    Ok(next)
  }

  pub fn remove(&mut self, id: &str) -> Result<QueueItem, DownloadError> {
    let idx = self
      .items
      .iter()
      .position(|i| i.id == id)
      .ok_or_else(|| DownloadError::UnknownItem(id.to_string()))?;
    if self.items[idx].status == QueueItemStatus::Downloading {
      return Err(DownloadError::ItemInProgress(id.to_string()));
    }
    Ok(self.items.remove(idx))
  }

  pub fn remove_many(&mut self, ids: &[String]) -> usize {
    let before = self.items.len();
    self
      .items
      .retain(|i| !(ids.contains(&i.id) && i.status != QueueItemStatus::Downloading));
    before - self.items.len()
  }

  pub fn clear_finished(&mut self) -> usize {
    let before = self.items.len();
    self.items.retain(|i| !i.status.is_settled());
    before - self.items.len()
  }

  pub fn pending_ids(&self) -> Vec<String> {
    self
      .items
      .iter()
      .filter(|i| i.status == QueueItemStatus::Pending)
      .map(|i| i.id.clone())
      .collect()
  }
}
