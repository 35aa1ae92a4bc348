pub mod naming;
pub mod progress;
pub mod queue;
pub mod save;
mod batch;
mod job;

pub use job::PollPolicy;

use crate::{
  error::DownloadError,
  events::{EventHub, ServerEvent},
  model::{BatchReport, DownloadMode, DownloadOptions, QueueItem, QueueItemStatus, QueueSnapshot, StatusReport},
  normalize,
  settings::{BatchMode, Settings},
  transport::{ArtifactRef, CleanupTarget, JobBackend},
};
use job::Tick;
use parking_lot::Mutex;
use queue::{ItemEvent, Queue};
use save::ArtifactSink;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{broadcast, watch};

/// Owns the queue and the global flags. Built once, then driven through handles.
pub struct DownloadEngine {
  inner: Arc<EngineInner>,
}

#[derive(Clone)]
pub struct DownloadEngineHandle {
  inner: Arc<EngineInner>,
}

struct EngineInner {
  backend: Arc<dyn JobBackend>,
  sink: Arc<dyn ArtifactSink>,
  events: EventHub,
  policy: PollPolicy,
  batch_mode: BatchMode,
  batch_concurrency: usize,
  state: Mutex<EngineState>,
  // The global "downloading" flag every polling loop watches.
  run_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct EngineState {
  queue: Queue,
  adding_to_queue: bool,
  downloading: Option<DownloadMode>,
  archive_progress: Option<f64>,
  // Items taking part in the current download operation.
  active: Vec<String>,
  error: Option<String>,
}

impl EngineState {
  fn snapshot(&self) -> QueueSnapshot {
    let progress = self
      .downloading
      .and_then(|_| progress::aggregate(self.active.iter().filter_map(|id| self.queue.get(id))));
    QueueSnapshot {
      items: self.queue.items().to_vec(),
      adding_to_queue: self.adding_to_queue,
      downloading: self.downloading,
      progress,
      archive_progress: self.archive_progress,
      error: self.error.clone(),
      updated_at: now_rfc3339(),
    }
  }
}

impl DownloadEngine {
  pub fn new(backend: Arc<dyn JobBackend>, sink: Arc<dyn ArtifactSink>, settings: &Settings, events: EventHub) -> Self {
    let (run_tx, _) = watch::channel(false);
    let inner = Arc::new(EngineInner {
      backend,
      sink,
      events,
      policy: PollPolicy {
        interval: settings.poll_interval(),
        max_attempts: settings.max_poll_attempts.max(1),
      },
      batch_mode: settings.batch_mode,
      batch_concurrency: settings.batch_concurrency.max(1),
      state: Mutex::new(EngineState::default()),
      run_tx,
    });
    Self { inner }
  }

  pub fn handle(&self) -> DownloadEngineHandle {
    DownloadEngineHandle {
      inner: self.inner.clone(),
    }
  }
}

impl DownloadEngineHandle {
  pub fn snapshot(&self) -> QueueSnapshot {
    self.inner.state.lock().snapshot()
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
    self.inner.events.subscribe()
  }

  /// Resolves `url` against the backend and appends the resulting pending items.
  pub async fn add_to_queue(&self, url: &str, options: DownloadOptions) -> Result<Vec<QueueItem>, DownloadError> {
    let url = url.trim();
    if url.is_empty() {
      return Err(DownloadError::Validation("please enter a URL".into()));
    }
    if !normalize::validate(url) {
      return Err(DownloadError::Validation("only YouTube links are supported".into()));
    }
    options.validate()?;

    let _adding = self.begin_adding()?;
    let canonical = normalize::normalize(url);
    tracing::info!(url = %canonical, format = %options.file_format, "resolving queue entry");

    match self.resolve(&canonical, &options).await {
      Ok(items) => {
        tracing::info!(url = %canonical, items = items.len(), "queue entry resolved");
        self.update(|st| st.queue.extend(items.clone()));
        Ok(items)
      }
      Err(e) => {
        tracing::warn!(url = %canonical, error = %e, "queue entry could not be resolved");
        self.set_error(&e);
        Err(e)
      }
    }
  }

  async fn resolve(&self, url: &str, options: &DownloadOptions) -> Result<Vec<QueueItem>, DownloadError> {
    let backend = &self.inner.backend;
    let info = backend.fetch_metadata(url).await?;

    let (info, session_id) = match self.inner.batch_mode {
      BatchMode::PerItem => (info, None),
      BatchMode::Session => {
        let session = if info.is_playlist {
          backend.enqueue_playlist(url, options).await?
        } else {
          backend.create_session(url, options).await?
        };
        // Sessions may echo richer metadata than the lookup; fall back to the lookup otherwise.
        let info = if session.video_info == Default::default() { info } else { session.video_info };
        (info, Some(session.session_id))
      }
    };

    let items = queue::items_from_info(url, options, &info, session_id.as_deref());
    if items.is_empty() {
      if let Some(session) = session_id {
        self.cleanup(CleanupTarget::Session(session)).await;
      }
      return Err(DownloadError::BackendReported("the playlist has no downloadable videos".into()));
    }
    Ok(items)
  }

  /// Downloads one pending item and saves its file. Item-level failures end up on the
  /// returned item; only rejected commands come back as `Err`.
  pub async fn download_single(&self, id: &str) -> Result<QueueItem, DownloadError> {
    let _downloading = self.begin_download(DownloadMode::Single, vec![id.to_string()])?;
    let item = self.run_item(id, true).await?;
    if let Some(session) = item.session_id.clone() {
      self.release_sessions(vec![session]).await;
    }
    Ok(item)
  }

  /// Downloads every pending item: one goes through `download_single`, several through
  /// the batch path ending in a single archive.
  pub async fn download_all(&self) -> Result<BatchReport, DownloadError> {
    let pending = self.inner.state.lock().queue.pending_ids();
    match pending.len() {
      0 => Ok(BatchReport::default()),
      1 => self.download_single(&pending[0]).await.map(|item| batch::single_report(&item)),
      _ => self.run_batch(pending).await,
    }
  }

  /// Adds `url` and immediately downloads what it resolved to.
  pub async fn quick_download(&self, url: &str, options: DownloadOptions) -> Result<BatchReport, DownloadError> {
    let items = self.add_to_queue(url, options).await?;
    let ids: Vec<String> = items.into_iter().map(|i| i.id).collect();
    match ids.len() {
      0 => Ok(BatchReport::default()),
      1 => self.download_single(&ids[0]).await.map(|item| batch::single_report(&item)),
      _ => self.run_batch(ids).await,
    }
  }

  pub fn remove_from_queue(&self, id: &str) -> Result<QueueItem, DownloadError> {
    let removed = self.update(|st| st.queue.remove(id))?;
    tracing::info!(item_id = %id, "queue item removed");
    Ok(removed)
  }

  pub fn clear_finished(&self) -> usize {
    let removed = self.update(|st| {
      st.error = None;
      st.queue.clear_finished()
    });
    tracing::info!(removed, "finished queue items cleared");
    removed
  }

  /// Flips the global downloading flag off. Returns false when nothing was running.
  pub fn cancel(&self) -> bool {
    let running = self.inner.state.lock().downloading.is_some();
    if running {
      tracing::info!("cancelling current download");
      self.inner.run_tx.send_replace(false);
    }
    running
  }

  /// Runs one item from `pending` until its job is done on the server. With `deliver` set
  /// the file is fetched and saved and the item settles here. Otherwise a ready item stays
  /// `downloading` until the archive that carries it settles.
  async fn run_item(&self, id: &str, deliver: bool) -> Result<QueueItem, DownloadError> {
    let item = self.update(|st| st.queue.apply(id, &ItemEvent::Start))?;
    tracing::info!(item_id = %id, url = %item.url, "download started");

    let result = self.drive_item(&item, deliver).await;
    if let (false, Ok(filename)) = (deliver, &result) {
      tracing::debug!(item_id = %id, filename = %filename, "job ready; waiting for the archive");
      return self
        .inner
        .state
        .lock()
        .queue
        .get(id)
        .cloned()
        .ok_or_else(|| DownloadError::UnknownItem(id.to_string()));
    }
    self.settle(id, result)
  }

  /// Moves an in-flight item to `completed` or `error`.
  fn settle(&self, id: &str, result: Result<String, DownloadError>) -> Result<QueueItem, DownloadError> {
    let event = match result {
      Ok(filename) => {
        tracing::info!(item_id = %id, filename = %filename, "download completed");
        ItemEvent::Complete {
          filename: Some(filename),
        }
      }
      Err(e) => {
        tracing::warn!(item_id = %id, error = %e, "download failed");
        self.set_error(&e);
        ItemEvent::Fail { message: e.to_string() }
      }
    };
    self.update(|st| st.queue.apply(id, &event))
  }

  async fn drive_item(&self, item: &QueueItem, deliver: bool) -> Result<String, DownloadError> {
    let run = self.inner.run_tx.subscribe();
    if !*run.borrow() {
      return Err(DownloadError::Cancelled);
    }

    let backend: &dyn JobBackend = &*self.inner.backend;
    let download_id = backend.start_download(item, item.session_id.as_deref()).await?;
    self.update(|st| {
      st.queue.apply(
        &item.id,
        &ItemEvent::Accepted {
          download_id: download_id.clone(),
        },
      )
    })?;
    tracing::debug!(item_id = %item.id, download_id = %download_id, "backend job accepted");

    let item_id = item.id.as_str();
    let job_id = download_id.as_str();
    let polled = job::poll_until(
      move || backend.poll_status(job_id),
      |report: StatusReport| {
        self.record_progress(item_id, &report);
        match report {
          StatusReport { error: Some(e), .. } => Tick::Failed(e),
          StatusReport {
            is_ready: true,
            filename: Some(f),
            ..
          } => Tick::Done(f),
          _ => Tick::Pending,
        }
      },
      self.inner.policy,
      run,
    )
    .await;

    let filename = match polled.outcome.into_result() {
      Ok(f) => f,
      Err(e) => {
        tracing::debug!(item_id = %item.id, attempts = polled.attempts, "polling stopped");
        // An expired job has nothing left to discard.
        if e != DownloadError::JobExpired {
          self.cleanup(CleanupTarget::Download(download_id)).await;
        }
        return Err(e);
      }
    };

    if deliver {
      let saved = self.deliver(ArtifactRef::Filename(filename.clone())).await;
      self.cleanup(CleanupTarget::Download(download_id)).await;
      saved?;
    }
    Ok(filename)
  }

  fn record_progress(&self, id: &str, report: &StatusReport) {
    let event = ItemEvent::Progress {
      progress: report.progress,
      title: report.title.clone(),
    };
    let _ = self.update(|st| st.queue.apply(id, &event));
  }

  /// Fetches a ready artifact and hands it to the sink under the server-declared name.
  async fn deliver(&self, target: ArtifactRef) -> Result<PathBuf, DownloadError> {
    let artifact = self.inner.backend.fetch_artifact(&target).await?;
    let name = naming::artifact_filename(artifact.filename.as_deref(), artifact.content_type.as_deref());
    self
      .inner
      .sink
      .save(&name, artifact.payload)
      .await
      .map_err(|e| DownloadError::Save(format!("{e:#}")))
  }

  async fn cleanup(&self, target: CleanupTarget) {
    if let Err(e) = self.inner.backend.cleanup(&target).await {
      tracing::warn!(job = ?target, error = %e, "backend cleanup failed");
    }
  }

  /// Discards the given sessions unless a pending or in-flight item still belongs to one.
  async fn release_sessions(&self, sessions: Vec<String>) {
    let idle: Vec<String> = {
      let st = self.inner.state.lock();
      sessions
        .into_iter()
        .filter(|s| {
          !st
            .queue
            .items()
            .iter()
            .any(|i| i.session_id.as_deref() == Some(s.as_str()) && !i.status.is_settled())
        })
        .collect()
    };
    for session in idle {
      self.cleanup(CleanupTarget::Session(session)).await;
    }
  }

  fn begin_adding(&self) -> Result<AddingGuard<'_>, DownloadError> {
    self.update(|st| {
      if st.adding_to_queue {
        return Err(DownloadError::Busy("queue addition"));
      }
      st.adding_to_queue = true;
      st.error = None;
      Ok(())
    })?;
    Ok(AddingGuard { engine: self })
  }

  fn begin_download(&self, mode: DownloadMode, ids: Vec<String>) -> Result<DownloadGuard<'_>, DownloadError> {
    self.update(|st| {
      if st.downloading.is_some() {
        return Err(DownloadError::Busy("download"));
      }
      for id in &ids {
        let item = st.queue.get(id).ok_or_else(|| DownloadError::UnknownItem(id.clone()))?;
        match item.status {
          QueueItemStatus::Pending => {}
          QueueItemStatus::Downloading => return Err(DownloadError::ItemInProgress(id.clone())),
          _ => return Err(DownloadError::NotPending(id.clone())),
        }
      }
      st.downloading = Some(mode);
      st.active = ids;
      st.error = None;
      Ok(())
    })?;
    self.inner.run_tx.send_replace(true);
    Ok(DownloadGuard { engine: self })
  }

  fn set_error(&self, err: &DownloadError) {
    let message = err.to_string();
    self.update(|st| st.error = Some(message.clone()));
    self.inner.events.emit_error(message);
  }

  /// Applies `f` under the state lock and publishes the resulting snapshot.
  fn update<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
    let (out, snapshot) = {
      let mut st = self.inner.state.lock();
      let out = f(&mut st);
      (out, st.snapshot())
    };
    self.inner.events.emit_queue_changed(snapshot);
    out
  }
}

struct AddingGuard<'a> {
  engine: &'a DownloadEngineHandle,
}

impl Drop for AddingGuard<'_> {
  fn drop(&mut self) {
    self.engine.update(|st| st.adding_to_queue = false);
  }
}

struct DownloadGuard<'a> {
  engine: &'a DownloadEngineHandle,
}

impl Drop for DownloadGuard<'_> {
  fn drop(&mut self) {
    self.engine.inner.run_tx.send_replace(false);
    self.engine.update(|st| {
      st.downloading = None;
      st.archive_progress = None;
      st.active.clear();
    });
  }
}

pub(crate) fn now_rfc3339() -> String {
  time::OffsetDateTime::now_utc()
    .format(&time::format_description::well_known::Rfc3339)
    .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests;
