use super::{
  job::{self, Tick},
  queue::ItemEvent,
  DownloadEngineHandle,
};
use crate::{
  error::DownloadError,
  model::{BatchReport, BatchStatus, DownloadMode, QueueItem, QueueItemStatus},
  transport::{ArtifactRef, CleanupTarget, JobBackend},
};
use futures_util::{stream, StreamExt};
use std::path::PathBuf;

pub(super) fn single_report(item: &QueueItem) -> BatchReport {
  let completed = item.status == QueueItemStatus::Completed;
  BatchReport {
    completed: usize::from(completed),
    failed: usize::from(!completed),
    archive: None,
    error: item.error.clone(),
  }
}

impl DownloadEngineHandle {
  /// Runs a job per item, `batch_concurrency` at a time, then collects every ready item
  /// into one archive. A failed item never stops its siblings. Ready items settle with the
  /// archive: completed (and removed) when it is saved, failed with its error otherwise.
  pub(super) async fn run_batch(&self, ids: Vec<String>) -> Result<BatchReport, DownloadError> {
    let _downloading = self.begin_download(DownloadMode::Batch, ids.clone())?;
    tracing::info!(items = ids.len(), concurrency = self.inner.batch_concurrency, "batch download started");

    let mut sessions: Vec<String> = {
      let st = self.inner.state.lock();
      ids
        .iter()
        .filter_map(|id| st.queue.get(id).and_then(|i| i.session_id.clone()))
        .collect()
    };
    sessions.sort();
    sessions.dedup();

    let ready: Vec<QueueItem> = stream::iter(ids.clone())
      .map(|id| {
        let this = self.clone();
        async move { this.run_item(&id, false).await }
      })
      .buffer_unordered(self.inner.batch_concurrency)
      .filter_map(|res| async move { res.ok().filter(|i| i.status == QueueItemStatus::Downloading) })
      .collect()
      .await;

    let ready_ids: Vec<String> = ready.iter().map(|i| i.id.clone()).collect();
    let download_ids: Vec<String> = ready.iter().filter_map(|i| i.download_id.clone()).collect();
    let archive_session = ready.iter().filter_map(|i| i.session_id.as_deref()).min();

    let cancelled = !*self.inner.run_tx.borrow();
    let archived = if cancelled {
      Err(DownloadError::Cancelled)
    } else if ready.is_empty() {
      Err(DownloadError::BackendReported("none of the queued downloads finished".into()))
    } else {
      self.deliver_archive(archive_session, &download_ids).await
    };

    let mut report = BatchReport {
      completed: 0,
      failed: ids.len() - ready.len(),
      archive: None,
      error: None,
    };
    match archived {
      Ok(path) => {
        let removed = self.update(|st| {
          for id in &ready_ids {
            let _ = st.queue.apply(id, &ItemEvent::Complete { filename: None });
          }
          st.queue.remove_many(&ready_ids)
        });
        tracing::info!(path = %path.display(), removed, "batch archive saved");
        report.completed = ready.len();
        report.archive = Some(path.display().to_string());
      }
      Err(e) => {
        tracing::warn!(error = %e, ready = ready.len(), "batch archive failed");
        if e != DownloadError::Cancelled {
          self.set_error(&e);
        }
        let event = ItemEvent::Fail { message: e.to_string() };
        self.update(|st| {
          for id in &ready_ids {
            let _ = st.queue.apply(id, &event);
          }
        });
        report.failed = ids.len();
        report.error = Some(e.to_string());
      }
    }

    for id in download_ids {
      self.cleanup(CleanupTarget::Download(id)).await;
    }
    self.release_sessions(sessions).await;
    Ok(report)
  }

  async fn deliver_archive(&self, session_id: Option<&str>, download_ids: &[String]) -> Result<PathBuf, DownloadError> {
    let backend: &dyn JobBackend = &*self.inner.backend;
    let batch_id = backend.request_archive(session_id, download_ids).await?;
    tracing::debug!(batch_id = %batch_id, items = download_ids.len(), "archive requested");

    let job_id = batch_id.as_str();
    let polled = job::poll_until(
      move || backend.poll_archive(job_id),
      |status: BatchStatus| {
        self.update(|st| st.archive_progress = Some(status.progress.clamp(0.0, 100.0)));
        match status {
          BatchStatus { error: Some(e), .. } => Tick::Failed(e),
          BatchStatus {
            ready: true,
            filename: Some(f),
            ..
          } => Tick::Done(f),
          _ => Tick::Pending,
        }
      },
      self.inner.policy,
      self.inner.run_tx.subscribe(),
    )
    .await;

    let saved = match polled.outcome.into_result() {
      Ok(filename) => self.deliver(ArtifactRef::Filename(filename)).await,
      Err(e) => Err(e),
    };
    self.cleanup(CleanupTarget::Batch(batch_id)).await;
    saved
  }
}
