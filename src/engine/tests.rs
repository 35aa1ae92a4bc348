use super::*;
use crate::{
  error::ErrorCode,
  model::{BatchStatus, PlaylistEntry, SessionInfo, VideoInfo},
  transport::Artifact,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Clone, Copy)]
enum Script {
  ReadyAfter(u32),
  Fails(&'static str),
  Expired,
  Never,
}

#[derive(Default)]
struct FakeBackend {
  scripts: Mutex<HashMap<String, Script>>,
  polls: Mutex<HashMap<String, u32>>,
  sessions_created: Mutex<Vec<String>>,
  archive_requests: Mutex<Vec<(Option<String>, Vec<String>)>>,
  cleaned: Mutex<Vec<CleanupTarget>>,
  metadata_gate: Mutex<Option<Arc<Notify>>>,
  archive_error: Mutex<Option<&'static str>>,
}

impl FakeBackend {
  fn script(&self, download_id: &str, script: Script) {
    self.scripts.lock().insert(download_id.to_string(), script);
  }

  fn polls(&self, download_id: &str) -> u32 {
    self.polls.lock().get(download_id).copied().unwrap_or(0)
  }

  fn cleaned(&self) -> Vec<CleanupTarget> {
    self.cleaned.lock().clone()
  }
}

fn video_id(url: &str) -> &str {
  url.rsplit('=').next().unwrap_or(url)
}

#[async_trait]
impl JobBackend for FakeBackend {
  async fn fetch_metadata(&self, url: &str) -> Result<VideoInfo, DownloadError> {
    let gate = self.metadata_gate.lock().clone();
    if let Some(gate) = gate {
      gate.notified().await;
    }
    if url.contains("withdrawn") {
      return Err(DownloadError::remote(ErrorCode::Http4xx, "This video has been removed"));
    }
    if url.contains("playlist") {
      return Ok(VideoInfo {
        title: Some("Mix".into()),
        is_playlist: true,
        playlist_items: ["a", "b", "c"]
          .iter()
          .map(|id| PlaylistEntry {
            url: format!("https://www.youtube.com/watch?v={id}"),
            title: Some(format!("Track {id}")),
            ..PlaylistEntry::default()
          })
          .collect(),
        ..VideoInfo::default()
      });
    }
    Ok(VideoInfo {
      title: Some(format!("Clip {}", video_id(url))),
      duration: Some("3:25".into()),
      ..VideoInfo::default()
    })
  }

  async fn create_session(&self, url: &str, _options: &DownloadOptions) -> Result<SessionInfo, DownloadError> {
    let id = format!("s-{}", video_id(url));
    self.sessions_created.lock().push(id.clone());
    Ok(SessionInfo {
      session_id: id,
      video_info: VideoInfo::default(),
    })
  }

  async fn enqueue_playlist(&self, _url: &str, _options: &DownloadOptions) -> Result<SessionInfo, DownloadError> {
    self.sessions_created.lock().push("s-pl".into());
    Ok(SessionInfo {
      session_id: "s-pl".into(),
      video_info: VideoInfo::default(),
    })
  }

  async fn start_download(&self, item: &QueueItem, _session_id: Option<&str>) -> Result<String, DownloadError> {
    let id = format!("dl-{}", video_id(&item.url));
    if id == "dl-down" {
      return Err(DownloadError::remote(ErrorCode::Http5xx, "worker pool exhausted"));
    }
    Ok(id)
  }

  async fn poll_status(&self, download_id: &str) -> Result<StatusReport, DownloadError> {
    let n = {
      let mut polls = self.polls.lock();
      let n = polls.entry(download_id.to_string()).or_default();
      *n += 1;
      *n
    };
    let script = self.scripts.lock().get(download_id).copied().unwrap_or(Script::Never);
    match script {
      Script::ReadyAfter(k) if n >= k => Ok(StatusReport {
        progress: 100.0,
        title: None,
        is_ready: true,
        filename: Some(format!("{download_id}.mp4")),
        error: None,
      }),
      Script::ReadyAfter(_) | Script::Never => Ok(StatusReport {
        progress: f64::from(n.min(9) * 10),
        ..StatusReport::default()
      }),
      Script::Fails(msg) => Ok(StatusReport {
        error: Some(msg.to_string()),
        ..StatusReport::default()
      }),
      Script::Expired => Err(DownloadError::JobExpired),
    }
  }

  async fn request_archive(&self, session_id: Option<&str>, download_ids: &[String]) -> Result<String, DownloadError> {
    self
      .archive_requests
      .lock()
      .push((session_id.map(str::to_string), download_ids.to_vec()));
    if let Some(message) = *self.archive_error.lock() {
      return Err(DownloadError::remote(ErrorCode::Http5xx, message));
    }
    Ok("batch-1".into())
  }

  async fn poll_archive(&self, batch_id: &str) -> Result<BatchStatus, DownloadError> {
    let n = {
      let mut polls = self.polls.lock();
      let n = polls.entry(batch_id.to_string()).or_default();
      *n += 1;
      *n
    };
    Ok(BatchStatus {
      ready: n >= 2,
      progress: if n >= 2 { 100.0 } else { 50.0 },
      filename: (n >= 2).then(|| "playlist.zip".to_string()),
      error: None,
    })
  }

  async fn fetch_artifact(&self, target: &ArtifactRef) -> Result<Artifact, DownloadError> {
    match target {
      ArtifactRef::Filename(name) if name.starts_with("dl-broken") => {
        Err(DownloadError::remote(ErrorCode::Http5xx, "artifact vanished"))
      }
      ArtifactRef::Filename(name) => Ok(Artifact {
        payload: Bytes::from(format!("bytes of {name}")),
        filename: Some(name.clone()),
        content_type: None,
      }),
      other => Err(DownloadError::remote(ErrorCode::NotFound, format!("unexpected {other:?}"))),
    }
  }

  async fn cleanup(&self, target: &CleanupTarget) -> Result<(), DownloadError> {
    self.cleaned.lock().push(target.clone());
    Ok(())
  }
}

struct Harness {
  backend: Arc<FakeBackend>,
  engine: DownloadEngineHandle,
  dir: tempfile::TempDir,
}

fn harness_with(settings: Settings) -> Harness {
  let dir = tempfile::tempdir().unwrap();
  let backend = Arc::new(FakeBackend::default());
  let sink = save::DirectorySink::new(dir.path()).unwrap();
  let engine = DownloadEngine::new(backend.clone(), Arc::new(sink), &settings, EventHub::new());
  Harness {
    backend,
    engine: engine.handle(),
    dir,
  }
}

fn harness() -> Harness {
  harness_with(Settings::default())
}

async fn add(h: &Harness, url: &str) -> Vec<QueueItem> {
  h.engine.add_to_queue(url, DownloadOptions::default()).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn single_download_saves_artifact_and_cleans_up() {
  let h = harness();
  let item = add(&h, "https://youtu.be/a").await.remove(0);
  assert_eq!(item.url, "https://youtube.com/watch?v=a");
  assert_eq!(item.session_id.as_deref(), Some("s-a"));
  h.backend.script("dl-a", Script::ReadyAfter(3));

  let done = h.engine.download_single(&item.id).await.unwrap();

  assert_eq!(done.status, QueueItemStatus::Completed);
  assert_eq!(done.progress, 100.0);
  assert_eq!(done.filename.as_deref(), Some("dl-a.mp4"));
  assert_eq!(std::fs::read(h.dir.path().join("dl-a.mp4")).unwrap(), b"bytes of dl-a.mp4");
  assert_eq!(h.backend.polls("dl-a"), 3);
  assert_eq!(
    h.backend.cleaned(),
    [CleanupTarget::Download("dl-a".into()), CleanupTarget::Session("s-a".into())]
  );

  let snap = h.engine.snapshot();
  assert_eq!(snap.downloading, None);
  assert_eq!(snap.error, None);
}

#[tokio::test(start_paused = true)]
async fn not_found_halts_immediately() {
  let h = harness();
  let item = add(&h, "https://youtu.be/gone").await.remove(0);
  h.backend.script("dl-gone", Script::Expired);

  let started = tokio::time::Instant::now();
  let done = h.engine.download_single(&item.id).await.unwrap();

  assert_eq!(done.status, QueueItemStatus::Error);
  assert_eq!(done.error, Some(DownloadError::JobExpired.to_string()));
  assert_eq!(h.backend.polls("dl-gone"), 1);
  assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn retry_ceiling_times_out_and_clears_busy_flag() {
  let h = harness();
  let item = add(&h, "https://youtu.be/slow").await.remove(0);
  h.backend.script("dl-slow", Script::Never);

  let done = h.engine.download_single(&item.id).await.unwrap();

  assert_eq!(done.status, QueueItemStatus::Error);
  assert_eq!(done.error, Some(DownloadError::Timeout.to_string()));
  assert_eq!(h.backend.polls("dl-slow"), 300);
  assert!(done.progress > 0.0);

  let snap = h.engine.snapshot();
  assert_eq!(snap.downloading, None);
  assert_eq!(snap.error, Some(DownloadError::Timeout.to_string()));
}

#[tokio::test(start_paused = true)]
async fn backend_error_is_surfaced_verbatim() {
  let h = harness();
  let item = add(&h, "https://youtu.be/private").await.remove(0);
  h.backend.script("dl-private", Script::Fails("Video unavailable: this video is private"));
  let mut events = h.engine.subscribe();

  let done = h.engine.download_single(&item.id).await.unwrap();

  assert_eq!(done.error.as_deref(), Some("Video unavailable: this video is private"));
  assert_eq!(
    h.engine.snapshot().error.as_deref(),
    Some("Video unavailable: this video is private")
  );
  let mut saw_error = false;
  while let Ok(event) = events.try_recv() {
    if let ServerEvent::Error { message } = event {
      saw_error = message == "Video unavailable: this video is private";
    }
  }
  assert!(saw_error);
}

#[tokio::test(start_paused = true)]
async fn rejected_start_marks_item_failed() {
  let h = harness();
  let item = add(&h, "https://youtu.be/down").await.remove(0);

  let done = h.engine.download_single(&item.id).await.unwrap();

  assert_eq!(done.status, QueueItemStatus::Error);
  assert_eq!(done.error.as_deref(), Some("worker pool exhausted"));
  assert_eq!(h.backend.polls("dl-down"), 0);
}

#[tokio::test(start_paused = true)]
async fn batch_keeps_going_past_a_failed_item_and_archives_the_rest() {
  let h = harness();
  let items = add(&h, "https://www.youtube.com/playlist?list=PL1").await;
  assert_eq!(items.len(), 3);
  assert!(items.iter().all(|i| i.session_id.as_deref() == Some("s-pl")));
  h.backend.script("dl-a", Script::ReadyAfter(2));
  h.backend.script("dl-b", Script::Fails("Sign in to confirm your age"));
  h.backend.script("dl-c", Script::ReadyAfter(4));

  let report = h.engine.download_all().await.unwrap();

  assert_eq!(report.completed, 2);
  assert_eq!(report.failed, 1);
  assert!(report.archive.is_some());
  assert!(h.dir.path().join("playlist.zip").exists());

  let requests = h.backend.archive_requests.lock().clone();
  assert_eq!(requests.len(), 1);
  let (session, mut ids) = requests[0].clone();
  ids.sort();
  assert_eq!(session.as_deref(), Some("s-pl"));
  assert_eq!(ids, ["dl-a", "dl-c"]);

  // Archived items are gone; the failed one stays with its error.
  let snap = h.engine.snapshot();
  assert_eq!(snap.items.len(), 1);
  assert_eq!(snap.items[0].status, QueueItemStatus::Error);
  assert_eq!(snap.items[0].error.as_deref(), Some("Sign in to confirm your age"));
  assert_eq!(snap.downloading, None);

  let cleaned = h.backend.cleaned();
  assert!(cleaned.contains(&CleanupTarget::Batch("batch-1".into())));
  assert!(cleaned.contains(&CleanupTarget::Session("s-pl".into())));
}

#[tokio::test(start_paused = true)]
async fn download_all_with_one_item_uses_the_single_path() {
  let h = harness();
  add(&h, "https://youtu.be/a").await;
  h.backend.script("dl-a", Script::ReadyAfter(1));

  let report = h.engine.download_all().await.unwrap();

  assert_eq!(report.completed, 1);
  assert_eq!(report.archive, None);
  assert!(h.dir.path().join("dl-a.mp4").exists());
  assert!(h.backend.archive_requests.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn download_all_on_empty_queue_is_a_no_op() {
  let h = harness();
  assert_eq!(h.engine.download_all().await.unwrap(), BatchReport::default());
  assert!(h.engine.snapshot().items.is_empty());
}

#[tokio::test(start_paused = true)]
async fn per_item_mode_skips_sessions() {
  let h = harness_with(Settings {
    batch_mode: BatchMode::PerItem,
    ..Settings::default()
  });

  let item = add(&h, "https://youtu.be/a").await.remove(0);

  assert_eq!(item.session_id, None);
  assert!(h.backend.sessions_created.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_url_is_rejected_before_any_request() {
  let h = harness();
  let err = h
    .engine
    .add_to_queue("https://vimeo.com/1234", DownloadOptions::default())
    .await
    .unwrap_err();
  assert!(matches!(err, DownloadError::Validation(_)));
  let err = h.engine.add_to_queue("   ", DownloadOptions::default()).await.unwrap_err();
  assert!(matches!(err, DownloadError::Validation(_)));
  assert!(h.engine.snapshot().items.is_empty());
  assert!(h.backend.sessions_created.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn in_flight_item_cannot_be_removed_and_cancel_stops_it() {
  let h = harness();
  let a = add(&h, "https://youtu.be/a").await.remove(0);
  let b = add(&h, "https://youtu.be/b").await.remove(0);
  h.backend.script("dl-a", Script::Never);

  let engine = h.engine.clone();
  let a_id = a.id.clone();
  let task = tokio::spawn(async move { engine.download_single(&a_id).await });

  while h.backend.polls("dl-a") < 2 {
    tokio::time::sleep(Duration::from_millis(100)).await;
  }

  assert!(matches!(
    h.engine.remove_from_queue(&a.id),
    Err(DownloadError::ItemInProgress(_))
  ));
  assert!(matches!(
    h.engine.download_single(&b.id).await,
    Err(DownloadError::Busy(_))
  ));
  let snap = h.engine.snapshot();
  assert_eq!(snap.downloading, Some(DownloadMode::Single));
  assert!(snap.progress.is_some());

  assert!(h.engine.cancel());
  let done = task.await.unwrap().unwrap();

  assert_eq!(done.status, QueueItemStatus::Error);
  assert_eq!(done.error, Some(DownloadError::Cancelled.to_string()));
  assert!(h.backend.polls("dl-a") < 300);
  assert!(h.backend.cleaned().contains(&CleanupTarget::Download("dl-a".into())));
  assert_eq!(h.engine.snapshot().downloading, None);

  // Settled now, so it can go; b was never touched.
  assert!(h.engine.remove_from_queue(&a.id).is_ok());
  assert_eq!(h.engine.snapshot().items[0].status, QueueItemStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn finished_items_cannot_be_downloaded_again() {
  let h = harness();
  let item = add(&h, "https://youtu.be/a").await.remove(0);
  h.backend.script("dl-a", Script::ReadyAfter(1));
  h.engine.download_single(&item.id).await.unwrap();

  assert!(matches!(
    h.engine.download_single(&item.id).await,
    Err(DownloadError::NotPending(_))
  ));
  assert_eq!(h.engine.clear_finished(), 1);
  assert!(h.engine.snapshot().items.is_empty());
}

fn assert_send<T: Send>(_: &T) {}

#[test]
fn command_futures_can_be_spawned() {
  let h = harness();
  assert_send(&h.engine.download_all());
  assert_send(&h.engine.quick_download("https://youtu.be/a", DownloadOptions::default()));
  assert_send(&h.engine.download_single("x"));
  assert_send(&h.engine.add_to_queue("https://youtu.be/a", DownloadOptions::default()));
}

#[tokio::test(start_paused = true)]
async fn failed_archive_fails_the_ready_items_and_discards_their_jobs() {
  let h = harness();
  add(&h, "https://www.youtube.com/playlist?list=PL1").await;
  for id in ["dl-a", "dl-b", "dl-c"] {
    h.backend.script(id, Script::ReadyAfter(1));
  }
  *h.backend.archive_error.lock() = Some("zip worker crashed");

  let report = h.engine.download_all().await.unwrap();

  let expected = DownloadError::remote(ErrorCode::Http5xx, "zip worker crashed").to_string();
  assert_eq!(report.completed, 0);
  assert_eq!(report.failed, 3);
  assert_eq!(report.archive, None);
  assert_eq!(report.error.as_deref(), Some(expected.as_str()));

  let snap = h.engine.snapshot();
  assert_eq!(snap.items.len(), 3);
  assert!(snap.items.iter().all(|i| i.status == QueueItemStatus::Error));
  assert!(snap.items.iter().all(|i| i.error.as_deref() == Some(expected.as_str())));
  assert_eq!(snap.error.as_deref(), Some(expected.as_str()));
  assert_eq!(snap.downloading, None);
  assert_eq!(std::fs::read_dir(h.dir.path()).unwrap().count(), 0);

  let cleaned = h.backend.cleaned();
  for id in ["dl-a", "dl-b", "dl-c"] {
    assert!(cleaned.contains(&CleanupTarget::Download(id.into())));
  }
  assert!(cleaned.contains(&CleanupTarget::Session("s-pl".into())));
}

#[tokio::test(start_paused = true)]
async fn failed_save_still_discards_the_job_and_session() {
  let h = harness();
  let item = add(&h, "https://youtu.be/broken").await.remove(0);
  h.backend.script("dl-broken", Script::ReadyAfter(1));

  let done = h.engine.download_single(&item.id).await.unwrap();

  assert_eq!(done.status, QueueItemStatus::Error);
  assert_eq!(done.error.as_deref(), Some("artifact vanished"));
  assert_eq!(
    h.backend.cleaned(),
    [
      CleanupTarget::Download("dl-broken".into()),
      CleanupTarget::Session("s-broken".into())
    ]
  );
}

#[tokio::test(start_paused = true)]
async fn shared_playlist_session_outlives_a_single_download() {
  let h = harness();
  let items = add(&h, "https://www.youtube.com/playlist?list=PL1").await;
  h.backend.script("dl-a", Script::ReadyAfter(1));

  h.engine.download_single(&items[0].id).await.unwrap();

  let cleaned = h.backend.cleaned();
  assert!(cleaned.contains(&CleanupTarget::Download("dl-a".into())));
  assert!(!cleaned.contains(&CleanupTarget::Session("s-pl".into())));
}

#[tokio::test(start_paused = true)]
async fn second_add_is_rejected_while_the_first_resolves() {
  let h = harness();
  let gate = Arc::new(Notify::new());
  *h.backend.metadata_gate.lock() = Some(gate.clone());

  let engine = h.engine.clone();
  let first = tokio::spawn(async move { engine.add_to_queue("https://youtu.be/a", DownloadOptions::default()).await });
  while !h.engine.snapshot().adding_to_queue {
    tokio::task::yield_now().await;
  }

  let err = h
    .engine
    .add_to_queue("https://youtu.be/b", DownloadOptions::default())
    .await
    .unwrap_err();
  assert_eq!(err, DownloadError::Busy("queue addition"));

  gate.notify_one();
  assert_eq!(first.await.unwrap().unwrap().len(), 1);
  let snap = h.engine.snapshot();
  assert!(!snap.adding_to_queue);
  assert_eq!(snap.items.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_resolution_clears_the_adding_flag() {
  let h = harness();

  let err = h
    .engine
    .add_to_queue("https://youtu.be/withdrawn", DownloadOptions::default())
    .await
    .unwrap_err();

  assert_eq!(err.to_string(), "This video has been removed");
  let snap = h.engine.snapshot();
  assert!(!snap.adding_to_queue);
  assert!(snap.items.is_empty());
  assert_eq!(snap.error.as_deref(), Some("This video has been removed"));

  add(&h, "https://youtu.be/a").await;
  assert_eq!(h.engine.snapshot().error, None);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_every_batch_loop() {
  let h = harness_with(Settings {
    batch_concurrency: 3,
    ..Settings::default()
  });
  add(&h, "https://www.youtube.com/playlist?list=PL1").await;

  let engine = h.engine.clone();
  let task = tokio::spawn(async move { engine.download_all().await });
  while ["dl-a", "dl-b", "dl-c"].iter().any(|id| h.backend.polls(id) < 2) {
    tokio::time::sleep(Duration::from_millis(100)).await;
  }

  let snap = h.engine.snapshot();
  assert_eq!(snap.downloading, Some(DownloadMode::Batch));
  let progress = snap.progress.unwrap();
  assert_eq!(progress.total, 3);
  assert_eq!(progress.settled, 0);
  assert!(progress.percent > 0.0 && progress.percent < 100.0);

  assert!(h.engine.cancel());
  let report = task.await.unwrap().unwrap();

  assert_eq!(report.completed, 0);
  assert_eq!(report.failed, 3);
  assert_eq!(report.error, Some(DownloadError::Cancelled.to_string()));
  let snap = h.engine.snapshot();
  assert_eq!(snap.downloading, None);
  assert!(snap.items.iter().all(|i| i.status == QueueItemStatus::Error));
  assert!(h.backend.archive_requests.lock().is_empty());
  for id in ["dl-a", "dl-b", "dl-c"] {
    assert!(h.backend.polls(id) < 300);
  }
  assert!(h.backend.cleaned().contains(&CleanupTarget::Session("s-pl".into())));
}

#[tokio::test(start_paused = true)]
async fn archive_progress_is_published_while_the_archive_builds() {
  let h = harness();
  add(&h, "https://www.youtube.com/playlist?list=PL1").await;
  for id in ["dl-a", "dl-b", "dl-c"] {
    h.backend.script(id, Script::ReadyAfter(1));
  }
  let mut events = h.engine.subscribe();

  let report = h.engine.download_all().await.unwrap();
  assert_eq!(report.completed, 3);

  let mut seen = Vec::new();
  while let Ok(event) = events.try_recv() {
    if let ServerEvent::QueueChanged(snap) = event {
      seen.extend(snap.archive_progress);
    }
  }
  assert_eq!(seen.first(), Some(&50.0));
  assert!(seen.contains(&100.0));
  assert_eq!(h.engine.snapshot().archive_progress, None);
}
