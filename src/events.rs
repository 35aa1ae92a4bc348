use crate::model::QueueSnapshot;
use tokio::sync::broadcast;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
  QueueChanged(QueueSnapshot),
  Error { message: String },
}

#[derive(Clone)]
pub struct EventHub {
  tx: broadcast::Sender<ServerEvent>,
}

impl EventHub {
  pub fn new() -> Self {
    // Slow subscribers lag and skip; every snapshot is complete on its own.
    let (tx, _) = broadcast::channel(512);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
    self.tx.subscribe()
  }

  pub fn emit_queue_changed(&self, snapshot: QueueSnapshot) {
    let _ = self.tx.send(ServerEvent::QueueChanged(snapshot));
  }

  pub fn emit_error(&self, message: impl Into<String>) {
    let _ = self.tx.send(ServerEvent::Error {
      message: message.into(),
    });
  }
}

impl Default for EventHub {
  fn default() -> Self {
    Self::new()
  }
}
