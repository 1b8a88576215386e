use std::time::Duration;
use tokio::sync::mpsc;

use crate::net::Request;
use crate::worker::ClientMessage;

/// Events delivered to the worker by its host
#[derive(Debug)]
pub enum WorkerEvent {
  Install,
  /// The previous controller went away; a waiting worker may activate
  Activate,
  Fetch(Request),
  Message(ClientMessage),
  /// Background-sync trigger with its tag
  Sync(String),
  /// Push with an optional plain-text payload
  Push(Option<String>),
  /// Notification click with the chosen action, if any
  NotificationClick(Option<String>),
}

/// Event queue feeding the worker, optionally with a periodic background-sync trigger
pub struct EventHandler {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Emit `Sync(tag)` every `interval`, the way a host schedules background sync.
  pub fn with_sync_schedule(self, tag: String, interval: Duration) -> Self {
    let tx = self.tx.clone();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        if tx.send(WorkerEvent::Sync(tag.clone())).is_err() {
          break;
        }
      }
    });

    self
  }

  pub fn sender(&self) -> mpsc::UnboundedSender<WorkerEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<WorkerEvent> {
    self.rx.recv().await
  }
}
