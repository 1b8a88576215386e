//! Messages exchanged between pages and the worker.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Page -> worker command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate a waiting worker now ("apply update")
  SkipWaiting,
  GetVersion,
}

/// Worker -> page notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerNotification {
  /// Activation finished; the app shell is available offline
  OfflineReady { version: String },
  /// A refreshed response replaced the cached copy of `url`
  CacheUpdated { url: String },
  Version { version: String },
}

const CHANNEL_CAPACITY: usize = 64;

/// The set of pages the worker can talk to.
///
/// Clones share the channel, so pages keep listening when a new version
/// takes over.
#[derive(Clone)]
pub struct Clients {
  tx: broadcast::Sender<WorkerNotification>,
  controlled: Arc<AtomicBool>,
}

impl Default for Clients {
  fn default() -> Self {
    Self::new()
  }
}

impl Clients {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self {
      tx,
      controlled: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<WorkerNotification> {
    self.tx.subscribe()
  }

  /// Take control of every open page immediately.
  pub fn claim(&self) {
    self.controlled.store(true, Ordering::SeqCst);
  }

  #[cfg(test)]
  pub fn is_controlled(&self) -> bool {
    self.controlled.load(Ordering::SeqCst)
  }

  /// Broadcast to every page. Having no page open is not an error.
  pub fn post(&self, notification: WorkerNotification) {
    if self.tx.send(notification).is_err() {
      debug!("no clients listening");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_message_wire_format() {
    let msg: ClientMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    assert_eq!(msg, ClientMessage::SkipWaiting);

    let note = serde_json::to_value(WorkerNotification::CacheUpdated {
      url: "/api/projects".to_string(),
    })
    .unwrap();
    assert_eq!(
      note,
      serde_json::json!({ "type": "CACHE_UPDATED", "url": "/api/projects" })
    );
  }

  #[test]
  fn test_unknown_message_is_rejected() {
    assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"CLEAR_EVERYTHING"}"#).is_err());
  }

  #[tokio::test]
  async fn test_post_reaches_subscribers() {
    let clients = Clients::new();
    let mut rx = clients.subscribe();
    clients.post(WorkerNotification::OfflineReady {
      version: "v2".to_string(),
    });

    assert_eq!(
      rx.recv().await.unwrap(),
      WorkerNotification::OfflineReady {
        version: "v2".to_string()
      }
    );
  }

  #[test]
  fn test_post_without_clients_is_fine() {
    let clients = Clients::new();
    clients.post(WorkerNotification::Version {
      version: "v1".to_string(),
    });
    assert!(!clients.is_controlled());
    clients.claim();
    assert!(clients.is_controlled());
  }
}
