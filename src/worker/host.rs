//! Long-running host that keeps the controlling worker current.

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::error::WorkerError;
use crate::event::{EventHandler, WorkerEvent};
use crate::net::Network;
use crate::outbox::OutboxStore;

use super::lifecycle::WorkerState;
use super::{ClientMessage, Clients, EventOutcome, Registration, ServiceWorker};

/// Routes events to the version that controls pages.
///
/// Fetches go to the active version. Installing the configured version, or
/// applying an update (`SKIP_WAITING`, `Activate`), builds the other version's
/// worker and swaps it in once it is active. Pages keep their `Clients`
/// subscription across the swap.
pub struct WorkerHost<S: CacheStorage, O: OutboxStore, N: Network> {
  config: Config,
  storage: Arc<S>,
  outbox: Arc<O>,
  network: Arc<N>,
  registration: Arc<Registration>,
  clients: Clients,
  serving: ServiceWorker<S, O, N>,
}

impl<S: CacheStorage, O: OutboxStore, N: Network> WorkerHost<S, O, N> {
  /// Serve as the registered active version, or `config.version` when none is active.
  pub fn new(
    config: Config,
    storage: Arc<S>,
    outbox: Arc<O>,
    network: Arc<N>,
    registration: Arc<Registration>,
  ) -> Result<Self, WorkerError> {
    let version = registration
      .active()?
      .unwrap_or_else(|| config.version.clone());
    if version != config.version {
      info!(active = %version, configured = %config.version, "serving with the active worker");
    }

    let clients = Clients::new();
    let serving = ServiceWorker::new(
      &Config {
        version,
        ..config.clone()
      },
      Arc::clone(&storage),
      Arc::clone(&outbox),
      Arc::clone(&network),
      Arc::clone(&registration),
      clients.clone(),
    )?;

    Ok(Self {
      config,
      storage,
      outbox,
      network,
      registration,
      clients,
      serving,
    })
  }

  pub fn serving(&self) -> &ServiceWorker<S, O, N> {
    &self.serving
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  fn worker_for(&self, version: &str) -> Result<ServiceWorker<S, O, N>, WorkerError> {
    ServiceWorker::new(
      &Config {
        version: version.to_string(),
        ..self.config.clone()
      },
      Arc::clone(&self.storage),
      Arc::clone(&self.outbox),
      Arc::clone(&self.network),
      Arc::clone(&self.registration),
      self.clients.clone(),
    )
  }

  fn swap(&mut self, next: ServiceWorker<S, O, N>) {
    let mut previous = std::mem::replace(&mut self.serving, next);
    previous.retire();
    info!(from = %previous.version(), to = %self.serving.version(), "now serving");
  }

  /// Install `config.version`. It takes over at once only when nothing else is active.
  pub async fn install(&mut self) -> Result<WorkerState, WorkerError> {
    if self.config.version == self.serving.version() {
      return self.serving.install().await;
    }

    let mut next = self.worker_for(&self.config.version)?;
    let state = next.install().await?;
    if state == WorkerState::Activated {
      self.swap(next);
    }
    Ok(state)
  }

  /// Activate the waiting version, if any, and serve with it.
  async fn apply_update(&mut self, event: WorkerEvent) -> Result<WorkerState, WorkerError> {
    let waiting = match self.registration.waiting()? {
      Some(waiting) if waiting != self.serving.version() => waiting,
      _ => {
        self.serving.handle_event(event).await?;
        return Ok(self.serving.state());
      }
    };

    let mut next = self.worker_for(&waiting)?;
    next.handle_event(event).await?;
    let state = next.state();
    if state == WorkerState::Activated {
      self.swap(next);
    } else {
      debug!(version = %waiting, ?state, "waiting worker did not activate");
    }
    Ok(state)
  }

  pub async fn handle_event(&mut self, event: WorkerEvent) -> Result<EventOutcome, WorkerError> {
    match event {
      WorkerEvent::Install => self.install().await.map(EventOutcome::State),
      WorkerEvent::Activate => self
        .apply_update(WorkerEvent::Activate)
        .await
        .map(EventOutcome::State),
      WorkerEvent::Message(ClientMessage::SkipWaiting) => {
        self
          .apply_update(WorkerEvent::Message(ClientMessage::SkipWaiting))
          .await?;
        Ok(EventOutcome::Reply(None))
      }
      event => self.serving.handle_event(event).await,
    }
  }

  /// Handle events until the queue closes. A failing event is logged and
  /// does not stop the loop.
  pub async fn run(&mut self, events: &mut EventHandler) {
    while let Some(event) = events.next().await {
      match self.handle_event(event).await {
        Ok(outcome) => debug!(?outcome, "event handled"),
        Err(e) => error!(error = %e, "event failed"),
      }
    }
  }
}
