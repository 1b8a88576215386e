//! The worker controller: lifecycle, fetch routing, messaging and outbox sync.
//!
//! All worker state lives in one `ServiceWorker` value and only changes
//! through `handle_event`.

mod host;
pub mod lifecycle;
mod messages;
pub mod push;
mod registration;
mod router;

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cache::CacheStorage;
use crate::config::Config;
use crate::error::WorkerError;
use crate::event::WorkerEvent;
use crate::net::{Network, Request};
use crate::outbox::{DrainReport, Endpoints, OutboxStore, OutboxSync};

use lifecycle::{Lifecycle, LifecycleEvent, WorkerState};
use push::{ClickOutcome, Notification};

pub use host::WorkerHost;
pub use messages::{ClientMessage, Clients, WorkerNotification};
pub use registration::Registration;
pub use router::{CacheRouter, FetchOutcome, Route};

/// What handling one event produced.
#[derive(Debug)]
pub enum EventOutcome {
  State(WorkerState),
  Fetched(FetchOutcome),
  Reply(Option<WorkerNotification>),
  Drained(DrainReport),
  /// Sync trigger with a tag this worker does not own
  SyncIgnored(String),
  ShowNotification(Notification),
  Click(ClickOutcome),
}

pub struct ServiceWorker<S: CacheStorage, O: OutboxStore, N: Network> {
  version: String,
  sync_tag: String,
  lifecycle: Lifecycle,
  router: CacheRouter<S, N>,
  outbox: OutboxSync<O, N>,
  network: Arc<N>,
  registration: Arc<Registration>,
  clients: Clients,
}

impl<S: CacheStorage, O: OutboxStore, N: Network> ServiceWorker<S, O, N> {
  /// Build the worker for `config.version`, resuming its recorded state.
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    outbox_store: Arc<O>,
    network: Arc<N>,
    registration: Arc<Registration>,
    clients: Clients,
  ) -> Result<Self, WorkerError> {
    let router = CacheRouter::new(config, storage, Arc::clone(&network))?;
    let outbox = OutboxSync::new(
      outbox_store,
      Arc::clone(&network),
      Endpoints::from_config(config)?,
    );

    let lifecycle = if registration.active()?.as_deref() == Some(config.version.as_str()) {
      Lifecycle::resume(WorkerState::Activated)
    } else if registration.waiting()?.as_deref() == Some(config.version.as_str()) {
      Lifecycle::resume(WorkerState::Installed)
    } else {
      Lifecycle::new()
    };

    if lifecycle.is_active() {
      clients.claim();
    }

    Ok(Self {
      version: config.version.clone(),
      sync_tag: config.sync_tag.clone(),
      lifecycle,
      router,
      outbox,
      network,
      registration,
      clients,
    })
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> WorkerState {
    self.lifecycle.state()
  }

  #[cfg(test)]
  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  pub fn outbox(&self) -> &OutboxSync<O, N> {
    &self.outbox
  }

  pub fn router(&self) -> &CacheRouter<S, N> {
    &self.router
  }

  pub fn registration(&self) -> &Registration {
    &self.registration
  }

  /// Precache the manifest, then wait or activate.
  ///
  /// With another version active the worker stays `Installed` until
  /// `SKIP_WAITING` or the old controller goes away.
  pub async fn install(&mut self) -> Result<WorkerState, WorkerError> {
    if matches!(
      self.lifecycle.state(),
      WorkerState::Installed | WorkerState::Activated
    ) {
      debug!(version = %self.version, "already installed");
      return Ok(self.lifecycle.state());
    }

    self.lifecycle.apply(LifecycleEvent::Install)?;
    if let Err(e) = self.router.install().await {
      self.lifecycle.apply(LifecycleEvent::InstallFailed)?;
      return Err(e.into());
    }
    self.lifecycle.apply(LifecycleEvent::InstallSucceeded)?;

    match self.registration.active()? {
      Some(active) if active != self.version => {
        self.registration.set_waiting(&self.version)?;
        info!(active = %active, waiting = %self.version, "installed, waiting for the active worker to release");
        Ok(WorkerState::Installed)
      }
      _ => {
        self.lifecycle.apply(LifecycleEvent::ControllerReleased)?;
        self.activate()
      }
    }
  }

  /// Drop other versions' buckets, take over the registration and claim clients.
  ///
  /// On failure the worker goes back to waiting and activation can be retried.
  fn activate(&mut self) -> Result<WorkerState, WorkerError> {
    let promoted = self.router.activate().and_then(|removed| {
      self
        .registration
        .promote(&self.version)
        .map(|previous| (removed, previous))
    });
    let (removed, previous) = match promoted {
      Ok(done) => done,
      Err(e) => {
        error!(version = %self.version, error = %e, "activation failed");
        self.lifecycle.apply(LifecycleEvent::ActivationFailed)?;
        return Err(e.into());
      }
    };
    self.clients.claim();
    let state = self.lifecycle.apply(LifecycleEvent::Activated)?;

    info!(
      version = %self.version,
      previous = ?previous,
      removed_buckets = removed.len(),
      "worker activated"
    );
    self.clients.post(WorkerNotification::OfflineReady {
      version: self.version.clone(),
    });
    Ok(state)
  }

  /// Mark this worker replaced by a newer active version.
  pub fn retire(&mut self) {
    match self.lifecycle.apply(LifecycleEvent::Superseded) {
      Ok(_) => info!(version = %self.version, "worker superseded"),
      Err(e) => debug!(version = %self.version, error = %e, "nothing to retire"),
    }
  }

  /// Activate a waiting worker. No-op in any other state.
  async fn take_over(&mut self, event: LifecycleEvent) -> Result<WorkerState, WorkerError> {
    if !self.lifecycle.is_waiting() {
      debug!(state = ?self.lifecycle.state(), ?event, "nothing waiting to activate");
      return Ok(self.lifecycle.state());
    }
    self.lifecycle.apply(event)?;
    self.activate()
  }

  /// Serve a fetch. Pages are uncontrolled until activation and go straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<FetchOutcome, WorkerError> {
    if !self.lifecycle.is_active() {
      debug!(url = %request.url, "not controlling pages, forwarding");
      let response = self.network.fetch(request).await?;
      return Ok(FetchOutcome {
        route: Route::Passthrough,
        response,
        source: None,
        changed: false,
        cached_at: None,
      });
    }

    let url = request.url.to_string();
    let outcome = self.router.handle_fetch(request).await?;
    if outcome.route == Route::Api && outcome.changed {
      self.clients.post(WorkerNotification::CacheUpdated { url });
    }
    Ok(outcome)
  }

  pub async fn handle_message(
    &mut self,
    message: ClientMessage,
  ) -> Result<Option<WorkerNotification>, WorkerError> {
    match message {
      ClientMessage::SkipWaiting => {
        self.take_over(LifecycleEvent::SkipWaiting).await?;
        Ok(None)
      }
      ClientMessage::GetVersion => Ok(Some(WorkerNotification::Version {
        version: self.version.clone(),
      })),
    }
  }

  /// Drain the outbox if `tag` is ours.
  pub async fn sync(&self, tag: &str) -> Result<Option<DrainReport>, WorkerError> {
    if tag != self.sync_tag {
      info!(tag, "ignoring sync for unknown tag");
      return Ok(None);
    }
    Ok(Some(self.outbox.drain().await?))
  }

  pub async fn handle_event(&mut self, event: WorkerEvent) -> Result<EventOutcome, WorkerError> {
    match event {
      WorkerEvent::Install => self.install().await.map(EventOutcome::State),
      WorkerEvent::Activate => self
        .take_over(LifecycleEvent::ControllerReleased)
        .await
        .map(EventOutcome::State),
      WorkerEvent::Fetch(request) => self.fetch(request).await.map(EventOutcome::Fetched),
      WorkerEvent::Message(message) => self.handle_message(message).await.map(EventOutcome::Reply),
      WorkerEvent::Sync(tag) => Ok(match self.sync(&tag).await? {
        Some(report) => EventOutcome::Drained(report),
        None => EventOutcome::SyncIgnored(tag),
      }),
      WorkerEvent::Push(payload) => Ok(EventOutcome::ShowNotification(Notification::from_push(
        payload.as_deref(),
      ))),
      WorkerEvent::NotificationClick(action) => {
        Ok(EventOutcome::Click(push::on_click(action.as_deref())))
      }
    }
  }
}
