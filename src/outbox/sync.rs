//! Replays queued writes against the API.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OutboxError, ReplayFailure};
use crate::net::{Method, Network, Request};

use super::store::{OutboxStore, PendingOperation};

/// Header carrying the operation id so the backend can drop duplicate deliveries.
pub const OPERATION_ID_HEADER: &str = "X-Outbox-Operation-Id";

/// How long a drain may hold an entry before another drain can take it over.
const CLAIM_LEASE_SECS: i64 = 300;

/// Maps logical operation names to API endpoints.
#[derive(Debug, Clone)]
pub struct Endpoints {
  origin: Url,
  api_prefix: String,
  overrides: BTreeMap<String, String>,
}

impl Endpoints {
  pub fn new(origin: Url, api_prefix: impl Into<String>) -> Self {
    Self {
      origin,
      api_prefix: api_prefix.into(),
      overrides: BTreeMap::new(),
    }
  }

  pub fn from_config(config: &Config) -> Result<Self, OutboxError> {
    let origin = config.origin_url().map_err(|e| OutboxError::Endpoint {
      target: config.origin.clone(),
      reason: e.to_string(),
    })?;

    Ok(
      config
        .outbox
        .endpoints
        .iter()
        .fold(Self::new(origin, config.api_prefix.clone()), |endpoints, (target, path)| {
          endpoints.with_override(target.clone(), path.clone())
        }),
    )
  }

  pub fn with_override(mut self, target: impl Into<String>, path: impl Into<String>) -> Self {
    self.overrides.insert(target.into(), path.into());
    self
  }

  /// Configured path for `target`, else `{api_prefix}{target}`.
  pub fn resolve(&self, target: &str) -> Result<Url, OutboxError> {
    let path = match self.overrides.get(target) {
      Some(path) => path.clone(),
      None => format!("{}{}", self.api_prefix, target.trim_start_matches('/')),
    };

    self.origin.join(&path).map_err(|e| OutboxError::Endpoint {
      target: target.to_string(),
      reason: e.to_string(),
    })
  }
}

/// Outcome of one drain cycle.
#[derive(Debug, Default)]
pub struct DrainReport {
  /// Entries replayed successfully and removed
  pub delivered: usize,
  /// Entries that failed and stay queued for the next trigger
  pub retained: usize,
  /// Entries another drain was replaying; left to that drain
  pub in_flight: usize,
  /// Entries the server accepted that could not be removed; they will be replayed again
  pub unremoved: usize,
  pub failures: Vec<(PendingOperation, ReplayFailure)>,
}

/// Durable outbox of writes attempted while offline.
///
/// Delivery is at-least-once: an entry is removed only after the server
/// accepted it. Retry timing belongs to whoever calls `drain`.
///
/// Each entry is leased in the store before it is replayed, so drains in
/// other processes sharing the same database skip it.
pub struct OutboxSync<S: OutboxStore, N: Network> {
  store: Arc<S>,
  network: Arc<N>,
  endpoints: Endpoints,
  /// Lease owner id for this instance
  owner: String,
  /// Serializes drain cycles within this process.
  draining: Mutex<()>,
}

impl<S: OutboxStore, N: Network> OutboxSync<S, N> {
  pub fn new(store: Arc<S>, network: Arc<N>, endpoints: Endpoints) -> Self {
    Self {
      store,
      network,
      endpoints,
      owner: Uuid::new_v4().to_string(),
      draining: Mutex::new(()),
    }
  }

  /// Queue a write for later delivery.
  ///
  /// An `Err` means the operation was NOT saved and the user must be told.
  pub fn enqueue(&self, target: &str, payload: Value) -> Result<PendingOperation, OutboxError> {
    if target.trim().is_empty() {
      return Err(OutboxError::Endpoint {
        target: target.to_string(),
        reason: "empty operation name".to_string(),
      });
    }

    let operation = PendingOperation::new(target, payload);
    self.store.append(&operation)?;
    info!(id = %operation.id, target, "queued pending operation");
    Ok(operation)
  }

  pub fn pending(&self) -> Result<Vec<PendingOperation>, OutboxError> {
    self.store.pending()
  }

  pub fn len(&self) -> Result<usize, OutboxError> {
    Ok(self.store.len()?)
  }

  /// Replay every queued operation once, in insertion order.
  ///
  /// A failing entry is kept and the drain moves on to the next one. An
  /// unreadable store aborts the cycle with `Err`.
  pub async fn drain(&self) -> Result<DrainReport, OutboxError> {
    let _guard = self.draining.lock().await;

    let pending = self.store.pending().map_err(|e| {
      warn!(error = %e, "outbox unreadable, aborting drain cycle");
      e
    })?;

    let mut report = DrainReport::default();
    if pending.is_empty() {
      debug!("outbox empty, nothing to drain");
      return Ok(report);
    }

    for operation in pending {
      let until = Utc::now() + chrono::Duration::seconds(CLAIM_LEASE_SECS);
      match self.store.claim(operation.id, &self.owner, until) {
        Ok(true) => {}
        Ok(false) => {
          debug!(id = %operation.id, "operation claimed by another drain, skipping");
          report.in_flight += 1;
          continue;
        }
        Err(e) => {
          warn!(id = %operation.id, error = %e, "could not claim operation, keeping it");
          report.retained += 1;
          report
            .failures
            .push((operation, ReplayFailure::Storage(e.to_string())));
          continue;
        }
      }

      match self.replay(&operation).await {
        Ok(()) => match self.store.remove(operation.id) {
          Ok(_) => report.delivered += 1,
          Err(e) => {
            // Replayed again later; the id header lets the server dedupe.
            warn!(id = %operation.id, error = %e, "delivered but could not remove");
            self.release(&operation);
            report.unremoved += 1;
          }
        },
        Err(failure) => {
          warn!(id = %operation.id, target = %operation.target, error = %failure, "replay failed, keeping operation");
          self.release(&operation);
          report.retained += 1;
          report.failures.push((operation, failure));
        }
      }
    }

    info!(
      delivered = report.delivered,
      retained = report.retained,
      in_flight = report.in_flight,
      unremoved = report.unremoved,
      "outbox drain finished"
    );
    Ok(report)
  }

  fn release(&self, operation: &PendingOperation) {
    if let Err(e) = self.store.release(operation.id, &self.owner) {
      warn!(id = %operation.id, error = %e, "could not release claim, entry waits for the lease to expire");
    }
  }

  async fn replay(&self, operation: &PendingOperation) -> Result<(), ReplayFailure> {
    let url = self
      .endpoints
      .resolve(&operation.target)
      .map_err(|e| ReplayFailure::Endpoint(e.to_string()))?;

    let request = Request::new(Method::Post, url)
      .with_header(OPERATION_ID_HEADER, operation.id.to_string())
      .with_json(&operation.payload);

    let response = self
      .network
      .fetch(request)
      .await
      .map_err(ReplayFailure::Network)?;

    if response.is_ok() {
      debug!(id = %operation.id, status = response.status, "replayed operation");
      Ok(())
    } else {
      Err(ReplayFailure::Rejected {
        status: response.status,
      })
    }
  }
}
