//! Worker lifecycle as an explicit state machine.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
  /// Loaded, install not started
  Parsed,
  /// Precaching the manifest
  Installing,
  /// Installed; waiting while an older version still controls the page
  Installed,
  /// Cleaning up old buckets and claiming clients
  Activating,
  /// Serving fetch events
  Activated,
  /// Failed install or replaced by a newer version
  Redundant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  Install,
  InstallSucceeded,
  InstallFailed,
  /// Page asked the waiting worker to take over
  SkipWaiting,
  /// No older controller remains
  ControllerReleased,
  Activated,
  /// Cleanup or promotion failed; back to waiting so activation can be retried
  ActivationFailed,
  /// A newer version took over
  Superseded,
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
  state: WorkerState,
}

impl Default for Lifecycle {
  fn default() -> Self {
    Self::new()
  }
}

impl Lifecycle {
  pub fn new() -> Self {
    Self {
      state: WorkerState::Parsed,
    }
  }

  /// Resume a worker whose state was recorded by an earlier process.
  pub fn resume(state: WorkerState) -> Self {
    Self { state }
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn is_waiting(&self) -> bool {
    self.state == WorkerState::Installed
  }

  pub fn is_active(&self) -> bool {
    self.state == WorkerState::Activated
  }

  /// Apply `event`, returning the new state. Undefined transitions leave the
  /// state untouched.
  pub fn apply(&mut self, event: LifecycleEvent) -> Result<WorkerState, LifecycleError> {
    use LifecycleEvent as E;
    use WorkerState as S;

    let next = match (self.state, event) {
      (S::Parsed, E::Install) => S::Installing,
      (S::Installing, E::InstallSucceeded) => S::Installed,
      (S::Installing, E::InstallFailed) => S::Redundant,
      (S::Installed, E::SkipWaiting | E::ControllerReleased) => S::Activating,
      (S::Activating, E::Activated) => S::Activated,
      (S::Activating, E::ActivationFailed) => S::Installed,
      (S::Installed | S::Activated, E::Superseded) => S::Redundant,
      (state, event) => return Err(LifecycleError { state, event }),
    };

    info!(from = ?self.state, to = ?next, ?event, "worker state transition");
    self.state = next;
    Ok(next)
  }
}
