//! Outcome types for the caching strategies.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// Result from a cache operation, including the response and where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The response handed back to the caller
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the entry was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// Whether this call wrote a new or different entry into the bucket
  pub changed: bool,
}

impl CacheResult {
  /// Fresh data from the network.
  pub fn from_network(response: Response, changed: bool) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
      changed,
    }
  }

  /// Cache hit on a cache-first route.
  pub fn from_cache(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
      changed: false,
    }
  }

  /// Network failed, serving what the bucket had.
  pub fn fallback(response: Response, cached_at: DateTime<Utc>) -> Self {
    Self {
      response,
      source: CacheSource::CacheFallback,
      cached_at: Some(cached_at),
      changed: false,
    }
  }

  /// Network failed and nothing was cached.
  pub fn offline() -> Self {
    Self {
      response: Response::offline(),
      source: CacheSource::Offline,
      cached_at: None,
      changed: false,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Cache hit, network not consulted
  Cache,
  /// Network unavailable, serving cached data
  CacheFallback,
  /// Network unavailable and nothing cached; synthesized offline response
  Offline,
}

impl CacheSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      CacheSource::Network => "network",
      CacheSource::Cache => "cache",
      CacheSource::CacheFallback => "cache-fallback",
      CacheSource::Offline => "offline",
    }
  }
}

/// What to do when the network fails and the bucket has no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
  /// Answer with the structured offline response
  Offline,
  /// Hand the network error back to the caller
  Propagate,
}
