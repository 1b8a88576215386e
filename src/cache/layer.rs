//! Cache layer that orchestrates caching strategies with network fetching.

use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{InstallError, NetworkError, StorageError};
use crate::net::{Request, Response};

use super::result::{CacheResult, Fallback};
use super::storage::{CacheStorage, CachedResponse};

/// Cache layer bound to one bucket.
///
/// Storage failures while serving are logged and treated as misses; only the
/// network outcome decides whether a request fails.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  bucket: String,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(storage: Arc<S>, bucket: impl Into<String>) -> Self {
    Self {
      storage,
      bucket: bucket.into(),
    }
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  /// Drop the cached response for `request`. Returns whether one existed.
  pub fn evict(&self, request: &Request) -> Result<bool, StorageError> {
    self.storage.delete(&self.bucket, &request.cache_key())
  }

  fn lookup(&self, key: &str) -> Option<CachedResponse> {
    match self.storage.get(&self.bucket, key) {
      Ok(found) => found,
      Err(e) => {
        warn!(bucket = %self.bucket, key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Store `copy` under `key` if it is cacheable. Callers pass a clone taken
  /// before the original is handed back.
  ///
  /// Returns whether the bucket content for `key` changed.
  fn store(&self, key: &str, copy: Response, previous: Option<&CachedResponse>) -> bool {
    if !copy.is_ok() {
      debug!(key, status = copy.status, "not caching non-ok response");
      return false;
    }

    let changed = previous.map_or(true, |p| p.response.body != copy.body);
    match self.storage.put(&self.bucket, key, &copy) {
      Ok(()) => changed,
      Err(e) => {
        warn!(bucket = %self.bucket, key, error = %e, "cache write failed");
        false
      }
    }
  }

  /// Cache-first strategy.
  ///
  /// 1. Check cache - if present, return it without touching the network
  /// 2. Otherwise fetch, store a clone, and return the network response
  pub async fn cache_first<F, Fut>(
    &self,
    request: &Request,
    fetcher: F,
  ) -> Result<CacheResult, NetworkError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, NetworkError>>,
  {
    let key = request.cache_key();

    if let Some(cached) = self.lookup(&key) {
      debug!(key, "cache hit");
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let response = fetcher().await?;
    let changed = self.store(&key, response.clone(), None);
    Ok(CacheResult::from_network(response, changed))
  }

  /// Network-first strategy.
  ///
  /// 1. Fetch from network - on success store a clone and return it
  /// 2. On network failure, return the cached entry for this exact key
  /// 3. With nothing cached, apply `fallback`
  pub async fn network_first<F, Fut>(
    &self,
    request: &Request,
    fallback: Fallback,
    fetcher: F,
  ) -> Result<CacheResult, NetworkError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response, NetworkError>>,
  {
    let key = request.cache_key();

    match fetcher().await {
      Ok(response) => {
        let previous = self.lookup(&key);
        let changed = self.store(&key, response.clone(), previous.as_ref());
        Ok(CacheResult::from_network(response, changed))
      }
      Err(e) => match self.lookup(&key) {
        Some(cached) => {
          warn!(key, error = %e, "network failed, serving cached copy");
          Ok(CacheResult::fallback(cached.response, cached.cached_at))
        }
        None => match fallback {
          Fallback::Offline => {
            warn!(key, error = %e, "network failed and nothing cached, answering offline");
            Ok(CacheResult::offline())
          }
          Fallback::Propagate => Err(e),
        },
      },
    }
  }

  /// Fetch every request and store all responses, or store nothing.
  ///
  /// Fetches run concurrently; the first failure aborts the whole batch
  /// before any write happens.
  pub async fn precache<F, Fut>(
    &self,
    requests: Vec<Request>,
    fetcher: F,
  ) -> Result<usize, InstallError>
  where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response, NetworkError>>,
  {
    let fetches = requests.into_iter().map(|request| {
      let url = request.url.to_string();
      let key = request.cache_key();
      let fut = fetcher(request);
      async move {
        let response = fut
          .await
          .map_err(|source| InstallError::Unreachable {
            url: url.clone(),
            source,
          })?;
        if !response.is_ok() {
          return Err(InstallError::BadStatus {
            url,
            status: response.status,
          });
        }
        Ok((key, response))
      }
    });

    let fetched = try_join_all(fetches).await?;

    self.storage.open_bucket(&self.bucket)?;
    for (key, response) in &fetched {
      self.storage.put(&self.bucket, key, response)?;
    }

    info!(bucket = %self.bucket, entries = fetched.len(), "precached manifest");
    Ok(fetched.len())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::net::testing::ScriptedNetwork;
  use crate::net::Network;
  use url::Url;

  fn layer() -> CacheLayer<SqliteStorage> {
    CacheLayer::new(Arc::new(SqliteStorage::open_in_memory().unwrap()), "test-v1")
  }

  fn get(url: &str) -> Request {
    Request::get(Url::parse(url).unwrap())
  }

  #[tokio::test]
  async fn test_cache_first_second_call_skips_network() {
    let layer = layer();
    let net = ScriptedNetwork::new();
    net.ok("https://b.example/js/main.js", "console.log(1)");
    let request = get("https://b.example/js/main.js");

    let first = layer
      .cache_first(&request, || net.fetch(request.clone()))
      .await
      .unwrap();
    let second = layer
      .cache_first(&request, || net.fetch(request.clone()))
      .await
      .unwrap();

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(first.response.body, second.response.body);
    assert_eq!(net.call_count("https://b.example/js/main.js"), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_errors() {
    let layer = layer();
    let net = ScriptedNetwork::new();
    net.status("https://b.example/missing.css", 404, "nope");
    let request = get("https://b.example/missing.css");

    let result = layer
      .cache_first(&request, || net.fetch(request.clone()))
      .await
      .unwrap();
    assert_eq!(result.response.status, 404);
    assert!(!result.changed);

    layer
      .cache_first(&request, || net.fetch(request.clone()))
      .await
      .unwrap();
    assert_eq!(net.call_count("https://b.example/missing.css"), 2);
  }

  #[tokio::test]
  async fn test_network_first_refreshes_then_falls_back() {
    let layer = layer();
    let net = ScriptedNetwork::new();
    let url = "https://b.example/api/projects";
    let request = get(url);

    net.ok(url, "[1]");
    let a = layer
      .network_first(&request, Fallback::Offline, || net.fetch(request.clone()))
      .await
      .unwrap();
    assert!(a.changed);

    net.ok(url, "[1,2]");
    let b = layer
      .network_first(&request, Fallback::Offline, || net.fetch(request.clone()))
      .await
      .unwrap();
    assert!(b.changed);

    net.fail(url);
    let c = layer
      .network_first(&request, Fallback::Offline, || net.fetch(request.clone()))
      .await
      .unwrap();
    assert_eq!(c.source, CacheSource::CacheFallback);
    assert_eq!(c.response.text(), "[1,2]");
  }

  #[tokio::test]
  async fn test_network_first_unchanged_body_is_not_a_change() {
    let layer = layer();
    let net = ScriptedNetwork::new();
    let url = "https://b.example/api/stats";
    let request = get(url);
    net.ok(url, "{}");

    let first = layer
      .network_first(&request, Fallback::Offline, || net.fetch(request.clone()))
      .await
      .unwrap();
    let second = layer
      .network_first(&request, Fallback::Offline, || net.fetch(request.clone()))
      .await
      .unwrap();
    assert!(first.changed);
    assert!(!second.changed);
  }

  #[tokio::test]
  async fn test_network_first_fallback_policies() {
    let layer = layer();
    let net = ScriptedNetwork::new();
    let request = get("https://b.example/api/nothing");

    let offline = layer
      .network_first(&request, Fallback::Offline, || net.fetch(request.clone()))
      .await
      .unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert!(offline.response.is_offline_signal());

    let propagated = layer
      .network_first(&request, Fallback::Propagate, || net.fetch(request.clone()))
      .await;
    assert!(matches!(propagated, Err(NetworkError::Unreachable(_))));
  }

  #[tokio::test]
  async fn test_precache_is_all_or_nothing() {
    let layer = layer();
    let net = ScriptedNetwork::new();
    net.ok("https://b.example/", "<html>");
    net.fail("https://b.example/css/style.css");

    let requests = vec![
      get("https://b.example/"),
      get("https://b.example/css/style.css"),
    ];
    let err = layer
      .precache(requests, |r| net.fetch(r))
      .await
      .unwrap_err();

    assert!(matches!(err, InstallError::Unreachable { .. }));
    assert!(layer.storage().buckets().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_precache_rejects_bad_status() {
    let layer = layer();
    let net = ScriptedNetwork::new();
    net.status("https://b.example/js/main.js", 500, "boom");

    let err = layer
      .precache(vec![get("https://b.example/js/main.js")], |r| net.fetch(r))
      .await
      .unwrap_err();
    assert!(matches!(err, InstallError::BadStatus { status: 500, .. }));
  }
}
