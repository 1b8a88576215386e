//! Routes intercepted requests to a caching strategy.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheSource, CacheStorage, Fallback};
use crate::config::Config;
use crate::error::{InstallError, NetworkError, StorageError};
use crate::net::{Method, Network, Request, Response};

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// Not intercepted: non-GET or non-HTTP (browser extension) requests
  Passthrough,
  /// Manifest entry or static asset: cache-first
  Static,
  /// Under the API prefix: network-first, offline response as last resort
  Api,
  /// Anything else: network-first, failure propagates
  Other,
}

impl Route {
  pub fn as_str(&self) -> &'static str {
    match self {
      Route::Passthrough => "passthrough",
      Route::Static => "static",
      Route::Api => "api",
      Route::Other => "other",
    }
  }
}

/// A served fetch event.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
  pub route: Route,
  pub response: Response,
  /// None for passthrough requests, which never touch the bucket
  pub source: Option<CacheSource>,
  /// Whether the bucket entry for this request was written with new content
  pub changed: bool,
  /// When the served copy was cached, for cache hits and fallbacks
  pub cached_at: Option<DateTime<Utc>>,
}

/// Classification rules derived from the configuration.
#[derive(Debug, Clone)]
pub struct RouteTable {
  origin: Url,
  api_prefix: String,
  manifest_paths: BTreeSet<String>,
  static_extensions: BTreeSet<String>,
}

impl RouteTable {
  pub fn classify(&self, request: &Request) -> Route {
    if request.method != Method::Get {
      return Route::Passthrough;
    }
    // chrome-extension:, moz-extension:, safari-web-extension:, data:, ...
    if !matches!(request.url.scheme(), "http" | "https") {
      return Route::Passthrough;
    }

    let same_origin = request.url.origin() == self.origin.origin();
    let path = request.path();

    if same_origin && self.manifest_paths.contains(path) {
      return Route::Static;
    }
    if same_origin && path.starts_with(&self.api_prefix) {
      return Route::Api;
    }
    if let Some(ext) = extension(path) {
      if self.static_extensions.contains(&ext) {
        return Route::Static;
      }
    }
    Route::Other
  }
}

fn extension(path: &str) -> Option<String> {
  let file = path.rsplit('/').next()?;
  let (stem, ext) = file.rsplit_once('.')?;
  if stem.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

/// Serves fetch events for one worker version from that version's bucket.
pub struct CacheRouter<S: CacheStorage, N: Network> {
  cache: CacheLayer<S>,
  network: Arc<N>,
  routes: RouteTable,
  manifest: Vec<Url>,
}

impl<S: CacheStorage, N: Network> CacheRouter<S, N> {
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Result<Self, InstallError> {
    let origin = config
      .origin_url()
      .map_err(|e| InstallError::InvalidManifest {
        entry: config.origin.clone(),
        reason: e.to_string(),
      })?;

    let manifest = config
      .manifest
      .iter()
      .map(|entry| {
        origin.join(entry).map_err(|e| InstallError::InvalidManifest {
          entry: entry.clone(),
          reason: e.to_string(),
        })
      })
      .collect::<Result<Vec<_>, _>>()?;

    let manifest_paths = manifest
      .iter()
      .filter(|url| url.origin() == origin.origin())
      .map(|url| url.path().to_string())
      .collect();

    Ok(Self {
      cache: CacheLayer::new(storage, config.bucket_name()),
      network,
      routes: RouteTable {
        origin,
        api_prefix: config.api_prefix.clone(),
        manifest_paths,
        static_extensions: config.static_extensions.clone(),
      },
      manifest,
    })
  }

  pub fn bucket(&self) -> &str {
    self.cache.bucket()
  }

  pub fn classify(&self, request: &Request) -> Route {
    self.routes.classify(request)
  }

  /// Precache the manifest into this version's bucket.
  ///
  /// Any unreachable entry fails the whole install and removes the bucket,
  /// so a worker never activates with a partial manifest.
  pub async fn install(&self) -> Result<usize, InstallError> {
    let requests = self.manifest.iter().cloned().map(Request::get).collect();
    let network = &self.network;

    match self.cache.precache(requests, |r| network.fetch(r)).await {
      Ok(count) => Ok(count),
      Err(e) => {
        warn!(bucket = %self.bucket(), error = %e, "install failed, discarding bucket");
        if let Err(cleanup) = self.cache.storage().delete_bucket(self.bucket()) {
          warn!(error = %cleanup, "failed to discard partial bucket");
        }
        Err(e)
      }
    }
  }

  /// Delete every bucket that does not belong to this version.
  ///
  /// Returns the names of the deleted buckets.
  pub fn activate(&self) -> Result<Vec<String>, StorageError> {
    let storage = self.cache.storage();
    let mut removed = Vec::new();

    for bucket in storage.buckets()? {
      if bucket != self.bucket() && storage.delete_bucket(&bucket)? {
        info!(bucket = %bucket, "deleted stale bucket");
        removed.push(bucket);
      }
    }

    Ok(removed)
  }

  /// Remove one request's entry from this version's bucket.
  pub fn evict(&self, request: &Request) -> Result<bool, StorageError> {
    let removed = self.cache.evict(request)?;
    if removed {
      info!(bucket = %self.bucket(), url = %request.url, "evicted cached response");
    }
    Ok(removed)
  }

  /// Serve one intercepted request.
  ///
  /// `Err` is only returned where the browser would reject the fetch too:
  /// passthrough and `Other` requests with no network and no cached copy.
  pub async fn handle_fetch(&self, request: Request) -> Result<FetchOutcome, NetworkError> {
    let route = self.classify(&request);
    debug!(route = route.as_str(), method = %request.method, url = %request.url, "fetch");

    let network = &self.network;
    let result = match route {
      Route::Passthrough => {
        let response = network.fetch(request).await?;
        return Ok(FetchOutcome {
          route,
          response,
          source: None,
          changed: false,
          cached_at: None,
        });
      }
      Route::Static => {
        self
          .cache
          .cache_first(&request, || network.fetch(request.clone()))
          .await?
      }
      Route::Api => {
        self
          .cache
          .network_first(&request, Fallback::Offline, || {
            network.fetch(request.clone())
          })
          .await?
      }
      Route::Other => {
        self
          .cache
          .network_first(&request, Fallback::Propagate, || {
            network.fetch(request.clone())
          })
          .await?
      }
    };

    Ok(FetchOutcome {
      route,
      response: result.response,
      source: Some(result.source),
      changed: result.changed,
      cached_at: result.cached_at,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::testing::ScriptedNetwork;

  const ORIGIN: &str = "https://bostarter.example";

  fn config(version: &str) -> Config {
    Config {
      version: version.to_string(),
      origin: ORIGIN.to_string(),
      manifest: vec!["/".to_string(), "/css/style.css".to_string(), "/js/main.js".to_string()],
      ..Config::default()
    }
  }

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  fn router(
    version: &str,
    storage: Arc<SqliteStorage>,
    net: Arc<ScriptedNetwork>,
  ) -> CacheRouter<SqliteStorage, ScriptedNetwork> {
    CacheRouter::new(&config(version), storage, net).unwrap()
  }

  fn script_manifest(net: &ScriptedNetwork) {
    net.ok(&format!("{}/", ORIGIN), "<html>shell</html>");
    net.ok(&format!("{}/css/style.css", ORIGIN), "body{}");
    net.ok(&format!("{}/js/main.js", ORIGIN), "main()");
  }

  #[test]
  fn test_classification() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let r = router("v1", storage, Arc::new(ScriptedNetwork::new()));

    assert_eq!(r.classify(&Request::get(url("/"))), Route::Static);
    assert_eq!(r.classify(&Request::get(url("/img/logo.PNG"))), Route::Static);
    assert_eq!(r.classify(&Request::get(url("/api/projects.php"))), Route::Api);
    assert_eq!(r.classify(&Request::get(url("/projects.php?id=3"))), Route::Other);
    assert_eq!(
      r.classify(&Request::new(Method::Post, url("/api/projects"))),
      Route::Passthrough
    );
    assert_eq!(
      r.classify(&Request::get(
        Url::parse("chrome-extension://abcdef/content.js").unwrap()
      )),
      Route::Passthrough
    );
    // Another origin's API is not ours
    assert_eq!(
      r.classify(&Request::get(Url::parse("https://other.example/api/x").unwrap())),
      Route::Other
    );
    assert_eq!(
      r.classify(&Request::get(Url::parse("https://cdn.example/font.woff2").unwrap())),
      Route::Static
    );
  }

  #[test]
  fn test_extension_parsing() {
    assert_eq!(extension("/a/b.min.JS"), Some("js".to_string()));
    assert_eq!(extension("/a/.hidden"), None);
    assert_eq!(extension("/a/"), None);
    assert_eq!(extension("/a/readme"), None);
  }

  #[tokio::test]
  async fn test_static_served_from_cache_after_install() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    script_manifest(&net);
    let r = router("v1", storage, net.clone());

    assert_eq!(r.install().await.unwrap(), 3);
    let before = net.calls().len();

    let a = r.handle_fetch(Request::get(url("/css/style.css"))).await.unwrap();
    let b = r.handle_fetch(Request::get(url("/css/style.css"))).await.unwrap();

    assert_eq!(a.source, Some(CacheSource::Cache));
    assert!(a.cached_at.is_some());
    assert_eq!(a.response.body, b.response.body);
    assert_eq!(net.calls().len(), before);
  }

  #[tokio::test]
  async fn test_evicted_asset_is_fetched_again() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    script_manifest(&net);
    let r = router("v1", storage, net.clone());
    r.install().await.unwrap();
    let style = format!("{}/css/style.css", ORIGIN);

    assert!(r.evict(&Request::get(url("/css/style.css"))).unwrap());
    assert!(!r.evict(&Request::get(url("/css/style.css"))).unwrap());

    net.ok(&style, "body{color:red}");
    let outcome = r.handle_fetch(Request::get(url("/css/style.css"))).await.unwrap();
    assert_eq!(outcome.source, Some(CacheSource::Network));
    assert_eq!(outcome.response.text(), "body{color:red}");
    assert_eq!(net.call_count(&style), 2);
  }

  #[tokio::test]
  async fn test_install_failure_leaves_no_bucket() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    script_manifest(&net);
    net.fail(&format!("{}/js/main.js", ORIGIN));
    let r = router("v1", storage.clone(), net);

    assert!(r.install().await.is_err());
    assert!(storage.buckets().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_activate_removes_only_other_versions() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    script_manifest(&net);

    storage
      .put("bostarter-v0", "GET old", &Response::new(200, "old"))
      .unwrap();
    storage
      .put("unrelated-cache", "GET x", &Response::new(200, "x"))
      .unwrap();

    let r = router("v1", storage.clone(), net);
    r.install().await.unwrap();
    let keys_before = storage.list_keys("bostarter-v1").unwrap();

    let mut removed = r.activate().unwrap();
    removed.sort();

    assert_eq!(removed, vec!["bostarter-v0".to_string(), "unrelated-cache".to_string()]);
    assert_eq!(storage.buckets().unwrap(), vec!["bostarter-v1".to_string()]);
    assert_eq!(storage.list_keys("bostarter-v1").unwrap(), keys_before);
  }

  #[tokio::test]
  async fn test_api_refresh_is_visible_offline() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    let r = router("v1", storage, net.clone());
    let api = format!("{}/api/projects", ORIGIN);

    net.ok(&api, r#"[{"id":1}]"#);
    r.handle_fetch(Request::get(url("/api/projects"))).await.unwrap();
    net.ok(&api, r#"[{"id":1},{"id":2}]"#);
    let fresh = r.handle_fetch(Request::get(url("/api/projects"))).await.unwrap();
    assert!(fresh.changed);

    net.go_offline();
    let offline = r.handle_fetch(Request::get(url("/api/projects"))).await.unwrap();
    assert_eq!(offline.source, Some(CacheSource::CacheFallback));
    assert_eq!(offline.response.text(), r#"[{"id":1},{"id":2}]"#);
  }

  #[tokio::test]
  async fn test_api_without_cache_answers_offline() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    let r = router("v1", storage, net);

    let outcome = r
      .handle_fetch(Request::get(url("/api/stats")))
      .await
      .unwrap();
    assert_eq!(outcome.source, Some(CacheSource::Offline));
    assert!(outcome.response.is_offline_signal());
  }

  #[tokio::test]
  async fn test_other_route_propagates_failure() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    let r = router("v1", storage, net);

    let err = r
      .handle_fetch(Request::get(url("/projects.php")))
      .await
      .unwrap_err();
    assert!(err.is_offline());
  }

  #[tokio::test]
  async fn test_post_is_forwarded_unmodified_and_never_cached() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let net = Arc::new(ScriptedNetwork::new());
    let api = format!("{}/api/projects", ORIGIN);
    net.ok(&api, r#"{"ok":true}"#);
    let r = router("v1", storage.clone(), net.clone());

    let request = Request::new(Method::Post, url("/api/projects"))
      .with_header("X-CSRF-Token", "abc")
      .with_body("title=Lamp");
    let outcome = r.handle_fetch(request.clone()).await.unwrap();

    assert_eq!(outcome.route, Route::Passthrough);
    assert_eq!(outcome.source, None);
    assert_eq!(net.calls(), vec![request]);
    assert!(storage.buckets().unwrap().is_empty());

    // Offline POST is not answered with a synthesized body
    net.go_offline();
    let err = r
      .handle_fetch(Request::new(Method::Post, url("/api/projects")))
      .await
      .unwrap_err();
    assert!(err.is_offline());
  }
}
