use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Environment variable that overrides `origin`.
const ORIGIN_ENV: &str = "BOSTARTER_SW_ORIGIN";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Build-time asset version. Changing it is the only way to invalidate old buckets.
  pub version: String,
  /// Bucket names are `{cache_prefix}-{version}`
  pub cache_prefix: String,
  /// Origin of the backend that the worker fronts
  pub origin: String,
  /// Requests whose path starts with this prefix are served network-first
  pub api_prefix: String,
  /// Critical assets precached on install, in order
  pub manifest: Vec<String>,
  /// File extensions (without dot) served cache-first
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub static_extensions: BTreeSet<String>,
  pub network_timeout_secs: u64,
  /// Background-sync tag that drains the outbox
  pub sync_tag: String,
  /// Interval of the emulated background-sync scheduler in `watch` mode
  pub sync_interval_secs: u64,
  /// SQLite database path (default: $XDG_DATA_HOME/bostarter-sw/worker.db)
  pub storage_path: Option<PathBuf>,
  /// Directory for daily rolling log files; stderr only when unset
  pub log_dir: Option<PathBuf>,
  pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboxConfig {
  /// Logical operation name -> endpoint path. Unmapped targets go to `{api_prefix}{target}`.
  #[serde(default)]
  pub endpoints: BTreeMap<String, String>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      cache_prefix: "bostarter".to_string(),
      origin: "http://localhost:8080".to_string(),
      api_prefix: "/api/".to_string(),
      manifest: [
        "/",
        "/index.php",
        "/css/style.css",
        "/js/main.js",
        "/js/theme.js",
        "/js/notifications.js",
        "/manifest.json",
        "/images/icon-192x192.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      static_extensions: [
        "css", "js", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      network_timeout_secs: 10,
      sync_tag: "sync-pending-operations".to_string(),
      sync_interval_secs: 30,
      storage_path: None,
      log_dir: None,
      outbox: OutboxConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./bostarter-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/bostarter-sw/config.yaml
  /// 4. Built-in defaults
  ///
  /// `BOSTARTER_SW_ORIGIN` overrides `origin` in every case.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var(ORIGIN_ENV) {
      config.origin = origin;
    }

    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("bostarter-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("bostarter-sw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.version.trim().is_empty() {
      return Err(eyre!("`version` must not be empty"));
    }
    if !self.api_prefix.starts_with('/') {
      return Err(eyre!(
        "`api_prefix` must be an absolute path, got {:?}",
        self.api_prefix
      ));
    }
    self.origin_url()?;
    Ok(())
  }

  /// Name of the bucket owned by this version.
  pub fn bucket_name(&self) -> String {
    format!("{}-{}", self.cache_prefix, self.version)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {:?}: {}", self.origin, e))
  }

  /// Resolve an absolute URL or an origin-relative path.
  pub fn resolve(&self, input: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(input) {
      return Ok(url);
    }
    self
      .origin_url()?
      .join(input)
      .map_err(|e| eyre!("Invalid URL {:?}: {}", input, e))
  }

  pub fn network_timeout(&self) -> Duration {
    Duration::from_secs(self.network_timeout_secs)
  }

  pub fn sync_interval(&self) -> Duration {
    Duration::from_secs(self.sync_interval_secs.max(1))
  }

  /// Get the SQLite database path, falling back to the user data directory.
  pub fn storage_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.storage_path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("bostarter-sw").join("worker.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.bucket_name(), "bostarter-v1");
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      r#"
version: "2024.05.1"
origin: "https://bostarter.example"
static_extensions: [".CSS", "js"]
outbox:
  endpoints:
    create_project: /api/projects/create.php
"#,
    )
    .unwrap();

    assert_eq!(config.version, "2024.05.1");
    assert_eq!(config.api_prefix, "/api/");
    assert!(config.static_extensions.contains("css"));
    assert!(config.static_extensions.contains("js"));
    assert_eq!(config.static_extensions.len(), 2);
    assert_eq!(
      config.outbox.endpoints.get("create_project").map(String::as_str),
      Some("/api/projects/create.php")
    );
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let config = Config {
      origin: "https://bostarter.example".to_string(),
      ..Config::default()
    };

    assert_eq!(
      config.resolve("/api/projects").unwrap().as_str(),
      "https://bostarter.example/api/projects"
    );
    assert_eq!(
      config.resolve("https://cdn.example/x.js").unwrap().as_str(),
      "https://cdn.example/x.js"
    );
  }

  #[test]
  fn test_relative_api_prefix_is_rejected() {
    let config = Config {
      api_prefix: "api/".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }
}
