//! Request and response values passed between the router, the cache and the network.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use url::Url;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      other => Err(format!("unsupported HTTP method: {}", other)),
    }
  }
}

/// An outgoing request as seen by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Bytes>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Attach a JSON body and the matching content type.
  pub fn with_json(self, value: &serde_json::Value) -> Self {
    self
      .with_header("Content-Type", "application/json")
      .with_body(value.to_string())
  }

  /// Exact request key used for bucket lookups.
  ///
  /// Method plus absolute URL. The fragment never reaches the server and is
  /// dropped; the query string is significant and kept.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    format!("{} {}", self.method, url)
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }
}

/// A response, either from the network, from a bucket, or synthesized.
///
/// The body is a `Bytes` handle, so `clone()` is the "clone before consume"
/// of the browser cache API: the stored copy and the returned copy share the
/// same immutable buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self::new(status, value.to_string()).with_header("Content-Type", "application/json")
  }

  /// Structured "offline" answer for API reads that have no cached copy.
  pub fn offline() -> Self {
    Self::json(
      503,
      &serde_json::json!({
        "error": "Offline",
        "offline": true,
        "message": "You are offline and this content is not available in the cache.",
      }),
    )
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// 2xx status.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Whether this is the synthesized offline response.
  pub fn is_offline_signal(&self) -> bool {
    self.status == 503
      && serde_json::from_slice::<serde_json::Value>(&self.body)
        .map(|v| v.get("offline") == Some(&serde_json::Value::Bool(true)))
        .unwrap_or(false)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  #[test]
  fn test_cache_key_drops_fragment_keeps_query() {
    let a = Request::get(url("https://b.example/api/projects?page=2#top"));
    let b = Request::get(url("https://b.example/api/projects?page=2"));
    let c = Request::get(url("https://b.example/api/projects?page=3"));

    assert_eq!(a.cache_key(), b.cache_key());
    assert_ne!(a.cache_key(), c.cache_key());
    assert_eq!(a.cache_key(), "GET https://b.example/api/projects?page=2");
  }

  #[test]
  fn test_cache_key_includes_method() {
    let get = Request::get(url("https://b.example/x"));
    let head = Request::new(Method::Head, url("https://b.example/x"));
    assert_ne!(get.cache_key(), head.cache_key());
  }

  #[test]
  fn test_method_parse() {
    assert_eq!("post".parse::<Method>(), Ok(Method::Post));
    assert!("BREW".parse::<Method>().is_err());
  }

  #[test]
  fn test_offline_response_shape() {
    let response = Response::offline();
    assert_eq!(response.status, 503);
    assert_eq!(response.header("content-type"), Some("application/json"));
    assert!(response.is_offline_signal());
    assert!(!Response::new(503, "maintenance").is_offline_signal());
  }

  #[test]
  fn test_clone_shares_body() {
    let response = Response::new(200, "hello");
    let stored = response.clone();
    assert_eq!(stored.body.as_ptr(), response.body.as_ptr());
  }
}
