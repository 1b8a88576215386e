//! Network port: the `fetch` the worker falls through to.

mod client;
mod types;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::NetworkError;

pub use client::HttpNetwork;
pub use types::{Method, Request, Response};

/// Anything that can turn a request into a response.
///
/// Mirrors browser `fetch`: an HTTP error status is a successful fetch; only
/// transport failures are errors.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError>;
}

#[async_trait]
impl<N: Network + ?Sized> Network for Arc<N> {
  async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
    (**self).fetch(request).await
  }
}

#[cfg(test)]
pub mod testing {
  //! Scripted network fake shared by component tests.

  use std::collections::HashMap;
  use std::sync::Mutex;
  use std::time::Duration;

  use async_trait::async_trait;

  use super::{Method, Network, Request, Response};
  use crate::error::NetworkError;

  /// Network fake: answers from a per-URL script, records every call.
  #[derive(Default)]
  pub struct ScriptedNetwork {
    routes: Mutex<HashMap<String, Result<Response, NetworkError>>>,
    calls: Mutex<Vec<Request>>,
    latency: Mutex<Option<Duration>>,
  }

  impl ScriptedNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    /// Answer `url` (any method) with a 200 and `body`.
    pub fn ok(&self, url: &str, body: &str) {
      self.respond(url, Ok(Response::new(200, body.to_string())));
    }

    pub fn status(&self, url: &str, status: u16, body: &str) {
      self.respond(url, Ok(Response::new(status, body.to_string())));
    }

    pub fn fail(&self, url: &str) {
      self.respond(
        url,
        Err(NetworkError::Unreachable("connection refused".to_string())),
      );
    }

    pub fn respond(&self, url: &str, result: Result<Response, NetworkError>) {
      self.routes.lock().unwrap().insert(url.to_string(), result);
    }

    /// Delay every answer, so concurrent callers interleave at the fetch.
    pub fn set_latency(&self, latency: Duration) {
      *self.latency.lock().unwrap() = Some(latency);
    }

    /// Make every scripted URL fail, as if the host went offline.
    pub fn go_offline(&self) {
      let mut routes = self.routes.lock().unwrap();
      for result in routes.values_mut() {
        *result = Err(NetworkError::Unreachable("offline".to_string()));
      }
    }

    pub fn calls(&self) -> Vec<Request> {
      self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, url: &str) -> usize {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url.as_str() == url)
        .count()
    }

    pub fn calls_with_method(&self, method: Method) -> Vec<Request> {
      self
        .calls
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.method == method)
        .cloned()
        .collect()
    }
  }

  #[async_trait]
  impl Network for ScriptedNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetworkError> {
      let url = request.url.to_string();
      self.calls.lock().unwrap().push(request);
      let result = self
        .routes
        .lock()
        .unwrap()
        .get(&url)
        .cloned()
        .unwrap_or_else(|| Err(NetworkError::Unreachable(format!("no route for {}", url))));

      let latency = *self.latency.lock().unwrap();
      if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
      }
      result
    }
  }
}
