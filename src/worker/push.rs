//! Push notification display and click handling.

use serde::Serialize;

const TITLE: &str = "BOSTARTER";
const DEFAULT_BODY: &str = "There are new updates on BOSTARTER";
const ICON: &str = "/images/icon-192x192.png";
const BADGE: &str = "/images/badge-72x72.png";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationButton {
  pub action: &'static str,
  pub title: &'static str,
}

/// What the worker shows for an incoming push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
  pub title: &'static str,
  pub body: String,
  pub icon: &'static str,
  pub badge: &'static str,
  pub actions: Vec<NotificationButton>,
}

impl Notification {
  /// Build a notification from a plain-text push payload.
  pub fn from_push(payload: Option<&str>) -> Self {
    let body = payload
      .map(str::trim)
      .filter(|p| !p.is_empty())
      .unwrap_or(DEFAULT_BODY)
      .to_string();

    Self {
      title: TITLE,
      body,
      icon: ICON,
      badge: BADGE,
      actions: vec![
        NotificationButton {
          action: "explore",
          title: "Open BOSTARTER",
        },
        NotificationButton {
          action: "close",
          title: "Close",
        },
      ],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "url", rename_all = "snake_case")]
pub enum ClickOutcome {
  OpenWindow(String),
  Dismiss,
}

/// Resolve a notification click. A click on the body (no action) explores.
pub fn on_click(action: Option<&str>) -> ClickOutcome {
  match action {
    Some("close") => ClickOutcome::Dismiss,
    _ => ClickOutcome::OpenWindow("/".to_string()),
  }
}
