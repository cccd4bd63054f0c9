//! Push-style notifications. "Displaying" one means emitting a log event.

use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotificationPayload {
  pub title: String,
  pub body: String,
  pub icon: Option<String>,
  pub tag: Option<String>,
  pub actions: Vec<NotificationAction>,
}

impl Default for NotificationPayload {
  fn default() -> Self {
    Self {
      title: "Dashboard".to_string(),
      body: "You have a new notification".to_string(),
      icon: Some("/icons/icon-192x192.png".to_string()),
      tag: None,
      actions: Vec::new(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

impl NotificationPayload {
  pub fn display(&self) {
    let actions: Vec<&str> = self.actions.iter().map(|a| a.action.as_str()).collect();
    info!(
      title = %self.title,
      body = %self.body,
      icon = self.icon.as_deref().unwrap_or(""),
      tag = self.tag.as_deref().unwrap_or(""),
      ?actions,
      "Notification"
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_fields_get_defaults() {
    let payload: NotificationPayload =
      serde_json::from_str(r#"{"body": "Ticket #42 escalated"}"#).unwrap();
    assert_eq!(payload.title, "Dashboard");
    assert_eq!(payload.body, "Ticket #42 escalated");
    assert!(payload.actions.is_empty());
  }

  #[test]
  fn test_actions() {
    let payload: NotificationPayload = serde_json::from_str(
      r#"{"title": "SLA", "tag": "sla", "actions": [{"action": "view", "title": "View"}]}"#,
    )
    .unwrap();
    assert_eq!(payload.tag.as_deref(), Some("sla"));
    assert_eq!(payload.actions[0].action, "view");
    payload.display();
  }
}
