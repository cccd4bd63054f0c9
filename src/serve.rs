//! JSON-lines front-end for the worker: one message per stdin line, one
//! reply per stdout line.

use color_eyre::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::admin::AdminCommand;
use crate::config::Config;
use crate::http::Request;
use crate::notify::NotificationPayload;
use crate::sync::Delivery;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HostMessage {
  Admin(AdminCommand),
  Worker(WorkerMessage),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  Fetch {
    url: String,
    /// GET, or POST when a body is present
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    body: Option<Value>,
    /// Sync tag for mutations that should be queued when offline
    #[serde(default)]
    tag: Option<String>,
  },
  SyncRegister {
    tag: String,
    #[serde(default)]
    payload: Value,
  },
  Sync,
  Push {
    #[serde(default)]
    payload: NotificationPayload,
  },
}

/// Read messages from stdin until EOF.
pub async fn run(handle: &WorkerHandle, config: &Config) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  let mut stdout = tokio::io::stdout();

  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    let reply = respond(handle, config, &line).await;
    stdout.write_all(format!("{}\n", reply).as_bytes()).await?;
    stdout.flush().await?;
  }

  Ok(())
}

/// Answer one message line. Every line gets a reply.
pub async fn respond(handle: &WorkerHandle, config: &Config, line: &str) -> Value {
  let message: HostMessage = match serde_json::from_str(line) {
    Ok(message) => message,
    Err(e) => return json!({ "error": format!("Invalid message: {}", e) }),
  };
  debug!(?message, "Host message");

  let result = match message {
    HostMessage::Admin(command) => return json!(handle.admin(command).await),
    HostMessage::Worker(WorkerMessage::Fetch {
      url,
      method,
      body,
      tag,
    }) => fetch(handle, config, &url, method.as_deref(), body, tag).await,
    HostMessage::Worker(WorkerMessage::SyncRegister { tag, payload }) => handle
      .register_sync(&tag, payload)
      .await
      .map(|id| json!({ "success": true, "id": id })),
    HostMessage::Worker(WorkerMessage::Sync) => handle.sync().await.map(|report| json!(report)),
    HostMessage::Worker(WorkerMessage::Push { payload }) => {
      handle.push(payload).map(|()| json!({ "success": true }))
    }
  };

  result.unwrap_or_else(|e| json!({ "error": e.to_string() }))
}

async fn fetch(
  handle: &WorkerHandle,
  config: &Config,
  url: &str,
  method: Option<&str>,
  body: Option<Value>,
  tag: Option<String>,
) -> Result<Value> {
  let url = config.resolve(url)?;
  let request = Request::compose(method, url, body.as_ref())?;

  if let (false, Some(tag)) = (request.is_get(), tag) {
    return Ok(match handle.mutate(&tag, request).await? {
      Delivery::Sent(response) => json!({ "status": response.status }),
      Delivery::Queued(id) => json!({ "queued": id }),
    });
  }

  let served = handle.fetch(request).await?;
  Ok(json!({
    "status": served.response.status,
    "servedFrom": served.source,
    "bytes": served.response.body.len(),
    "cachedAt": served.cached_at,
  }))
}
