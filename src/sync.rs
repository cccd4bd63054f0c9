//! Deferred mutation queue ("background sync").
//!
//! Tasks are persisted through a [`SyncStore`] and delivered in creation order
//! by POSTing `{"tag", "payload"}` to a fixed endpoint. Delivery is strictly
//! head-of-line: the first failing task stops the drain, leaving it and every
//! later task queued for the next trigger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::SyncStore;
use crate::error::{GatewayError, GatewayResult};
use crate::http::{Request, Response};
use crate::network::Network;

/// A mutation waiting to reach the server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncTask {
  pub id: i64,
  pub tag: String,
  pub payload: serde_json::Value,
  pub created_at: DateTime<Utc>,
}

/// Outcome of a drain trigger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
  pub delivered: usize,
  pub pending: usize,
  /// Another drain was running; this trigger was folded into it
  pub coalesced: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub failure: Option<String>,
}

/// Result of [`SyncQueue::send_or_queue`].
#[derive(Debug)]
pub enum Delivery {
  Sent(Response),
  Queued(i64),
}

pub struct SyncQueue<S: SyncStore, N: Network> {
  store: Arc<S>,
  network: Arc<N>,
  endpoint: Url,
  draining: Mutex<()>,
  rerun: AtomicBool,
}

impl<S: SyncStore, N: Network> SyncQueue<S, N> {
  pub fn new(store: Arc<S>, network: Arc<N>, endpoint: Url) -> Self {
    Self {
      store,
      network,
      endpoint,
      draining: Mutex::new(()),
      rerun: AtomicBool::new(false),
    }
  }

  /// Persist a task. Works offline; fails only if the store is unavailable.
  pub fn register(&self, tag: &str, payload: serde_json::Value) -> GatewayResult<i64> {
    let id = self
      .store
      .push_task(tag, &payload)
      .map_err(GatewayError::unavailable)?;
    debug!(id, tag, "Registered sync task");
    Ok(id)
  }

  pub fn pending(&self, tag: Option<&str>) -> GatewayResult<Vec<SyncTask>> {
    self
      .store
      .pending_tasks(tag)
      .map_err(GatewayError::unavailable)
  }

  /// Send a mutation now, or queue it under `tag` if the network is unreachable.
  ///
  /// A response with an error status still counts as sent: the server was reached.
  pub async fn send_or_queue(&self, tag: &str, request: &Request) -> GatewayResult<Delivery> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(Delivery::Sent(response)),
      Err(e) => {
        info!(url = %request.url, error = %e, "Mutation failed, queueing for sync");
        let body = request
          .body
          .as_deref()
          .map(|b| {
            serde_json::from_slice(b)
              .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(b).into()))
          })
          .unwrap_or(serde_json::Value::Null);
        let payload = json!({
          "method": request.method,
          "url": request.url.as_str(),
          "body": body,
        });
        Ok(Delivery::Queued(self.register(tag, payload)?))
      }
    }
  }

  /// Deliver pending tasks in creation order.
  ///
  /// A trigger arriving while another drain is running is coalesced: it
  /// returns at once and the running drain makes one more pass afterwards.
  pub async fn drain(&self) -> GatewayResult<DrainReport> {
    let mut report = DrainReport::default();

    loop {
      let guard = match self.draining.try_lock() {
        Ok(guard) => guard,
        Err(_) => {
          self.rerun.store(true, Ordering::SeqCst);
          // The holder may have checked the flag and released in between
          match self.draining.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
              debug!("Drain already running, coalescing trigger");
              report.coalesced = true;
              break;
            }
          }
        }
      };

      self.rerun.store(false, Ordering::SeqCst);
      let failed = self.drain_once(&mut report).await?;
      // Release before looking at the flag, so a trigger that lands after
      // this check finds the lock free and drains on its own
      drop(guard);

      if failed || !self.rerun.load(Ordering::SeqCst) {
        break;
      }
      debug!("Drain re-triggered while running, making another pass");
    }

    report.pending = self.pending(None)?.len();
    Ok(report)
  }

  /// One pass over the queue. Returns true if a delivery failed.
  async fn drain_once(&self, report: &mut DrainReport) -> GatewayResult<bool> {
    for task in self.pending(None)? {
      match self.deliver(&task).await {
        Ok(()) => {
          self
            .store
            .delete_task(task.id)
            .map_err(GatewayError::unavailable)?;
          report.delivered += 1;
          debug!(id = task.id, tag = %task.tag, "Delivered sync task");
        }
        Err(e) => {
          warn!(error = %e, "Sync delivery failed, keeping remaining tasks queued");
          report.failure = Some(e.to_string());
          return Ok(true);
        }
      }
    }

    Ok(false)
  }

  async fn deliver(&self, task: &SyncTask) -> GatewayResult<()> {
    let body = json!({ "tag": task.tag, "payload": task.payload });
    let request = Request::post_json(self.endpoint.clone(), &body);

    let failed = |reason: String| GatewayError::SyncDeliveryFailed {
      id: task.id,
      tag: task.tag.clone(),
      reason,
    };

    match self.network.fetch(&request).await {
      Ok(resp) if resp.is_success() => Ok(()),
      Ok(resp) => Err(failed(format!("server answered {}", resp.status))),
      Err(e) => Err(failed(e.to_string())),
    }
  }
}
