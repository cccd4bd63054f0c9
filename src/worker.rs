//! Message-driven worker owning the gateway.
//!
//! The host never touches gateway state directly: it sends [`Event`]s through
//! a [`WorkerHandle`] and gets replies back on oneshot channels. Fetches and
//! drains run as their own tasks so slow requests interleave; administrative
//! commands are answered in the same turn they arrive.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::admin::{AdminCommand, AdminReply};
use crate::cache::{CacheStorage, Served, SyncStore};
use crate::error::GatewayResult;
use crate::gateway::CacheGateway;
use crate::http::Request;
use crate::network::Network;
use crate::notify::NotificationPayload;
use crate::sync::{Delivery, DrainReport, SyncTask};

/// Worker events
#[derive(Debug)]
pub enum Event {
  /// Intercepted request
  Fetch {
    request: Request,
    reply: oneshot::Sender<GatewayResult<Served>>,
  },
  /// Mutation that is queued for sync if the network is down
  Mutate {
    tag: String,
    request: Request,
    reply: oneshot::Sender<GatewayResult<Delivery>>,
  },
  Admin {
    command: AdminCommand,
    reply: oneshot::Sender<AdminReply>,
  },
  RegisterSync {
    tag: String,
    payload: serde_json::Value,
    reply: oneshot::Sender<GatewayResult<i64>>,
  },
  Pending {
    tag: Option<String>,
    reply: oneshot::Sender<GatewayResult<Vec<SyncTask>>>,
  },
  /// Sync trigger, e.g. connectivity restored
  Sync {
    reply: oneshot::Sender<GatewayResult<DrainReport>>,
  },
  Push(NotificationPayload),
  /// Wait for background work, then stop
  Shutdown,
}

/// Sending side of the worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<Event>,
}

pub struct Worker;

impl Worker {
  /// Move the gateway into a worker task. A tick every `sync_interval` wakes
  /// the sync queue.
  pub fn spawn<S, N>(gateway: CacheGateway<S, N>, sync_interval: Duration) -> (WorkerHandle, JoinHandle<()>)
  where
    S: CacheStorage + SyncStore,
    N: Network,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let gateway = Arc::new(gateway);

    let task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(sync_interval);
      // The first tick fires immediately; skip it
      ticker.tick().await;

      loop {
        tokio::select! {
          event = rx.recv() => match event {
            Some(Event::Shutdown) | None => break,
            Some(event) => dispatch(&gateway, event).await,
          },
          _ = ticker.tick() => {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
              match gateway.drain_sync().await {
                Ok(report) if report.delivered > 0 => {
                  info!(delivered = report.delivered, pending = report.pending, "Periodic sync")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Periodic sync failed"),
              }
            });
          }
        }
      }

      gateway.settle().await;
      debug!("Worker stopped");
    });

    (WorkerHandle { tx }, task)
  }
}

async fn dispatch<S, N>(gateway: &Arc<CacheGateway<S, N>>, event: Event)
where
  S: CacheStorage + SyncStore,
  N: Network,
{
  match event {
    Event::Fetch { request, reply } => {
      let gateway = Arc::clone(gateway);
      tokio::spawn(async move {
        // The fetch completes even if the caller has gone away
        let _ = reply.send(gateway.handle(&request).await);
      });
    }
    Event::Mutate {
      tag,
      request,
      reply,
    } => {
      let gateway = Arc::clone(gateway);
      tokio::spawn(async move {
        let _ = reply.send(gateway.sync().send_or_queue(&tag, &request).await);
      });
    }
    Event::Admin { command, reply } => {
      let _ = reply.send(gateway.admin(command).await);
    }
    Event::RegisterSync {
      tag,
      payload,
      reply,
    } => {
      let _ = reply.send(gateway.register_sync(&tag, payload));
    }
    Event::Pending { tag, reply } => {
      let _ = reply.send(gateway.sync().pending(tag.as_deref()));
    }
    Event::Sync { reply } => {
      let gateway = Arc::clone(gateway);
      tokio::spawn(async move {
        let _ = reply.send(gateway.drain_sync().await);
      });
    }
    Event::Push(payload) => payload.display(),
    Event::Shutdown => {}
  }
}

impl WorkerHandle {
  fn send(&self, event: Event) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker has stopped"))
  }

  async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Event) -> Result<T> {
    let (reply, rx) = oneshot::channel();
    self.send(make(reply))?;
    rx.await.map_err(|_| eyre!("Worker dropped the request"))
  }

  pub async fn fetch(&self, request: Request) -> Result<Served> {
    let served = self
      .request(|reply| Event::Fetch { request, reply })
      .await??;
    Ok(served)
  }

  pub async fn mutate(&self, tag: &str, request: Request) -> Result<Delivery> {
    let tag = tag.to_string();
    let delivery = self
      .request(|reply| Event::Mutate {
        tag,
        request,
        reply,
      })
      .await??;
    Ok(delivery)
  }

  /// Always yields a reply, even when the worker is gone.
  pub async fn admin(&self, command: AdminCommand) -> AdminReply {
    match self.request(|reply| Event::Admin { command, reply }).await {
      Ok(reply) => reply,
      Err(e) => AdminReply::Error {
        error: e.to_string(),
      },
    }
  }

  pub async fn register_sync(&self, tag: &str, payload: serde_json::Value) -> Result<i64> {
    let tag = tag.to_string();
    let id = self
      .request(|reply| Event::RegisterSync {
        tag,
        payload,
        reply,
      })
      .await??;
    Ok(id)
  }

  pub async fn pending(&self, tag: Option<String>) -> Result<Vec<SyncTask>> {
    let tasks = self.request(|reply| Event::Pending { tag, reply }).await??;
    Ok(tasks)
  }

  pub async fn sync(&self) -> Result<DrainReport> {
    let report = self.request(|reply| Event::Sync { reply }).await??;
    Ok(report)
  }

  pub fn push(&self, payload: NotificationPayload) -> Result<()> {
    self.send(Event::Push(payload))
  }

  pub fn shutdown(&self) -> Result<()> {
    self.send(Event::Shutdown)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{SqliteStorage, Source};
  use crate::config::Config;
  use crate::error::GatewayError;
  use crate::testing::{get, FakeNetwork, Reply};
  use serde_json::json;

  async fn worker(network: &FakeNetwork, interval: Duration) -> (WorkerHandle, JoinHandle<()>) {
    let mut config = Config::default();
    config.precache = Vec::new();
    let storage = SqliteStorage::open_in_memory().unwrap();
    let gateway = CacheGateway::activate(config, storage, network.clone())
      .await
      .unwrap();
    Worker::spawn(gateway, interval)
  }

  #[tokio::test]
  async fn test_fetch_and_admin_through_handle() {
    let network = FakeNetwork::echo();
    let (handle, task) = worker(&network, Duration::from_secs(3600)).await;

    let first = handle.fetch(get("/images/logo.png")).await.unwrap();
    let second = handle.fetch(get("/images/logo.png")).await.unwrap();
    assert_eq!(first.source, Source::Network);
    assert_eq!(second.source, Source::CacheFresh);

    let reply = handle.admin(AdminCommand::GetCacheSize).await;
    assert_eq!(
      reply,
      AdminReply::CacheSize {
        total_entries: 1,
        caches: 3
      }
    );

    handle.shutdown().unwrap();
    task.await.unwrap();

    // No reply is ever lost, even after shutdown
    assert!(matches!(
      handle.admin(AdminCommand::GetCacheSize).await,
      AdminReply::Error { .. }
    ));
  }

  #[tokio::test]
  async fn test_network_error_keeps_its_kind() {
    let network = FakeNetwork::offline();
    let (handle, _task) = worker(&network, Duration::from_secs(3600)).await;

    let err = handle.fetch(get("/api/customers")).await.unwrap_err();
    assert!(matches!(
      err.downcast_ref::<GatewayError>(),
      Some(GatewayError::Network { .. })
    ));
  }

  #[tokio::test]
  async fn test_tick_drains_queue() {
    let network = FakeNetwork::offline();
    let (handle, _task) = worker(&network, Duration::from_millis(20)).await;

    let request = Request::post_json(get("/api/tickets").url, &json!({"subject": "vpn"}));
    let delivery = handle.mutate("tickets", request).await.unwrap();
    assert!(matches!(delivery, Delivery::Queued(_)));

    network.set_handler(|_| Reply::Respond(crate::http::Response::new(200, "")));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = handle.sync().await.unwrap();
    assert_eq!(report.pending, 0);
    assert!(network.calls_to("/api/sync") >= 1);
  }
}
