//! The cache gateway: one value owning every piece of worker state.

use color_eyre::Result;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheLayer, CacheStorage, OfflineFallback, PartitionPolicy, Served, SyncStore,
};
use crate::classify::{Classifier, PartitionKind, Route};
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::http::{Request, Response};
use crate::network::Network;
use crate::sync::{DrainReport, SyncQueue};

/// Entry and partition counts across the current cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSize {
  pub total_entries: usize,
  pub caches: usize,
}

/// Intercepts requests, routes them to a caching strategy, and owns the
/// partitions and the sync queue.
///
/// Only constructed through [`CacheGateway::activate`], so stale generations
/// are always swept before the first request is served.
pub struct CacheGateway<S: CacheStorage + SyncStore, N: Network> {
  config: Config,
  classifier: Classifier,
  policies: [PartitionPolicy; 3],
  storage: Arc<S>,
  network: Arc<N>,
  layer: CacheLayer<S, N>,
  sync: SyncQueue<S, N>,
}

impl<S: CacheStorage + SyncStore, N: Network> CacheGateway<S, N> {
  /// Activate the current generation.
  ///
  /// Deletes every durable partition not named by this generation, creates
  /// the current ones and precaches the static manifest if any of it is
  /// missing from the static partition. A precache that failed offline is
  /// retried on the next activation.
  pub async fn activate(config: Config, storage: S, network: N) -> Result<Self> {
    let storage = Arc::new(storage);
    let network = Arc::new(network);
    let policies = PartitionPolicy::for_generation(&config.cache);

    for name in storage.partitions()? {
      if !policies.iter().any(|p| p.name == name) {
        storage.delete_partition(&name)?;
        info!(partition = %name, "Deleted partition from an old generation");
      }
    }

    for policy in &policies {
      if storage.ensure_partition(&policy.name)? {
        debug!(partition = %policy.name, "Created partition");
      }
    }

    let static_name = policies[0].name.clone();
    let fallback = match &config.offline_fallback {
      Some(path) => Some(OfflineFallback {
        partition: static_name,
        key: Request::get(config.resolve(path)?).cache_key(),
      }),
      None => None,
    };

    let sync_endpoint = config.resolve(&config.sync.endpoint)?;
    let gateway = Self {
      classifier: Classifier::new(config.origin.clone(), config.routes.clone()),
      policies,
      layer: CacheLayer::new(Arc::clone(&storage), Arc::clone(&network))
        .with_offline_fallback(fallback),
      sync: SyncQueue::new(Arc::clone(&storage), Arc::clone(&network), sync_endpoint),
      storage,
      network,
      config,
    };

    if gateway.precache_missing()? {
      let manifest = gateway.config.precache.clone();
      match gateway.update_cache(&manifest).await {
        Ok(()) => info!(count = manifest.len(), "Precached static manifest"),
        Err(e) => warn!(error = %e, "Precaching static manifest failed"),
      }
    }

    Ok(gateway)
  }

  fn precache_missing(&self) -> Result<bool> {
    let partition = &self.policy(PartitionKind::Static).name;
    for path in &self.config.precache {
      let key = Request::get(self.config.resolve(path)?).cache_key();
      if self.storage.get(partition, &key)?.is_none() {
        return Ok(true);
      }
    }
    Ok(false)
  }

  pub fn policy(&self, kind: PartitionKind) -> &PartitionPolicy {
    match kind {
      PartitionKind::Static => &self.policies[0],
      PartitionKind::Dynamic => &self.policies[1],
      PartitionKind::Api => &self.policies[2],
    }
  }

  pub fn sync(&self) -> &SyncQueue<S, N> {
    &self.sync
  }

  /// Handle one intercepted request.
  pub async fn handle(&self, request: &Request) -> GatewayResult<Served> {
    match self.classifier.classify(request) {
      Route::PassThrough(reason) => {
        debug!(url = %request.url, ?reason, "Passing through");
        let response = self
          .network
          .fetch(request)
          .await
          .map_err(|e| GatewayError::network(&request.url, e))?;
        Ok(Served::pass_through(response, reason))
      }
      Route::Cached(kind) => {
        let policy = self.policy(kind);
        match kind {
          PartitionKind::Static => self.layer.cache_first(request, policy).await,
          PartitionKind::Api => self.layer.network_first(request, policy).await,
          PartitionKind::Dynamic => self.layer.stale_while_revalidate(request, policy).await,
        }
      }
    }
  }

  /// Queue a mutation for the next drain.
  pub fn register_sync(&self, tag: &str, payload: serde_json::Value) -> GatewayResult<i64> {
    self.sync.register(tag, payload)
  }

  /// Deliver queued mutations (sync trigger or periodic wake).
  pub async fn drain_sync(&self) -> GatewayResult<DrainReport> {
    self.sync.drain().await
  }

  /// Wait for detached background revalidations.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }

  /// Total entries and partition count across every durable partition.
  pub fn cache_size(&self) -> GatewayResult<CacheSize> {
    let names = self
      .storage
      .partitions()
      .map_err(GatewayError::unavailable)?;

    let mut total_entries = 0;
    for name in &names {
      total_entries += self
        .storage
        .count(name)
        .map_err(GatewayError::unavailable)?;
    }

    Ok(CacheSize {
      total_entries,
      caches: names.len(),
    })
  }

  /// Clear one partition, or every partition when `name` is `None`.
  ///
  /// `name` may be a durable partition name or a kind (`static`, `dynamic`,
  /// `api`). Returns false if the named partition didn't exist.
  pub fn clear_cache(&self, name: Option<&str>) -> GatewayResult<bool> {
    let targets = match name {
      Some(name) => {
        let resolved = self
          .policies
          .iter()
          .find(|p| p.kind.as_str() == name)
          .map(|p| p.name.as_str())
          .unwrap_or(name);
        vec![resolved.to_string()]
      }
      None => self
        .storage
        .partitions()
        .map_err(GatewayError::unavailable)?,
    };

    let mut deleted_any = false;
    for target in &targets {
      let deleted = self
        .storage
        .delete_partition(target)
        .map_err(GatewayError::unavailable)?;
      deleted_any |= deleted;
      info!(partition = %target, deleted, "Cleared partition");
    }

    Ok(deleted_any || name.is_none())
  }

  /// Fetch every URL and, only if all succeed, store them in the static
  /// partition regardless of classification.
  pub async fn update_cache(&self, urls: &[String]) -> GatewayResult<()> {
    let mut requests = Vec::with_capacity(urls.len());
    for url in urls {
      let url = self
        .config
        .resolve(url)
        .map_err(|e| GatewayError::network(url, e))?;
      requests.push(Request::get(url));
    }

    let results = join_all(requests.iter().map(|r| self.network.fetch(r))).await;

    let mut responses: Vec<(String, Response)> = Vec::with_capacity(results.len());
    for (request, result) in requests.iter().zip(results) {
      match result {
        Ok(response) if response.is_success() => responses.push((request.cache_key(), response)),
        Ok(response) => {
          return Err(GatewayError::network(
            &request.url,
            format!("server answered {}", response.status),
          ))
        }
        Err(e) => return Err(GatewayError::network(&request.url, e)),
      }
    }

    self
      .layer
      .store_all(self.policy(PartitionKind::Static), responses)
  }
}
