//! Cache layer that orchestrates caching strategies with network fetching.

use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::policy::PartitionPolicy;
use super::served::Served;
use super::storage::{CacheStorage, CachedEntry};
use crate::error::{GatewayError, GatewayResult};
use crate::http::{Request, Response};
use crate::network::Network;

/// Where the offline fallback lives: partition name and cache key.
#[derive(Debug, Clone)]
pub struct OfflineFallback {
  pub partition: String,
  pub key: String,
}

/// Cache layer that manages caching strategies and network fetching.
///
/// Sits between the gateway's router and the network, providing the three
/// strategies plus eviction after every write.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  fallback: Option<OfflineFallback>,
  /// Detached stale-while-revalidate refreshes
  revalidations: Mutex<JoinSet<()>>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>) -> Self {
    Self {
      storage,
      network,
      fallback: None,
      revalidations: Mutex::new(JoinSet::new()),
    }
  }

  /// Set the response served when both network and cache are unavailable.
  pub fn with_offline_fallback(mut self, fallback: Option<OfflineFallback>) -> Self {
    self.fallback = fallback;
    self
  }

  /// Cache-first: a fresh entry never touches the network.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network and store a 2xx result
  /// 3. On network failure, return the stale entry or the offline fallback
  pub async fn cache_first(
    &self,
    request: &Request,
    policy: &PartitionPolicy,
  ) -> GatewayResult<Served> {
    let key = request.cache_key();
    let cached = self.lookup(policy, &key);

    if let Some(entry) = &cached {
      if !policy.is_stale(entry) {
        debug!(%key, partition = %policy.name, "Cache hit");
        return Ok(Served::from_cache(
          entry.response.clone(),
          entry.captured_at,
          false,
        ));
      }
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store_response(self.storage.as_ref(), policy, &key, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(e) => {
        if let Some(entry) = cached {
          info!(%key, error = %e, "Network failed, serving stale cache");
          return Ok(Served::offline(entry.response, Some(entry.captured_at)));
        }
        if let Some(entry) = self.offline_fallback() {
          info!(%key, error = %e, "Network failed, serving offline fallback");
          return Ok(Served::offline(entry.response, Some(entry.captured_at)));
        }
        Err(GatewayError::network(&request.url, e))
      }
    }
  }

  /// Network-first: cached data is only a fallback, and only within max-age.
  pub async fn network_first(
    &self,
    request: &Request,
    policy: &PartitionPolicy,
  ) -> GatewayResult<Served> {
    let key = request.cache_key();

    let reason = match self.network.fetch(request).await {
      Ok(response) if response.is_success() => {
        store_response(self.storage.as_ref(), policy, &key, &response);
        return Ok(Served::from_network(response));
      }
      Ok(response) => format!("server answered {}", response.status),
      Err(e) => e.to_string(),
    };

    match self.lookup(policy, &key) {
      Some(entry) if !policy.is_stale(&entry) => {
        info!(%key, %reason, "Network failed, serving cached copy");
        Ok(Served::offline(entry.response, Some(entry.captured_at)))
      }
      Some(_) => {
        debug!(%key, "Cached copy is past max-age, not serving it");
        Err(GatewayError::network(&request.url, reason))
      }
      None => Err(GatewayError::network(&request.url, reason)),
    }
  }

  /// Stale-while-revalidate: any cached entry is returned without waiting on
  /// the network; a detached fetch refreshes it for the next request.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    policy: &PartitionPolicy,
  ) -> GatewayResult<Served> {
    let key = request.cache_key();

    if let Some(entry) = self.lookup(policy, &key) {
      self.spawn_revalidation(request.clone(), policy.clone());
      let is_stale = policy.is_stale(&entry);
      return Ok(Served::from_cache(entry.response, entry.captured_at, is_stale));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store_response(self.storage.as_ref(), policy, &key, &response);
        }
        Ok(Served::from_network(response))
      }
      Err(e) => {
        info!(%key, error = %e, "Network failed with nothing cached");
        Ok(match self.offline_fallback() {
          Some(entry) => Served::offline(entry.response, Some(entry.captured_at)),
          None => Served::offline(Response::offline(), None),
        })
      }
    }
  }

  /// Store several responses atomically, then enforce the size bound.
  pub fn store_all(
    &self,
    policy: &PartitionPolicy,
    responses: Vec<(String, Response)>,
  ) -> GatewayResult<()> {
    let entries: Vec<(String, CachedEntry)> = responses
      .into_iter()
      .map(|(key, response)| (key, CachedEntry::capture(response)))
      .collect();

    self
      .storage
      .put_all(&policy.name, &entries)
      .map_err(GatewayError::unavailable)?;
    enforce_bound(self.storage.as_ref(), policy);
    Ok(())
  }

  /// Wait for every detached revalidation started so far.
  pub async fn settle(&self) {
    let mut pending = match self.revalidations.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };

    while let Some(result) = pending.join_next().await {
      if let Err(e) = result {
        warn!(error = %e, "Background revalidation task panicked");
      }
    }
  }

  fn spawn_revalidation(&self, request: Request, policy: PartitionPolicy) {
    let storage = Arc::clone(&self.storage);
    let network = Arc::clone(&self.network);

    let Ok(mut set) = self.revalidations.lock() else {
      return;
    };
    // Reap finished refreshes so the set doesn't grow without bound
    while set.try_join_next().is_some() {}

    set.spawn(async move {
      let key = request.cache_key();
      match network.fetch(&request).await {
        Ok(response) if response.is_success() => {
          store_response(storage.as_ref(), &policy, &key, &response);
          debug!(%key, "Revalidated in background");
        }
        Ok(response) => debug!(%key, status = response.status, "Revalidation not stored"),
        Err(e) => debug!(%key, error = %e, "Background revalidation failed"),
      }
    });
  }

  /// Read an entry, treating storage errors as a miss.
  fn lookup(&self, policy: &PartitionPolicy, key: &str) -> Option<CachedEntry> {
    match self.storage.get(&policy.name, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(%key, partition = %policy.name, error = %e, "Cache read failed");
        None
      }
    }
  }

  fn offline_fallback(&self) -> Option<CachedEntry> {
    let fallback = self.fallback.as_ref()?;
    match self.storage.get(&fallback.partition, &fallback.key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(error = %e, "Offline fallback unreadable");
        None
      }
    }
  }
}

/// Store a response and evict beyond the bound. Failures are logged only;
/// the caller still gets its network response.
fn store_response<S: CacheStorage>(
  storage: &S,
  policy: &PartitionPolicy,
  key: &str,
  response: &Response,
) {
  let entry = CachedEntry::capture(response.clone());
  if let Err(e) = storage.put(&policy.name, key, &entry) {
    warn!(%key, partition = %policy.name, error = %e, "Cache write failed");
    return;
  }
  enforce_bound(storage, policy);
}

fn enforce_bound<S: CacheStorage>(storage: &S, policy: &PartitionPolicy) {
  match storage.trim(&policy.name, policy.max_entries) {
    Ok(0) => {}
    Ok(evicted) => debug!(partition = %policy.name, evicted, "Evicted oldest entries"),
    Err(e) => warn!(partition = %policy.name, error = %e, "Eviction failed"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{SqliteStorage, Source};
  use crate::classify::PartitionKind;
  use crate::config::PartitionConfig;
  use crate::testing::{get, FakeNetwork, Reply};
  use chrono::Utc;
  use std::time::Duration;

  fn policy(kind: PartitionKind, max_entries: usize, max_age_secs: u64) -> PartitionPolicy {
    PartitionPolicy::new(
      kind,
      format!("test-{}", kind.as_str()),
      PartitionConfig {
        max_entries,
        max_age_secs,
      },
    )
  }

  fn layer(network: &FakeNetwork) -> (Arc<SqliteStorage>, CacheLayer<SqliteStorage, FakeNetwork>) {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let layer = CacheLayer::new(Arc::clone(&storage), Arc::new(network.clone()));
    (storage, layer)
  }

  fn aged(body: &str, minutes: i64) -> CachedEntry {
    let date = Utc::now() - chrono::Duration::minutes(minutes);
    CachedEntry::capture(Response::new(200, body).with_date(date))
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let network = FakeNetwork::echo();
    let (_, layer) = layer(&network);
    let policy = policy(PartitionKind::Static, 10, 3600);
    let req = get("/images/logo.png");

    let first = layer.cache_first(&req, &policy).await.unwrap();
    let second = layer.cache_first(&req, &policy).await.unwrap();

    assert_eq!(first.source, Source::Network);
    assert_eq!(second.source, Source::CacheFresh);
    assert_eq!(first.response.body, second.response.body);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_refetches_stale() {
    let network = FakeNetwork::echo();
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Static, 10, 60);
    let req = get("/app.css");
    storage.put(&policy.name, &req.cache_key(), &aged("old", 5)).unwrap();

    let served = layer.cache_first(&req, &policy).await.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body, b"/app.css");
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_error_status_not_stored() {
    let network = FakeNetwork::new(|_| Reply::Respond(Response::new(404, "missing")));
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Static, 10, 3600);
    let req = get("/nope.png");

    let served = layer.cache_first(&req, &policy).await.unwrap();
    assert_eq!(served.response.status, 404);
    assert_eq!(storage.count(&policy.name).unwrap(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_offline_uses_stale_then_fallback_then_error() {
    let network = FakeNetwork::offline();
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Static, 10, 60);

    let stale = get("/old.js");
    storage.put(&policy.name, &stale.cache_key(), &aged("old", 5)).unwrap();
    let served = layer.cache_first(&stale, &policy).await.unwrap();
    assert_eq!(served.source, Source::Offline);
    assert_eq!(served.response.body, b"old");

    // No entry and no fallback configured
    let err = layer.cache_first(&get("/new.js"), &policy).await.unwrap_err();
    assert!(matches!(err, GatewayError::Network { .. }));

    let fallback_key = get("/offline.html").cache_key();
    storage
      .put(&policy.name, &fallback_key, &aged("you are offline", 0))
      .unwrap();
    let layer = layer.with_offline_fallback(Some(OfflineFallback {
      partition: policy.name.clone(),
      key: fallback_key,
    }));
    let served = layer.cache_first(&get("/new.js"), &policy).await.unwrap();
    assert_eq!(served.source, Source::Offline);
    assert_eq!(served.response.body, b"you are offline");
  }

  #[tokio::test]
  async fn test_network_first_prefers_network() {
    let network = FakeNetwork::echo();
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Api, 10, 300);
    let req = get("/api/customers");
    storage.put(&policy.name, &req.cache_key(), &aged("cached", 1)).unwrap();

    let served = layer.network_first(&req, &policy).await.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body, b"/api/customers");
    let stored = storage.get(&policy.name, &req.cache_key()).unwrap().unwrap();
    assert_eq!(stored.response.body, b"/api/customers");
  }

  #[tokio::test]
  async fn test_network_first_error_status_falls_back() {
    let network = FakeNetwork::new(|_| Reply::Respond(Response::new(502, "bad gateway")));
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Api, 10, 300);
    let req = get("/api/customers");

    let err = layer.network_first(&req, &policy).await.unwrap_err();
    assert!(err.to_string().contains("502"));

    storage.put(&policy.name, &req.cache_key(), &aged("cached", 1)).unwrap();
    let served = layer.network_first(&req, &policy).await.unwrap();
    assert_eq!(served.source, Source::Offline);
    assert_eq!(served.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_swr_returns_cached_without_waiting() {
    let network = FakeNetwork::new(|req| {
      Reply::Slow(Duration::from_secs(30), Response::new(200, req.url.path()))
    });
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Dynamic, 10, 60);
    let req = get("/dashboard");
    storage.put(&policy.name, &req.cache_key(), &aged("cached page", 600)).unwrap();

    let served = tokio::time::timeout(
      Duration::from_millis(500),
      layer.stale_while_revalidate(&req, &policy),
    )
    .await
    .expect("must not wait on the network")
    .unwrap();

    assert_eq!(served.source, Source::CacheStale);
    assert_eq!(served.response.body, b"cached page");
  }

  #[tokio::test]
  async fn test_swr_update_visible_on_next_request() {
    let network = FakeNetwork::new(|_| Reply::Respond(Response::new(200, "fresh page")));
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Dynamic, 10, 3600);
    let req = get("/dashboard");
    storage.put(&policy.name, &req.cache_key(), &aged("cached page", 1)).unwrap();

    let first = layer.stale_while_revalidate(&req, &policy).await.unwrap();
    assert_eq!(first.response.body, b"cached page");
    assert_eq!(first.source, Source::CacheFresh);

    layer.settle().await;
    let second = layer.stale_while_revalidate(&req, &policy).await.unwrap();
    assert_eq!(second.response.body, b"fresh page");
    layer.settle().await;
    assert_eq!(network.calls(), 2);
  }

  #[tokio::test]
  async fn test_swr_failed_revalidation_is_swallowed() {
    let network = FakeNetwork::offline();
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Dynamic, 10, 60);
    let req = get("/reports");
    storage.put(&policy.name, &req.cache_key(), &aged("cached", 1)).unwrap();

    let served = layer.stale_while_revalidate(&req, &policy).await.unwrap();
    assert_eq!(served.response.body, b"cached");
    layer.settle().await;
    let kept = storage.get(&policy.name, &req.cache_key()).unwrap().unwrap();
    assert_eq!(kept.response.body, b"cached");
  }

  #[tokio::test]
  async fn test_swr_miss_waits_and_offline_gets_designated_response() {
    let network = FakeNetwork::echo();
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Dynamic, 10, 60);

    let served = layer.stale_while_revalidate(&get("/team"), &policy).await.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(storage.count(&policy.name).unwrap(), 1);

    network.set_handler(|_| Reply::Fail);
    let served = layer.stale_while_revalidate(&get("/other"), &policy).await.unwrap();
    assert_eq!(served.source, Source::Offline);
    assert_eq!(served.response, Response::offline());
  }

  #[tokio::test]
  async fn test_writes_enforce_fifo_bound() {
    let network = FakeNetwork::echo();
    let (storage, layer) = layer(&network);
    let policy = policy(PartitionKind::Api, 2, 300);

    for path in ["/api/a", "/api/b", "/api/a", "/api/c"] {
      layer.network_first(&get(path), &policy).await.unwrap();
    }

    // "a" was re-written after "b", so "b" is the oldest
    let keys = storage.keys(&policy.name).unwrap();
    assert_eq!(
      keys,
      vec![get("/api/a").cache_key(), get("/api/c").cache_key()]
    );
  }
}
