//! Request classification: which partition (if any) handles a request.

use serde::Serialize;
use url::Url;

use crate::config::RoutesConfig;
use crate::http::Request;

/// The three cache partitions of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionKind {
  /// Long-lived assets, cache-first
  Static,
  /// Navigable documents, stale-while-revalidate
  Dynamic,
  /// Backend JSON, network-first
  Api,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 3] = [Self::Static, Self::Dynamic, Self::Api];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Static => "static",
      Self::Dynamic => "dynamic",
      Self::Api => "api",
    }
  }
}

/// Why a request bypasses the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PassReason {
  CrossOrigin,
  NotGet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  PassThrough(PassReason),
  Cached(PartitionKind),
}

pub struct Classifier {
  origin: Url,
  routes: RoutesConfig,
}

impl Classifier {
  pub fn new(origin: Url, mut routes: RoutesConfig) -> Self {
    for ext in &mut routes.static_extensions {
      *ext = ext.trim_start_matches('.').to_lowercase();
    }
    Self { origin, routes }
  }

  pub fn classify(&self, request: &Request) -> Route {
    if request.url.origin() != self.origin.origin() {
      return Route::PassThrough(PassReason::CrossOrigin);
    }
    if !request.is_get() {
      return Route::PassThrough(PassReason::NotGet);
    }

    let path = request.url.path();
    if self.is_static(path) {
      Route::Cached(PartitionKind::Static)
    } else if self.routes.api_prefixes.iter().any(|p| path.starts_with(p)) {
      Route::Cached(PartitionKind::Api)
    } else {
      Route::Cached(PartitionKind::Dynamic)
    }
  }

  fn is_static(&self, path: &str) -> bool {
    if self.routes.static_prefixes.iter().any(|p| path.starts_with(p)) {
      return true;
    }

    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((_, ext)) => {
        let ext = ext.to_lowercase();
        self.routes.static_extensions.iter().any(|e| *e == ext)
      }
      None => false,
    }
  }
}
