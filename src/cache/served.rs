//! What the gateway hands back for a request, with where it came from.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classify::PassReason;
use crate::http::Response;

/// A response served to the host, including metadata about its source.
#[derive(Debug, Clone)]
pub struct Served {
  /// The actual response
  pub response: Response,
  /// Where the response came from
  pub source: Source,
  /// When the response was captured (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  /// Fresh response straight from the network.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: Source::Network,
      cached_at: None,
    }
  }

  /// Response served from a partition.
  pub fn from_cache(response: Response, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      response,
      source: if is_stale {
        Source::CacheStale
      } else {
        Source::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Network unavailable; serving a cached copy or the offline response.
  pub fn offline(response: Response, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      response,
      source: Source::Offline,
      cached_at,
    }
  }

  /// Request bypassed the cache entirely.
  pub fn pass_through(response: Response, reason: PassReason) -> Self {
    Self {
      response,
      source: Source::PassThrough(reason),
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Source {
  /// Fresh data from network
  Network,
  /// From cache, within the partition's max-age
  CacheFresh,
  /// From cache past its max-age, a background refresh was started
  CacheStale,
  /// Network unavailable, serving a cached copy or the offline response
  Offline,
  /// Not eligible for caching; forwarded unchanged
  PassThrough(PassReason),
}
