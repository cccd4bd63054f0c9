use thiserror::Error;

/// Failures surfaced by the gateway to its callers.
#[derive(Debug, Error)]
pub enum GatewayError {
  /// Fetch failed and no acceptable cached fallback existed
  #[error("Network error for {url}: {reason}")]
  Network { url: String, reason: String },

  /// Durable storage could not be read or written
  #[error("Cache unavailable: {0}")]
  CacheUnavailable(String),

  /// A queued task could not be delivered; the task stays queued
  #[error("Sync delivery failed for task {id} ({tag}): {reason}")]
  SyncDeliveryFailed { id: i64, tag: String, reason: String },
}

impl GatewayError {
  pub fn network(url: impl ToString, reason: impl ToString) -> Self {
    Self::Network {
      url: url.to_string(),
      reason: reason.to_string(),
    }
  }

  pub fn unavailable(err: impl std::fmt::Display) -> Self {
    Self::CacheUnavailable(err.to_string())
  }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;
