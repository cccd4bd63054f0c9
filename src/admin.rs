//! Administrative control channel.
//!
//! Messages arrive as `{"type": "GET_CACHE_SIZE"}`,
//! `{"type": "CLEAR_CACHE", "payload": "name"}` or
//! `{"type": "UPDATE_CACHE", "payload": ["/a.css"]}` and every one of them
//! gets exactly one reply.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::{CacheStorage, SyncStore};
use crate::gateway::CacheGateway;
use crate::network::Network;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdminCommand {
  GetCacheSize,
  ClearCache {
    /// Partition to clear; all partitions when absent
    #[serde(default)]
    payload: Option<String>,
  },
  UpdateCache {
    payload: Vec<String>,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AdminReply {
  CacheSize {
    #[serde(rename = "totalEntries")]
    total_entries: usize,
    caches: usize,
  },
  Ack {
    success: bool,
  },
  Error {
    error: String,
  },
}

impl<S: CacheStorage + SyncStore, N: Network> CacheGateway<S, N> {
  /// Execute an administrative command. Never fails: errors become replies.
  pub async fn admin(&self, command: AdminCommand) -> AdminReply {
    match command {
      AdminCommand::GetCacheSize => match self.cache_size() {
        Ok(size) => AdminReply::CacheSize {
          total_entries: size.total_entries,
          caches: size.caches,
        },
        Err(e) => {
          warn!(error = %e, "GET_CACHE_SIZE failed");
          AdminReply::Error {
            error: e.to_string(),
          }
        }
      },
      AdminCommand::ClearCache { payload } => {
        let success = match self.clear_cache(payload.as_deref()) {
          Ok(success) => success,
          Err(e) => {
            warn!(error = %e, "CLEAR_CACHE failed");
            false
          }
        };
        AdminReply::Ack { success }
      }
      AdminCommand::UpdateCache { payload } => {
        let success = match self.update_cache(&payload).await {
          Ok(()) => true,
          Err(e) => {
            warn!(error = %e, "UPDATE_CACHE failed");
            false
          }
        };
        AdminReply::Ack { success }
      }
    }
  }
}
