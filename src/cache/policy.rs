use crate::classify::PartitionKind;
use crate::config::{CacheConfig, PartitionConfig};

use super::storage::CachedEntry;

/// Expiry and size policy of one partition in the current generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionPolicy {
  pub kind: PartitionKind,
  /// Generation-qualified durable name, e.g. `cachegate-static-v1`
  pub name: String,
  pub max_entries: usize,
  pub max_age: chrono::Duration,
}

impl PartitionPolicy {
  pub fn new(kind: PartitionKind, name: impl Into<String>, config: PartitionConfig) -> Self {
    Self {
      kind,
      name: name.into(),
      max_entries: config.max_entries,
      max_age: config.max_age(),
    }
  }

  /// Policies for the three partitions of the configured generation.
  pub fn for_generation(config: &CacheConfig) -> [PartitionPolicy; 3] {
    PartitionKind::ALL.map(|kind| {
      let limits = match kind {
        PartitionKind::Static => config.static_assets,
        PartitionKind::Dynamic => config.dynamic,
        PartitionKind::Api => config.api,
      };
      let name = format!("{}-{}-{}", config.prefix, kind.as_str(), config.version);
      Self::new(kind, name, limits)
    })
  }

  pub fn is_stale(&self, entry: &CachedEntry) -> bool {
    entry.age() > self.max_age
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_generation_names() {
    let config = CacheConfig {
      version: "v3".to_string(),
      ..CacheConfig::default()
    };
    let names: Vec<String> = PartitionPolicy::for_generation(&config)
      .into_iter()
      .map(|p| p.name)
      .collect();
    assert_eq!(
      names,
      vec![
        "cachegate-static-v3",
        "cachegate-dynamic-v3",
        "cachegate-api-v3"
      ]
    );
  }
}
