use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the host application; requests elsewhere are never cached
  pub origin: Url,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  /// URL served when both network and cache are unavailable (must be precached)
  pub offline_fallback: Option<String>,
  /// Static manifest, added to the static partition on first activation
  pub precache: Vec<String>,
  pub sync: SyncConfig,
  pub network: NetworkConfig,
  /// SQLite database path (defaults to $XDG_DATA_HOME/cachegate/cache.db)
  pub database: Option<PathBuf>,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: default_origin(),
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      offline_fallback: Some("/offline.html".to_string()),
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/offline.html".to_string(),
        "/manifest.json".to_string(),
      ],
      sync: SyncConfig::default(),
      network: NetworkConfig::default(),
      database: None,
      log: LogConfig::default(),
    }
  }
}

fn default_origin() -> Url {
  Url::parse("http://localhost:3000").expect("static origin is valid")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Partition name prefix
  pub prefix: String,
  /// Generation identifier; bumping it drops every older partition on activation
  pub version: String,
  #[serde(rename = "static")]
  pub static_assets: PartitionConfig,
  pub dynamic: PartitionConfig,
  pub api: PartitionConfig,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "cachegate".to_string(),
      version: "v1".to_string(),
      static_assets: PartitionConfig {
        max_entries: 100,
        max_age_secs: 7 * 24 * 60 * 60,
      },
      dynamic: PartitionConfig {
        max_entries: 50,
        max_age_secs: 24 * 60 * 60,
      },
      api: PartitionConfig {
        max_entries: 100,
        max_age_secs: 5 * 60,
      },
    }
  }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct PartitionConfig {
  pub max_entries: usize,
  pub max_age_secs: u64,
}

impl PartitionConfig {
  pub fn max_age(&self) -> chrono::Duration {
    chrono::Duration::seconds(self.max_age_secs as i64)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// File extensions (without the dot, case-insensitive) served from the static partition
  pub static_extensions: Vec<String>,
  pub static_prefixes: Vec<String>,
  pub api_prefixes: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    let extensions = [
      "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "css", "js", "mjs", "woff", "woff2",
      "ttf", "eot", "otf",
    ];
    Self {
      static_extensions: extensions.iter().map(|e| e.to_string()).collect(),
      static_prefixes: vec![
        "/static/".to_string(),
        "/assets/".to_string(),
        "/images/".to_string(),
        "/fonts/".to_string(),
      ],
      api_prefixes: vec!["/api/".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Endpoint queued tasks are POSTed to, absolute or relative to the origin
  pub endpoint: String,
  /// Period of the worker's drain tick
  pub interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      endpoint: "/api/sync".to_string(),
      interval_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write a daily rolling log here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cachegate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cachegate/config.yaml
  ///
  /// Falls back to defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("cachegate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cachegate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Resolve a possibly relative URL against the configured origin.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    self
      .origin
      .join(url)
      .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))
  }

  /// Get the database path, falling back to the per-user data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cachegate").join("cache.db"))
  }
}
