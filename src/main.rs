mod admin;
mod cache;
mod classify;
mod config;
mod error;
mod gateway;
mod http;
mod logging;
mod network;
mod notify;
mod serve;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::admin::AdminCommand;
use crate::cache::SqliteStorage;
use crate::gateway::CacheGateway;
use crate::http::Request;
use crate::network::HttpNetwork;
use crate::sync::Delivery;
use crate::worker::{Worker, WorkerHandle};

#[derive(Parser, Debug)]
#[command(name = "cachegate")]
#[command(about = "Offline caching gateway with background sync")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/cachegate/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin of the host application
  #[arg(short, long)]
  origin: Option<Url>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch a URL through the gateway and write the body to stdout
  Fetch {
    url: String,
    /// HTTP method (default: GET, or POST when --data is given)
    #[arg(short = 'X', long)]
    method: Option<String>,
    /// JSON body for mutations
    #[arg(short, long)]
    data: Option<String>,
    /// Queue the mutation under this sync tag if the network is down
    #[arg(short, long)]
    tag: Option<String>,
  },
  /// Cache administration
  #[command(subcommand)]
  Cache(CacheCommand),
  /// Background sync queue
  #[command(subcommand)]
  Sync(SyncCommand),
  /// Display a push notification from a JSON payload
  Notify { payload: String },
  /// Answer JSON messages from stdin, one per line
  Serve {
    /// Seconds between periodic sync drains (overrides config)
    #[arg(long)]
    interval: Option<u64>,
  },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Total entries and partition count
  Size,
  /// Clear one partition (name or static/dynamic/api), or all
  Clear { name: Option<String> },
  /// Force-add URLs to the static partition
  Update {
    #[arg(required = true)]
    urls: Vec<String>,
  },
}

#[derive(Subcommand, Debug)]
enum SyncCommand {
  /// Queue a task
  Register {
    tag: String,
    /// JSON payload
    payload: Option<String>,
  },
  /// Deliver pending tasks now
  Drain,
  /// List pending tasks
  List {
    #[arg(short, long)]
    tag: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };

  let _log_guard = logging::init(&config.log)?;

  let interval = match &args.command {
    Command::Serve {
      interval: Some(secs),
    } => *secs,
    _ => config.sync.interval_secs,
  };

  let storage = SqliteStorage::open(&config.database_path()?)?;
  let network = HttpNetwork::new(config.network.timeout())?;
  let gateway = CacheGateway::activate(config.clone(), storage, network).await?;
  let (handle, worker) = Worker::spawn(gateway, Duration::from_secs(interval.max(1)));

  let result = run(args.command, &handle, &config).await;

  handle.shutdown()?;
  worker.await?;
  result
}

async fn run(command: Command, handle: &WorkerHandle, config: &config::Config) -> Result<()> {
  match command {
    Command::Fetch {
      url,
      method,
      data,
      tag,
    } => {
      let url = config.resolve(&url)?;
      let body = data.as_deref().map(parse_json).transpose()?;
      let request = Request::compose(method.as_deref(), url, body.as_ref())?;

      if let (false, Some(tag)) = (request.is_get(), &tag) {
        match handle.mutate(tag, request).await? {
          Delivery::Sent(response) => eprintln!("{}", response.status),
          Delivery::Queued(id) => eprintln!("offline, queued as sync task {}", id),
        }
        return Ok(());
      }

      let served = handle.fetch(request).await?;
      eprintln!("{} ({:?})", served.response.status, served.source);
      std::io::stdout().write_all(&served.response.body)?;
    }
    Command::Cache(cache) => {
      let command = match cache {
        CacheCommand::Size => AdminCommand::GetCacheSize,
        CacheCommand::Clear { name } => AdminCommand::ClearCache { payload: name },
        CacheCommand::Update { urls } => AdminCommand::UpdateCache { payload: urls },
      };
      let reply = handle.admin(command).await;
      println!("{}", serde_json::to_string_pretty(&reply)?);
    }
    Command::Sync(SyncCommand::Register { tag, payload }) => {
      let payload = match payload {
        Some(p) => parse_json(&p)?,
        None => serde_json::Value::Null,
      };
      let id = handle.register_sync(&tag, payload).await?;
      println!("{}", id);
    }
    Command::Sync(SyncCommand::Drain) => {
      let report = handle.sync().await?;
      println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Command::Sync(SyncCommand::List { tag }) => {
      let tasks = handle.pending(tag).await?;
      println!("{}", serde_json::to_string_pretty(&tasks)?);
    }
    Command::Notify { payload } => {
      let payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Invalid notification payload: {}", e))?;
      handle.push(payload)?;
    }
    Command::Serve { .. } => serve::run(handle, config).await?,
  }

  Ok(())
}

fn parse_json(s: &str) -> Result<serde_json::Value> {
  serde_json::from_str(s).map_err(|e| eyre!("Invalid JSON '{}': {}", s, e))
}
