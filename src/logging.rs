use color_eyre::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LogConfig;

/// Install the global subscriber. Keep the guard alive until exit or
/// buffered lines are lost.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cachegate=info"));

  let (writer, guard) = match &config.directory {
    Some(dir) => {
      std::fs::create_dir_all(dir)?;
      tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "cachegate.log"))
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(config.directory.is_none())
    .try_init()
    .map_err(|e| color_eyre::eyre::eyre!("Failed to install logger: {}", e))?;

  Ok(guard)
}
