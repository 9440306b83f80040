mod agent;
mod cache;
mod config;
mod dispatch;
mod http;
#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use agent::{ActivateReport, CacheAgent, Manifest, RouteMatcher};
use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use config::{Config, LogConfig};
use dispatch::Dispatcher;
use http::{HttpFetcher, Request};

#[derive(Parser, Debug)]
#[command(name = "tilecache")]
#[command(about = "Offline caching agent for the GPS speed tracker web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tilecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Base URL of the app, overrides `origin` from the config
  #[arg(short, long)]
  origin: Option<String>,

  /// Keep the cache in memory instead of the database
  #[arg(long)]
  ephemeral: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the manifest into the current generation
  Install,
  /// Delete every cache generation except the current one
  Activate,
  /// Install, then activate
  Register,
  /// Answer requests the way the agent would, one task per URL
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
    /// Write the body here instead of stdout (single URL only)
    #[arg(long)]
    output: Option<PathBuf>,
  },
  /// List cache generations (current one marked with *)
  Generations,
  /// List request identities stored in a generation
  Entries {
    /// Defaults to the current generation
    generation: Option<String>,
  },
}

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG wins over the configured level. The returned guard must stay
/// alive for the file writer to flush.
fn init_tracing(config: &LogConfig) -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new(config.level.as_deref().unwrap_or("warn")));

  let (file_layer, guard) = match &config.dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "tilecache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  guard
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(origin) = args.origin {
    config.origin = Some(origin);
  }

  let _log_guard = init_tracing(&config.log);
  info!(version = %config.version, "tilecache starting");

  if args.ephemeral {
    run(args.command, &config, Arc::new(MemoryStorage::new())).await
  } else {
    let storage = SqliteStorage::open(&config.database_path()?)?;
    run(args.command, &config, Arc::new(storage)).await
  }
}

/// Manifest URLs; install cannot proceed without an origin, the other
/// commands only need it when one is configured.
fn manifest_urls(config: &Config, required: bool) -> Result<Vec<Url>> {
  let origin = match config.origin_url() {
    Ok(origin) => origin,
    Err(e) if required => return Err(e),
    Err(_) => return Ok(Vec::new()),
  };
  Manifest::new(config.manifest.iter().cloned()).resolve(&origin)
}

async fn run<S: CacheStorage + 'static>(
  command: Command,
  config: &Config,
  storage: Arc<S>,
) -> Result<()> {
  let fetcher = Arc::new(HttpFetcher::new(&config.http)?);
  let needs_manifest = matches!(command, Command::Install | Command::Register);
  let agent = CacheAgent::new(
    config.version.clone(),
    manifest_urls(config, needs_manifest)?,
    RouteMatcher::from_config(&config.routes),
    Arc::clone(&storage),
    Arc::clone(&fetcher),
  );

  match command {
    Command::Install => {
      let stored = agent.install().await?;
      println!("Installed {} ({} entries)", agent.version(), stored);
    }
    Command::Activate => {
      let report = agent.activate().await?;
      print_report(agent.version(), &report);
    }
    Command::Register => {
      let dispatcher = Dispatcher::new(Arc::clone(agent.fetcher()));
      let report = dispatcher.register(agent).await?;
      info!(state = ?dispatcher.state()?, "registration complete");
      let version = dispatcher.active_version()?.unwrap_or_default();
      print_report(&version, &report);
    }
    Command::Fetch {
      urls,
      method,
      headers,
      output,
    } => {
      if output.is_some() && urls.len() > 1 {
        return Err(eyre!("--output needs exactly one URL"));
      }

      // An installed generation means a previous run left this version in control
      let installed = storage.generations()?.contains(&config.version);
      let dispatcher = if installed {
        Dispatcher::with_active(agent)
      } else {
        Dispatcher::new(fetcher)
      };

      let mut handles = Vec::with_capacity(urls.len());
      for url in &urls {
        let mut request = Request::parse(&method, url)?;
        for header in &headers {
          let (name, value) = parse_header(header)?;
          request = request.with_header(name, value);
        }
        handles.push(dispatcher.dispatch(request));
      }

      for (url, handle) in urls.iter().zip(handles) {
        let result = handle.await??;
        let response = &result.data;
        let content_type = response.header("content-type").unwrap_or("-");

        match result.cached_at {
          Some(at) => eprintln!(
            "{} {} {} {} [{}, stored {}]",
            url, response.status, response.status_text, content_type, result.source, at
          ),
          None => eprintln!(
            "{} {} {} {} [{}]",
            url, response.status, response.status_text, content_type, result.source
          ),
        }

        match &output {
          Some(path) => std::fs::write(path, &response.body)?,
          None if urls.len() == 1 => io::stdout().write_all(&response.body)?,
          None => {}
        }
      }
    }
    Command::Generations => {
      for name in storage.generations()? {
        let marker = if name == config.version { "*" } else { " " };
        println!("{} {}", marker, name);
      }
    }
    Command::Entries { generation } => {
      let generation = generation.unwrap_or_else(|| config.version.clone());
      for key in storage.keys(&generation)? {
        println!("{}", key);
      }
    }
  }

  Ok(())
}

/// Split a "Name: value" header argument.
fn parse_header(header: &str) -> Result<(&str, &str)> {
  let (name, value) = header
    .split_once(':')
    .ok_or_else(|| eyre!("Invalid header '{}', expected \"Name: value\"", header))?;
  let name = name.trim();
  if name.is_empty() {
    return Err(eyre!("Invalid header '{}', empty name", header));
  }
  Ok((name, value.trim()))
}

fn print_report(version: &str, report: &ActivateReport) {
  println!("Activated {}", version);
  for name in &report.deleted {
    println!("  deleted {}", name);
  }
  for name in &report.failed {
    println!("  failed to delete {}", name);
  }
}
