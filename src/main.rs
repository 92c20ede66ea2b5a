mod cache;
mod config;
mod event;
mod logging;
mod net;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

use cache::{CacheSource, CacheStorage, MemoryStorage, Request, SqliteStorage};
use event::{Dispatcher, Event, EventOutcome};
use net::{resolve, HttpTransport};
use worker::OfflineCache;

#[derive(Parser, Debug)]
#[command(name = "precache")]
#[command(about = "Pre-cache static assets and serve them cache-first with network fallback")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./precache.yaml or $XDG_CONFIG_HOME/precache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin that relative URLs are resolved against
  #[arg(long)]
  origin: Option<String>,

  /// Cache database path
  #[arg(long)]
  database: Option<PathBuf>,

  /// Log at debug level to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch and store the pre-cache resource list
  Install {
    /// Fetch everything but keep it in memory only
    #[arg(long)]
    dry_run: bool,
  },
  /// Answer a request from the cache, falling back to the network
  Fetch {
    /// Absolute URL or path relative to the origin
    url: String,

    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Extra request header as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,
  },
  /// List the URLs stored in the cache with status and size
  Keys,
  /// List every cache name, oldest first
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::init(args.verbose)?;

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Command line overrides
  if let Some(origin) = args.origin {
    config.origin = origin;
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let transport = HttpTransport::new(config.timeout())?;

  if let Command::Install { dry_run: true } = args.command {
    return run(MemoryStorage::new(), transport, &config, args.command).await;
  }

  let path = match &config.database {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  let storage = SqliteStorage::open(&path)?;

  run(storage, transport, &config, args.command).await
}

async fn run<S>(
  storage: S,
  transport: HttpTransport,
  config: &config::Config,
  command: Command,
) -> Result<()>
where
  S: CacheStorage + 'static,
{
  let origin = config.origin_url()?;
  let worker = OfflineCache::new(storage, transport, &origin)?;

  match command {
    Command::Install { dry_run } => {
      let dispatcher = Dispatcher::for_worker(worker.clone());
      if let Some(EventOutcome::Installed(count)) = dispatcher.dispatch(Event::Install).await? {
        if dry_run {
          for resource in worker.resources() {
            println!("reachable {}", resource);
          }
        } else {
          println!("Cached {} resources in {}", count, worker.cache_name());
        }
      }
    }
    Command::Fetch {
      url,
      method,
      headers,
    } => {
      let mut request = Request::get(resolve(&origin, &url)?).with_method(&method);
      for header in &headers {
        let (name, value) = header
          .split_once(':')
          .ok_or_else(|| eyre!("Invalid header (expected \"Name: value\"): {}", header))?;
        request = request.with_header(name.trim(), value.trim());
      }

      let dispatcher = Dispatcher::for_worker(worker);
      if let Some(EventOutcome::Responded(result)) =
        dispatcher.dispatch(Event::Fetch(request)).await?
      {
        info!(
          url = %url,
          status = result.data.status,
          content_type = result.data.header("content-type").unwrap_or("-"),
          source = %result.source,
          "served"
        );
        let origin_note = match result.source {
          CacheSource::Cache => "from cache",
          CacheSource::Network => "from network",
        };
        eprintln!(
          "{} {} ({})",
          result.data.status, result.data.status_text, origin_note
        );
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(&result.data.body)?;
        stdout.flush()?;
      }
    }
    Command::Keys => {
      for (key, response) in worker.entries()? {
        println!("{}\t{}\t{} bytes", key, response.status, response.body.len());
      }
    }
    Command::Caches => {
      for name in worker.cache_names()? {
        println!("{}", name);
      }
    }
  }

  Ok(())
}
